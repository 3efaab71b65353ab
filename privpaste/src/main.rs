use clap::Parser;
use privpaste::{Config, Role};
use std::{env, path::Path, process::ExitCode};

#[tokio::main]
async fn main() -> ExitCode {
    // Children are executed with their role as the program name.
    let role = env::args_os()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse::<Role>().ok())
        .unwrap_or(Role::PARENT);

    let config = Config::parse();
    if let Err(err) = config.validate() {
        eprintln!("Error: {}", err);
        return ExitCode::FAILURE;
    }

    match privpaste::run(role, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
