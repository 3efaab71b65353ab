//! The privileged parent process.

use crate::{error::Error, process::Parent, Config};
use privpaste_log::info;
use std::{env, ffi::OsString, sync::Arc};

pub async fn main(config: Arc<Config>) -> Result<(), Error> {
    // The children parse the same command line.
    let args = env::args_os().skip(1).collect::<Vec<OsString>>();
    let parent = Parent::spawn(&args, &config.options())?;

    info!("started"; "store" => %config.store.display(), "listen" => %config.listen);

    parent.supervise(config.shutdown_timeout).await
}
