//! Privilege-separated ephemeral file and paste sharing.
//!
//! `privpasted` splits the service into three processes that only talk
//! to each other over `imsg` channels:
//!
//! - the privileged parent spawns and supervises the children;
//! - the store owns the item directory and hands out descriptors for
//!   item content;
//! - the webserver accepts HTTP requests and never opens a path in the
//!   store.
//!
//! Each child is a re-execution of the same binary with its role as
//! `argv[0]`.  Before a child reads its first message it drops its
//! privileges into a chroot and installs a syscall filter.
//!
//! ```text
//!               parent
//!              /      \
//!          store <--> webserver
//!       (control + descriptor channel)
//! ```

pub mod config;
mod error;
pub mod imsg;
pub mod mime;
pub mod net;
mod parent;
pub mod process;
pub mod rpc;
pub mod sandbox;
pub mod store;
pub mod units;
pub mod webserver;

pub use {config::Config, error::Error};
use privpaste_derive::Privsep;
use privpaste_log::crit;
use std::sync::Arc;

/// The privsep processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Privsep)]
pub enum Role {
    /// Supervisor
    #[parent]
    Parent,
    /// Item store
    Store,
    /// HTTP frontend
    Webserver,
}

/// Run the process of the given role until it stops.
pub async fn run(role: Role, config: Config) -> Result<(), Error> {
    let name = format!("privpasted({})", role);
    let _guard = privpaste_log::async_logger(&name, config.logging()).await?;
    let config = Arc::new(config);

    let result = match role {
        Role::Parent => parent::main(config).await,
        Role::Store => store::child::main(config).await,
        Role::Webserver => webserver::main(config).await,
    };

    if let Err(err) = &result {
        crit!("process failed"; "role" => %role, "error" => %err);
    }

    result
}
