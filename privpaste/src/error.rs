use crate::{rpc::StoreError, Role};
use derive_more::{Display, From};
use std::{borrow::Cow, io};

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "Permission denied, must run as root")]
    #[from(ignore)]
    PermissionDenied,
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Invalid configuration: {}", "_0")]
    #[from(ignore)]
    Config(String),
    #[display(fmt = "{}", "_0")]
    JoinError(tokio::task::JoinError),
    #[display(fmt = "Logging failed: {}", "_0")]
    LogError(privpaste_log::Error),
    #[display(fmt = "Username '{}' for dropping privileges not found", "_0")]
    #[from(ignore)]
    UserNotFound(Cow<'static, str>),
    #[display(fmt = "Group '{}' for dropping privileges not found", "_0")]
    #[from(ignore)]
    GroupNotFound(String),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Privdrop(&'static str, Box<dyn std::error::Error + Send + Sync>),
    #[display(fmt = "Failed to install sandbox ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Sandbox(&'static str, Box<dyn std::error::Error + Send + Sync>),
    #[display(fmt = "Protocol violation: {}", "_0")]
    #[from(ignore)]
    Protocol(&'static str),
    #[display(fmt = "Store request timed out")]
    #[from(ignore)]
    Timeout,
    #[display(fmt = "{}", "_0")]
    Store(StoreError),
    #[display(fmt = "Process {} exited: {}", "_0", "_1")]
    #[from(ignore)]
    ChildExited(Role, String),
}

impl Error {
    /// Returns true if the error breaks the process pair.
    ///
    /// Store errors are answers to a single request; everything else
    /// means that the transport or the process setup is unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Config(_))
    }
}

impl std::error::Error for Error {}
