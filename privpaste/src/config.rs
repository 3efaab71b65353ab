//! Command line configuration.
//!
//! Every process parses the same arguments: the parent forwards its
//! command line to the children it executes.  The parsed [`Config`] is
//! never changed afterwards.

use crate::{
    error::Error,
    mime::MimeMap,
    process::Options,
    store::Limits,
    units::{parse_bytesize, parse_duration},
};
use clap::Parser;
use derive_more::Display;
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Privilege-separated ephemeral file and paste sharing.
#[derive(Debug, Clone, Parser)]
#[command(name = "privpasted", version, about)]
pub struct Config {
    /// Directory of the item store.
    #[arg(long, value_name = "DIR")]
    pub store: PathBuf,

    /// Maximum item size, e.g. 512KiB or 10MB.
    #[arg(long, default_value = "10MiB", value_parser = parse_bytesize)]
    pub max_size: u64,

    /// Maximum item lifetime, e.g. 1w or 2d12h.
    #[arg(long, default_value = "24h", value_parser = parse_duration)]
    pub max_lifetime: Duration,

    /// Maximum number of stored items.
    #[arg(long, default_value_t = 100_000)]
    pub max_items: usize,

    /// Contact address for abuse reports.
    #[arg(long)]
    pub contact: String,

    /// Serve items of this MIME type as application/octet-stream.
    #[arg(long, value_name = "MIME")]
    pub mime_drop: Vec<String>,

    /// Serve items of MIME type FROM as TO.
    #[arg(long, value_name = "FROM=TO")]
    pub mime_map: Vec<MimeRewrite>,

    /// TCP address or, starting with '/' or '.', a Unix socket path.
    #[arg(long, default_value = ":8080")]
    pub listen: ListenAddr,

    /// Octal file mode of the Unix socket.
    #[arg(long, default_value = "0600", value_parser = parse_mode)]
    pub unix_mode: u32,

    /// Owner of the Unix socket.
    #[arg(long)]
    pub unix_owner: Option<String>,

    /// Group of the Unix socket.
    #[arg(long)]
    pub unix_group: Option<String>,

    /// URL path prefix, e.g. /paste.
    #[arg(long, default_value = "")]
    pub url_prefix: String,

    /// Unprivileged user of the child processes.
    #[arg(long, default_value = "nobody")]
    pub user: String,

    /// Unprivileged group, defaults to the user's group.
    #[arg(long)]
    pub group: Option<String>,

    /// Run without root, chroot and privilege drop.
    #[arg(long)]
    pub no_privdrop: bool,

    /// Run without syscall filter.
    #[arg(long)]
    pub no_sandbox: bool,

    /// Deadline of a single store request.
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub rpc_timeout: Duration,

    /// Interval of the expiry sweep.
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub reap_interval: Duration,

    /// Time after which an unfinished upload is discarded.
    #[arg(long, default_value = "15m", value_parser = parse_duration)]
    pub upload_timeout: Duration,

    /// Time to wait for the children on shutdown.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,

    /// Log to stderr instead of syslog.
    #[arg(short = 'd', long)]
    pub foreground: bool,

    /// Log debug messages.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Check the values that the parsers cannot check alone.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_size == 0 {
            return Err(Error::Config("--max-size must not be zero".into()));
        }
        if self.max_lifetime.is_zero() {
            return Err(Error::Config("--max-lifetime must not be zero".into()));
        }
        if self.max_items == 0 {
            return Err(Error::Config("--max-items must not be zero".into()));
        }
        if self.contact.trim().is_empty() {
            return Err(Error::Config("--contact must be set".into()));
        }
        for timeout in [
            self.rpc_timeout,
            self.reap_interval,
            self.upload_timeout,
            self.shutdown_timeout,
        ] {
            if timeout.is_zero() {
                return Err(Error::Config("timeouts must not be zero".into()));
            }
        }
        if !self.url_prefix.is_empty()
            && (!self.url_prefix.starts_with('/') || self.url_prefix.ends_with('/'))
        {
            return Err(Error::Config(
                "--url-prefix must start with '/' and must not end with '/'".into(),
            ));
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_size: self.max_size,
            max_lifetime: self.max_lifetime,
            max_items: self.max_items,
            upload_timeout: self.upload_timeout,
        }
    }

    pub fn mime_map(&self) -> MimeMap {
        MimeMap::new(
            self.mime_drop.iter().map(String::as_str),
            self.mime_map
                .iter()
                .map(|rewrite| (rewrite.from.as_str(), rewrite.to.as_str())),
        )
    }

    /// Hardening options of the child processes.
    pub fn options(&self) -> Options {
        Options {
            disable_privdrop: self.no_privdrop,
            disable_sandbox: self.no_sandbox,
            username: self.user.clone().into(),
            groupname: self.group.clone(),
        }
    }

    pub fn logging(&self) -> privpaste_log::Config {
        privpaste_log::Config {
            foreground: self.foreground,
            verbose: self.verbose,
        }
    }
}

/// Listening socket address.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    #[display(fmt = "{}", "_0")]
    Tcp(String),
    #[display(fmt = "unix:{}", "_0.display()")]
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err("empty listen address".to_string())
        } else if s.starts_with('/') || s.starts_with('.') {
            Ok(Self::Unix(PathBuf::from(s)))
        } else if s.starts_with(':') {
            Ok(Self::Tcp(format!("0.0.0.0{}", s)))
        } else {
            Ok(Self::Tcp(s.to_string()))
        }
    }
}

/// A `FROM=TO` MIME rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeRewrite {
    pub from: String,
    pub to: String,
}

impl FromStr for MimeRewrite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => Ok(Self {
                from: from.trim().to_string(),
                to: to.trim().to_string(),
            }),
            _ => Err(format!("expected FROM=TO, got '{}'", s)),
        }
    }
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8)
        .ok()
        .filter(|mode| *mode <= 0o777)
        .ok_or_else(|| format!("invalid octal mode '{}'", s))
}
