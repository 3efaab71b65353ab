//! The listening socket, created before the privilege drop.

use crate::{
    config::{Config, ListenAddr},
    error::Error,
};
use nix::{
    sys::stat::{umask, Mode},
    unistd::{chown, Group, User},
};
use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::Path,
};
use tokio::net::{TcpListener, UnixListener};

/// A bound TCP or Unix socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub async fn bind(config: &Config) -> Result<Listener, Error> {
    match &config.listen {
        ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        ListenAddr::Unix(path) => bind_unix(
            path,
            config.unix_mode,
            config.unix_owner.as_deref(),
            config.unix_group.as_deref(),
        )
        .map(Listener::Unix),
    }
}

/// Bind a Unix socket and apply its ownership and mode.
///
/// The socket is created with a restrictive umask so that it is never
/// accessible with wider permissions than requested.
fn bind_unix(
    path: &Path,
    mode: u32,
    owner: Option<&str>,
    group: Option<&str>,
) -> Result<UnixListener, Error> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => fs::remove_file(path)?,
        Ok(_) => {
            return Err(Error::Config(format!(
                "{} exists and is not a socket",
                path.display()
            )))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let old = umask(Mode::S_IXUSR | Mode::S_IXGRP | Mode::S_IROTH | Mode::S_IWOTH | Mode::S_IXOTH);
    let listener = UnixListener::bind(path);
    umask(old);
    let listener = listener?;

    let uid = match owner {
        Some(name) => Some(
            User::from_name(name)?
                .ok_or_else(|| Error::UserNotFound(name.to_string().into()))?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            Group::from_name(name)?
                .ok_or_else(|| Error::GroupNotFound(name.to_string()))?
                .gid,
        ),
        None => None,
    };
    if uid.is_some() || gid.is_some() {
        chown(path, uid, gid)?;
    }
    fs::set_permissions(path, Permissions::from_mode(mode))?;

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::bind_unix;
    use std::{fs, os::unix::fs::PermissionsExt};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paste.sock");

        let listener = bind_unix(&path, 0o660, None, None).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
        drop(listener);

        // A stale socket is replaced.
        let _listener = bind_unix(&path, 0o600, None, None).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refuse_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paste.sock");
        fs::write(&path, b"data").unwrap();

        assert!(bind_unix(&path, 0o600, None, None).is_err());
        assert!(path.is_file());
    }
}
