//! The store process.

use crate::{
    error::Error,
    process::{Child, Options},
    rpc::StoreServer,
    sandbox::SandboxPolicy,
    store::Store,
    Config, Role,
};
use nix::unistd::chown;
use privpaste_log::{debug, info, warn};
use std::{
    fs::{self, DirBuilder, Permissions},
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    time,
};

pub async fn main(config: Arc<Config>) -> Result<(), Error> {
    let child = Child::adopt(Role::Store)?;
    let options = config.options();

    // The supervisor coordinates the shutdown.
    let _sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    prepare_root(&config.store, &options)?;

    let sandboxed = child.harden(Some(&config.store), SandboxPolicy::store(), &options)?;
    let root = if options.disable_privdrop {
        config.store.clone()
    } else {
        PathBuf::from("/")
    };

    let store = Arc::new(Store::open(root, config.limits())?);
    let (control, descriptors) = sandboxed.into_channels();
    let server = StoreServer::new(store.clone(), control, descriptors);

    let reaper = tokio::spawn(reap(store, config.reap_interval));

    let result = tokio::select! {
        result = server.run() => result,
        _ = sigterm.recv() => {
            info!("received SIGTERM, stopping store");
            Ok(())
        }
    };

    reaper.abort();
    server.shutdown();

    result
}

/// Create the store directory and hand it to the privdrop user.
fn prepare_root(root: &Path, options: &Options) -> Result<(), Error> {
    if !root.is_dir() {
        DirBuilder::new().recursive(true).mode(0o700).create(root)?;
        info!("created store directory"; "path" => %root.display());
    }

    if !options.disable_privdrop {
        let (user, gid) = options.credentials()?;
        chown(root, Some(user.uid), Some(gid))?;
        fs::set_permissions(root, Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Periodically remove expired items.
async fn reap(store: Arc<Store>, interval: Duration) {
    let mut interval = time::interval(interval);

    loop {
        interval.tick().await;

        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.reap()).await {
            Ok(count) => debug!("reaper finished"; "removed" => count),
            Err(err) => warn!("reaper failed"; "error" => %err),
        }
    }
}
