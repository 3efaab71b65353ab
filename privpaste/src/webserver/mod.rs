//! The webserver process.
//!
//! It binds the listening socket, drops into an empty jail and talks
//! to the store over its two channels.

pub mod adapter;
pub mod listen;
mod routes;

use crate::{
    error::Error,
    process::Child,
    rpc::StoreClient,
    sandbox::SandboxPolicy,
    webserver::{
        adapter::Adapter,
        listen::Listener,
        routes::{router, AppState},
    },
    Config, Role,
};
use axum::Router;
use privpaste_log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::Notify,
    time,
};

pub async fn main(config: Arc<Config>) -> Result<(), Error> {
    let child = Child::adopt(Role::Webserver)?;
    let options = config.options();

    // The supervisor coordinates the shutdown.
    let _sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let listener = listen::bind(&config).await?;
    info!("listening"; "address" => %config.listen);

    let sandboxed = child.harden(None, SandboxPolicy::webserver(), &options)?;
    let (control, descriptors) = sandboxed.into_channels();
    let client = StoreClient::new(control, descriptors, config.rpc_timeout);

    let adapter = Arc::new(Adapter::new(
        client.clone(),
        config.limits(),
        config.mime_map(),
    ));
    let app = router(AppState::new(adapter, &config));

    let shutdown = Arc::new(Notify::new());
    let mut server = tokio::spawn(serve(listener, app, shutdown.clone()));

    let result = tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, stopping webserver");
            Ok(())
        }
        _ = client.failed() => {
            error!("store connection failed, stopping webserver");
            Err(Error::Protocol("store connection failed"))
        }
        result = &mut server => {
            client.close();
            return result?;
        }
    };

    // Give open requests a chance to finish.
    shutdown.notify_one();
    match time::timeout(config.shutdown_timeout / 2, &mut server).await {
        Ok(Ok(Ok(()))) => debug!("webserver drained"),
        Ok(Ok(Err(err))) => warn!("webserver failed"; "error" => %err),
        Ok(Err(err)) => warn!("webserver task failed"; "error" => %err),
        Err(_) => {
            warn!("connections did not drain in time");
            server.abort();
        }
    }
    client.close();

    result
}

async fn serve(listener: Listener, app: Router, shutdown: Arc<Notify>) -> Result<(), Error> {
    let stop = async move { shutdown.notified().await };

    match listener {
        Listener::Tcp(listener) => {
            axum::serve(listener, app)
                .with_graceful_shutdown(stop)
                .await?
        }
        Listener::Unix(listener) => {
            axum::serve(listener, app)
                .with_graceful_shutdown(stop)
                .await?
        }
    }

    Ok(())
}
