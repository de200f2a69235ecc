use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use libakrun::remote::SshConnector;
use libakrun::{ConfigLookup, Daemon, LogRedirect, TaskLayout, TaskStore};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection::{self, FrontEnd};

const CONTROL_QUEUE_DEPTH: usize = 16;

pub async fn run(config: ServerConfig, redirect: LogRedirect) -> anyhow::Result<()> {
    let registry: Arc<dyn ConfigLookup> = Arc::new(config.registry()?);
    let settings = config.daemon_settings()?;

    for dir in [&config.data_dir, &config.completed_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(
        TaskStore::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );

    if let Some(parent) = config.pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.pid_file, std::process::id().to_string())?;

    let (control, control_rx) = libakrun::control::channel(CONTROL_QUEUE_DEPTH, config.control_timeout());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon::new(
        store.clone(),
        TaskLayout::new(&config.data_dir, &config.completed_dir),
        registry.clone(),
        Arc::new(SshConnector),
        settings.clone(),
        redirect,
    );
    let daemon_task = tokio::spawn(daemon.run(control_rx, shutdown_rx));

    let front = Arc::new(FrontEnd {
        store,
        lookup: registry,
        control,
        lock_poll: settings.lock_poll_interval(),
        lock_max_wait: settings.lock_max_wait,
    });

    let listener = bind(&config.socket_path)?;
    info!(
        socket = %config.socket_path.display(),
        pid = std::process::id(),
        "akrun server started"
    );

    let mut terminate = signal(SignalKind::terminate())?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let front = Arc::clone(&front);
                    tokio::spawn(async move {
                        if let Err(e) = connection::handle_client(front, stream).await {
                            tracing::debug!(err = %e, "client disconnected");
                        }
                    });
                }
                Err(e) => error!("accept error: {e}"),
            },
            _ = &mut ctrl_c => break,
            _ = terminate.recv() => break,
        }
    }

    info!("shutting down...");
    let _ = shutdown_tx.send(true);
    match daemon_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "scheduling daemon failed"),
        Err(e) => error!(error = %e, "scheduling daemon panicked"),
    }
    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(&config.pid_file);
    Ok(())
}

fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }
    Ok(listener)
}
