use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pos_proxy::config;
use pos_proxy::listener::Listener;
use pos_proxy::session::SessionStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const VERSION_MARKER: &str = "POSPROXY.ver";

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = touch_version_marker() {
        warn!(error = %e, "could not write {VERSION_MARKER}");
    }

    let cwd = std::env::current_dir().unwrap_or_else(|e| {
        eprintln!("fatal: could not determine working directory: {e}");
        std::process::exit(1);
    });

    let proxy_files = discover_proxy_files(&cwd).unwrap_or_else(|e| {
        eprintln!("fatal: could not scan {} for .proxy files: {e}", cwd.display());
        std::process::exit(1);
    });

    if proxy_files.is_empty() {
        eprintln!("fatal: no .proxy files found in {}", cwd.display());
        std::process::exit(1);
    }

    let session_store = match SessionStore::open(&cwd) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("fatal: could not open session store: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = session_store.integrity_check().await {
        eprintln!("fatal: session store integrity check failed: {e}");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_tasks = Vec::new();

    for path in &proxy_files {
        match config::load(path) {
            Ok(cfg) => {
                info!(path = %path.display(), port = cfg.listen_port, "starting listener");
                let listener = Listener::new(&cfg, session_store.clone());
                let rx = shutdown_rx.clone();
                listener_tasks.push(tokio::spawn(listener.run(rx)));
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "skipping invalid config");
            }
        }
    }

    if listener_tasks.is_empty() {
        eprintln!("fatal: every .proxy file in {} failed to load", cwd.display());
        std::process::exit(1);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);

    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    let drain = futures_join_all(listener_tasks);
    tokio::pin!(drain);

    tokio::select! {
        _ = &mut drain => info!("all listeners stopped cleanly"),
        () = &mut grace => warn!("shutdown grace period elapsed, exiting anyway"),
    }

    let store = Arc::try_unwrap(session_store);
    if let Ok(store) = store {
        store.close().await;
    }
}

async fn futures_join_all(tasks: Vec<tokio::task::JoinHandle<Result<(), pos_proxy::ProxyError>>>) {
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "listener stopped with an error"),
            Err(e) => error!(error = %e, "listener task panicked"),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn touch_version_marker() -> std::io::Result<()> {
    std::fs::write(VERSION_MARKER, b"")
}

fn discover_proxy_files(dir: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_proxy_file = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("proxy"));
        if is_proxy_file {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
