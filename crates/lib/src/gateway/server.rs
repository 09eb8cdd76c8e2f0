//! Relay server: router construction, transport dispatch and shutdown.

use crate::channels::HipChatClient;
use crate::config::{self, Config, Transport};
use crate::gateway::fcgi;
use crate::relay::{room_message, Picker, RelayState, ROOM_MESSAGE_ROUTE};
use crate::search::BingClient;
use anyhow::{Context, Result};
use axum::{routing::post, Router};
use std::future::Future;
use std::sync::Arc;

/// The relay's routes with state applied.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(ROOM_MESSAGE_ROUTE, post(room_message))
        .with_state(state)
}

/// Build the relay from config (credentials, clients, random source) and serve it on `transport`.
/// Blocks until shutdown (Ctrl+C / SIGTERM), or until the stdio peer closes.
pub async fn run_server(config: Config, transport: Transport) -> Result<()> {
    let credentials = config::resolve_credentials(&config)?;
    let http = config::build_http_client(&config.http)?;
    let search = BingClient::new(
        config.bing.base_url.clone(),
        credentials.bing_account_key,
        http.clone(),
    );
    let notifier = HipChatClient::new(
        config.hipchat.base_url.clone(),
        credentials.hipchat_token,
        http,
    );
    let state = RelayState {
        search: Arc::new(search),
        notifier: Arc::new(notifier),
        picker: Arc::new(Picker::from_time()),
        max_body_bytes: config.http.max_body_bytes,
    };
    serve(
        router(state),
        transport,
        config.http.max_body_bytes,
        shutdown_signal(),
    )
    .await
}

/// Serve `app` on the given transport until `shutdown` completes. `max_body_bytes` bounds
/// what a FastCGI connection buffers per request.
pub async fn serve<F>(
    app: Router,
    transport: Transport,
    max_body_bytes: usize,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    log::info!("relay serving {} on {}", ROOM_MESSAGE_ROUTE, transport);
    match transport {
        Transport::Http { addr } => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding to {}", addr))?;
            log::info!("http listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .context("http server exited")?;
        }
        Transport::FcgiTcp { addr } => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding to {}", addr))?;
            log::info!("fastcgi listening on tcp {}", addr);
            fcgi::serve_tcp(listener, app, max_body_bytes, shutdown).await;
        }
        #[cfg(unix)]
        Transport::FcgiUnix { path } => {
            remove_stale_socket(&path)?;
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("binding unix socket {}", path.display()))?;
            log::info!("fastcgi listening on unix socket {}", path.display());
            fcgi::serve_unix(listener, app, max_body_bytes, shutdown).await;
            if let Err(e) = std::fs::remove_file(&path) {
                log::debug!("removing socket {} on shutdown: {}", path.display(), e);
            }
        }
        #[cfg(not(unix))]
        Transport::FcgiUnix { path } => {
            anyhow::bail!(
                "unix sockets are not supported on this platform ({})",
                path.display()
            );
        }
        Transport::FcgiStdio => serve_stdio(app, max_body_bytes, shutdown).await?,
    }
    log::info!("relay stopped");
    Ok(())
}

/// Remove a socket left behind by an earlier run. Anything else at `path` is an error.
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("inspecting {}", path.display())),
    };
    if !meta.file_type().is_socket() {
        anyhow::bail!(
            "{} exists and is not a socket; refusing to replace it",
            path.display()
        );
    }
    log::debug!("removing stale socket {}", path.display());
    std::fs::remove_file(path)
        .with_context(|| format!("removing stale socket {}", path.display()))
}

/// FastCGI on stdin. A front end that spawns the process passes a listening socket as
/// fd 0 and connects to it; when fd 0 is not a socket, stdin/stdout carry one connection.
async fn serve_stdio<F>(app: Router, max_body_bytes: usize, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    #[cfg(unix)]
    match listener_on_stdin() {
        Some(StdinListener::Unix(listener)) => {
            listener
                .set_nonblocking(true)
                .context("fastcgi listener on stdin")?;
            let listener = tokio::net::UnixListener::from_std(listener)
                .context("fastcgi listener on stdin")?;
            log::info!("fastcgi listening on unix socket passed as stdin");
            fcgi::serve_unix(listener, app, max_body_bytes, shutdown).await;
            return Ok(());
        }
        Some(StdinListener::Tcp(listener)) => {
            listener
                .set_nonblocking(true)
                .context("fastcgi listener on stdin")?;
            let listener = tokio::net::TcpListener::from_std(listener)
                .context("fastcgi listener on stdin")?;
            log::info!("fastcgi listening on tcp socket passed as stdin");
            fcgi::serve_tcp(listener, app, max_body_bytes, shutdown).await;
            return Ok(());
        }
        None => {}
    }

    log::info!("fastcgi on stdin/stdout");
    tokio::select! {
        res = fcgi::serve_connection(tokio::io::stdin(), tokio::io::stdout(), app, max_body_bytes) => {
            res.context("fastcgi over stdio")?;
        }
        _ = shutdown => {}
    }
    Ok(())
}

#[cfg(unix)]
enum StdinListener {
    Unix(std::os::unix::net::UnixListener),
    Tcp(std::net::TcpListener),
}

/// Take fd 0 as a listening socket, if it is one (FCGI_LISTENSOCK_FILENO).
#[cfg(unix)]
fn listener_on_stdin() -> Option<StdinListener> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};

    const LISTENSOCK_FILENO: std::os::unix::io::RawFd = 0;

    // SAFETY: fd 0 stays open for the life of the process and nothing else in the process
    // reads it in this mode. Each attempt either keeps the fd in the returned listener or hands
    // it back with into_raw_fd, so it is never closed twice.
    let unix = unsafe { std::os::unix::net::UnixListener::from_raw_fd(LISTENSOCK_FILENO) };
    // getsockname fails on pipes and ttys, and the address family check rejects inet sockets.
    if unix.local_addr().is_ok() {
        return Some(StdinListener::Unix(unix));
    }
    let fd = unix.into_raw_fd();
    // SAFETY: as above.
    let tcp = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    if tcp.local_addr().is_ok() {
        return Some(StdinListener::Tcp(tcp));
    }
    let _ = tcp.into_raw_fd();
    None
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
