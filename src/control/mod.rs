//! HTTP control server.
//!
//! Exposes the running coordinator to `stackd status|restart|down`:
//!
//! - `GET /health` → liveness plus a phase summary and collector counters
//! - `GET /services` → every service snapshot in startup order
//! - `GET /services/{name}` → one snapshot with its probe history
//! - `POST /services/{name}/restart` → manual restart
//! - `POST /shutdown` → orderly shutdown
//!
//! Raw TCP with a minimal HTTP/1.1 reader; every response closes the
//! connection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorHandle, Phase};
use crate::error::StackError;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST: usize = 8 * 1024;

/// Status line and JSON body of a response.
type Reply = (&'static str, Value);

/// Bind `addr` and serve the control API until the returned task is aborted.
///
/// Returns the bound address (useful with port 0) and the accept-loop task.
pub async fn start_control_server(
    addr: &str,
    handle: CoordinatorHandle,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "Control server listening on http://{}", local);
    let started = Instant::now();

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &handle, started).await {
                            debug!(peer = %peer, error = %e, "Control connection error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Control server accept error");
                }
            }
        }
    });

    Ok((local, task))
}

async fn serve(mut stream: TcpStream, handle: &CoordinatorHandle, started: Instant) -> std::io::Result<()> {
    let Some(head) = read_head(&mut stream).await? else {
        return Ok(());
    };
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let raw_path = parts.next().unwrap_or_default();
    let path = raw_path.split('?').next().unwrap_or(raw_path);

    let (status, body) = route(method, path, handle, started).await;
    debug!(method, path, status, "Control request");

    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Read until the end of the request headers. Bodies are not used by any route.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Ok(None),
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST {
            break;
        }
    }
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn route(method: &str, path: &str, handle: &CoordinatorHandle, started: Instant) -> Reply {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => health(handle, started).await,
        ("GET", ["services"]) => match handle.status().await {
            Ok(services) => ok(json!(services)),
            Err(e) => error_reply(&e),
        },
        ("GET", ["services", name]) => match handle.service(name).await {
            Ok(detail) => ok(json!(detail)),
            Err(e) => error_reply(&e),
        },
        ("POST", ["services", name, "restart"]) => match handle.restart(name).await {
            Ok(()) => (
                "202 Accepted",
                json!({ "status": "accepted", "service": name }),
            ),
            Err(e) => error_reply(&e),
        },
        ("POST", ["shutdown"]) => match handle.shutdown().await {
            Ok(()) => ("202 Accepted", json!({ "status": "shutting_down" })),
            Err(e) => error_reply(&e),
        },
        (_, ["health"]) | (_, ["services"]) | (_, ["services", _]) | (_, ["services", _, "restart"])
        | (_, ["shutdown"]) => (
            "405 Method Not Allowed",
            json!({ "error": "method_not_allowed" }),
        ),
        _ => ("404 Not Found", json!({ "error": "not_found" })),
    }
}

async fn health(handle: &CoordinatorHandle, started: Instant) -> Reply {
    let services = match handle.status().await {
        Ok(services) => services,
        Err(e) => return error_reply(&e),
    };
    let count = |phase: Phase| services.iter().filter(|s| s.phase == phase).count();
    ok(json!({
        "status": "ok",
        "uptime_secs": started.elapsed().as_secs(),
        "services": services.len(),
        "healthy": count(Phase::Healthy),
        "unhealthy": count(Phase::Unhealthy),
        "failed": count(Phase::Failed),
        "pending": count(Phase::Pending),
        "collectors": handle.sink_stats(),
    }))
}

fn ok(body: Value) -> Reply {
    ("200 OK", body)
}

fn error_reply(err: &StackError) -> Reply {
    let status = match err {
        StackError::NotFound(_) => "404 Not Found",
        StackError::InvalidState(_) => "409 Conflict",
        StackError::ControlClosed => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    };
    (status, json!({ "error": err.to_string() }))
}
