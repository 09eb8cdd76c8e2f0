//! FastCGI responder: turns FastCGI requests into HTTP requests for the axum router
//! and writes the responses back as CGI output.
//!
//! Requests are multiplexed by id on a connection; each completed request runs in its own task.
//! PARAMS and STDIN are buffered up to the body limit; a request that goes over it is answered
//! with a 500 and the rest of its records are dropped. ABORT_REQUEST ends a request whether or
//! not it has been dispatched; an aborted in-flight request gets END_REQUEST but no STDOUT.

use crate::gateway::protocol::{
    self, BeginRequest, FcgiError, ProtocolStatus, Record, RecordType, NULL_REQUEST_ID,
    ROLE_RESPONDER,
};
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, Response},
    Router,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tower::ServiceExt;

/// Values reported for FCGI_GET_VALUES.
const MAX_CONNS: &str = "128";
const MAX_REQS: &str = "128";
const MPXS_CONNS: &str = "1";

/// A request between BEGIN_REQUEST and its empty STDIN record.
#[derive(Default)]
struct PendingRequest {
    keep_conn: bool,
    params_raw: Vec<u8>,
    params: Option<Vec<(String, String)>>,
    stdin: Vec<u8>,
}

type SharedWriter<W> = Arc<Mutex<W>>;

/// Ids of dispatched requests, mapped to whether they were aborted since.
type Dispatched = Arc<std::sync::Mutex<HashMap<u16, bool>>>;

/// Per-connection state shared by the record loop and the request tasks.
struct Connection<W> {
    writer: SharedWriter<W>,
    app: Router,
    max_body_bytes: usize,
    dispatched: Dispatched,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&self, kind: RecordType, id: u16, content: &[u8]) -> Result<(), FcgiError> {
        let mut w = self.writer.lock().await;
        protocol::write_record(&mut *w, kind, id, content).await?;
        w.flush().await?;
        Ok(())
    }

    async fn end_request(&self, id: u16, status: ProtocolStatus) -> Result<(), FcgiError> {
        self.write(RecordType::EndRequest, id, &protocol::end_request_body(0, status))
            .await
    }

    /// Answer a request that went over the body limit without dispatching it.
    async fn reject_oversized(&self, id: u16, what: &str) -> Result<(), FcgiError> {
        log::warn!(
            "fastcgi request {}: {} exceeds {} bytes",
            id,
            what,
            self.max_body_bytes
        );
        let output = format!(
            "Status: 500 Internal Server Error\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{} exceeds {} bytes",
            what, self.max_body_bytes
        );
        write_output(&self.writer, id, Some(output.as_bytes())).await
    }
}

/// Serve one FastCGI connection until the peer closes it, or until a request without
/// FCGI_KEEP_CONN completes. Requests whose params or body exceed `max_body_bytes` are
/// answered with a 500 without reaching `app`.
pub async fn serve_connection<R, W>(
    mut reader: R,
    writer: W,
    app: Router,
    max_body_bytes: usize,
) -> Result<(), FcgiError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let conn = Connection {
        writer: Arc::new(Mutex::new(writer)),
        app,
        max_body_bytes,
        dispatched: Arc::new(std::sync::Mutex::new(HashMap::new())),
    };
    let mut pending: HashMap<u16, PendingRequest> = HashMap::new();
    let mut in_flight = JoinSet::new();

    let result = loop {
        let record = match protocol::read_record(&mut reader).await {
            Ok(Some(r)) => r,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        match handle_record(record, &mut pending, &conn, &mut in_flight).await {
            Ok(Continue::Yes) => {}
            Ok(Continue::No) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            log::warn!("fastcgi request task failed: {}", e);
        }
    }
    let mut w = conn.writer.lock().await;
    let _ = w.shutdown().await;
    result
}

enum Continue {
    Yes,
    No,
}

fn lock_dispatched(d: &Dispatched) -> std::sync::MutexGuard<'_, HashMap<u16, bool>> {
    d.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn handle_record<W>(
    record: Record,
    pending: &mut HashMap<u16, PendingRequest>,
    conn: &Connection<W>,
    in_flight: &mut JoinSet<()>,
) -> Result<Continue, FcgiError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = record.request_id;
    match record.record_type() {
        Some(RecordType::GetValues) if id == NULL_REQUEST_ID => {
            let body = get_values_result(&record.content)?;
            conn.write(RecordType::GetValuesResult, NULL_REQUEST_ID, &body)
                .await?;
        }
        Some(RecordType::BeginRequest) => {
            let begin = BeginRequest::parse(&record.content)?;
            if begin.role != ROLE_RESPONDER {
                log::debug!("fastcgi request {} has unsupported role {}", id, begin.role);
                conn.end_request(id, ProtocolStatus::UnknownRole).await?;
                if !begin.keep_conn() {
                    return Ok(Continue::No);
                }
            } else {
                pending.insert(
                    id,
                    PendingRequest {
                        keep_conn: begin.keep_conn(),
                        ..Default::default()
                    },
                );
            }
        }
        Some(RecordType::Params) => {
            let Some(req) = pending.get_mut(&id) else {
                return Ok(Continue::Yes);
            };
            if record.content.is_empty() {
                req.params = Some(protocol::decode_pairs(&req.params_raw)?);
                req.params_raw.clear();
            } else if req.params_raw.len() + record.content.len() > conn.max_body_bytes {
                let keep_conn = req.keep_conn;
                pending.remove(&id);
                conn.reject_oversized(id, "request params").await?;
                if !keep_conn {
                    return Ok(Continue::No);
                }
            } else {
                req.params_raw.extend_from_slice(&record.content);
            }
        }
        Some(RecordType::Stdin) => {
            let Some(req) = pending.get_mut(&id) else {
                return Ok(Continue::Yes);
            };
            if !record.content.is_empty() {
                if req.stdin.len() + record.content.len() > conn.max_body_bytes {
                    let keep_conn = req.keep_conn;
                    pending.remove(&id);
                    conn.reject_oversized(id, "request body").await?;
                    if !keep_conn {
                        return Ok(Continue::No);
                    }
                } else {
                    req.stdin.extend_from_slice(&record.content);
                }
                return Ok(Continue::Yes);
            }
            if let Some(req) = pending.remove(&id) {
                let keep_conn = req.keep_conn;
                let app = conn.app.clone();
                let writer = conn.writer.clone();
                let dispatched = conn.dispatched.clone();
                lock_dispatched(&dispatched).insert(id, false);
                in_flight.spawn(async move {
                    if let Err(e) = respond(id, req, app, writer, dispatched).await {
                        log::debug!("fastcgi request {}: {}", id, e);
                    }
                });
                if !keep_conn {
                    return Ok(Continue::No);
                }
            }
        }
        Some(RecordType::AbortRequest) => {
            if pending.remove(&id).is_some() {
                log::debug!("fastcgi request {} aborted before dispatch", id);
                conn.end_request(id, ProtocolStatus::RequestComplete).await?;
            } else {
                let mut dispatched = lock_dispatched(&conn.dispatched);
                if let Some(aborted) = dispatched.get_mut(&id) {
                    log::debug!("fastcgi request {} aborted in flight", id);
                    *aborted = true;
                }
            }
        }
        // Only the authorizer/filter roles send DATA; those are refused at BEGIN_REQUEST.
        Some(RecordType::Data) => {}
        _ if id == NULL_REQUEST_ID => {
            conn.write(
                RecordType::UnknownType,
                NULL_REQUEST_ID,
                &protocol::unknown_type_body(record.kind),
            )
            .await?;
        }
        _ => {
            log::debug!("fastcgi: ignoring record type {} for request {}", record.kind, id);
        }
    }
    Ok(Continue::Yes)
}

/// Answer GET_VALUES with the variables we know; unknown names are left out.
fn get_values_result(content: &[u8]) -> Result<Vec<u8>, FcgiError> {
    let asked = protocol::decode_pairs(content)?;
    let known: Vec<(&str, &str)> = asked
        .iter()
        .filter_map(|(name, _)| match name.as_str() {
            "FCGI_MAX_CONNS" => Some(("FCGI_MAX_CONNS", MAX_CONNS)),
            "FCGI_MAX_REQS" => Some(("FCGI_MAX_REQS", MAX_REQS)),
            "FCGI_MPXS_CONNS" => Some(("FCGI_MPXS_CONNS", MPXS_CONNS)),
            _ => None,
        })
        .collect();
    Ok(protocol::encode_pairs(known))
}

/// Dispatch one request through the router and write STDOUT + END_REQUEST.
/// If the request was aborted meanwhile, only END_REQUEST is written.
async fn respond<W>(
    id: u16,
    req: PendingRequest,
    app: Router,
    writer: SharedWriter<W>,
    dispatched: Dispatched,
) -> Result<(), FcgiError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let params = req.params.unwrap_or_default();
    let output = match build_request(&params, req.stdin) {
        Ok(http_req) => match app.oneshot(http_req).await {
            Ok(res) => cgi_output(res).await,
            Err(never) => match never {},
        },
        Err(e) => {
            log::debug!("fastcgi request {} rejected: {}", id, e);
            Ok(format!("Status: 400 Bad Request\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}", e)
                .into_bytes())
        }
    };

    let aborted = lock_dispatched(&dispatched).remove(&id).unwrap_or(false);
    if aborted {
        return write_output(&writer, id, None).await;
    }
    write_output(&writer, id, Some(&output?)).await
}

/// Write a request's STDOUT stream (if any) and its END_REQUEST in one go.
async fn write_output<W>(
    writer: &SharedWriter<W>,
    id: u16,
    output: Option<&[u8]>,
) -> Result<(), FcgiError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = Vec::with_capacity(output.map_or(0, <[u8]>::len) + 64);
    if let Some(output) = output {
        protocol::encode_stream(&mut buf, RecordType::Stdout, id, output);
    }
    protocol::encode_record(
        &mut buf,
        RecordType::EndRequest,
        id,
        &protocol::end_request_body(0, ProtocolStatus::RequestComplete),
    );
    let mut w = writer.lock().await;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// CGI environment to HTTP request: method, URI (REQUEST_URI, else SCRIPT_NAME + PATH_INFO + QUERY_STRING)
/// and headers (HTTP_* plus CONTENT_TYPE / CONTENT_LENGTH).
pub fn build_request(params: &[(String, String)], body: Vec<u8>) -> Result<Request<Body>, FcgiError> {
    let method = param(params, "REQUEST_METHOD").unwrap_or("GET");
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| FcgiError::Malformed(format!("invalid REQUEST_METHOD {:?}", method)))?;

    let uri = match param(params, "REQUEST_URI").filter(|u| !u.is_empty()) {
        Some(u) => u.to_string(),
        None => {
            let mut u = format!(
                "{}{}",
                param(params, "SCRIPT_NAME").unwrap_or(""),
                param(params, "PATH_INFO").unwrap_or("")
            );
            if u.is_empty() {
                u.push('/');
            }
            if let Some(q) = param(params, "QUERY_STRING").filter(|q| !q.is_empty()) {
                u.push('?');
                u.push_str(q);
            }
            u
        }
    };

    let mut builder = Request::builder().method(method).uri(uri.as_str());
    for (name, value) in params {
        let header = if let Some(rest) = name.strip_prefix("HTTP_") {
            rest.replace('_', "-").to_ascii_lowercase()
        } else if name == "CONTENT_TYPE" || name == "CONTENT_LENGTH" {
            name.replace('_', "-").to_ascii_lowercase()
        } else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        match (
            HeaderName::from_bytes(header.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => builder = builder.header(n, v),
            _ => log::debug!("fastcgi: skipping unrepresentable header {}", name),
        }
    }
    builder
        .body(Body::from(body))
        .map_err(|e| FcgiError::Malformed(format!("invalid request {:?}: {}", uri, e)))
}

/// HTTP response to CGI output: `Status:` line, headers, blank line, body.
async fn cgi_output(res: Response<Body>) -> Result<Vec<u8>, FcgiError> {
    let (parts, body) = res.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| FcgiError::Malformed(format!("reading response body: {}", e)))?;

    let mut out = Vec::with_capacity(body.len() + 128);
    out.extend_from_slice(
        format!(
            "Status: {} {}\r\n",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in parts.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&body);
    Ok(out)
}

/// Accept FastCGI connections on a TCP listener until `shutdown` completes.
pub async fn serve_tcp<F>(
    listener: tokio::net::TcpListener,
    app: Router,
    max_body_bytes: usize,
    shutdown: F,
) where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("fastcgi connection from {}", peer);
                    let app = app.clone();
                    tokio::spawn(async move {
                        let (r, w) = stream.into_split();
                        if let Err(e) = serve_connection(r, w, app, max_body_bytes).await {
                            log::debug!("fastcgi connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("fastcgi accept failed: {}", e),
            },
        }
    }
}

/// Accept FastCGI connections on a Unix-domain socket until `shutdown` completes.
#[cfg(unix)]
pub async fn serve_unix<F>(
    listener: tokio::net::UnixListener,
    app: Router,
    max_body_bytes: usize,
    shutdown: F,
) where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    log::debug!("fastcgi connection on unix socket");
                    let app = app.clone();
                    tokio::spawn(async move {
                        let (r, w) = stream.into_split();
                        if let Err(e) = serve_connection(r, w, app, max_body_bytes).await {
                            log::debug!("fastcgi unix connection ended: {}", e);
                        }
                    });
                }
                Err(e) => log::warn!("fastcgi accept failed: {}", e),
            },
        }
    }
}
