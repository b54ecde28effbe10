//! In-process HTTP server that plays both the service under test and the test proxy.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

static RESPONSE_BODY: Bytes = Bytes::from_static(b"{\"status\":\"ok\"}");

const ID_HEADER: &str = "x-recording-id";
const MODE_HEADER: &str = "x-recording-mode";
const UPSTREAM_HEADER: &str = "x-recording-upstream-base-uri";
const FILE_HEADER: &str = "x-recording-file";

/// One request as the server saw it
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub recording_id: Option<String>,
    pub mode: Option<String>,
    pub upstream: Option<String>,
    pub file: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub body_len: usize,
}

#[derive(Default)]
struct ServerState {
    seen: Mutex<Vec<SeenRequest>>,
    next_id: AtomicU64,
    data_status: Mutex<Option<StatusCode>>,
    control_status: Mutex<HashMap<String, StatusCode>>,
    omit_recording_id: AtomicBool,
}

/// Server handle; shuts down on drop
pub struct FakeProxy {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl FakeProxy {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => continue,
                    },
                };
                stream.set_nodelay(true).ok();
                let io = TokioIo::new(stream);
                let state = Arc::clone(&accept_state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Make non-proxy requests answer with `status`
    pub fn fail_data_requests(&self, status: u16) {
        if let Ok(mut s) = self.state.data_status.lock() {
            *s = StatusCode::from_u16(status).ok();
        }
    }

    /// Make the proxy control endpoint `path` answer with `status`
    pub fn fail_control(&self, path: &str, status: u16) {
        let Ok(code) = StatusCode::from_u16(status) else {
            return;
        };
        if let Ok(mut s) = self.state.control_status.lock() {
            s.insert(path.to_string(), code);
        }
    }

    /// Answer `/record/start` without an `x-recording-id` header
    pub fn omit_recording_id(&self) {
        self.state.omit_recording_id.store(true, Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state
            .seen
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn count_path(&self, path: &str) -> usize {
        self.seen().iter().filter(|r| r.path == path).count()
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let recording_id = header(&req, ID_HEADER);
    let mode = header(&req, MODE_HEADER);
    let upstream = header(&req, UPSTREAM_HEADER);
    let file = header(&req, FILE_HEADER);
    let content_type = header(&req, "content-type");
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    if let Ok(mut seen) = state.seen.lock() {
        seen.push(SeenRequest {
            method,
            path: path.clone(),
            recording_id: recording_id.clone(),
            mode,
            upstream,
            file,
            content_type,
            body_len: body.len(),
            body,
        });
    }

    let failed = state
        .control_status
        .lock()
        .ok()
        .and_then(|s| s.get(&path).copied());
    if let Some(status) = failed {
        return Ok(respond(status)
            .body(Full::new(Bytes::from_static(b"{\"error\":\"proxy failure\"}")))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))));
    }

    let response = match path.as_str() {
        "/record/start" if state.omit_recording_id.load(Ordering::SeqCst) => {
            respond(StatusCode::OK)
        }
        "/record/start" => {
            let id = format!("rec-{}", state.next_id.fetch_add(1, Ordering::SeqCst));
            respond(StatusCode::OK).header(ID_HEADER, id)
        }
        "/playback/start" => match recording_id {
            Some(id) => respond(StatusCode::OK).header(ID_HEADER, format!("play-{}", id)),
            None => respond(StatusCode::BAD_REQUEST),
        },
        "/record/stop" | "/playback/stop" => match recording_id {
            Some(_) => respond(StatusCode::OK),
            None => respond(StatusCode::BAD_REQUEST),
        },
        _ => {
            let status = state
                .data_status
                .lock()
                .ok()
                .and_then(|s| *s)
                .unwrap_or(StatusCode::OK);
            respond(status)
        }
    };

    Ok(response
        .body(Full::new(RESPONSE_BODY.clone()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

fn respond(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
}
