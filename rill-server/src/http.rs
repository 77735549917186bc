//! Read-only HTTP status endpoint.
//!
//! Serves JSON snapshots of the registries. Snapshots take only the
//! registry/bucket locks, never a session lock across I/O — the
//! response is fully built before anything is written.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::engine::Engine;

/// Spawn the status listener.
pub fn start(eng: Arc<Engine>, port: u16) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(target: "http", port, error = %e, "status listener failed");
                std::process::exit(1);
            }
        };
        info!(target: "http", port, "status endpoint listening");
        loop {
            let Ok((stream, _)) = listener.accept().await else { continue };
            let eng = Arc::clone(&eng);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let eng = Arc::clone(&eng);
                    async move { handle(&eng, req) }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });
}

fn handle(
    eng: &Arc<Engine>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.uri().path() {
        "/summary" => Some(summary(eng)),
        "/mapsize" => Some(eng.sessions.map_size()),
        "/dumpall" => Some(eng.sessions.dump_all()),
        "/streams" => Some(eng.streams.dump()),
        _ => None,
    };
    let rsp = match body {
        Some(value) => {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|e| e.to_string());
            Response::new(Full::new(Bytes::from(text)))
        }
        None => {
            let mut rsp = Response::new(Full::new(Bytes::from("not found\n")));
            *rsp.status_mut() = StatusCode::NOT_FOUND;
            rsp
        }
    };
    Ok(rsp)
}

fn summary(eng: &Arc<Engine>) -> serde_json::Value {
    json!({
        "time": {
            "current": crate::util::unix_ms() / 1000,
            "boot": eng.boot_unix_s,
        },
        "build": {
            "version": env!("CARGO_PKG_VERSION"),
        },
        "cookies": eng.cookies.len(),
        "session": eng.sessions.summary(),
        "streams": eng.streams.len(),
        "counts": eng.counts.snapshot(),
    })
}
