//! The RPC bridge protocol: session lifecycle and call forwarding to a
//! sibling backend over the framed TCP transport.
//!
//! Outgoing records carry `{xid, addr, code, callback, data, reliable,
//! port}`; incoming server frames carry a broadcast or a close command;
//! incoming client frames carry an RPC result for one session. Payloads
//! are JSON documents behind the magic+length frame.

use std::net::SocketAddrV4;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::session;

// ─── Records ─────────────────────────────────────────────────────────────────

/// An outgoing bridge request.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub xid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    pub code: String,
    pub callback: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    pub reliable: bool,
    /// Our own bridge listen port, so the backend can dial back.
    pub port: u32,
}

/// An RPC result pushed back for one session.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub xid: u32,
    #[serde(default)]
    pub data: Vec<u8>,
    pub callback: f64,
    pub reliable: bool,
}

/// A command received on the serving side.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Broadcast>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<CloseCommand>,
}

/// Deliver `data` to every listed session.
#[derive(Debug, Serialize, Deserialize)]
pub struct Broadcast {
    pub xids: Vec<u32>,
    #[serde(default)]
    pub data: Vec<u8>,
    pub reliable: bool,
}

/// Close every listed session.
#[derive(Debug, Serialize, Deserialize)]
pub struct CloseCommand {
    pub xids: Vec<u32>,
}

// ─── Outgoing calls ──────────────────────────────────────────────────────────

fn send_request(eng: &Arc<Engine>, counter: &'static str, request: BridgeRequest) {
    if eng.bridge.is_none() {
        if request.code == "call" {
            eng.counts.count("rpc.call.noclient", 1);
            debug!(target: "rpc", "rpc bridge is disabled");
        }
        return;
    }
    match serde_json::to_vec(&request) {
        Err(e) => {
            eng.counts.count("rpc.encode.error", 1);
            warn!(target: "rpc", error = %e, "request encode failed");
        }
        Ok(bytes) => {
            eng.counts.count(counter, 1);
            let eng2 = Arc::clone(eng);
            eng.fabric.call(u64::from(request.xid), move || {
                if let Some(bridge) = &eng2.bridge {
                    bridge.send(&eng2.counts, bytes);
                }
            });
        }
    }
}

fn request(eng: &Arc<Engine>, xid: u32, raddr: SocketAddrV4, code: &str, callback: f64, data: &[u8], reliable: bool) -> BridgeRequest {
    BridgeRequest {
        xid,
        addr: Some(raddr.to_string()),
        code: code.to_owned(),
        callback,
        data: data.to_vec(),
        reliable,
        port: eng_listen_port(eng),
    }
}

fn eng_listen_port(eng: &Arc<Engine>) -> u32 {
    u32::from(eng.cfg.rpc_listen.unwrap_or(0))
}

/// Announce a freshly authenticated session.
pub fn join(eng: &Arc<Engine>, xid: u32, raddr: SocketAddrV4) {
    send_request(eng, "rpc.join", request(eng, xid, raddr, "join", 0.0, &[], true));
}

/// Announce a closed session.
pub fn exit(eng: &Arc<Engine>, xid: u32, raddr: SocketAddrV4) {
    send_request(eng, "rpc.exit", request(eng, xid, raddr, "exit", 0.0, &[], true));
}

/// Forward an RPC payload from a session to the backend.
pub fn call(
    eng: &Arc<Engine>,
    xid: u32,
    raddr: SocketAddrV4,
    callback: f64,
    data: &[u8],
    reliable: bool,
) {
    send_request(eng, "rpc.call", request(eng, xid, raddr, "call", callback, data, reliable));
}

// ─── Incoming frames ─────────────────────────────────────────────────────────

/// Drain frames from peers connected to our bridge listener.
pub fn start_server_loop(eng: Arc<Engine>, mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let msg: BridgeMessage = match serde_json::from_slice(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    eng.counts.count("rpc.xmessage.error", 1);
                    warn!(target: "rpc", error = %e, "message decode failed");
                    continue;
                }
            };
            if let Some(b) = msg.broadcast {
                if !b.xids.is_empty() && !b.data.is_empty() {
                    session::recv_pull(&eng, b.xids, b.data, b.reliable);
                }
            }
            if let Some(c) = msg.close {
                if !c.xids.is_empty() {
                    session::close_all(&eng, c.xids);
                }
            }
        }
    });
}

/// Drain RPC results from the bridge we dialed.
pub fn start_client_loop(eng: Arc<Engine>, mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let rsp: BridgeResponse = match serde_json::from_slice(&bytes) {
                Ok(rsp) => rsp,
                Err(e) => {
                    eng.counts.count("rpc.xresponse.error", 1);
                    warn!(target: "rpc", error = %e, "response decode failed");
                    continue;
                }
            };
            if rsp.xid == 0 || rsp.data.is_empty() {
                continue;
            }
            session::callback(&eng, rsp.xid, rsp.data, rsp.callback, rsp.reliable);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_through_json() {
        let req = BridgeRequest {
            xid: 7,
            addr: Some("10.0.0.1:1935".into()),
            code: "call".into(),
            callback: 3.0,
            data: vec![1, 2, 3],
            reliable: true,
            port: 7000,
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let got: BridgeRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(got.xid, 7);
        assert_eq!(got.code, "call");
        assert_eq!(got.data, vec![1, 2, 3]);
        assert_eq!(got.port, 7000);
    }

    #[test]
    fn message_variants_decode() {
        let msg: BridgeMessage = serde_json::from_str(
            r#"{"broadcast":{"xids":[1,2],"data":[9],"reliable":false}}"#,
        )
        .unwrap();
        let b = msg.broadcast.unwrap();
        assert_eq!(b.xids, vec![1, 2]);
        assert!(!b.reliable);
        assert!(msg.close.is_none());

        let msg: BridgeMessage = serde_json::from_str(r#"{"close":{"xids":[3]}}"#).unwrap();
        assert_eq!(msg.close.unwrap().xids, vec![3]);
    }
}
