//! The session engine.
//!
//! A session is created by the handshake and lives until closed by the
//! peer, by keepalive timeout, or by protocol violation. All mutable
//! state sits behind one mutex per session; UDP workers, manage shards
//! and work-queue tasks serialize on it, and nothing holds two session
//! locks at once (cross-session work hops through the work-queue
//! fabric instead).

mod conn;
mod flow_ack;
mod flow_reader;
mod flow_writer;
mod fragment;
mod message;
mod registry;
mod request;
mod response;
mod stream;
mod streams;

pub use registry::{CreateError, SessionRegistry};
pub(crate) use streams::PublicationRegistry;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rill_amf::AmfError;
use rill_crypto::PacketCipher;
use rill_wire::PacketReader;
use thiserror::Error;
use tracing::{debug, error};

use crate::engine::Engine;
use crate::frame::{self, EchoTime, FrameError};
use crate::rpc;
use crate::util::unix_ns;
use conn::ConnHandler;
use flow_reader::FlowReader;
use flow_writer::{FlowWriter, split};
use message::{Handler, amf_message_writer};
use request::{
    FlowRequest, parse_flow_ack_request, parse_flow_error_request, parse_flow_request,
    parse_flow_slice,
};
use response::Response;
use stream::StreamHandler;

pub(crate) const MAX_KEEPALIVE: u32 = 6;

/// Datagram payload bound for outgoing batches.
const FLUSH_LIMIT: usize = 1320;

/// Every flow signature starts with this tag; the connection flow's
/// signature is exactly the tag plus a zero byte.
const SIGNATURE_TAG: &[u8] = b"\x00\x54\x43\x04";

// ─── Session ─────────────────────────────────────────────────────────────────

/// One established RTMFP session.
pub struct Session {
    /// Server-assigned session id, nonzero, unique among live sessions.
    pub xid: u32,
    /// SHA-256 of the client identity, for peer rendezvous.
    pub pid: [u8; 32],
    cipher: PacketCipher,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session poisoned")
    }
}

/// Everything behind the session lock.
pub(crate) struct SessionState {
    pub yid: u32,
    /// Cookie to commit on the first authenticated packet.
    pub cookie: Option<Vec<u8>>,
    pub lport: u16,
    pub raddr: SocketAddrV4,
    /// Addresses the client advertised via `setPeerInfo`.
    pub addrs: Vec<SocketAddrV4>,
    pub closed: bool,
    pub keepalive_cnt: u32,
    pub last_activity: Instant,
    /// The peer's packet timestamp, echoed back with our delta.
    pub stmptime: u16,
    pub last_fid: u64,
    pub last_sid: u32,
    /// Flow id of the writer carrying NetConnection messages.
    pub main_writer: u64,
    pub readers: HashMap<u64, FlowReader>,
    pub writers: HashMap<u64, FlowWriter>,
    pub rsplist: VecDeque<Response>,
}

impl SessionState {
    fn new(yid: u32, cookie: Vec<u8>, lport: u16, raddr: SocketAddrV4) -> Self {
        Self {
            yid,
            cookie: Some(cookie),
            lport,
            raddr,
            addrs: Vec::new(),
            closed: false,
            keepalive_cnt: 0,
            last_activity: Instant::now(),
            stmptime: 0,
            last_fid: 0,
            last_sid: 0,
            main_writer: 0,
            readers: HashMap::new(),
            writers: HashMap::new(),
            rsplist: VecDeque::new(),
        }
    }

    pub fn send(&mut self, rsp: Response) {
        self.rsplist.push_back(rsp);
    }
}

#[derive(Debug, Error)]
enum HandleError {
    #[error("unknown packet marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("unknown message code {0:#04x}")]
    UnknownCode(u8),
    #[error("unsupported flow signature")]
    BadSignature,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ─── Receive path ────────────────────────────────────────────────────────────

/// Entry point for a datagram addressed to an established session.
pub fn handle_packet(
    eng: &Arc<Engine>,
    lport: u16,
    raddr: SocketAddrV4,
    xid: u32,
    mut data: Vec<u8>,
) {
    let Some(s) = eng.sessions.find_by_xid(xid) else {
        eng.counts.count("session.notfound", 1);
        return;
    };
    let mut state = s.lock_state();
    if state.closed {
        eng.counts.count("session.hasclosed", 1);
        return;
    }

    if let Err(e) = frame::decode_packet(&s.cipher, &mut data) {
        eng.counts.count("session.decode.error", 1);
        debug!(target: "session", xid, error = %e, "decode error");
        return;
    }

    state.lport = lport;
    state.raddr = raddr;

    if let Some(cookie) = state.cookie.take() {
        eng.cookies.commit(&cookie, &eng.counts);
        rpc::join(eng, s.xid, raddr);
    }

    state.keepalive_cnt = 0;
    state.last_activity = Instant::now();

    if let Err(e) = handle(eng, &s, &mut state, &data[6..]) {
        eng.counts.count("session.handle.error", 1);
        debug!(target: "session", xid, error = %e, "handle error");
    }
    flush_state(eng, &s, &mut state);
}

fn handle(
    eng: &Arc<Engine>,
    sess: &Arc<Session>,
    state: &mut SessionState,
    body: &[u8],
) -> Result<(), HandleError> {
    let mut r = PacketReader::new(body);
    let marker = r.read_u8().map_err(FrameError::from)?;
    state.stmptime = r.read_u16().map_err(FrameError::from)?;
    match marker | 0xf0 {
        0xf9 => {}
        0xfd => {
            // Echo of our own timestamp; ignored.
            r.read_u16().map_err(FrameError::from)?;
        }
        _ => {
            eng.counts.count("session.marker.unknown", 1);
            close_session(eng, sess, state);
            return Err(HandleError::UnknownMarker(marker));
        }
    }

    let mut lastreq: Option<FlowRequest> = None;
    while r.remaining() != 0 {
        let Some(msg) = frame::parse_request_message(&mut r)? else {
            break;
        };
        if msg.code != 0x11 {
            if let Some(req) = lastreq.take() {
                handle_flow_request(eng, sess, state, req)?;
            }
        }
        let mut body = msg.body;
        match msg.code {
            0x4c => {
                eng.counts.count("session.code.close", 1);
                close_session(eng, sess, state);
                return Ok(());
            }
            0x01 => state.send(Response::KeepAlive { passive: true }),
            0x41 => {}
            0x5e => {
                let req = parse_flow_error_request(&mut body).inspect_err(|_| {
                    eng.counts.count("session.parse5e.error", 1);
                })?;
                let reader_fid = state.writers.get(&req.fid).map(|fw| fw.reader_fid);
                match reader_fid {
                    Some(rfid) => {
                        if let Some(mut fr) = state.readers.remove(&rfid) {
                            fr.on_close(eng, sess, state);
                            let fid = fr.fid;
                            state.readers.insert(fid, fr);
                        }
                    }
                    None => {
                        debug!(target: "session", xid = sess.xid, fid = req.fid, "flow not found for 0x5e");
                    }
                }
            }
            0x51 => {
                let req = parse_flow_ack_request(&mut body).inspect_err(|_| {
                    eng.counts.count("session.parse51.error", 1);
                })?;
                match state.writers.remove(&req.fid) {
                    Some(mut fw) => {
                        fw.commit_ack(&mut state.rsplist, &req.ack);
                        state.writers.insert(req.fid, fw);
                    }
                    None => {
                        debug!(target: "session", xid = sess.xid, fid = req.fid, "flow not found for 0x51");
                    }
                }
            }
            0x10 => {
                let req = parse_flow_request(&mut body).inspect_err(|_| {
                    eng.counts.count("session.parse10.error", 1);
                })?;
                lastreq = Some(req);
            }
            0x11 => {
                let slice = parse_flow_slice(&mut body).inspect_err(|_| {
                    eng.counts.count("session.parse11.error", 1);
                })?;
                match &mut lastreq {
                    Some(req) => req.add_slice(slice),
                    None => {
                        debug!(target: "session", xid = sess.xid, "continuation without a flow record");
                    }
                }
            }
            code => {
                eng.counts.count("session.code.unknown", 1);
                close_session(eng, sess, state);
                return Err(HandleError::UnknownCode(code));
            }
        }
    }
    if let Some(req) = lastreq {
        handle_flow_request(eng, sess, state, req)?;
    }
    Ok(())
}

fn handle_flow_request(
    eng: &Arc<Engine>,
    sess: &Arc<Session>,
    state: &mut SessionState,
    req: FlowRequest,
) -> Result<(), HandleError> {
    let fid = match get_or_create_reader(state, req.fid, &req.signature) {
        Err(e) => {
            eng.counts.count("session.flow.error", 1);
            return Err(e);
        }
        Ok(None) => {
            debug!(target: "session", xid = sess.xid, fid = req.fid, "flow not found");
            return Ok(());
        }
        Ok(Some(fid)) => fid,
    };
    let mut fr = state.readers.remove(&fid).expect("reader just resolved");
    fr.add_fragments(eng, sess, state, req.stageack, req.fragments());
    fr.commit_ack(state);
    state.readers.insert(fid, fr);
    Ok(())
}

/// Resolve the reader for a flow record, creating the reader/writer
/// pair when the record carries a fresh signature.
fn get_or_create_reader(
    state: &mut SessionState,
    fid: u64,
    signature: &[u8],
) -> Result<Option<u64>, HandleError> {
    if let Some(fr) = state.readers.get(&fid) {
        if signature.is_empty() || signature == fr.signature {
            return Ok(Some(fid));
        }
        return Err(HandleError::BadSignature);
    }
    if signature.is_empty() || state.closed {
        return Ok(None);
    }
    if signature.len() <= SIGNATURE_TAG.len() || &signature[..SIGNATURE_TAG.len()] != SIGNATURE_TAG
    {
        return Err(HandleError::BadSignature);
    }

    state.last_fid += 1;
    let wfid = state.last_fid;
    let handler = if &signature[SIGNATURE_TAG.len()..] == b"\x00" {
        state.main_writer = wfid;
        Handler::Conn(ConnHandler::new())
    } else {
        Handler::Stream(StreamHandler::new())
    };
    let fw = FlowWriter::new(wfid, signature.to_vec(), fid);
    let fr = FlowReader::new(fid, signature.to_vec(), wfid, handler);
    state.writers.insert(wfid, fw);
    state.readers.insert(fid, fr);
    Ok(Some(fid))
}

// ─── Close / manage ──────────────────────────────────────────────────────────

/// Close a session: cascade `on_close` over every flow, queue the error
/// response, and tell the bridge. Removal from the registry happens on
/// the next manage tick.
pub(crate) fn close_session(eng: &Arc<Engine>, sess: &Arc<Session>, state: &mut SessionState) {
    if state.closed {
        return;
    }
    state.closed = true;
    let wfids: Vec<u64> = state.writers.keys().copied().collect();
    for wfid in wfids {
        let Some(fw) = state.writers.get(&wfid) else { continue };
        let rfid = fw.reader_fid;
        if let Some(mut fr) = state.readers.remove(&rfid) {
            fr.on_close(eng, sess, state);
            let fid = fr.fid;
            state.readers.insert(fid, fr);
        }
    }
    state.send(Response::Error);
    eng.counts.count("session.close", 1);
    debug!(target: "session", xid = sess.xid, "session closed");
    rpc::exit(eng, sess.xid, state.raddr);
}

/// One manage tick. Returns true when the session should be dropped
/// from the registry.
pub(crate) fn manage(eng: &Arc<Engine>, s: &Arc<Session>) -> bool {
    let mut state = s.lock_state();
    if state.closed {
        debug!(target: "session", xid = s.xid, "session deleted, closed");
        return true;
    }

    if state.last_activity.elapsed() >= Duration::from_secs(eng.cfg.heartbeat_s) {
        if state.keepalive_cnt < MAX_KEEPALIVE {
            state.keepalive_cnt += 1;
            state.last_activity = Instant::now();
            state.send(Response::KeepAlive { passive: false });
        } else {
            close_session(eng, s, &mut state);
            flush_state(eng, s, &mut state);
            debug!(target: "session", xid = s.xid, "session deleted, timeout");
            return true;
        }
    }

    let wfids: Vec<u64> = state.writers.keys().copied().collect();
    for wfid in wfids {
        let Some(mut fw) = state.writers.remove(&wfid) else { continue };
        let idle = fw.manage(&mut state.rsplist, &eng.cfg.retrans_ms);
        if idle && fw.closed {
            state.readers.remove(&fw.reader_fid);
            debug!(target: "session", xid = s.xid, fid = wfid, "flow deleted");
        } else {
            state.writers.insert(wfid, fw);
        }
    }

    flush_state(eng, s, &mut state);
    false
}

// ─── Rendezvous ──────────────────────────────────────────────────────────────

/// Serve a peer-rendezvous Hello aimed at this session: notify the
/// session of the caller's address and return the address list to hand
/// back (own address first, then advertised ones).
pub(crate) fn rendezvous(
    eng: &Arc<Engine>,
    s: &Arc<Session>,
    tag: Vec<u8>,
    raddr: SocketAddrV4,
) -> Option<Vec<SocketAddrV4>> {
    let mut state = s.lock_state();
    if state.closed {
        eng.counts.count("session.p2p.closed", 1);
        return None;
    }
    debug!(target: "session", xid = s.xid, peer = %raddr, "rendezvous");
    state.send(Response::Rendezvous(response::RendezvousNotice {
        pid: s.pid,
        tag,
        addr: raddr,
        public: true,
    }));
    let mut addrs = Vec::with_capacity(1 + state.addrs.len());
    addrs.push(state.raddr);
    addrs.extend(state.addrs.iter().copied());
    flush_state(eng, s, &mut state);
    Some(addrs)
}

// ─── Outbound batching ───────────────────────────────────────────────────────

/// Drain the response FIFO into ≤1320-byte packets and send them.
///
/// Responses are sized against the previous one (`set_last_info`) so a
/// flow response directly continuing its predecessor can drop its
/// header. FIFO order is load-bearing; never reorder.
pub(crate) fn flush_state(eng: &Arc<Engine>, sess: &Arc<Session>, state: &mut SessionState) {
    if state.rsplist.is_empty() {
        return;
    }
    let (mut lastfid, mut laststage) = (0u64, 0u64);
    let mut size = 0usize;
    let mut msgs: Vec<Response> = Vec::with_capacity(8);
    while let Some(front) = state.rsplist.front_mut() {
        size += 3 + front.set_last_info(lastfid, laststage);
        if size <= FLUSH_LIMIT || msgs.is_empty() {
            let rsp = state.rsplist.pop_front().expect("nonempty front");
            (lastfid, laststage) = rsp.info();
            msgs.push(rsp);
            continue;
        }
        send_packet(eng, sess, state, &msgs);
        (lastfid, laststage) = (0, 0);
        size = 0;
        msgs.clear();
    }
    if !msgs.is_empty() {
        send_packet(eng, sess, state, &msgs);
    }
}

fn send_packet(eng: &Arc<Engine>, sess: &Arc<Session>, state: &SessionState, msgs: &[Response]) {
    let echo = EchoTime { recv: state.last_activity, stamp: state.stmptime };
    let mut body = match frame::packet_to_bytes(0x4a, Some(echo), msgs) {
        Ok(body) => body,
        Err(e) => {
            eng.counts.count("session.tobytes.error", 1);
            error!(target: "session", xid = sess.xid, error = %e, "packet serialize error");
            return;
        }
    };
    // End-of-packet terminator; the frame's 0xFF padding extends it.
    body.push(0xff);
    match frame::encode_packet(&sess.cipher, state.yid, body) {
        Ok(data) => eng.udp.send(&eng.counts, state.lport, state.raddr, data),
        Err(e) => {
            eng.counts.count("session.encode.error", 1);
            error!(target: "session", xid = sess.xid, error = %e, "packet encode error");
        }
    }
}

// ─── Cross-session operations (always via the fabric) ────────────────────────

/// Append pre-chunked message bytes to a session's main flow and flush.
pub(crate) fn push_to_main_writer(
    eng: &Arc<Engine>,
    s: &Arc<Session>,
    reliable: bool,
    chunks: &[Vec<u8>],
) {
    let mut state = s.lock_state();
    if state.closed {
        return;
    }
    let wfid = state.main_writer;
    if let Some(mut fw) = state.writers.remove(&wfid) {
        fw.add_fragments(&mut state.rsplist, reliable, chunks);
        state.writers.insert(wfid, fw);
    }
    flush_state(eng, s, &mut state);
}

/// Close every listed session (bridge `close` command).
pub fn close_all(eng: &Arc<Engine>, xids: Vec<u32>) {
    let eng2 = Arc::clone(eng);
    eng.fabric.call(unix_ns(), move || {
        for xid in xids {
            if let Some(s) = eng2.sessions.find_by_xid(xid) {
                let mut state = s.lock_state();
                close_session(&eng2, &s, &mut state);
                flush_state(&eng2, &s, &mut state);
            }
        }
    });
}

/// Deliver bridge-pushed data to every listed session's main flow as a
/// `recvPull`/`recvPull2` command.
pub fn recv_pull(eng: &Arc<Engine>, xids: Vec<u32>, data: Vec<u8>, reliable: bool) {
    let bytes = match recv_pull_message(&data, reliable) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(target: "session", error = %e, "recvPull message build failed");
            return;
        }
    };
    let chunks = split(&bytes);
    let eng2 = Arc::clone(eng);
    eng.fabric.call(unix_ns(), move || {
        for xid in &xids {
            if let Some(s) = eng2.sessions.find_by_xid(*xid) {
                push_to_main_writer(&eng2, &s, reliable, &chunks);
            }
        }
    });
}

/// Deliver a bridge RPC result to one session as a `_result` command.
pub fn callback(eng: &Arc<Engine>, xid: u32, data: Vec<u8>, callback: f64, reliable: bool) {
    let bytes = match callback_message(callback, &data) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(target: "session", error = %e, "callback message build failed");
            return;
        }
    };
    let chunks = split(&bytes);
    let eng2 = Arc::clone(eng);
    eng.fabric.call(unix_ns(), move || {
        if let Some(s) = eng2.sessions.find_by_xid(xid) {
            push_to_main_writer(&eng2, &s, reliable, &chunks);
        }
    });
}

/// Broadcast raw message bytes to each listed session's main flow,
/// tagged with the sending session's id.
pub(crate) fn broadcast_by_xid(
    eng: &Arc<Engine>,
    xids: Vec<u32>,
    data: &[u8],
    from: u32,
    reliable: bool,
) {
    let bytes = match broadcast_message(data, from, reliable) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(target: "session", error = %e, "broadcast message build failed");
            return;
        }
    };
    let chunks = split(&bytes);
    let eng2 = Arc::clone(eng);
    eng.fabric.call(unix_ns(), move || {
        for xid in &xids {
            if let Some(s) = eng2.sessions.find_by_xid(*xid) {
                push_to_main_writer(&eng2, &s, reliable, &chunks);
            }
        }
    });
}

fn callback_message(callback: f64, data: &[u8]) -> Result<Vec<u8>, AmfError> {
    let mut w = amf_message_writer("_result", callback)?;
    w.raw_mut().write_bytes(data);
    Ok(w.into_bytes())
}

fn recv_pull_message(data: &[u8], reliable: bool) -> Result<Vec<u8>, AmfError> {
    let name = if reliable { "recvPull" } else { "recvPull2" };
    let mut w = amf_message_writer(name, 0.0)?;
    w.raw_mut().write_bytes(data);
    Ok(w.into_bytes())
}

fn broadcast_message(data: &[u8], from: u32, reliable: bool) -> Result<Vec<u8>, AmfError> {
    let name = if reliable { "broadcastBySessionId" } else { "broadcastBySessionId2" };
    let mut w = amf_message_writer(name, 0.0)?;
    w.raw_mut().write_bytes(data);
    w.write_number(f64::from(from));
    Ok(w.into_bytes())
}
