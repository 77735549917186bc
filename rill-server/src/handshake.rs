//! The handshake engine: Hello → cookie → key exchange → session.
//!
//! Handshake datagrams are encrypted under a fixed, publicly known AES
//! key; real secrecy starts once the Diffie-Hellman exchange completes
//! and the session is created with derived keys. Agents (a cipher plus
//! a DH keypair) are pooled and reused across handshakes.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill_crypto::{DhEngine, PacketCipher, compute_session_keys, sha256};
use rill_wire::{PacketReader, PacketWriter};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cookies::COOKIE_SIZE;
use crate::counts::Counts;
use crate::engine::Engine;
use crate::frame::{self, FrameError, ResponseMessage};
use crate::session;

/// The well-known AES key for handshake packets.
const HANDSHAKE_KEY: &[u8; 16] = b"Adobe Systems 02";

/// Certificate blob layout: fixed prefix, 64 process-wide random bytes,
/// fixed suffix.
const CERT_PREFIX: [u8; 4] = [0x01, 0x0a, 0x41, 0x0e];
const CERT_SUFFIX: [u8; 9] = [0x02, 0x15, 0x02, 0x02, 0x15, 0x05, 0x02, 0x15, 0x0e];

/// Build the 77-byte server certificate once at startup.
pub fn build_certificate() -> Vec<u8> {
    let mut middle = [0u8; 64];
    getrandom::getrandom(&mut middle).expect("getrandom failed");
    let mut cert = Vec::with_capacity(CERT_PREFIX.len() + middle.len() + CERT_SUFFIX.len());
    cert.extend_from_slice(&CERT_PREFIX);
    cert.extend_from_slice(&middle);
    cert.extend_from_slice(&CERT_SUFFIX);
    cert
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("unknown packet marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("unknown message code {0:#04x}")]
    UnknownCode(u8),
    #[error("unknown hello mode {0:#04x}")]
    UnknownMode(u8),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("unauthorized app '{0}'")]
    UnauthorizedApp(String),
    #[error("rendezvous session not found")]
    SessionNotFound,
    #[error("rendezvous session closed")]
    SessionClosed,
    #[error("cookie allocation failed")]
    NoCookie,
    #[error("cookie not found")]
    CookieNotFound,
    #[error("session create failed: {0}")]
    Create(#[from] session::CreateError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ─── Agent pool ──────────────────────────────────────────────────────────────

/// One pooled handshake worker: the fixed cipher plus a DH keypair.
pub struct HandshakeAgent {
    cipher: PacketCipher,
    dh: DhEngine,
}

impl HandshakeAgent {
    fn new(counts: &Counts) -> Self {
        counts.count("handshake.new", 1);
        Self {
            cipher: PacketCipher::new(HANDSHAKE_KEY, HANDSHAKE_KEY)
                .expect("fixed handshake key is a valid AES key"),
            dh: DhEngine::new(),
        }
    }
}

/// LIFO pool of handshake agents with a slow background shrinker.
pub struct HandshakePool {
    stack: Mutex<Vec<HandshakeAgent>>,
}

impl HandshakePool {
    pub fn new() -> Self {
        Self { stack: Mutex::new(Vec::new()) }
    }

    fn get(&self, counts: &Counts) -> HandshakeAgent {
        let pooled = self.stack.lock().expect("handshake pool poisoned").pop();
        pooled.unwrap_or_else(|| HandshakeAgent::new(counts))
    }

    fn put(&self, agent: HandshakeAgent) {
        self.stack.lock().expect("handshake pool poisoned").push(agent);
    }

    /// Spawn the pool shrinker: drop one agent per pass, pausing longer
    /// the smaller the pool gets.
    pub fn start_shrinker(self: &Arc<Self>, counts: Arc<Counts>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let remaining = {
                    let mut stack = pool.stack.lock().expect("handshake pool poisoned");
                    if stack.pop().is_some() {
                        counts.count("handshake.release", 1);
                    }
                    stack.len()
                };
                let pause = if remaining > 512 {
                    Duration::from_secs(2)
                } else if remaining > 128 {
                    Duration::from_secs(5)
                } else {
                    Duration::from_secs(30)
                };
                tokio::time::sleep(pause).await;
            }
        });
    }
}

impl Default for HandshakePool {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

struct HelloRequest {
    epd: Vec<u8>,
    tag: Vec<u8>,
    mode: u8,
}

fn parse_hello(r: &mut PacketReader<'_>) -> Result<HelloRequest, HandshakeError> {
    r.read_u8().map_err(|_| HandshakeError::Malformed("hello ignore byte"))?;
    let size = r.read_u8().map_err(|_| HandshakeError::Malformed("hello epd length"))?;
    if size <= 1 {
        return Err(HandshakeError::Malformed("hello epd length"));
    }
    let size = usize::from(size) - 1;
    if size > r.remaining() {
        return Err(HandshakeError::Malformed("hello epd length"));
    }
    let mode = r.read_u8().map_err(|_| HandshakeError::Malformed("hello mode"))?;
    let epd = r.read_vec(size).map_err(|_| HandshakeError::Malformed("hello epd"))?;
    let mut tag = vec![0u8; 16];
    r.read_bytes(&mut tag).map_err(|_| HandshakeError::Malformed("hello tag"))?;
    Ok(HelloRequest { epd, tag, mode })
}

struct AssignRequest {
    yid: u32,
    pid: [u8; 32],
    cookie: Vec<u8>,
    pubkey: Vec<u8>,
    initiator: Vec<u8>,
}

fn parse_assign(r: &mut PacketReader<'_>) -> Result<AssignRequest, HandshakeError> {
    let yid = r.read_u32().map_err(|_| HandshakeError::Malformed("assign yid"))?;

    let coolen = r.read_7bit_u64().map_err(|_| HandshakeError::Malformed("assign cookie length"))?;
    if coolen != COOKIE_SIZE as u64 {
        return Err(HandshakeError::Malformed("assign cookie length"));
    }
    let cookie = r.read_vec(COOKIE_SIZE).map_err(|_| HandshakeError::Malformed("assign cookie"))?;

    let pid_len = r.read_7bit_u64().map_err(|_| HandshakeError::Malformed("assign pid length"))?;
    if pid_len == 0 || pid_len > r.remaining() as u64 {
        return Err(HandshakeError::Malformed("assign pid length"));
    }
    // The pid is the digest of the raw identity bytes, which the pubkey
    // field overlaps — hash without consuming.
    let pid = sha256!(&r.rest()[..pid_len as usize]);

    let pubkey_len = r.read_7bit_u64().map_err(|_| HandshakeError::Malformed("assign pubkey length"))?;
    if pubkey_len <= 2 {
        return Err(HandshakeError::Malformed("assign pubkey length"));
    }
    let pubkey_len = pubkey_len - 2;
    if pubkey_len > r.remaining() as u64 {
        return Err(HandshakeError::Malformed("assign pubkey length"));
    }
    r.skip(2).map_err(|_| HandshakeError::Malformed("assign pubkey prefix"))?;
    let pubkey = r.read_vec(pubkey_len as usize).map_err(|_| HandshakeError::Malformed("assign pubkey"))?;

    let init_len = r.read_7bit_u64().map_err(|_| HandshakeError::Malformed("assign initiator length"))?;
    if init_len == 0 || init_len > r.remaining() as u64 {
        return Err(HandshakeError::Malformed("assign initiator length"));
    }
    let initiator = r.read_vec(init_len as usize).map_err(|_| HandshakeError::Malformed("assign initiator"))?;

    Ok(AssignRequest { yid, pid, cookie, pubkey, initiator })
}

// ─── Responses ───────────────────────────────────────────────────────────────

enum HsResponse {
    /// `0x70`: tag echo, cookie, server certificate.
    Hello { tag: Vec<u8>, cookie: Vec<u8>, certificate: Vec<u8> },
    /// `0x71`: tag echo plus the target's addresses (public first).
    Rendezvous { tag: Vec<u8>, addrs: Vec<SocketAddrV4> },
    /// `0x78`: assigned session id and responder blob.
    Assign { xid: u32, responder: Vec<u8> },
}

impl ResponseMessage for HsResponse {
    fn code(&self) -> u8 {
        match self {
            Self::Hello { .. } => 0x70,
            Self::Rendezvous { .. } => 0x71,
            Self::Assign { .. } => 0x78,
        }
    }

    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        match self {
            Self::Hello { tag, cookie, certificate } => {
                w.write_u8(tag.len() as u8);
                w.write_bytes(tag);
                w.write_string8(cookie)?;
                w.write_bytes(certificate);
            }
            Self::Rendezvous { tag, addrs } => {
                w.write_u8(tag.len() as u8);
                w.write_bytes(tag);
                for (i, addr) in addrs.iter().enumerate() {
                    w.write_address(addr, i == 0);
                }
            }
            Self::Assign { xid, responder } => {
                w.write_u32(*xid);
                w.write_7bit_u64(responder.len() as u64)?;
                w.write_bytes(responder);
                w.write_u8(0x58);
            }
        }
        Ok(())
    }
}

// ─── Packet handling ─────────────────────────────────────────────────────────

/// Entry point for datagrams whose extracted session id is zero.
pub fn handle_packet(eng: &Arc<Engine>, lport: u16, raddr: SocketAddrV4, mut data: Vec<u8>) {
    let agent = eng.handshakes.get(&eng.counts);

    if let Err(e) = frame::decode_packet(&agent.cipher, &mut data) {
        eng.counts.count("handshake.decode.error", 1);
        debug!(target: "handshake", peer = %raddr, error = %e, "decode error");
        eng.handshakes.put(agent);
        return;
    }

    match handle(eng, &agent, lport, raddr, &data[6..]) {
        Err(e) => {
            eng.counts.count("handshake.handle.error", 1);
            debug!(target: "handshake", peer = %raddr, error = %e, "handle error");
        }
        Ok((yid, rsp)) => match frame::packet_to_bytes(0x0b, None, &[rsp]) {
            Err(e) => {
                eng.counts.count("handshake.tobytes.error", 1);
                warn!(target: "handshake", peer = %raddr, error = %e, "serialize error");
            }
            Ok(body) => match frame::encode_packet(&agent.cipher, yid, body) {
                Err(e) => {
                    eng.counts.count("handshake.encode.error", 1);
                    warn!(target: "handshake", peer = %raddr, error = %e, "encode error");
                }
                Ok(out) => eng.udp.send(&eng.counts, lport, raddr, out),
            },
        },
    }
    eng.handshakes.put(agent);
}

fn handle(
    eng: &Arc<Engine>,
    agent: &HandshakeAgent,
    lport: u16,
    raddr: SocketAddrV4,
    body: &[u8],
) -> Result<(u32, HsResponse), HandshakeError> {
    let mut r = PacketReader::new(body);
    let marker = r.read_u8().map_err(FrameError::from)?;
    r.read_u16().map_err(FrameError::from)?; // timestamp
    if marker != 0x0b {
        eng.counts.count("handshake.marker.unknown", 1);
        return Err(HandshakeError::UnknownMarker(marker));
    }
    let Some(msg) = frame::parse_request_message(&mut r)? else {
        return Err(HandshakeError::Malformed("empty packet"));
    };
    let mut body = msg.body;
    match msg.code {
        0x30 => {
            let rsp = handle_hello(eng, raddr, &mut body).inspect_err(|_| {
                eng.counts.count("handshake.hello.error", 1);
            })?;
            // Handshake replies always target the client-side zero id.
            Ok((0, rsp))
        }
        0x38 => {
            let (yid, rsp) =
                handle_assign(eng, agent, lport, raddr, &mut body).inspect_err(|_| {
                    eng.counts.count("handshake.assign.error", 1);
                })?;
            Ok((yid, rsp))
        }
        code => {
            eng.counts.count("handshake.code.unknown", 1);
            Err(HandshakeError::UnknownCode(code))
        }
    }
}

fn handle_hello(
    eng: &Arc<Engine>,
    raddr: SocketAddrV4,
    r: &mut PacketReader<'_>,
) -> Result<HsResponse, HandshakeError> {
    let req = parse_hello(r)?;
    match req.mode {
        0x0a => {
            let app = app_of_epd(&req.epd)?;
            if !eng.cfg.is_authorized_app(&app) {
                eng.counts.count("handshake.app.unauthorized", 1);
                return Err(HandshakeError::UnauthorizedApp(app));
            }
            let cookie = eng.cookies.alloc(&eng.counts).ok_or(HandshakeError::NoCookie)?;
            let value = cookie.lock().expect("cookie poisoned").value().to_vec();
            eng.counts.count("handshake.hello", 1);
            debug!(target: "handshake", peer = %raddr, "new cookie");
            Ok(HsResponse::Hello {
                tag: req.tag,
                cookie: value,
                certificate: eng.certificate.clone(),
            })
        }
        0x0f => {
            let pid: [u8; 32] = req
                .epd
                .as_slice()
                .try_into()
                .map_err(|_| HandshakeError::SessionNotFound)?;
            let s = eng.sessions.find_by_pid(&pid).ok_or_else(|| {
                eng.counts.count("p2p.session.notfound", 1);
                HandshakeError::SessionNotFound
            })?;
            let addrs = session::rendezvous(eng, &s, req.tag.clone(), raddr).ok_or_else(|| {
                eng.counts.count("p2p.session.hasclosed", 1);
                HandshakeError::SessionClosed
            })?;
            eng.counts.count("p2p.handshake", 1);
            Ok(HsResponse::Rendezvous { tag: req.tag, addrs })
        }
        mode => Err(HandshakeError::UnknownMode(mode)),
    }
}

/// Pull the application name — the first nonempty path segment — out of
/// the endpoint descriptor URI.
fn app_of_epd(epd: &[u8]) -> Result<String, HandshakeError> {
    let text = String::from_utf8_lossy(epd);
    let uri = url::Url::parse(&text).map_err(|_| HandshakeError::Malformed("hello uri"))?;
    uri.path_segments()
        .and_then(|mut segments| segments.find(|s| !s.is_empty()))
        .map(str::to_owned)
        .ok_or(HandshakeError::Malformed("hello app"))
}

fn handle_assign(
    eng: &Arc<Engine>,
    agent: &HandshakeAgent,
    lport: u16,
    raddr: SocketAddrV4,
    r: &mut PacketReader<'_>,
) -> Result<(u32, HsResponse), HandshakeError> {
    let req = parse_assign(r)?;
    let cookie = eng
        .cookies
        .find(&req.cookie, &eng.counts)
        .ok_or(HandshakeError::CookieNotFound)?;
    let mut cookie = cookie.lock().expect("cookie poisoned");
    if cookie.xid == 0 {
        let (responder, encrypt, decrypt) =
            compute_session_keys(&agent.dh, &req.pubkey, &req.initiator);
        let s = eng
            .sessions
            .create(req.yid, req.pid, cookie.value().to_vec(), &encrypt, &decrypt, lport, raddr)
            .inspect_err(|_| {
                eng.counts.count("handshake.session.error", 1);
            })?;
        cookie.xid = s.xid;
        cookie.pid = req.pid;
        cookie.responder = responder;
        eng.counts.count("handshake.assign", 1);
        tracing::info!(
            target: "session",
            xid = s.xid,
            pid = %hex::encode(req.pid),
            peer = %raddr,
            "join"
        );
    }
    Ok((req.yid, HsResponse::Assign { xid: cookie.xid, responder: cookie.responder.clone() }))
}
