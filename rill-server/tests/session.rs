//! End-to-end exercises over loopback UDP: handshake, key exchange,
//! connect, rendezvous, publish/play fan-out, reassembly, keepalive.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use rill_amf::AmfObject;
use rill_amf::amf0::Amf0Writer;
use rill_crypto::{DhEngine, PacketCipher};
use rill_server::config::Config;
use rill_server::engine::Engine;
use rill_server::frame::{self, ResponseMessage};
use rill_wire::{PacketReader, PacketWriter};

const HANDSHAKE_KEY: &[u8; 16] = b"Adobe Systems 02";
const CONN_SIGNATURE: &[u8] = b"\x00\x54\x43\x04\x00";

// ─── Harness ─────────────────────────────────────────────────────────────────

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn start_engine(apps: &[&str]) -> (Arc<Engine>, SocketAddr) {
    start_engine_with_heartbeat(apps, 60)
}

fn start_engine_with_heartbeat(apps: &[&str], heartbeat_s: u64) -> (Arc<Engine>, SocketAddr) {
    let mut seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u16;
    for _ in 0..64 {
        let port = 20000 + (seed % 40000);
        seed = seed.wrapping_mul(31).wrapping_add(17);
        let cfg = Config {
            ncpu: 2,
            parallel: 4,
            udp_ports: vec![port],
            rpc_listen: None,
            rpc_remote: None,
            manage_ms: 200,
            retrans_ms: vec![500, 500, 1000, 1500],
            http_port: None,
            apps: apps.iter().map(|s| (*s).to_owned()).collect::<HashSet<_>>(),
            heartbeat_s,
            debug: false,
        };
        if let Ok(eng) = Engine::start(cfg) {
            return (eng, format!("127.0.0.1:{port}").parse().unwrap());
        }
    }
    panic!("no free UDP port found");
}

struct Msg {
    code: u8,
    body: Vec<u8>,
}

impl ResponseMessage for Msg {
    fn code(&self) -> u8 {
        self.code
    }
    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        w.write_bytes(&self.body);
        Ok(())
    }
}

struct Client {
    sock: UdpSocket,
    server: SocketAddr,
    hs_cipher: PacketCipher,
    dh: DhEngine,
    /// Set after a successful Assign round.
    xid: u32,
    yid: u32,
    cipher: Option<PacketCipher>,
    /// SHA-256 the server computed over our identity bytes.
    pid: [u8; 32],
}

impl Client {
    fn new(server: SocketAddr) -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        Self {
            sock,
            server,
            hs_cipher: PacketCipher::new(HANDSHAKE_KEY, HANDSHAKE_KEY).unwrap(),
            dh: DhEngine::new(),
            xid: 0,
            yid: 0,
            cipher: None,
            pid: [0u8; 32],
        }
    }

    fn send_handshake(&self, code: u8, body: Vec<u8>) {
        let pkt = frame::packet_to_bytes(0x0b, None, &[Msg { code, body }]).unwrap();
        let data = frame::encode_packet(&self.hs_cipher, 0, pkt).unwrap();
        self.sock.send_to(&data, self.server).unwrap();
    }

    fn recv_with(&self, cipher: &PacketCipher) -> Option<(u32, Vec<u8>)> {
        let mut buf = [0u8; 2048];
        let (n, _) = self.sock.recv_from(&mut buf).ok()?;
        let mut data = buf[..n].to_vec();
        let id = frame::session_id_of(&data).ok()?;
        frame::decode_packet(cipher, &mut data).ok()?;
        Some((id, data))
    }

    fn recv_handshake(&self, expect_id: u32) -> (u8, Vec<u8>) {
        let (id, data) = self.recv_with(&self.hs_cipher).expect("handshake response");
        assert_eq!(id, expect_id, "handshake reply target id");
        let mut r = PacketReader::new(&data[6..]);
        assert_eq!(r.read_u8().unwrap(), 0x0b);
        r.read_u16().unwrap();
        let msg = frame::parse_request_message(&mut r).unwrap().expect("one message");
        (msg.code, msg.body.rest().to_vec())
    }

    /// Hello (mode 0x0A) → cookie, then Assign → session keys.
    fn handshake(&mut self, app: &str, yid: u32) {
        let epd = format!("rtmfp://example.net/{app}");
        let tag = [0x42u8; 16];
        let mut hello = PacketWriter::new();
        hello.write_u8(0);
        hello.write_u8(epd.len() as u8 + 1);
        hello.write_u8(0x0a);
        hello.write_bytes(epd.as_bytes());
        hello.write_bytes(&tag);
        self.send_handshake(0x30, hello.into_bytes());

        // Hello replies always target the client-side zero id.
        let (code, body) = self.recv_handshake(0);
        assert_eq!(code, 0x70, "expected a Hello response");
        let mut r = PacketReader::new(&body);
        let taglen = r.read_u8().unwrap() as usize;
        assert_eq!(r.read_vec(taglen).unwrap(), tag);
        let cookie = r.read_string8().unwrap();
        assert_eq!(cookie.len(), 0x40);
        let certificate = r.rest();
        assert_eq!(certificate.len(), 77);
        assert_eq!(&certificate[..4], &[0x01, 0x0a, 0x41, 0x0e]);
        assert_eq!(&certificate[68..], &[0x02, 0x15, 0x02, 0x02, 0x15, 0x05, 0x02, 0x15, 0x0e]);

        // Assign: yid, cookie, then the pid/pubkey/initiator tail.
        let initiator = b"initiator-nonce-0123456789".to_vec();
        let mut tail = PacketWriter::new();
        tail.write_7bit_u64(16).unwrap(); // pid source length
        tail.write_7bit_u64(self.dh.public_key().len() as u64 + 2).unwrap();
        tail.write_bytes(&[0x1d, 0x02]);
        tail.write_bytes(self.dh.public_key());
        tail.write_7bit_u64(initiator.len() as u64).unwrap();
        tail.write_bytes(&initiator);
        let tail = tail.into_bytes();

        // The server hashes the 16 bytes after the pid-length field.
        let pid_src_off = rill_wire::size_of_7bit_u64(16).unwrap();
        self.pid = {
            let mut h = Sha256::new();
            h.update(&tail[pid_src_off..pid_src_off + 16]);
            h.finalize().into()
        };

        let mut assign = PacketWriter::new();
        assign.write_u32(yid);
        assign.write_7bit_u64(cookie.len() as u64).unwrap();
        assign.write_bytes(&cookie);
        assign.write_bytes(&tail);
        self.send_handshake(0x38, assign.into_bytes());

        // The Assign reply is addressed to the id we chose for ourselves.
        let (code, body) = self.recv_handshake(yid);
        assert_eq!(code, 0x78, "expected an Assign response");
        let mut r = PacketReader::new(&body);
        let xid = r.read_u32().unwrap();
        assert_ne!(xid, 0);
        let rlen = r.read_7bit_u64().unwrap() as usize;
        let responder = r.read_vec(rlen).unwrap();
        assert_eq!(r.read_u8().unwrap(), 0x58);

        // Mirror the server's key derivation from the client side.
        let server_pub = &responder[11..];
        let shared = self.dh.shared_secret(server_pub);
        let mdp1 = hmac_sha256(&initiator, &responder);
        let mdp2 = hmac_sha256(&responder, &initiator);
        let server_encrypt = &hmac_sha256(&shared, &mdp1)[..16];
        let server_decrypt = &hmac_sha256(&shared, &mdp2)[..16];
        // Our encrypt key is the server's decrypt key and vice versa.
        self.cipher = Some(PacketCipher::new(server_decrypt, server_encrypt).unwrap());
        self.xid = xid;
        self.yid = yid;
    }

    fn send_session(&self, msgs: &[Msg]) {
        let pkt = frame::packet_to_bytes(0x89, None, msgs).unwrap();
        let data = frame::encode_packet(self.cipher.as_ref().unwrap(), self.xid, pkt).unwrap();
        self.sock.send_to(&data, self.server).unwrap();
    }

    /// Receive one session packet body (after the 6 frame bytes).
    fn recv_session(&self) -> Option<Vec<u8>> {
        let (id, data) = self.recv_with(self.cipher.as_ref().unwrap())?;
        assert_eq!(id, self.yid, "session replies target our client-side id");
        Some(data[6..].to_vec())
    }

    /// Receive packets until one contains `needle`, or time out.
    fn recv_until_contains(&self, needle: &[u8], total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if let Some(body) = self.recv_session() {
                if contains(&body, needle) {
                    return true;
                }
            }
        }
        false
    }

    /// A `0x10` flow record with full header.
    fn flow_record(fid: u64, stage: u64, delta: u64, flags: u8, signature: &[u8], payload: &[u8]) -> Msg {
        let mut w = PacketWriter::new();
        w.write_u8(flags | 0x80);
        w.write_7bit_u64(fid).unwrap();
        w.write_7bit_u64(stage).unwrap();
        w.write_7bit_u64(delta).unwrap();
        w.write_string8(signature).unwrap();
        w.write_u8(0);
        w.write_bytes(payload);
        Msg { code: 0x10, body: w.into_bytes() }
    }

    /// Open the connection flow with an AMF `connect` carrying
    /// `objectEncoding: 3`.
    fn connect(&self) {
        let mut w = Amf0Writer::new();
        {
            let raw = w.raw_mut();
            raw.write_u8(0x14);
            raw.write_u32(0);
        }
        w.write_string("connect").unwrap();
        w.write_number(1.0);
        w.write_null();
        let mut obj = AmfObject::new();
        obj.set_number("objectEncoding", 3.0);
        w.write_object(&obj).unwrap();
        let payload = w.into_bytes();
        self.send_session(&[Self::flow_record(2, 1, 1, 0, CONN_SIGNATURE, &payload)]);
        assert!(
            self.recv_until_contains(b"NetConnection.Connect.Success", Duration::from_secs(2)),
            "connect must succeed"
        );
    }

    /// Send one AMF command on a stream flow and wait for `expect`.
    fn stream_command(
        &self,
        fid: u64,
        stage: u64,
        signature: &[u8],
        name: &str,
        arg: &str,
        expect: &[u8],
    ) {
        let mut w = Amf0Writer::new();
        {
            let raw = w.raw_mut();
            raw.write_u8(0x14);
            raw.write_u32(0);
        }
        w.write_string(name).unwrap();
        w.write_number(2.0);
        w.write_null();
        w.write_string(arg).unwrap();
        let payload = w.into_bytes();
        self.send_session(&[Self::flow_record(fid, stage, stage, 0, signature, &payload)]);
        assert!(
            self.recv_until_contains(expect, Duration::from_secs(2)),
            "expected {:?} after {name}",
            String::from_utf8_lossy(expect)
        );
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// The message codes inside one decoded session packet body.
fn message_codes(body: &[u8]) -> Vec<u8> {
    let mut r = PacketReader::new(body);
    let Ok(marker) = r.read_u8() else { return Vec::new() };
    if r.read_u16().is_err() {
        return Vec::new();
    }
    if marker & 0x04 != 0 && r.read_u16().is_err() {
        return Vec::new();
    }
    let mut codes = Vec::new();
    while r.remaining() != 0 {
        let Ok(Some(msg)) = frame::parse_request_message(&mut r) else { break };
        codes.push(msg.code);
    }
    codes
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_connect_and_keepalive() {
    let (eng, server) = start_engine(&["app1"]);
    let mut client = Client::new(server);
    client.handshake("app1", 0x1122_3344);
    assert!(eng.sessions.find_by_xid(client.xid).is_some());

    // First authenticated packet commits the cookie.
    client.send_session(&[Msg { code: 0x01, body: Vec::new() }]);
    let body = client.recv_session().expect("keepalive reply");
    let marker = body[0];
    assert!(marker == 0x4a || marker == 0x4e);
    assert!(message_codes(&body).contains(&0x41), "passive keepalive reply");
    assert!(eng.cookies.is_empty(), "cookie must be committed");

    client.connect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unauthorized_app_gets_silence() {
    let (_eng, server) = start_engine(&["app1"]);
    let client = Client::new(server);
    let epd = b"rtmfp://example.net/otherapp";
    let mut hello = PacketWriter::new();
    hello.write_u8(0);
    hello.write_u8(epd.len() as u8 + 1);
    hello.write_u8(0x0a);
    hello.write_bytes(epd);
    hello.write_bytes(&[0u8; 16]);
    client.send_handshake(0x30, hello.into_bytes());

    let mut buf = [0u8; 2048];
    assert!(client.sock.recv_from(&mut buf).is_err(), "failure paths are silent");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_order_fragments_reassemble() {
    let (_eng, server) = start_engine(&["app1"]);
    let mut client = Client::new(server);
    client.handshake("app1", 0x0100_0001);

    // Build the connect payload and split it into two fragments.
    let mut w = Amf0Writer::new();
    {
        let raw = w.raw_mut();
        raw.write_u8(0x14);
        raw.write_u32(0);
    }
    w.write_string("connect").unwrap();
    w.write_number(1.0);
    w.write_null();
    let mut obj = AmfObject::new();
    obj.set_number("objectEncoding", 3.0);
    w.write_object(&obj).unwrap();
    let payload = w.into_bytes();
    let (head, tail) = payload.split_at(10);

    // Second fragment first: stage 2, with-before, carries the header
    // (it must — it is what creates the flow).
    client.send_session(&[Client::flow_record(2, 2, 2, 0x20, CONN_SIGNATURE, tail)]);
    assert!(
        !client.recv_until_contains(b"NetConnection.Connect.Success", Duration::from_millis(400)),
        "half a message must not be delivered"
    );

    // First fragment: stage 1, with-after. Now the message completes.
    client.send_session(&[Client::flow_record(2, 1, 1, 0x10, CONN_SIGNATURE, head)]);
    assert!(
        client.recv_until_contains(b"NetConnection.Connect.Success", Duration::from_secs(2)),
        "reassembled message must be delivered"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unacked_response_is_retransmitted() {
    let (_eng, server) = start_engine(&["app1"]);
    let mut client = Client::new(server);
    client.handshake("app1", 0x0200_0002);
    client.connect();

    // Never ACK. The manage loop must resend within the schedule.
    assert!(
        client.recv_until_contains(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x29], Duration::from_secs(3)),
        "newest reliable fragment must be retransmitted"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_rendezvous_exchanges_addresses() {
    let (_eng, server) = start_engine(&["app1"]);
    let mut a = Client::new(server);
    a.handshake("app1", 0x0a00_000a);
    // Commit and register A's remote address.
    a.send_session(&[Msg { code: 0x01, body: Vec::new() }]);
    let _ = a.recv_session();

    // B asks for A by pid.
    let b = Client::new(server);
    let tag = [0x77u8; 16];
    let mut hello = PacketWriter::new();
    hello.write_u8(0);
    hello.write_u8(a.pid.len() as u8 + 1);
    hello.write_u8(0x0f);
    hello.write_bytes(&a.pid);
    hello.write_bytes(&tag);
    b.send_handshake(0x30, hello.into_bytes());

    let (code, body) = b.recv_handshake(0);
    assert_eq!(code, 0x71);
    let mut r = PacketReader::new(&body);
    let taglen = r.read_u8().unwrap() as usize;
    assert_eq!(r.read_vec(taglen).unwrap(), tag);
    let (addr, public) = r.read_address().unwrap();
    assert!(public);
    assert_eq!(SocketAddr::V4(addr), a.sock.local_addr().unwrap());

    // A simultaneously gets the 0x0f notice with B's address and the tag.
    let notice = a.recv_session().expect("rendezvous notice");
    assert!(contains(&notice, &tag));
    assert!(contains(&notice, &a.pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keepalive_timeout_closes_the_session() {
    let (eng, server) = start_engine_with_heartbeat(&["app1"], 1);
    let mut client = Client::new(server);
    client.handshake("app1", 0x0e00_000e);
    let xid = client.xid;
    assert!(eng.sessions.find_by_xid(xid).is_some());

    // Say nothing. The server must probe six times, then give up.
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut keepalives = 0;
    let mut closed = false;
    while Instant::now() < deadline {
        let Some(body) = client.recv_session() else { continue };
        let codes = message_codes(&body);
        keepalives += codes.iter().filter(|&&c| c == 0x01).count();
        if codes.contains(&0x0c) {
            closed = true;
            break;
        }
    }
    assert!(closed, "session must close with an error response");
    assert!(keepalives >= 6, "got only {keepalives} keepalive probes");

    // Removal happens on the manage tick that closed it.
    let deadline = Instant::now() + Duration::from_secs(3);
    while eng.sessions.find_by_xid(xid).is_some() {
        assert!(Instant::now() < deadline, "session must leave the registry");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_play_fan_out() {
    let (_eng, server) = start_engine(&["app1"]);

    let mut publisher = Client::new(server);
    publisher.handshake("app1", 0x0b00_000b);
    publisher.connect();

    let mut sub1 = Client::new(server);
    sub1.handshake("app1", 0x0c00_000c);
    sub1.connect();

    let mut sub2 = Client::new(server);
    sub2.handshake("app1", 0x0d00_000d);
    sub2.connect();

    sub1.stream_command(4, 1, b"\x00\x54\x43\x04\x01", "play", "live", b"NetStream.Play.Start");
    sub2.stream_command(4, 1, b"\x00\x54\x43\x04\x01", "play", "live", b"NetStream.Play.Start");
    publisher.stream_command(4, 1, b"\x00\x54\x43\x04\x01", "publish", "live", b"NetStream.Publish.Start");

    // A data message on the publisher's stream flow fans out.
    let mut w = Amf0Writer::new();
    {
        let raw = w.raw_mut();
        raw.write_u8(0x0f);
        raw.write_u8(0);
        raw.write_u32(0);
    }
    w.write_string("onMetaData").unwrap();
    w.write_string("payload-body").unwrap();
    let payload = w.into_bytes();
    publisher.send_session(&[Client::flow_record(4, 2, 1, 0, &[], &payload)]);

    assert!(
        sub1.recv_until_contains(b"onMetaData", Duration::from_secs(2)),
        "first subscriber must receive the data message"
    );
    assert!(
        sub2.recv_until_contains(b"onMetaData", Duration::from_secs(2)),
        "second subscriber must receive the data message"
    );
    assert!(
        !publisher.recv_until_contains(b"onMetaData", Duration::from_millis(500)),
        "the publisher must not receive its own message"
    );
}
