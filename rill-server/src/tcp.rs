//! The framed TCP transport under the RPC bridge.
//!
//! Frames are `[magic 0xDEADBEAF u32][length u32][payload]`, payload at
//! most 10 MiB. The client side dials the peer bridge and reconnects
//! forever with a drain-backoff; the server side accepts any number of
//! connections and funnels their frames into one channel. Reads stall
//! out after 90 s mid-frame, writes after 10 s.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::counts::Counts;

const MAX_SEND_BUFFER: usize = 1024 * 1024 * 8;
const MAX_RECV_BUFFER: usize = 1024 * 1024 * 32;

const MAX_PACKET_SIZE: usize = 1024 * 1024 * 10;
const MAGIC: u32 = 0xdead_beaf;

const READ_DEADLINE: Duration = Duration::from_secs(90);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

fn configure(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let _ = sock.set_send_buffer_size(MAX_SEND_BUFFER);
    let _ = sock.set_recv_buffer_size(MAX_RECV_BUFFER);
    let _ = sock.set_nodelay(true);
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "frame deadline exceeded")
}

/// Read one frame. Waiting for the first byte has no deadline (an idle
/// bridge is fine); the rest of the frame must arrive within 90 s.
async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> io::Result<Vec<u8>> {
    let mut head = [0u8; 8];
    rd.read_exact(&mut head[..1]).await?;
    timeout(READ_DEADLINE, rd.read_exact(&mut head[1..]))
        .await
        .map_err(|_| timed_out())??;
    let magic = u64::from_be_bytes(head);
    if (magic >> 32) as u32 != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad magic {magic:#018x}"),
        ));
    }
    let size = magic as u32 as usize;
    if size > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {size} exceeds {MAX_PACKET_SIZE}"),
        ));
    }
    let mut data = vec![0u8; size];
    timeout(READ_DEADLINE, rd.read_exact(&mut data))
        .await
        .map_err(|_| timed_out())??;
    Ok(data)
}

async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, data: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(8 + data.len());
    let magic = (u64::from(MAGIC) << 32) | data.len() as u64;
    buf.extend_from_slice(&magic.to_be_bytes());
    buf.extend_from_slice(data);
    timeout(WRITE_DEADLINE, wr.write_all(&buf))
        .await
        .map_err(|_| timed_out())?
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Send handle for the dialing side of the bridge.
pub struct BridgeClient {
    tx: mpsc::Sender<Vec<u8>>,
}

impl BridgeClient {
    /// Dial `host:port` forever. Returns the send handle and the channel
    /// of frames received from the peer.
    pub fn start(
        host: String,
        port: u16,
        counts: Arc<Counts>,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (send_tx, send_rx) = mpsc::channel::<Vec<u8>>(1024);
        let (recv_tx, recv_rx) = mpsc::channel::<Vec<u8>>(1024);
        tokio::spawn(client_main(host, port, send_rx, recv_tx, counts));
        (Self { tx: send_tx }, recv_rx)
    }

    /// Queue a frame for the peer; dropped (and counted) when the
    /// connection is down and the backlog is full.
    pub fn send(&self, counts: &Counts, data: Vec<u8>) {
        if self.tx.try_send(data).is_err() {
            counts.count("tcp.send.dropped", 1);
        }
    }
}

async fn client_main(
    host: String,
    port: u16,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    recv_tx: mpsc::Sender<Vec<u8>>,
    counts: Arc<Counts>,
) {
    loop {
        match TcpStream::connect((host.as_str(), port)).await {
            Err(e) => {
                counts.count("tcp.connect.error", 1);
                warn!(target: "tcp", %host, port, error = %e, "connect failed");
            }
            Ok(stream) => {
                counts.count("tcp.connect", 1);
                info!(target: "tcp", %host, port, "connected");
                configure(&stream);
                let (mut rd, mut wr) = stream.into_split();

                let recv_tx2 = recv_tx.clone();
                let mut recv_task = tokio::spawn(async move {
                    loop {
                        match read_frame(&mut rd).await {
                            Ok(data) => {
                                if !data.is_empty() && recv_tx2.send(data).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(target: "tcp", error = %e, "recv error");
                                return;
                            }
                        }
                    }
                });

                loop {
                    tokio::select! {
                        _ = &mut recv_task => break,
                        msg = send_rx.recv() => match msg {
                            None => return,
                            Some(data) => {
                                if data.is_empty() {
                                    continue;
                                }
                                if let Err(e) = write_frame(&mut wr, &data).await {
                                    warn!(target: "tcp", error = %e, "send error");
                                    recv_task.abort();
                                    break;
                                }
                            }
                        },
                    }
                }
                counts.count("tcp.connect.close", 1);
            }
        }
        // Back off, discarding whatever piles up meanwhile.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            while send_rx.try_recv().is_ok() {}
        }
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Listen on `port`; every accepted connection's frames land in the
/// returned channel.
pub fn start_server(port: u16, counts: Arc<Counts>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(1024);
    tokio::spawn(server_main(port, tx, counts));
    rx
}

async fn server_main(port: u16, tx: mpsc::Sender<Vec<u8>>, counts: Arc<Counts>) {
    loop {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Err(e) => {
                counts.count("tcp.listen.error", 1);
                warn!(target: "tcp", port, error = %e, "listen failed");
            }
            Ok(listener) => {
                counts.count("tcp.listen", 1);
                info!(target: "tcp", port, "listening");
                loop {
                    match listener.accept().await {
                        Err(e) => {
                            counts.count("tcp.accept.error", 1);
                            warn!(target: "tcp", port, error = %e, "accept failed");
                            break;
                        }
                        Ok((stream, peer)) => {
                            counts.count("tcp.accept", 1);
                            info!(target: "tcp", port, %peer, "accepted");
                            configure(&stream);
                            let tx = tx.clone();
                            let counts = Arc::clone(&counts);
                            tokio::spawn(async move {
                                let (mut rd, _wr) = stream.into_split();
                                loop {
                                    match read_frame(&mut rd).await {
                                        Ok(data) => {
                                            if !data.is_empty() && tx.send(data).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            warn!(target: "tcp", %peer, error = %e, "recv error");
                                            break;
                                        }
                                    }
                                }
                                counts.count("tcp.accept.close", 1);
                            });
                        }
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
