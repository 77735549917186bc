//! UDP listeners: parallel receive workers, one sender task per port.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::counts::Counts;
use crate::engine::Engine;
use crate::{frame, handshake, session};

const MAX_SEND_BUFFER: usize = 1024 * 1024 * 8;
const MAX_RECV_BUFFER: usize = 1024 * 1024 * 32;

/// Largest datagram we read off the wire.
const MAX_RECV_PACKET: usize = 1024 * 2;

/// Largest datagram we put on the wire (after encryption).
const MAX_SEND_PACKET: usize = 1400;

type Outgoing = (SocketAddrV4, Vec<u8>);

/// Send handles for every bound port.
pub struct UdpHub {
    senders: HashMap<u16, mpsc::UnboundedSender<Outgoing>>,
}

impl UdpHub {
    /// Bind all ports and spawn their sender tasks. Returns the hub and
    /// the sockets for the receive workers.
    pub fn bind(ports: &[u16]) -> io::Result<(Self, Vec<(u16, Arc<UdpSocket>)>)> {
        let mut senders = HashMap::new();
        let mut sockets = Vec::new();
        for &port in ports {
            if senders.contains_key(&port) {
                continue;
            }
            let socket = bind_socket(port)?;
            info!(target: "udp", port, "listening");
            let socket = Arc::new(socket);

            let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
            let sender_socket = Arc::clone(&socket);
            tokio::spawn(async move {
                while let Some((addr, data)) = rx.recv().await {
                    if let Err(e) = sender_socket.send_to(&data, SocketAddr::V4(addr)).await {
                        warn!(target: "udp", port, error = %e, "send error");
                    }
                }
            });

            senders.insert(port, tx);
            sockets.push((port, socket));
        }
        Ok((Self { senders }, sockets))
    }

    /// Queue a datagram for sending. Oversize packets are dropped.
    pub fn send(&self, counts: &Counts, lport: u16, addr: SocketAddrV4, data: Vec<u8>) {
        if data.len() > MAX_SEND_PACKET {
            counts.count("udp.toobig", 1);
            error!(target: "udp", port = lport, size = data.len(), "packet too big");
            return;
        }
        match self.senders.get(&lport) {
            Some(tx) => {
                let _ = tx.send((addr, data));
            }
            None => {
                counts.count("udp.notfound", 1);
                error!(target: "udp", port = lport, "no listener for port");
            }
        }
    }
}

fn bind_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(MAX_SEND_BUFFER)?;
    socket.set_recv_buffer_size(MAX_RECV_BUFFER)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Spawn `parallel` receive workers per socket; each dispatches by the
/// extracted session id (zero → handshake engine). A panic while
/// handling one datagram is caught and logged; the worker keeps going.
pub fn spawn_workers(eng: &Arc<Engine>, sockets: Vec<(u16, Arc<UdpSocket>)>, parallel: usize) {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    for (port, socket) in sockets {
        for _ in 0..parallel {
            let eng = Arc::clone(eng);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_RECV_PACKET];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, SocketAddr::V4(peer))) if n != 0 => {
                            let data = buf[..n].to_vec();
                            let dispatch = catch_unwind(AssertUnwindSafe(|| {
                                match frame::session_id_of(&data) {
                                    Err(_) => {}
                                    Ok(0) => handshake::handle_packet(&eng, port, peer, data),
                                    Ok(xid) => session::handle_packet(&eng, port, peer, xid, data),
                                }
                            }));
                            if dispatch.is_err() {
                                eng.counts.count("server.panic", 1);
                                error!(target: "udp", port, "dispatch panicked");
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(target: "udp", port, error = %e, "recv error");
                        }
                    }
                }
            });
        }
    }
}
