//! Outgoing session messages and their MTU accounting.
//!
//! Responses queue in a per-session FIFO; at flush time each is asked
//! for its encoded size relative to the previous response
//! (`set_last_info`) so a flow response can elide its header when it
//! directly continues the previous one. Responses must be finalized in
//! FIFO order for that elision to stay consistent.

use std::net::SocketAddrV4;

use rill_wire::{PacketWriter, size_of_7bit_u64};

use super::flow_ack::FlowAck;
use super::fragment::{FLAG_HEADER, Fragment};
use crate::frame::ResponseMessage;

// ─── FlowResponse ────────────────────────────────────────────────────────────

/// A single outgoing flow fragment (`0x10` with header, `0x11` without).
pub(crate) struct FlowResponse {
    header: bool,
    fw_fid: u64,
    signature: Vec<u8>,
    fr_fid: u64,
    stage: u64,
    delta: u64,
    flags: u8,
    data: Vec<u8>,
}

impl FlowResponse {
    /// Build a response for one fragment. The flow header (signature and
    /// companion-reader option) is included only on the very first send,
    /// when nothing is outstanding (`stageack == 0`).
    pub fn new(
        fw_fid: u64,
        signature: &[u8],
        reader_fid: u64,
        f: &Fragment,
        stageack: u64,
    ) -> Self {
        let (signature, fr_fid) = if stageack == 0 {
            (signature.to_vec(), reader_fid)
        } else {
            (Vec::new(), 0)
        };
        Self {
            header: false,
            fw_fid,
            signature,
            fr_fid,
            stage: f.stage,
            delta: if f.stage > stageack { f.stage - stageack } else { 0 },
            flags: f.flags,
            data: f.data.clone(),
        }
    }

    fn set_last_info(&mut self, lastfid: u64, laststage: u64) -> usize {
        self.header = !(self.fw_fid == lastfid && self.stage == laststage + 1);
        let mut size = 1 + self.data.len();
        if self.header {
            size += size_of_7bit_u64(self.fw_fid).unwrap_or(0);
            size += size_of_7bit_u64(self.stage).unwrap_or(0);
            size += size_of_7bit_u64(self.delta).unwrap_or(0);
            if !self.signature.is_empty() {
                size += 1 + self.signature.len();
                if self.fr_fid != 0 {
                    let more = 1 + size_of_7bit_u64(self.fr_fid).unwrap_or(0);
                    size += size_of_7bit_u64(more as u64).unwrap_or(0);
                    size += more;
                }
            }
            size += 1;
        }
        size
    }

    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        let mut flags = self.flags;
        if self.header {
            flags |= FLAG_HEADER;
        }
        w.write_u8(flags);
        if self.header {
            w.write_7bit_u64(self.fw_fid)?;
            w.write_7bit_u64(self.stage)?;
            w.write_7bit_u64(self.delta)?;
            if !self.signature.is_empty() {
                w.write_string8(&self.signature)?;
                if self.fr_fid != 0 {
                    let more = 1 + size_of_7bit_u64(self.fr_fid)?;
                    w.write_7bit_u64(more as u64)?;
                    w.write_u8(0x0a);
                    w.write_7bit_u64(self.fr_fid)?;
                }
            }
            w.write_u8(0);
        }
        w.write_bytes(&self.data);
        Ok(())
    }
}

// ─── FlowAckResponse ─────────────────────────────────────────────────────────

/// A `0x51` flow ACK.
pub(crate) struct FlowAckResponse {
    pub fid: u64,
    pub cnt: u64,
    pub ack: FlowAck,
}

impl FlowAckResponse {
    fn size(&self) -> usize {
        size_of_7bit_u64(self.fid).unwrap_or(0)
            + size_of_7bit_u64(self.cnt).unwrap_or(0)
            + self.ack.size()
    }

    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        w.write_7bit_u64(self.fid)?;
        w.write_7bit_u64(self.cnt)?;
        self.ack.store(w)
    }
}

// ─── RendezvousNotice ────────────────────────────────────────────────────────

/// A `0x0f` handshake notice telling an established session that a peer
/// wants to reach it: the peer's address and the correlation tag.
pub(crate) struct RendezvousNotice {
    pub pid: [u8; 32],
    pub tag: Vec<u8>,
    pub addr: SocketAddrV4,
    pub public: bool,
}

impl RendezvousNotice {
    fn size(&self) -> usize {
        3 + self.pid.len() + 7 + self.tag.len()
    }

    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        w.write_u8(0x22);
        w.write_u8(0x21);
        w.write_u8(0x0f);
        w.write_bytes(&self.pid);
        w.write_address(&self.addr, self.public);
        w.write_bytes(&self.tag);
        Ok(())
    }
}

// ─── Response ────────────────────────────────────────────────────────────────

/// Every message a session can queue for its peer.
pub(crate) enum Response {
    Flow(FlowResponse),
    KeepAlive { passive: bool },
    FlowAck(FlowAckResponse),
    Error,
    Rendezvous(RendezvousNotice),
}

impl Response {
    /// `(flow id, stage)` of a flow response, for header elision.
    pub fn info(&self) -> (u64, u64) {
        match self {
            Self::Flow(f) => (f.fw_fid, f.stage),
            _ => (0, 0),
        }
    }

    /// Decide header presence against the previous response and return
    /// the resulting encoded body size.
    pub fn set_last_info(&mut self, lastfid: u64, laststage: u64) -> usize {
        match self {
            Self::Flow(f) => f.set_last_info(lastfid, laststage),
            Self::KeepAlive { .. } | Self::Error => 0,
            Self::FlowAck(a) => a.size(),
            Self::Rendezvous(n) => n.size(),
        }
    }
}

impl ResponseMessage for Response {
    fn code(&self) -> u8 {
        match self {
            Self::Flow(f) => {
                if f.header {
                    0x10
                } else {
                    0x11
                }
            }
            Self::KeepAlive { passive: true } => 0x41,
            Self::KeepAlive { passive: false } => 0x01,
            Self::FlowAck(_) => 0x51,
            Self::Error => 0x0c,
            Self::Rendezvous(_) => 0x0f,
        }
    }

    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        match self {
            Self::Flow(f) => f.write_to(w),
            Self::KeepAlive { .. } | Self::Error => Ok(()),
            Self::FlowAck(a) => a.write_to(w),
            Self::Rendezvous(n) => n.write_to(w),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(stage: u64, flags: u8, data: &[u8]) -> Fragment {
        Fragment { stage, flags, data: data.to_vec(), sendtime: None }
    }

    fn encoded_len(rsp: &Response) -> usize {
        let mut w = PacketWriter::new();
        rsp.write_to(&mut w).unwrap();
        w.len()
    }

    #[test]
    fn first_send_carries_the_full_header() {
        let f = frag(1, 0, b"hello");
        let mut rsp = Response::Flow(FlowResponse::new(3, b"\x00TC\x04\x00", 2, &f, 0));
        let size = rsp.set_last_info(0, 0);
        assert!(matches!(&rsp, Response::Flow(f) if f.header));
        assert_eq!(size, encoded_len(&rsp));
        assert_eq!(rsp.code(), 0x10);
    }

    #[test]
    fn continuation_elides_the_header() {
        let f = frag(6, 0x20, b"abc");
        let mut rsp = Response::Flow(FlowResponse::new(3, b"", 0, &f, 5));
        let size = rsp.set_last_info(3, 5);
        assert!(matches!(&rsp, Response::Flow(f) if !f.header));
        assert_eq!(rsp.code(), 0x11);
        assert_eq!(size, 1 + 3);
        assert_eq!(size, encoded_len(&rsp));
    }

    #[test]
    fn resumed_flow_header_omits_signature() {
        // stageack != 0: header may be re-emitted but without signature.
        let f = frag(9, 0, b"xy");
        let mut rsp = Response::Flow(FlowResponse::new(3, b"\x00TC\x04\x00", 2, &f, 8));
        let size = rsp.set_last_info(0, 0);
        assert!(matches!(&rsp, Response::Flow(f) if f.header && f.signature.is_empty()));
        assert_eq!(size, encoded_len(&rsp));
    }

    #[test]
    fn flow_ack_size_matches_encoding() {
        let mut ack = FlowAck::new(4);
        ack.add_range(7, 9);
        let mut rsp = Response::FlowAck(FlowAckResponse { fid: 2, cnt: 0x7f, ack });
        let size = rsp.set_last_info(0, 0);
        assert_eq!(size, encoded_len(&rsp));
    }

    #[test]
    fn rendezvous_notice_size_matches_encoding() {
        let mut rsp = Response::Rendezvous(RendezvousNotice {
            pid: [7u8; 32],
            tag: vec![1; 16],
            addr: "10.0.0.1:1935".parse().unwrap(),
            public: true,
        });
        let size = rsp.set_last_info(0, 0);
        assert_eq!(size, encoded_len(&rsp));
        assert_eq!(rsp.code(), 0x0f);
    }

    #[test]
    fn keepalive_codes() {
        assert_eq!(Response::KeepAlive { passive: true }.code(), 0x41);
        assert_eq!(Response::KeepAlive { passive: false }.code(), 0x01);
        assert_eq!(Response::Error.code(), 0x0c);
    }
}
