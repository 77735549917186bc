//! Parsers for the flow-carrying request messages.

use rill_wire::PacketReader;

use super::flow_ack::FlowAck;
use super::fragment::{FLAG_HEADER, Fragment};
use crate::frame::FrameError;

/// A `0x10` flow record plus any `0x11` continuation slices from the
/// same packet.
pub(crate) struct FlowRequest {
    pub fid: u64,
    pub signature: Vec<u8>,
    pub stage: u64,
    pub stageack: u64,
    slices: Vec<FlowSlice>,
}

pub(crate) struct FlowSlice {
    pub flags: u8,
    pub data: Vec<u8>,
}

/// A `0x51` flow ACK record.
pub(crate) struct FlowAckRequest {
    pub fid: u64,
    pub cnt: u64,
    pub ack: FlowAck,
}

/// A `0x5e` flow error notice.
pub(crate) struct FlowErrorRequest {
    pub fid: u64,
}

impl FlowRequest {
    pub fn add_slice(&mut self, slice: FlowSlice) {
        self.slices.push(slice);
    }

    /// Materialize the slices as fragments with consecutive stages.
    pub fn fragments(&self) -> Vec<Fragment> {
        self.slices
            .iter()
            .enumerate()
            .map(|(i, s)| Fragment {
                stage: self.stage + i as u64,
                flags: s.flags,
                data: s.data.clone(),
                sendtime: None,
            })
            .collect()
    }
}

pub(crate) fn parse_flow_request(r: &mut PacketReader<'_>) -> Result<FlowRequest, FrameError> {
    let flags = r.read_u8()?;
    let fid = r.read_7bit_u64()?;
    let stage = r.read_7bit_u64()?;
    let delta = r.read_7bit_u64()?;
    let mut signature = Vec::new();
    if flags & FLAG_HEADER != 0 {
        signature = r.read_string8()?;
        // Options, each length-prefixed, up to a zero-length terminator.
        loop {
            let size = r.read_u8()? as usize;
            if size == 0 {
                break;
            }
            if size > r.remaining() {
                return Err(FrameError::BadContentLength);
            }
            r.skip(size)?;
        }
    }
    let data = r.rest().to_vec();
    let mut req = FlowRequest {
        fid,
        signature,
        stage,
        stageack: stage.saturating_sub(delta),
        slices: Vec::with_capacity(4),
    };
    req.add_slice(FlowSlice { flags, data });
    Ok(req)
}

pub(crate) fn parse_flow_slice(r: &mut PacketReader<'_>) -> Result<FlowSlice, FrameError> {
    let flags = r.read_u8()?;
    Ok(FlowSlice { flags, data: r.rest().to_vec() })
}

pub(crate) fn parse_flow_ack_request(
    r: &mut PacketReader<'_>,
) -> Result<FlowAckRequest, FrameError> {
    let fid = r.read_7bit_u64()?;
    let cnt = r.read_7bit_u64()?;
    let ack = FlowAck::parse(r)?;
    Ok(FlowAckRequest { fid, cnt, ack })
}

pub(crate) fn parse_flow_error_request(
    r: &mut PacketReader<'_>,
) -> Result<FlowErrorRequest, FrameError> {
    Ok(FlowErrorRequest { fid: r.read_7bit_u64()? })
}
