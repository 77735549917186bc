//! Message dispatch for delivered flow payloads.
//!
//! A delivered message starts with a one-byte code: `0x11`/`0x14` are
//! AMF commands (name, callback, null, args), `0x0f` is AMF data
//! (name, args, no callback), anything else is a raw message.

use std::sync::Arc;

use rill_amf::amf0::Amf0Writer;
use rill_amf::{AmfError, amf0::Amf0Reader};
use rill_wire::PacketReader;
use thiserror::Error;

use super::conn::ConnHandler;
use super::flow_writer::FlowWriter;
use super::stream::StreamHandler;
use super::{Session, SessionState};
use crate::engine::Engine;

/// Everything a handler may touch while processing one message: the
/// engine, the owning session's locked state, and the handler's paired
/// flow writer (detached from the state's writer map for the duration).
pub(crate) struct HandlerCx<'c> {
    pub eng: &'c Arc<Engine>,
    pub sess: &'c Arc<Session>,
    pub state: &'c mut SessionState,
    pub fw: &'c mut FlowWriter,
    /// Flow id of the handler's reader — the subscriber identity used by
    /// the publication router.
    pub reader_fid: u64,
}

impl HandlerCx<'_> {
    /// Queue an assembled message on this handler's writer, reliably.
    pub fn reply(&mut self, bytes: &[u8]) {
        let chunks = super::flow_writer::split(bytes);
        self.fw.add_fragments(&mut self.state.rsplist, true, &chunks);
    }
}

/// Dispatch failures. All are logged and dropped; none close the session.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("message: {0}")]
    Message(&'static str),
    #[error(transparent)]
    Amf(#[from] AmfError),
}

/// A flow's message handler: the connection flow handles NetConnection
/// RPC, every other flow handles NetStream commands.
pub(crate) enum Handler {
    Conn(ConnHandler),
    Stream(StreamHandler),
}

impl Handler {
    /// A subscriber of an unreliable publication fabricates cumulative
    /// ACK advancement to skip dropped fragments.
    pub fn deceptive_ack(&self) -> bool {
        match self {
            Self::Conn(_) => false,
            Self::Stream(h) => h.deceptive_ack(),
        }
    }

    pub fn on_close(&mut self, cx: &mut HandlerCx<'_>) {
        match self {
            Self::Conn(h) => h.on_close(cx),
            Self::Stream(h) => h.on_close(cx),
        }
    }

    fn on_amf_message(
        &mut self,
        cx: &mut HandlerCx<'_>,
        name: &str,
        callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        match self {
            Self::Conn(h) => h.on_amf_message(cx, name, callback, r),
            Self::Stream(h) => h.on_amf_message(cx, name, callback, r),
        }
    }

    fn on_raw_message(
        &mut self,
        cx: &mut HandlerCx<'_>,
        code: u8,
        r: &mut PacketReader<'_>,
    ) -> Result<(), DispatchError> {
        match self {
            Self::Conn(h) => h.on_raw_message(cx, code, r),
            Self::Stream(h) => h.on_raw_message(cx, code, r),
        }
    }
}

/// Decode one delivered message and dispatch it.
pub(crate) fn handle_message(
    cx: &mut HandlerCx<'_>,
    handler: &mut Handler,
    data: &[u8],
) -> Result<(), DispatchError> {
    let mut r = PacketReader::new(data);
    let code = r.read_u8().map_err(|_| DispatchError::Message("read code"))?;
    match code {
        0x11 => {
            r.skip(5).map_err(|_| DispatchError::Message("skip prefix"))?;
            handle_amf_message(cx, handler, &mut r, true)
        }
        0x14 => {
            r.skip(4).map_err(|_| DispatchError::Message("skip prefix"))?;
            handle_amf_message(cx, handler, &mut r, true)
        }
        0x0f => {
            r.skip(5).map_err(|_| DispatchError::Message("skip prefix"))?;
            handle_amf_message(cx, handler, &mut r, false)
        }
        _ => handler.on_raw_message(cx, code, &mut r),
    }
}

fn handle_amf_message(
    cx: &mut HandlerCx<'_>,
    handler: &mut Handler,
    r: &mut PacketReader<'_>,
    with_callback: bool,
) -> Result<(), DispatchError> {
    let mut ar = Amf0Reader::new(r);
    let name = ar.read_string().map_err(|_| DispatchError::Message("read name"))?;
    let mut callback = 0.0;
    if with_callback {
        callback = ar.read_number().map_err(|_| DispatchError::Message("read callback"))?;
        if ar.remaining() != 0 && ar.test_null() {
            ar.read_null().map_err(|_| DispatchError::Message("read null"))?;
        }
    }
    handler.on_amf_message(cx, &name, callback, &mut ar)
}

// ─── Message builders ────────────────────────────────────────────────────────

/// Start an AMF command message: `0x14`, 4 zero bytes, name, callback, null.
pub(crate) fn amf_message_writer(name: &str, callback: f64) -> Result<Amf0Writer, AmfError> {
    let mut w = Amf0Writer::new();
    {
        let raw = w.raw_mut();
        raw.write_u8(0x14);
        raw.write_u32(0);
    }
    w.write_string(name)?;
    w.write_number(callback);
    w.write_null();
    Ok(w)
}

/// Start an AMF data message: `0x0f`, 5 zero bytes, name (no callback).
pub(crate) fn amf_data_writer(name: &str) -> Result<Amf0Writer, AmfError> {
    let mut w = Amf0Writer::new();
    {
        let raw = w.raw_mut();
        raw.write_u8(0x0f);
        raw.write_u8(0);
        raw.write_u32(0);
    }
    w.write_string(name)?;
    Ok(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_writer_prefix_layout() {
        let w = amf_message_writer("_result", 2.0).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0x14);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
        // AMF0 string marker then "_result"
        assert_eq!(bytes[5], 0x02);
        assert_eq!(&bytes[8..15], b"_result");
    }

    #[test]
    fn data_writer_prefix_layout() {
        let w = amf_data_writer("onStatus").unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0x0f);
        assert_eq!(&bytes[1..6], &[0, 0, 0, 0, 0]);
        assert_eq!(bytes[6], 0x02);
    }
}
