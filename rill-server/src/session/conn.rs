//! The NetConnection handler — RPC on a session's main flow.

use std::net::SocketAddrV4;

use rill_amf::AmfObject;
use rill_amf::amf0::Amf0Reader;
use rill_wire::{PacketReader, PacketWriter};
use tracing::debug;

use super::message::{DispatchError, HandlerCx, amf_message_writer};
use super::{broadcast_by_xid, close_session, push_to_main_writer};
use crate::rpc;

const KEEPALIVE_SERVER_MS: u32 = 1000 * 20;
const KEEPALIVE_PEER_MS: u32 = 1000 * 5;

/// Handler state for the main connection flow.
pub(crate) struct ConnHandler {
    addr_change_inform: bool,
}

impl ConnHandler {
    pub fn new() -> Self {
        Self { addr_change_inform: false }
    }

    pub fn on_amf_message(
        &mut self,
        cx: &mut HandlerCx<'_>,
        name: &str,
        callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        if cx.fw.closed {
            return Err(DispatchError::Message("conn message on closed flow"));
        }
        match name {
            "connect" => self.on_connect(cx, callback, r),
            "setPeerInfo" => self.on_set_peer_info(cx, callback, r),
            "initStream" | "deleteStream" => Ok(()),
            "createStream" => self.on_create_stream(cx, callback),
            "setAddressChangeInform" => {
                self.addr_change_inform = true;
                Ok(())
            }
            "addressChange" => self.on_address_change(cx),
            "request" => {
                rpc::call(cx.eng, cx.sess.xid, cx.state.raddr, callback, r.rest(), true);
                Ok(())
            }
            "relay" => self.on_relay(cx, r),
            "proxySend" => {
                rpc::call(cx.eng, cx.sess.xid, cx.state.raddr, 0.0, r.rest(), true);
                Ok(())
            }
            "proxySend2" => {
                rpc::call(cx.eng, cx.sess.xid, cx.state.raddr, 0.0, r.rest(), false);
                Ok(())
            }
            "broadcastBySessionId" => on_broadcast_by_xid(cx, r, true),
            "broadcastBySessionId2" => on_broadcast_by_xid(cx, r, false),
            _ => self.on_default(cx, name, callback),
        }
    }

    pub fn on_close(&mut self, cx: &mut HandlerCx<'_>) {
        if !cx.fw.closed {
            cx.fw.closed = true;
            cx.fw.end(&mut cx.state.rsplist);
            debug!(target: "session", xid = cx.sess.xid, fid = cx.fw.fid, "flow closed");
        }
        close_session(cx.eng, cx.sess, cx.state);
    }

    fn on_connect(
        &mut self,
        cx: &mut HandlerCx<'_>,
        callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        let obj = r
            .read_object()
            .map_err(|_| DispatchError::Message("connect: read object"))?
            .ok_or(DispatchError::Message("connect: no object"))?;
        let encoding = obj
            .get_number("objectEncoding")
            .ok_or(DispatchError::Message("connect: no objectEncoding"))?;
        if encoding == 0.0 {
            let mut w = amf_message_writer("_error", callback)?;
            let mut o = AmfObject::new();
            o.set_string("level", "error");
            o.set_string("code", "NetConnection.Connect.Rejected");
            o.set_string("description", "ObjectEncoding client must be in a AMF3 format (not AMF0)");
            w.write_object(&o)?;
            cx.reply(w.bytes());
            return Ok(());
        }
        let mut w = amf_message_writer("_result", callback)?;
        let mut o = AmfObject::new();
        o.set_string("level", "status");
        o.set_string("code", "NetConnection.Connect.Success");
        o.set_string("description", "Connection succeeded");
        o.set_number("objectEncoding", 3.0);
        o.set_number("sessionId", f64::from(cx.sess.xid));
        o.set_string("address", cx.state.raddr.to_string());
        w.write_object(&o)?;
        cx.reply(w.bytes());
        self.keepalive_config(cx);
        Ok(())
    }

    fn on_set_peer_info(
        &mut self,
        cx: &mut HandlerCx<'_>,
        _callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        let mut addrs = Vec::new();
        while r.remaining() != 0 {
            let s = r
                .read_string()
                .map_err(|_| DispatchError::Message("setPeerInfo: read address"))?;
            if s.is_empty() {
                continue;
            }
            match s.parse::<SocketAddrV4>() {
                Ok(addr) => addrs.push(addr),
                Err(_) => debug!(target: "session", xid = cx.sess.xid, addr = %s, "unparsable peer address"),
            }
        }
        cx.state.addrs = addrs;
        self.keepalive_config(cx);
        Ok(())
    }

    /// Raw keepalive configuration: server interval then peer interval.
    fn keepalive_config(&self, cx: &mut HandlerCx<'_>) {
        let mut w = PacketWriter::new();
        w.write_u8(0x04);
        w.write_u32(0);
        w.write_u16(0x29);
        w.write_u32(KEEPALIVE_SERVER_MS);
        w.write_u32(KEEPALIVE_PEER_MS);
        cx.reply(w.bytes());
    }

    fn on_create_stream(
        &mut self,
        cx: &mut HandlerCx<'_>,
        callback: f64,
    ) -> Result<(), DispatchError> {
        loop {
            cx.state.last_sid = cx.state.last_sid.wrapping_add(1);
            if cx.state.last_sid != 0 {
                break;
            }
        }
        let mut w = amf_message_writer("_result", callback)?;
        w.write_number(f64::from(cx.state.last_sid));
        cx.reply(w.bytes());
        Ok(())
    }

    fn on_address_change(&mut self, cx: &mut HandlerCx<'_>) -> Result<(), DispatchError> {
        if self.addr_change_inform {
            let mut w = amf_message_writer("onIPChange", 0.0)?;
            w.write_string(&cx.state.raddr.to_string())?;
            cx.reply(w.bytes());
        }
        Ok(())
    }

    fn on_relay(
        &mut self,
        cx: &mut HandlerCx<'_>,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        let pid_hex = r
            .read_string()
            .map_err(|_| DispatchError::Message("relay: read pid"))?;
        let pid_bytes =
            hex::decode(&pid_hex).map_err(|_| DispatchError::Message("relay: decode pid"))?;
        let target: [u8; 32] = pid_bytes
            .try_into()
            .map_err(|_| DispatchError::Message("relay: bad pid length"))?;

        let mut w = amf_message_writer("onRelay", 0.0)?;
        w.write_string(&hex::encode(cx.sess.pid))?;
        w.raw_mut().write_bytes(r.rest());
        let chunks = super::flow_writer::split(w.bytes());

        let eng = std::sync::Arc::clone(cx.eng);
        cx.eng.fabric.call(u64::from(cx.sess.xid), move || {
            if let Some(s) = eng.sessions.find_by_pid(&target) {
                push_to_main_writer(&eng, &s, true, &chunks);
            }
        });
        Ok(())
    }

    fn on_default(
        &mut self,
        cx: &mut HandlerCx<'_>,
        name: &str,
        callback: f64,
    ) -> Result<(), DispatchError> {
        let mut w = amf_message_writer("_error", callback)?;
        let mut o = AmfObject::new();
        o.set_string("level", "error");
        o.set_string("code", "NetConnection.Call.Failed");
        o.set_string("description", format!("Method '{name}' not found"));
        w.write_object(&o)?;
        cx.reply(w.bytes());
        Ok(())
    }

    pub fn on_raw_message(
        &mut self,
        cx: &mut HandlerCx<'_>,
        _code: u8,
        r: &mut PacketReader<'_>,
    ) -> Result<(), DispatchError> {
        if cx.fw.closed {
            return Err(DispatchError::Message("conn raw message on closed flow"));
        }
        let flag = r.read_u16().map_err(|_| DispatchError::Message("raw: read flag"))?;
        if flag != 0x03 {
            return Err(DispatchError::Message("raw: unknown flag"));
        }
        let sid = r.read_u32().map_err(|_| DispatchError::Message("raw: read sid"))?;
        if sid != 0 {
            // set-buffer-time acknowledgement
            let mut w = PacketWriter::new();
            w.write_u8(0x04);
            w.write_u32(0);
            w.write_u16(0);
            w.write_u32(sid);
            cx.reply(w.bytes());
        }
        Ok(())
    }
}

/// Parse an underscore-separated session-id list and broadcast the
/// remaining message bytes to each target's main flow.
pub(crate) fn on_broadcast_by_xid(
    cx: &mut HandlerCx<'_>,
    r: &mut Amf0Reader<'_, '_>,
    reliable: bool,
) -> Result<(), DispatchError> {
    let s = r
        .read_string()
        .map_err(|_| DispatchError::Message("broadcast: read xids"))?;
    if s.is_empty() {
        return Ok(());
    }
    let mut xids = Vec::with_capacity(32);
    for part in s.split('_') {
        let xid: u32 = part
            .parse()
            .map_err(|_| DispatchError::Message("broadcast: parse xid"))?;
        xids.push(xid);
    }
    broadcast_by_xid(cx.eng, xids, r.rest(), cx.sess.xid, reliable);
    Ok(())
}
