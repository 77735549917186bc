//! The NetStream handler — play/publish on a stream flow.

use std::sync::Arc;

use rill_amf::AmfObject;
use rill_amf::amf0::Amf0Reader;
use rill_wire::{PacketReader, PacketWriter};
use tracing::debug;

use super::flow_writer::split;
use super::message::{DispatchError, Handler, HandlerCx, amf_data_writer, amf_message_writer};
use super::streams::{HandlerRef, Publication};
use super::{conn::on_broadcast_by_xid, flush_state};
use crate::engine::Engine;
use crate::rpc;

/// A handler's attachment to a publication, as player or publisher.
pub(crate) struct Engagement {
    pub publication: Arc<Publication>,
    pub callback: f64,
}

/// Handler state for one stream flow.
pub(crate) struct StreamHandler {
    pub play: Option<Engagement>,
    pub publish: Option<Engagement>,
    bound: u32,
    unstable: bool,
}

impl StreamHandler {
    pub fn new() -> Self {
        Self { play: None, publish: None, bound: 0, unstable: false }
    }

    pub fn deceptive_ack(&self) -> bool {
        self.unstable
    }

    fn handler_ref(cx: &HandlerCx<'_>) -> HandlerRef {
        HandlerRef { xid: cx.sess.xid, fid: cx.reader_fid }
    }

    pub fn on_amf_message(
        &mut self,
        cx: &mut HandlerCx<'_>,
        name: &str,
        callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        if cx.fw.closed {
            return Err(DispatchError::Message("stream message on closed flow"));
        }
        match name {
            "play" => self.on_play(cx, callback, r),
            "publish" => self.on_publish(cx, callback, r),
            "closeStream" => self.disengage(cx),
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
            _ => self.on_default(cx, name, r),
        }
    }

    pub fn on_close(&mut self, cx: &mut HandlerCx<'_>) {
        let _ = self.disengage(cx);
        if !cx.fw.closed {
            cx.fw.closed = true;
            cx.fw.end(&mut cx.state.rsplist);
            debug!(target: "session", xid = cx.sess.xid, fid = cx.fw.fid, "flow closed");
        }
    }

    /// Leave any publication this handler is attached to, notifying the
    /// peer and — for a publisher — every subscriber.
    fn disengage(&mut self, cx: &mut HandlerCx<'_>) -> Result<(), DispatchError> {
        if let Some(play) = self.play.take() {
            play.publication
                .remove(&cx.eng.streams, Self::handler_ref(cx));
            self.status(
                cx,
                play.callback,
                "NetStream.Play.Stop",
                format!("Stopped playing {}", play.publication.name),
            )?;
        }
        if let Some(publish) = self.publish.take() {
            self.unstable = false;
            let p = publish.publication;
            p.stop(&cx.eng.streams);
            if !p.rpc {
                let eng = Arc::clone(cx.eng);
                let p2 = Arc::clone(&p);
                cx.eng.fabric.call(p.gid, move || {
                    let (slaves, _) = p2.list();
                    for href in slaves {
                        notify_subscriber(&eng, &p2, href, "NetStream.Play.UnpublishNotify", |n| {
                            format!("{n} is now unpublished")
                        });
                    }
                });
            }
            self.status(
                cx,
                publish.callback,
                "NetStream.Unpublish.Success",
                format!("{} is now unpublished", p.name),
            )?;
        }
        Ok(())
    }

    fn on_play(
        &mut self,
        cx: &mut HandlerCx<'_>,
        callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        self.disengage(cx)?;
        let stream = r
            .read_string()
            .map_err(|_| DispatchError::Message("play: read stream"))?;
        let p = cx.eng.streams.get_or_create(&stream);
        if p.add(Self::handler_ref(cx)) {
            self.status(cx, callback, "NetStream.Play.Reset", format!("Playing and resetting {stream}"))?;
            self.status(cx, callback, "NetStream.Play.Start", format!("Started playing {stream}"))?;
            self.play = Some(Engagement { publication: p, callback });
            self.bound += 1;
            self.bound_notice(cx, self.bound);
        } else {
            self.status(cx, callback, "NetStream.Play.Failed", format!("Play closed stream {stream}"))?;
        }
        Ok(())
    }

    fn on_publish(
        &mut self,
        cx: &mut HandlerCx<'_>,
        callback: f64,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        self.disengage(cx)?;
        let stream = r
            .read_string()
            .map_err(|_| DispatchError::Message("publish: read stream"))?;
        let p = cx.eng.streams.get_or_create(&stream);
        if p.start(Self::handler_ref(cx)) {
            self.status(cx, callback, "NetStream.Publish.Start", format!("{stream} is now published"))?;
            self.unstable = !p.reliable;
            if !p.rpc {
                let eng = Arc::clone(cx.eng);
                let p2 = Arc::clone(&p);
                cx.eng.fabric.call(p.gid, move || {
                    let (slaves, _) = p2.list();
                    for href in slaves {
                        notify_subscriber(&eng, &p2, href, "NetStream.Play.PublishNotify", |n| {
                            format!("{n} is now published")
                        });
                    }
                });
            }
            self.publish = Some(Engagement { publication: p, callback });
        } else {
            self.status(cx, callback, "NetStream.Publish.BadName", format!("{stream} is already published"))?;
        }
        Ok(())
    }

    /// Any other command on a publisher's stream flow is AMF data fanned
    /// out to every subscriber.
    fn on_default(
        &mut self,
        cx: &mut HandlerCx<'_>,
        name: &str,
        r: &mut Amf0Reader<'_, '_>,
    ) -> Result<(), DispatchError> {
        let Some(publish) = &self.publish else {
            debug!(target: "session", xid = cx.sess.xid, "message on non-published stream");
            return Ok(());
        };
        let p = Arc::clone(&publish.publication);
        if p.rpc {
            debug!(target: "session", xid = cx.sess.xid, "unhandled call on rpc stream");
            return Ok(());
        }
        let mut w = amf_data_writer(name)?;
        w.raw_mut().write_bytes(r.rest());
        let chunks = split(w.bytes());
        let eng = Arc::clone(cx.eng);
        cx.eng.fabric.call(p.gid, move || {
            let (slaves, open) = p.list();
            if !open {
                return;
            }
            for href in slaves {
                deliver_to_subscriber(&eng, &p, href, &chunks, p.reliable);
            }
        });
        Ok(())
    }

    fn status(
        &self,
        cx: &mut HandlerCx<'_>,
        callback: f64,
        code: &str,
        description: String,
    ) -> Result<(), DispatchError> {
        let mut w = amf_message_writer("onStatus", callback)?;
        let mut o = AmfObject::new();
        o.set_string("level", "status");
        o.set_string("code", code);
        o.set_string("description", description);
        w.write_object(&o)?;
        cx.reply(w.bytes());
        Ok(())
    }

    /// The raw "bound" notice after a successful play.
    fn bound_notice(&self, cx: &mut HandlerCx<'_>, bound: u32) {
        let mut w = PacketWriter::new();
        w.write_u8(0x04);
        w.write_u32(0);
        w.write_u16(0x22);
        w.write_u32(bound);
        w.write_u32(1);
        cx.reply(w.bytes());
    }

    pub fn on_raw_message(
        &mut self,
        cx: &mut HandlerCx<'_>,
        _code: u8,
        r: &mut PacketReader<'_>,
    ) -> Result<(), DispatchError> {
        if cx.fw.closed {
            return Err(DispatchError::Message("stream raw message on closed flow"));
        }
        let flag = r.read_u16().map_err(|_| DispatchError::Message("raw: read flag"))?;
        if flag != 0x22 {
            return Err(DispatchError::Message("raw: unknown flag"));
        }
        Ok(())
    }
}

// ─── Subscriber-side delivery (runs on a work queue) ─────────────────────────

/// True if the reader's handler is still playing `p`; returns the writer
/// fid and the play callback when so.
fn playing_state(
    state: &super::SessionState,
    p: &Arc<Publication>,
    href: HandlerRef,
) -> Option<(u64, f64)> {
    let fr = state.readers.get(&href.fid)?;
    let Handler::Stream(h) = &fr.handler else { return None };
    let play = h.play.as_ref()?;
    if !Arc::ptr_eq(&play.publication, p) {
        return None;
    }
    Some((fr.writer_fid, play.callback))
}

/// Fan one published data message out to a subscriber: append the
/// chunks to its main connection flow writer, if it is still playing.
pub(crate) fn deliver_to_subscriber(
    eng: &Arc<Engine>,
    p: &Arc<Publication>,
    href: HandlerRef,
    chunks: &[Vec<u8>],
    reliable: bool,
) {
    let Some(s) = eng.sessions.find_by_xid(href.xid) else { return };
    let mut state = s.lock_state();
    if state.closed {
        return;
    }
    if playing_state(&state, p, href).is_none() {
        return;
    }
    let wfid = state.main_writer;
    if let Some(mut fw) = state.writers.remove(&wfid) {
        fw.add_fragments(&mut state.rsplist, reliable, chunks);
        state.writers.insert(wfid, fw);
    }
    flush_state(eng, &s, &mut state);
}

/// Send a per-subscriber `onStatus` notice built with that subscriber's
/// own play callback.
pub(crate) fn notify_subscriber(
    eng: &Arc<Engine>,
    p: &Arc<Publication>,
    href: HandlerRef,
    code: &str,
    description: impl Fn(&str) -> String,
) {
    let Some(s) = eng.sessions.find_by_xid(href.xid) else { return };
    let mut state = s.lock_state();
    if state.closed {
        return;
    }
    let Some((wfid, callback)) = playing_state(&state, p, href) else { return };

    let Ok(mut w) = amf_message_writer("onStatus", callback) else { return };
    let mut o = AmfObject::new();
    o.set_string("level", "status");
    o.set_string("code", code);
    o.set_string("description", description(&p.name));
    if w.write_object(&o).is_err() {
        return;
    }
    let chunks = split(w.bytes());

    if let Some(mut fw) = state.writers.remove(&wfid) {
        fw.add_fragments(&mut state.rsplist, true, &chunks);
        state.writers.insert(wfid, fw);
    }
    flush_state(eng, &s, &mut state);
}
