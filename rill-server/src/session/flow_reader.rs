//! Receiving side of a flow: reassembly, ordering, ACK emission.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::flow_ack::FlowAck;
use super::fragment::Fragment;
use super::message::{Handler, HandlerCx, handle_message};
use super::response::{FlowAckResponse, Response};
use super::{Session, SessionState};
use crate::engine::Engine;

/// The receiving half of a flow.
///
/// Buffers out-of-order fragments in ascending stage order, advances the
/// cumulative `stage` as the head becomes contiguous, coalesces
/// fragments into messages, and recovers from skipped stages when the
/// sender's `stageack` jumps ahead.
pub(crate) struct FlowReader {
    pub fid: u64,
    pub signature: Vec<u8>,
    pub writer_fid: u64,
    pub handler: Handler,
    /// Highest consecutively delivered stage.
    pub stage: u64,
    frags: VecDeque<Fragment>,
    ready: Vec<Fragment>,
}

impl FlowReader {
    pub fn new(fid: u64, signature: Vec<u8>, writer_fid: u64, handler: Handler) -> Self {
        Self {
            fid,
            signature,
            writer_fid,
            handler,
            stage: 0,
            frags: VecDeque::new(),
            ready: Vec::new(),
        }
    }

    /// Emit a flow ACK reflecting the current cumulative stage and the
    /// contiguous ranges still buffered out of order.
    pub fn commit_ack(&self, state: &mut SessionState) {
        let mut ack = FlowAck::new(self.stage);
        if let Some(first) = self.frags.front() {
            let (mut beg, mut end) = (first.stage, first.stage);
            for f in self.frags.iter().skip(1) {
                if f.stage == end + 1 {
                    end += 1;
                } else {
                    ack.add_range(beg, end);
                    beg = f.stage;
                    end = f.stage;
                }
            }
            ack.add_range(beg, end);
        }
        let cnt = match self.frags.len() {
            0 => 0x7f,
            n if n < 0x3f00 => 0x3f00 - n as u64,
            _ => 0,
        };
        state.send(Response::FlowAck(FlowAckResponse { fid: self.fid, cnt, ack }));
    }

    /// Ingest the fragments of one `0x10` record.
    pub fn add_fragments(
        &mut self,
        eng: &Arc<Engine>,
        sess: &Arc<Session>,
        state: &mut SessionState,
        mut stageack: u64,
        frags: Vec<Fragment>,
    ) {
        if self.handler.deceptive_ack() {
            // Jump the cumulative ack over dropped unreliable fragments:
            // any whole-message fragment ahead of the ack raises it.
            for f in &frags {
                if f.with_before() || f.with_after() {
                    continue;
                }
                if stageack + 1 < f.stage {
                    stageack = f.stage - 1;
                    debug!(target: "flows", fid = self.fid, stageack, "deceptive ack advance");
                }
            }
        }

        let mut nothing = true;
        if self.stage < stageack {
            // The sender no longer cares about stages ≤ stageack; apply
            // what we have buffered below the ack, then skip forward.
            while self.frags.front().is_some_and(|f| f.stage <= stageack) {
                let f = self.frags.pop_front().expect("nonempty front");
                if self.accept(eng, sess, state, f) {
                    return;
                }
            }
            if self.stage < stageack {
                self.stage = stageack;
                self.deliver(eng, sess, state);
                warn!(target: "flows", fid = self.fid, stage = self.stage, "skip to stage");
            }
            nothing = false;
        }

        // Insert in ascending stage order, dropping duplicates.
        let mut lower = self.stage;
        let mut idx = 0usize;
        for f in frags {
            let stage = f.stage;
            if stage <= lower {
                debug!(target: "flows", fid = self.fid, stage, "stage already received");
                continue;
            }
            loop {
                if idx == self.frags.len() {
                    self.frags.push_back(f);
                    nothing = false;
                    idx = self.frags.len();
                    break;
                }
                let next_stage = self.frags[idx].stage;
                if stage < next_stage {
                    self.frags.insert(idx, f);
                    nothing = false;
                    idx += 1;
                    break;
                } else if next_stage == stage {
                    idx += 1;
                    debug!(target: "flows", fid = self.fid, stage, "stage already received");
                    break;
                }
                idx += 1;
            }
            lower = stage;
        }
        if nothing {
            return;
        }

        // Drain the now-contiguous head.
        while self.frags.front().is_some_and(|f| f.stage == self.stage + 1) {
            let f = self.frags.pop_front().expect("nonempty front");
            if self.accept(eng, sess, state, f) {
                return;
            }
        }

        let buffered = self.frags.len() + self.ready.len();
        if buffered > 128 {
            warn!(target: "flows", fid = self.fid, buffered, "too many buffered stages");
        }
    }

    /// Apply one in-order fragment. Returns true when the flow ended.
    fn accept(
        &mut self,
        eng: &Arc<Engine>,
        sess: &Arc<Session>,
        state: &mut SessionState,
        f: Fragment,
    ) -> bool {
        let next = self.stage + 1;
        if next > f.stage {
            warn!(target: "flows", fid = self.fid, stage = f.stage, "accept below current stage");
            return false;
        }
        self.stage = f.stage;
        if next != f.stage {
            self.deliver(eng, sess, state);
            warn!(target: "flows", fid = self.fid, "skipped stage in accept");
        }
        let (abandoned, with_before, with_after, end) =
            (f.abandoned(), f.with_before(), f.with_after(), f.end());
        if abandoned {
            self.deliver(eng, sess, state);
            debug!(target: "flows", fid = self.fid, stage = self.stage, "abandoned fragment");
        } else {
            if !with_before {
                self.deliver(eng, sess, state);
            }
            self.ready.push(f);
            if !with_after {
                self.deliver(eng, sess, state);
            }
        }
        if end {
            self.deliver(eng, sess, state);
            self.on_close(eng, sess, state);
            return true;
        }
        false
    }

    /// Merge and dispatch the ready buffer, if it holds a whole message.
    fn deliver(&mut self, eng: &Arc<Engine>, sess: &Arc<Session>, state: &mut SessionState) {
        if self.ready.is_empty() {
            return;
        }
        let data = self.merge();
        self.ready.clear();
        if data.is_empty() {
            return;
        }
        let Some(mut fw) = state.writers.remove(&self.writer_fid) else {
            return;
        };
        {
            let mut cx = HandlerCx {
                eng,
                sess,
                state,
                fw: &mut fw,
                reader_fid: self.fid,
            };
            if let Err(e) = handle_message(&mut cx, &mut self.handler, &data) {
                debug!(target: "flows", fid = self.fid, error = %e, "deliver failed");
            }
        }
        let fid = fw.fid;
        state.writers.insert(fid, fw);
    }

    fn merge(&self) -> Vec<u8> {
        let first = self.ready.first().expect("nonempty ready");
        let last = self.ready.last().expect("nonempty ready");
        if first.with_before() || last.with_after() {
            warn!(target: "flows", fid = self.fid, "merge fragments failed");
            return Vec::new();
        }
        if self.ready.len() == 1 {
            return first.data.clone();
        }
        let size = self.ready.iter().map(|f| f.data.len()).sum();
        let mut out = Vec::with_capacity(size);
        for f in &self.ready {
            out.extend_from_slice(&f.data);
        }
        out
    }

    /// Notify the handler that the peer ended or errored this flow.
    pub fn on_close(&mut self, eng: &Arc<Engine>, sess: &Arc<Session>, state: &mut SessionState) {
        let Some(mut fw) = state.writers.remove(&self.writer_fid) else {
            return;
        };
        {
            let mut cx = HandlerCx {
                eng,
                sess,
                state,
                fw: &mut fw,
                reader_fid: self.fid,
            };
            self.handler.on_close(&mut cx);
        }
        let fid = fw.fid;
        state.writers.insert(fid, fw);
    }
}
