//! Reliable-transmission side of a flow.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use super::flow_ack::FlowAck;
use super::fragment::{FLAG_ABANDONED, FLAG_END, FLAG_WITH_AFTER, FLAG_WITH_BEFORE, Fragment};
use super::response::{FlowResponse, Response};

/// A fragment sent within this window is not retransmitted again.
const RESEND_GUARD: Duration = Duration::from_millis(100);

/// Application messages are fragmented to this size before hand-off.
pub(crate) const FRAGMENT_SIZE: usize = 256;

/// The sending half of a flow: retransmission queue, stage allocator,
/// back-off state. Paired with the [`super::flow_reader::FlowReader`]
/// whose id it advertises in its first fragment's header.
pub(crate) struct FlowWriter {
    pub fid: u64,
    pub signature: Vec<u8>,
    pub closed: bool,
    pub stage: u64,
    pub reader_fid: u64,
    backoff_idx: usize,
    backoff_last: Option<Instant>,
    frags: VecDeque<Fragment>,
}

impl FlowWriter {
    pub fn new(fid: u64, signature: Vec<u8>, reader_fid: u64) -> Self {
        Self {
            fid,
            signature,
            closed: false,
            stage: 0,
            reader_fid,
            backoff_idx: 0,
            backoff_last: None,
            frags: VecDeque::new(),
        }
    }

    fn flow_response(&self, f: &Fragment, stageack: u64) -> Response {
        Response::Flow(FlowResponse::new(
            self.fid,
            &self.signature,
            self.reader_fid,
            f,
            stageack,
        ))
    }

    /// Append pre-fragmented chunks as one message. Reliable fragments
    /// are retained for retransmission; unreliable ones are fire-and-forget.
    pub fn add_fragments(
        &mut self,
        rsp: &mut VecDeque<Response>,
        reliable: bool,
        chunks: &[Vec<u8>],
    ) {
        if chunks.is_empty() {
            return;
        }
        let stageack = match self.frags.front() {
            Some(f) => f.stage - 1,
            None => self.stage,
        };
        let cnt = chunks.len();
        let now = Instant::now();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut flags = 0u8;
            if i != 0 {
                flags |= FLAG_WITH_BEFORE;
            }
            if i != cnt - 1 {
                flags |= FLAG_WITH_AFTER;
            }
            self.stage += 1;
            let f = Fragment {
                stage: self.stage,
                flags,
                data: chunk.clone(),
                sendtime: Some(now),
            };
            rsp.push_back(self.flow_response(&f, stageack));
            if reliable {
                self.frags.push_back(f);
            }
        }
    }

    /// Terminate the flow: a synthetic `abandoned|end` fragment at the
    /// next stage, never retained.
    pub fn end(&mut self, rsp: &mut VecDeque<Response>) {
        self.frags.clear();
        self.stage += 1;
        let f = Fragment {
            stage: self.stage,
            flags: FLAG_ABANDONED | FLAG_END,
            data: Vec::new(),
            sendtime: Some(Instant::now()),
        };
        rsp.push_back(self.flow_response(&f, f.stage - 1));
    }

    /// Process a peer ACK: drop acknowledged fragments, retransmit the
    /// stale ones the ranges skip over, reset the back-off.
    pub fn commit_ack(&mut self, rsp: &mut VecDeque<Response>, ack: &FlowAck) {
        while let Some(f) = self.frags.front() {
            if f.stage <= ack.stage {
                self.frags.pop_front();
            } else {
                break;
            }
        }
        let now = Instant::now();
        self.backoff_idx = 0;
        self.backoff_last = Some(now);

        let Some(front) = self.frags.front() else { return };
        let stageack = front.stage - 1;
        let mut i = 0usize;
        for &(beg, end) in &ack.ranges {
            while i < self.frags.len() {
                let fstage = self.frags[i].stage;
                if fstage < beg {
                    self.retransmit_if_stale(rsp, i, stageack, now);
                    i += 1;
                } else if fstage <= end {
                    self.frags.remove(i);
                } else {
                    break;
                }
            }
        }
        while i < self.frags.len() {
            self.retransmit_if_stale(rsp, i, stageack, now);
            i += 1;
        }
    }

    fn retransmit_if_stale(
        &mut self,
        rsp: &mut VecDeque<Response>,
        i: usize,
        stageack: u64,
        now: Instant,
    ) {
        let stale = self.frags[i]
            .sendtime
            .is_none_or(|t| now.duration_since(t) >= RESEND_GUARD);
        if stale {
            self.frags[i].sendtime = Some(now);
            let out = self.flow_response(&self.frags[i], stageack);
            rsp.push_back(out);
        }
    }

    /// Periodic retransmission tick. Returns true when the queue is
    /// empty (the flow is idle and removable once closed).
    pub fn manage(&mut self, rsp: &mut VecDeque<Response>, retrans_ms: &[u64]) -> bool {
        if self.frags.is_empty() {
            return true;
        }
        let now = Instant::now();
        let due = self
            .backoff_last
            .is_none_or(|t| now.duration_since(t) > Duration::from_millis(retrans_ms[self.backoff_idx]));
        if due {
            if self.backoff_idx < retrans_ms.len() - 1 {
                self.backoff_idx += 1;
            }
            self.backoff_last = Some(now);
            let idx = self.frags.len() - 1;
            let newest_stale = self.frags[idx]
                .sendtime
                .is_none_or(|t| now.duration_since(t) >= RESEND_GUARD);
            if newest_stale {
                let stageack = self.frags[0].stage - 1;
                self.frags[idx].sendtime = Some(now);
                let out = self.flow_response(&self.frags[idx], stageack);
                rsp.push_back(out);
                debug!(target: "flows", fid = self.fid, stage = self.frags[idx].stage, "retransmit");
            }
        }
        false
    }

    /// Outstanding (unacknowledged) fragment count.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.frags.len()
    }
}

/// Split a message into ≤256-byte chunks for flow hand-off.
pub(crate) fn split(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(FRAGMENT_SIZE).map(<[u8]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> FlowWriter {
        FlowWriter::new(2, b"\x00TC\x04\x00".to_vec(), 3)
    }

    #[test]
    fn split_chunks_at_256() {
        assert!(split(&[]).is_empty());
        assert_eq!(split(&[0u8; 256]).len(), 1);
        let chunks = split(&[0u8; 600]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 256);
        assert_eq!(chunks[2].len(), 88);
    }

    #[test]
    fn fragment_flags_mark_message_boundaries() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        fw.add_fragments(&mut rsp, true, &split(&[1u8; 600]));
        assert_eq!(fw.stage, 3);
        assert_eq!(fw.pending(), 3);
        // first !with_before, middle both, last !with_after
        let flags: Vec<u8> = (1..=3)
            .map(|st| {
                let f = fw.frags.iter().find(|f| f.stage == st).unwrap();
                f.flags
            })
            .collect();
        assert_eq!(flags, vec![FLAG_WITH_AFTER, FLAG_WITH_BEFORE | FLAG_WITH_AFTER, FLAG_WITH_BEFORE]);
        assert_eq!(rsp.len(), 3);
    }

    #[test]
    fn unreliable_fragments_are_not_retained() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        fw.add_fragments(&mut rsp, false, &split(&[1u8; 300]));
        assert_eq!(fw.pending(), 0);
        assert_eq!(rsp.len(), 2);
    }

    #[test]
    fn cumulative_ack_drains_the_queue() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        fw.add_fragments(&mut rsp, true, &split(&[1u8; 600]));
        rsp.clear();
        fw.commit_ack(&mut rsp, &FlowAck::new(3));
        assert_eq!(fw.pending(), 0);
        assert!(rsp.is_empty());
    }

    #[test]
    fn selective_ack_removes_ranged_fragments() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        for _ in 0..5 {
            fw.add_fragments(&mut rsp, true, &split(&[1u8; 10]));
        }
        rsp.clear();
        // Stages 1..=5 outstanding; ack nothing cumulatively, ranges ack 3..=4.
        let mut ack = FlowAck::new(0);
        ack.add_range(3, 4);
        fw.commit_ack(&mut rsp, &ack);
        let left: Vec<u64> = fw.frags.iter().map(|f| f.stage).collect();
        assert_eq!(left, vec![1, 2, 5]);
        // Freshly sent fragments are inside the resend guard, so no
        // immediate retransmissions.
        assert!(rsp.is_empty());
    }

    #[test]
    fn manage_respects_the_backoff_schedule() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        fw.add_fragments(&mut rsp, true, &split(&[1u8; 10]));
        rsp.clear();

        // Pretend the fragment was sent long ago and no ack arrived.
        fw.frags[0].sendtime = None;
        fw.backoff_last = None;
        assert!(!fw.manage(&mut rsp, &[500, 1000]));
        assert_eq!(rsp.len(), 1, "stale fragment must be retransmitted");
        assert_eq!(fw.backoff_idx, 1);

        // Immediately after, the schedule gate holds it back.
        rsp.clear();
        fw.frags[0].sendtime = None;
        assert!(!fw.manage(&mut rsp, &[500, 1000]));
        assert!(rsp.is_empty(), "retransmission before the interval elapses");
        // The index never walks past the schedule end.
        assert_eq!(fw.backoff_idx, 1);
    }

    #[test]
    fn manage_reports_idle_when_empty() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        assert!(fw.manage(&mut rsp, &[500]));
    }

    #[test]
    fn end_emits_abandoned_end_at_next_stage() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        fw.add_fragments(&mut rsp, true, &split(&[1u8; 10]));
        rsp.clear();
        fw.end(&mut rsp);
        assert_eq!(fw.stage, 2);
        assert_eq!(fw.pending(), 0);
        assert_eq!(rsp.len(), 1);
    }

    #[test]
    fn ack_resets_backoff() {
        let mut fw = writer();
        let mut rsp = VecDeque::new();
        fw.add_fragments(&mut rsp, true, &split(&[1u8; 10]));
        fw.backoff_idx = 5;
        fw.commit_ack(&mut rsp, &FlowAck::new(1));
        assert_eq!(fw.backoff_idx, 0);
        assert!(fw.backoff_last.is_some());
    }
}
