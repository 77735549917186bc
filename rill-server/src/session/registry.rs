//! The sharded session registry and the manage loops.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rill_crypto::{CryptoError, PacketCipher};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use super::{Session, SessionState};
use crate::engine::Engine;
use crate::util::hash16_bytes;

const BUCKETS: usize = 256;
const MANAGE_SHARDS: usize = 32;

/// Session-creation failures during Assign.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The 32-bit id space wrapped without finding a free id.
    #[error("too many sessions")]
    TooManySessions,
    /// The derived AES keys were unusable.
    #[error(transparent)]
    BadKey(#[from] CryptoError),
}

#[derive(Default)]
struct Bucket {
    by_xid: HashMap<u32, Arc<Session>>,
    by_pid: HashMap<[u8; 32], Arc<Session>>,
}

/// Sessions indexed by server-assigned id and by peer id, sharded over
/// 256 buckets; 32 manage shards each tick a disjoint set of sessions.
pub struct SessionRegistry {
    buckets: Vec<RwLock<Bucket>>,
    last_xid: Mutex<u32>,
    fresh: Vec<Mutex<Vec<Arc<Session>>>>,
}

fn xid_bucket(xid: u32) -> usize {
    xid as usize % BUCKETS
}

fn pid_bucket(pid: &[u8; 32]) -> usize {
    usize::from(hash16_bytes(pid)) % BUCKETS
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| RwLock::new(Bucket::default())).collect(),
            last_xid: Mutex::new(0),
            fresh: (0..MANAGE_SHARDS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Create and register a session with a fresh nonzero id.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        yid: u32,
        pid: [u8; 32],
        cookie: Vec<u8>,
        encrypt: &[u8],
        decrypt: &[u8],
        lport: u16,
        raddr: SocketAddrV4,
    ) -> Result<Arc<Session>, CreateError> {
        let cipher = PacketCipher::new(encrypt, decrypt)?;

        let mut last = self.last_xid.lock().expect("registry poisoned");
        let wrap_at = if *last == 0 { u32::MAX } else { *last };
        let mut xid = *last;
        loop {
            xid = xid.wrapping_add(1);
            if xid == 0 {
                continue;
            }
            if xid == wrap_at && self.find_by_xid(xid).is_some() {
                return Err(CreateError::TooManySessions);
            }
            if self.find_by_xid(xid).is_none() {
                break;
            }
        }
        *last = xid;

        let s = Arc::new(Session {
            xid,
            pid,
            cipher,
            state: Mutex::new(SessionState::new(yid, cookie, lport, raddr)),
        });

        self.buckets[xid_bucket(xid)]
            .write()
            .expect("registry poisoned")
            .by_xid
            .insert(xid, Arc::clone(&s));
        self.buckets[pid_bucket(&pid)]
            .write()
            .expect("registry poisoned")
            .by_pid
            .insert(pid, Arc::clone(&s));

        let shard = xid as usize % MANAGE_SHARDS;
        self.fresh[shard]
            .lock()
            .expect("registry poisoned")
            .push(Arc::clone(&s));
        Ok(s)
    }

    pub fn find_by_xid(&self, xid: u32) -> Option<Arc<Session>> {
        self.buckets[xid_bucket(xid)]
            .read()
            .expect("registry poisoned")
            .by_xid
            .get(&xid)
            .cloned()
    }

    pub fn find_by_pid(&self, pid: &[u8; 32]) -> Option<Arc<Session>> {
        self.buckets[pid_bucket(pid)]
            .read()
            .expect("registry poisoned")
            .by_pid
            .get(pid)
            .cloned()
    }

    fn remove(&self, xid: u32, pid: &[u8; 32]) {
        self.buckets[xid_bucket(xid)]
            .write()
            .expect("registry poisoned")
            .by_xid
            .remove(&xid);
        self.buckets[pid_bucket(pid)]
            .write()
            .expect("registry poisoned")
            .by_pid
            .remove(pid);
    }

    /// Spawn the 32 manage-shard tasks. Each owns its alive list; new
    /// sessions arrive through the shard's fresh list.
    pub fn start_manage(eng: &Arc<Engine>) {
        for shard in 0..MANAGE_SHARDS {
            let eng = Arc::clone(eng);
            tokio::spawn(async move {
                let interval = Duration::from_millis(eng.cfg.manage_ms);
                let mut alive: Vec<Arc<Session>> = Vec::new();
                loop {
                    {
                        let mut fresh =
                            eng.sessions.fresh[shard].lock().expect("registry poisoned");
                        alive.append(&mut fresh);
                    }
                    let mut cleaned = 0i64;
                    alive.retain(|s| {
                        if super::manage(&eng, s) {
                            eng.sessions.remove(s.xid, &s.pid);
                            cleaned += 1;
                            info!(
                                target: "session",
                                xid = s.xid,
                                pid = %hex::encode(s.pid),
                                "exit"
                            );
                            false
                        } else {
                            true
                        }
                    });
                    if cleaned != 0 {
                        eng.counts.count("session.cleanup", cleaned);
                    }
                    tokio::time::sleep(interval).await;
                }
            });
        }
    }

    // ── Snapshots for the status endpoint ────────────────────────────

    /// Registry totals plus keepalive-counter histogram.
    pub fn summary(&self) -> serde_json::Value {
        let (mut xids, mut pids) = (0usize, 0usize);
        let mut closed = 0usize;
        let mut manage = vec![0usize; super::MAX_KEEPALIVE as usize + 1];
        for bucket in &self.buckets {
            let bucket = bucket.read().expect("registry poisoned");
            xids += bucket.by_xid.len();
            pids += bucket.by_pid.len();
            for s in bucket.by_xid.values() {
                let state = s.lock_state();
                if state.closed {
                    closed += 1;
                } else if (state.keepalive_cnt as usize) < manage.len() {
                    manage[state.keepalive_cnt as usize] += 1;
                }
            }
        }
        json!({
            "xids": xids,
            "pids": pids,
            "z": { "closed": closed, "manage": manage },
        })
    }

    /// Per-bucket map sizes.
    pub fn map_size(&self) -> serde_json::Value {
        let mut xids = Vec::with_capacity(BUCKETS);
        let mut pids = Vec::with_capacity(BUCKETS);
        for bucket in &self.buckets {
            let bucket = bucket.read().expect("registry poisoned");
            xids.push(bucket.by_xid.len());
            pids.push(bucket.by_pid.len());
        }
        json!({ "xids": xids, "pids": pids })
    }

    /// Full session detail dump.
    pub fn dump_all(&self) -> serde_json::Value {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().expect("registry poisoned");
            for s in bucket.by_xid.values() {
                let state = s.lock_state();
                let addrs: Vec<String> =
                    state.addrs.iter().map(SocketAddrV4::to_string).collect();
                all.push(json!({
                    "xid": s.xid,
                    "yid": state.yid,
                    "pid": hex::encode(s.pid),
                    "raddr": state.raddr.to_string(),
                    "addrs": addrs,
                    "closed": state.closed,
                    "manage": {
                        "cnt": state.keepalive_cnt,
                        "idle_ms": state.last_activity.elapsed().as_millis() as u64,
                    },
                }));
            }
        }
        serde_json::Value::Array(all)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
