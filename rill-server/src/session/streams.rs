//! The publication router: stream name → one publisher + subscriber set.
//!
//! Non-RPC publications live in a sharded name map and disappear when
//! the last participant leaves. The reserved names `recvPull` and
//! `recvPull2` create transient, anonymous publications used to deliver
//! messages pushed in from the RPC bridge (`recvPull2` is unreliable).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::util::{hash16_bytes, unix_ns};

const BUCKETS: usize = 256;

/// A subscriber or publisher identity: the session plus the flow reader
/// whose handler holds the stream state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HandlerRef {
    pub xid: u32,
    pub fid: u64,
}

struct PubState {
    closed: bool,
    master: Option<HandlerRef>,
    slaves: Vec<HandlerRef>,
}

/// One named stream route.
pub(crate) struct Publication {
    pub name: String,
    /// Routes all fan-out work for this publication to one work queue.
    pub gid: u64,
    /// True for the reserved bridge-delivery names; never registered.
    pub rpc: bool,
    /// Subscribers of an unreliable publication use deceptive ACKs.
    pub reliable: bool,
    bid: u16,
    state: Mutex<PubState>,
}

impl Publication {
    /// Claim the publisher slot. Fails if closed or already published.
    pub fn start(&self, master: HandlerRef) -> bool {
        let mut st = self.state.lock().expect("publication poisoned");
        if st.closed || st.master.is_some() {
            return false;
        }
        st.master = Some(master);
        true
    }

    /// Close the publication; a non-RPC one is also unregistered.
    pub fn stop(&self, registry: &PublicationRegistry) {
        let unregister = {
            let mut st = self.state.lock().expect("publication poisoned");
            if st.closed {
                false
            } else {
                st.closed = true;
                !self.rpc
            }
        };
        if unregister {
            registry.unregister(self);
        }
    }

    /// Snapshot the subscriber list, most recent first, plus openness.
    pub fn list(&self) -> (Vec<HandlerRef>, bool) {
        let st = self.state.lock().expect("publication poisoned");
        (st.slaves.clone(), !st.closed)
    }

    /// Add a subscriber (deduplicated, newest first). Fails if closed.
    pub fn add(&self, h: HandlerRef) -> bool {
        let mut st = self.state.lock().expect("publication poisoned");
        if st.closed {
            return false;
        }
        if !self.rpc {
            let mut slaves = Vec::with_capacity(st.slaves.len() + 1);
            slaves.push(h);
            slaves.extend(st.slaves.iter().copied().filter(|o| *o != h));
            st.slaves = slaves;
        }
        true
    }

    /// Remove a subscriber; the publication closes and unregisters once
    /// both publisher and subscribers are gone.
    pub fn remove(&self, registry: &PublicationRegistry, h: HandlerRef) {
        let unregister = {
            let mut st = self.state.lock().expect("publication poisoned");
            if st.closed || self.rpc {
                false
            } else {
                st.slaves.retain(|o| *o != h);
                if st.master.is_none() && st.slaves.is_empty() {
                    st.closed = true;
                    true
                } else {
                    false
                }
            }
        };
        if unregister {
            registry.unregister(self);
        }
    }

    #[cfg(test)]
    pub fn master(&self) -> Option<HandlerRef> {
        self.state.lock().expect("publication poisoned").master
    }
}

/// The sharded name → publication map.
pub(crate) struct PublicationRegistry {
    buckets: Vec<Mutex<HashMap<String, Arc<Publication>>>>,
}

impl PublicationRegistry {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Look up or create the publication for `name`. Reserved RPC names
    /// always get a fresh anonymous publication.
    pub fn get_or_create(&self, name: &str) -> Arc<Publication> {
        if name == "recvPull" || name == "recvPull2" {
            return Arc::new(Publication {
                name: name.to_owned(),
                gid: unix_ns(),
                rpc: true,
                reliable: name != "recvPull2",
                bid: 0,
                state: Mutex::new(PubState {
                    closed: false,
                    master: None,
                    slaves: Vec::new(),
                }),
            });
        }

        let bid = hash16_bytes(name.as_bytes()) % BUCKETS as u16;
        let mut bucket = self.buckets[bid as usize].lock().expect("streams poisoned");
        Arc::clone(bucket.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(Publication {
                name: name.to_owned(),
                gid: unix_ns(),
                rpc: false,
                reliable: true,
                bid,
                state: Mutex::new(PubState {
                    closed: false,
                    master: None,
                    slaves: Vec::new(),
                }),
            })
        }))
    }

    fn unregister(&self, p: &Publication) {
        let mut bucket = self.buckets[p.bid as usize].lock().expect("streams poisoned");
        bucket.remove(&p.name);
    }

    /// Registered publication count.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("streams poisoned").len())
            .sum()
    }

    /// JSON snapshot of every registered publication.
    pub fn dump(&self) -> serde_json::Value {
        let mut all = serde_json::Map::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().expect("streams poisoned");
            for (name, p) in bucket.iter() {
                let st = p.state.lock().expect("publication poisoned");
                let slaves: Vec<u32> = st.slaves.iter().map(|h| h.xid).collect();
                all.insert(
                    name.clone(),
                    json!({
                        "master": st.master.map_or(0, |h| h.xid),
                        "slaves": slaves,
                        "closed": st.closed,
                    }),
                );
            }
        }
        serde_json::Value::Object(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(xid: u32) -> HandlerRef {
        HandlerRef { xid, fid: u64::from(xid) * 10 }
    }

    #[test]
    fn named_publications_are_shared() {
        let reg = PublicationRegistry::new();
        let a = reg.get_or_create("live");
        let b = reg.get_or_create("live");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn rpc_publications_are_anonymous() {
        let reg = PublicationRegistry::new();
        let a = reg.get_or_create("recvPull");
        let b = reg.get_or_create("recvPull");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(a.rpc && a.reliable);
        let c = reg.get_or_create("recvPull2");
        assert!(c.rpc && !c.reliable);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn only_one_publisher() {
        let reg = PublicationRegistry::new();
        let p = reg.get_or_create("live");
        assert!(p.start(h(1)));
        assert!(!p.start(h(2)));
        assert_eq!(p.master(), Some(h(1)));
    }

    #[test]
    fn subscribers_dedupe_newest_first() {
        let reg = PublicationRegistry::new();
        let p = reg.get_or_create("live");
        assert!(p.add(h(1)));
        assert!(p.add(h(2)));
        assert!(p.add(h(1)));
        let (slaves, open) = p.list();
        assert!(open);
        assert_eq!(slaves, vec![h(1), h(2)]);
    }

    #[test]
    fn empty_publication_unregisters() {
        let reg = PublicationRegistry::new();
        let p = reg.get_or_create("live");
        p.add(h(1));
        assert_eq!(reg.len(), 1);
        p.remove(&reg, h(1));
        assert_eq!(reg.len(), 0);
        let (_, open) = p.list();
        assert!(!open);
        // A new publication under the same name is a fresh object.
        let p2 = reg.get_or_create("live");
        assert!(!Arc::ptr_eq(&p, &p2));
    }

    #[test]
    fn stop_closes_and_unregisters() {
        let reg = PublicationRegistry::new();
        let p = reg.get_or_create("live");
        p.start(h(1));
        p.add(h(2));
        p.stop(&reg);
        assert_eq!(reg.len(), 0);
        assert!(!p.add(h(3)));
        assert!(!p.start(h(4)));
    }
}
