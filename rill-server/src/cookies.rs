//! Short-lived handshake cookies.
//!
//! A cookie binds a half-finished handshake to the session it creates:
//! issued on Hello, bound to a session id during Assign, committed
//! (deleted) on the first authenticated session packet, or expired
//! after five minutes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::counts::Counts;
use crate::util::unix_ns;

/// Cookie value length on the wire.
pub const COOKIE_SIZE: usize = 0x40;

const EXPIRY: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// One issued cookie.
pub struct Cookie {
    /// Session id bound during Assign; 0 until then.
    pub xid: u32,
    /// Peer id bound during Assign.
    pub pid: [u8; 32],
    /// Responder blob bound during Assign (replayed on retransmit).
    pub responder: Vec<u8>,
    value: Vec<u8>,
    alloctime: Instant,
}

impl Cookie {
    /// The 64-byte cookie value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// The cookie store: one lock, small critical sections.
pub struct CookieStore {
    values: Mutex<HashMap<Vec<u8>, Arc<Mutex<Cookie>>>>,
}

impl CookieStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { values: Mutex::new(HashMap::new()) }
    }

    /// Number of outstanding cookies.
    pub fn len(&self) -> usize {
        self.values.lock().expect("cookie store poisoned").len()
    }

    /// True if no cookies are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a fresh cookie: 8 bytes of allocation time plus 56
    /// random bytes. Gives up after four collisions.
    pub fn alloc(&self, counts: &Counts) -> Option<Arc<Mutex<Cookie>>> {
        let mut values = self.values.lock().expect("cookie store poisoned");
        let mut buf = vec![0u8; COOKIE_SIZE];
        buf[..8].copy_from_slice(&unix_ns().to_le_bytes());
        for _ in 0..4 {
            getrandom::getrandom(&mut buf[8..]).expect("getrandom failed");
            if values.contains_key(&buf) {
                continue;
            }
            let cookie = Arc::new(Mutex::new(Cookie {
                xid: 0,
                pid: [0u8; 32],
                responder: Vec::new(),
                value: buf.clone(),
                alloctime: Instant::now(),
            }));
            values.insert(buf, Arc::clone(&cookie));
            counts.count("cookie.new", 1);
            return Some(cookie);
        }
        counts.count("cookie.null", 1);
        None
    }

    /// Look up a cookie by value.
    pub fn find(&self, value: &[u8], counts: &Counts) -> Option<Arc<Mutex<Cookie>>> {
        let found = self
            .values
            .lock()
            .expect("cookie store poisoned")
            .get(value)
            .cloned();
        if found.is_none() {
            counts.count("cookie.notfound", 1);
        }
        found
    }

    /// Delete a cookie once its session has authenticated.
    pub fn commit(&self, value: &[u8], counts: &Counts) {
        self.values.lock().expect("cookie store poisoned").remove(value);
        counts.count("cookie.commit", 1);
    }

    /// Drop cookies older than the expiry window. Returns how many.
    pub fn expire(&self, counts: &Counts) -> usize {
        let mut values = self.values.lock().expect("cookie store poisoned");
        let before = values.len();
        values.retain(|_, c| {
            c.lock().map(|c| c.alloctime.elapsed() < EXPIRY).unwrap_or(false)
        });
        let dropped = before - values.len();
        if dropped != 0 {
            counts.count("cookie.timeout", dropped as i64);
        }
        dropped
    }

    /// Spawn the background expiry sweeper.
    pub fn start_sweeper(self: &Arc<Self>, counts: Arc<Counts>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                store.expire(&counts);
            }
        });
    }
}

impl Default for CookieStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_find_commit() {
        let store = CookieStore::new();
        let counts = Counts::new();
        let cookie = store.alloc(&counts).unwrap();
        let value = cookie.lock().unwrap().value().to_vec();
        assert_eq!(value.len(), COOKIE_SIZE);
        assert_eq!(store.len(), 1);

        assert!(store.find(&value, &counts).is_some());
        store.commit(&value, &counts);
        assert!(store.find(&value, &counts).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn fresh_cookies_survive_a_sweep() {
        let store = CookieStore::new();
        let counts = Counts::new();
        store.alloc(&counts).unwrap();
        assert_eq!(store.expire(&counts), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn values_are_unique() {
        let store = CookieStore::new();
        let counts = Counts::new();
        let a = store.alloc(&counts).unwrap().lock().unwrap().value().to_vec();
        let b = store.alloc(&counts).unwrap().lock().unwrap().value().to_vec();
        assert_ne!(a, b);
    }
}
