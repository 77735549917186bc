//! Flow fragments.

use std::fmt;
use std::time::Instant;

pub(crate) const FLAG_END: u8 = 0x01;
pub(crate) const FLAG_ABANDONED: u8 = 0x02;
pub(crate) const FLAG_WITH_AFTER: u8 = 0x10;
pub(crate) const FLAG_WITH_BEFORE: u8 = 0x20;
pub(crate) const FLAG_HEADER: u8 = 0x80;

/// One fragment of a flow message.
///
/// A message is one or more fragments with consecutive stages; the first
/// has `!with_before`, the last `!with_after`. `end` terminates the
/// flow; `abandoned` drops this message but keeps the flow alive.
#[derive(Clone)]
pub(crate) struct Fragment {
    pub stage: u64,
    pub flags: u8,
    pub data: Vec<u8>,
    pub sendtime: Option<Instant>,
}

impl Fragment {
    pub fn with_after(&self) -> bool {
        self.flags & FLAG_WITH_AFTER != 0
    }

    pub fn with_before(&self) -> bool {
        self.flags & FLAG_WITH_BEFORE != 0
    }

    pub fn abandoned(&self) -> bool {
        self.flags & FLAG_ABANDONED != 0
    }

    pub fn end(&self) -> bool {
        self.flags & FLAG_END != 0
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:", self.stage)?;
        if self.abandoned() {
            write!(f, "A")?;
        } else {
            match (!self.with_before(), !self.with_after()) {
                (true, true) => write!(f, "M")?,
                (true, false) => write!(f, "[")?,
                (false, true) => write!(f, "]")?,
                (false, false) => write!(f, "+")?,
            }
        }
        if self.end() {
            write!(f, "E")?;
        }
        write!(f, "}}")
    }
}
