//! Flow ACK coding: a cumulative stage plus selective ranges.
//!
//! Wire form: `[stage varint64]` then pairs of `[beg - prev - 2]`
//! `[end - beg]`, each relative to the previous range's end (initially
//! the cumulative stage). The `- 2` makes a range adjacent to the
//! cumulative stage encode as zero.

use rill_wire::{PacketReader, PacketWriter, size_of_7bit_u64};

use crate::frame::FrameError;

/// A parsed or under-construction flow ACK.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FlowAck {
    /// Highest consecutively received stage.
    pub stage: u64,
    /// Selectively received `[beg, end]` ranges above `stage`, ascending.
    pub ranges: Vec<(u64, u64)>,
}

impl FlowAck {
    pub fn new(stage: u64) -> Self {
        Self { stage, ranges: Vec::new() }
    }

    pub fn add_range(&mut self, beg: u64, end: u64) {
        self.ranges.push((beg, end));
    }

    /// Parse an ACK body (everything after fid and cnt).
    pub fn parse(r: &mut PacketReader<'_>) -> Result<Self, FrameError> {
        let stage = r.read_7bit_u64()?;
        let mut ack = Self::new(stage);
        let mut prev = stage;
        while r.remaining() != 0 {
            let beg = r.read_7bit_u64()? + prev + 2;
            let end = beg + r.read_7bit_u64()?;
            ack.add_range(beg, end);
            prev = end;
        }
        Ok(ack)
    }

    /// Serialize the ACK body.
    pub fn store(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
        w.write_7bit_u64(self.stage)?;
        let mut prev = self.stage;
        for &(beg, end) in &self.ranges {
            w.write_7bit_u64(beg - prev - 2)?;
            w.write_7bit_u64(end - beg)?;
            prev = end;
        }
        Ok(())
    }

    /// Encoded body size.
    pub fn size(&self) -> usize {
        let mut total = size_of_7bit_u64(self.stage).unwrap_or(0);
        let mut prev = self.stage;
        for &(beg, end) in &self.ranges {
            total += size_of_7bit_u64(beg - prev - 2).unwrap_or(0);
            total += size_of_7bit_u64(end - beg).unwrap_or(0);
            prev = end;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ack: &FlowAck) -> FlowAck {
        let mut w = PacketWriter::new();
        ack.store(&mut w).unwrap();
        assert_eq!(w.len(), ack.size());
        let bytes = w.into_bytes();
        FlowAck::parse(&mut PacketReader::new(&bytes)).unwrap()
    }

    #[test]
    fn cumulative_only() {
        let ack = FlowAck::new(17);
        assert_eq!(roundtrip(&ack), ack);
    }

    #[test]
    fn ranges_roundtrip() {
        let mut ack = FlowAck::new(3);
        ack.add_range(5, 5);
        ack.add_range(8, 12);
        ack.add_range(100, 250);
        assert_eq!(roundtrip(&ack), ack);
    }

    #[test]
    fn adjacent_range_encodes_compactly() {
        // A range starting right above stage + 1 encodes its offset as 0.
        let mut ack = FlowAck::new(1);
        ack.add_range(3, 3);
        let mut w = PacketWriter::new();
        ack.store(&mut w).unwrap();
        assert_eq!(w.bytes(), &[1, 0, 0]);
    }

    #[test]
    fn large_stage_values() {
        let mut ack = FlowAck::new(1 << 40);
        ack.add_range((1 << 40) + 10, (1 << 40) + 20);
        assert_eq!(roundtrip(&ack), ack);
    }
}
