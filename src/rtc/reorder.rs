use std::collections::BTreeMap;

use webrtc::rtp::packet::Packet;

/// Releases RTP packets in sequence order, holding out-of-order arrivals in
/// a bounded window. When the window overflows, the release cursor jumps to
/// the oldest buffered packet and the gap surfaces downstream as a sequence
/// discontinuity.
pub struct ReorderBuffer {
    depth: usize,
    next: Option<u16>,
    pending: BTreeMap<u16, Packet>,
}

impl ReorderBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            next: None,
            pending: BTreeMap::new(),
        }
    }

    /// Accepts one packet and returns everything releasable in order.
    pub fn push(&mut self, packet: Packet) -> Vec<Packet> {
        let seq = packet.header.sequence_number;
        let next = *self.next.get_or_insert(seq);

        let mut released = Vec::new();
        // Sequence numbers behind the cursor are late duplicates.
        if seq.wrapping_sub(next) >= 0x8000 {
            return released;
        }
        self.pending.insert(seq, packet);
        self.drain_in_order(&mut released);

        while self.pending.len() > self.depth {
            if let Some(oldest) = self.oldest_pending() {
                self.next = Some(oldest);
                self.drain_in_order(&mut released);
            }
        }
        released
    }

    fn drain_in_order(&mut self, out: &mut Vec<Packet>) {
        while let Some(next) = self.next {
            match self.pending.remove(&next) {
                Some(packet) => {
                    out.push(packet);
                    self.next = Some(next.wrapping_add(1));
                }
                None => break,
            }
        }
    }

    fn oldest_pending(&self) -> Option<u16> {
        let next = self.next?;
        self.pending
            .keys()
            .copied()
            .min_by_key(|seq| seq.wrapping_sub(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16) -> Packet {
        let mut packet = Packet::default();
        packet.header.sequence_number = seq;
        packet
    }

    fn seqs(packets: &[Packet]) -> Vec<u16> {
        packets.iter().map(|p| p.header.sequence_number).collect()
    }

    #[test]
    fn in_order_packets_pass_through() {
        let mut buffer = ReorderBuffer::new(45);
        for seq in 100..110u16 {
            let released = buffer.push(packet(seq));
            assert_eq!(seqs(&released), vec![seq]);
        }
    }

    #[test]
    fn swapped_packets_are_reordered() {
        let mut buffer = ReorderBuffer::new(45);
        assert_eq!(seqs(&buffer.push(packet(1))), vec![1]);
        assert!(buffer.push(packet(3)).is_empty());
        assert_eq!(seqs(&buffer.push(packet(2))), vec![2, 3]);
    }

    #[test]
    fn burst_of_window_size_is_reassembled() {
        let mut buffer = ReorderBuffer::new(45);
        buffer.push(packet(0));
        // 45 packets arriving fully reversed.
        for seq in (1..=45u16).rev() {
            if seq > 1 {
                assert!(buffer.push(packet(seq)).is_empty());
            }
        }
        let released = buffer.push(packet(1));
        assert_eq!(seqs(&released), (1..=45).collect::<Vec<u16>>());
    }

    #[test]
    fn overflow_skips_the_gap_and_continues() {
        let mut buffer = ReorderBuffer::new(45);
        buffer.push(packet(0));
        // Packet 1 never arrives; the window fills up behind the gap.
        let mut released = Vec::new();
        for seq in 2..=47u16 {
            released.extend(buffer.push(packet(seq)));
        }
        // The cursor jumped past the loss and released the buffered run.
        assert_eq!(seqs(&released), (2..=47).collect::<Vec<u16>>());
    }

    #[test]
    fn wraps_around_sequence_space() {
        let mut buffer = ReorderBuffer::new(45);
        assert_eq!(seqs(&buffer.push(packet(65534))), vec![65534]);
        assert_eq!(seqs(&buffer.push(packet(65535))), vec![65535]);
        assert_eq!(seqs(&buffer.push(packet(0))), vec![0]);
        assert_eq!(seqs(&buffer.push(packet(1))), vec![1]);
    }

    #[test]
    fn late_duplicates_are_dropped() {
        let mut buffer = ReorderBuffer::new(45);
        buffer.push(packet(10));
        buffer.push(packet(11));
        assert!(buffer.push(packet(10)).is_empty());
        assert!(buffer.push(packet(5)).is_empty());
        assert_eq!(seqs(&buffer.push(packet(12))), vec![12]);
    }
}
