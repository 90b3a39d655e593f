use magnetite::address::Address;
use magnetite::MAX_PACKET_SIZE;
use std::mem;

/// A single datagram captured off the socket by the listener thread.
pub struct IncomingPacket {
    pub timestamp: f64,
    pub from: Address,
    pub length: usize,
    pub data: [u8; MAX_PACKET_SIZE],
}

impl IncomingPacket {
    pub fn new(timestamp: f64, from: Address, payload: &[u8]) -> IncomingPacket {
        let mut data = [0u8; MAX_PACKET_SIZE];
        data[..payload.len()].copy_from_slice(payload);

        IncomingPacket {
            timestamp,
            from,
            length: payload.len(),
            data,
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

/// A fixed capacity batch of captured packets.
pub struct PacketQueue {
    packets: Vec<IncomingPacket>,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> PacketQueue {
        PacketQueue {
            packets: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a packet. Returns false when the queue is full.
    #[inline]
    pub fn push(&mut self, packet: IncomingPacket) -> bool {
        if self.packets.len() >= self.capacity {
            return false;
        }

        self.packets.push(packet);
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &IncomingPacket> {
        self.packets.iter()
    }
}

/// Double buffered packet queue shared between the listener thread and the
/// updater. The listener appends to the active half; the updater flips the
/// halves and drains the inactive one. The flip is an index toggle plus a
/// vector swap, so the critical section is O(1) regardless of queue depth.
pub struct DoubleBuffer {
    queues: [PacketQueue; 2],
    active: usize,
    dropped: u64,
}

impl DoubleBuffer {
    pub fn new(capacity: usize) -> DoubleBuffer {
        DoubleBuffer {
            queues: [PacketQueue::new(capacity), PacketQueue::new(capacity)],
            active: 0,
            dropped: 0,
        }
    }

    /// Appends to the active half. Packets arriving while both halves are
    /// saturated are counted and dropped.
    #[inline]
    pub fn push(&mut self, packet: IncomingPacket) {
        if !self.queues[self.active].push(packet) {
            self.dropped += 1;
        }
    }

    /// Flips the active half and exchanges the captured packets with
    /// `scratch`, which must arrive empty. Called under the session lock.
    pub fn flip(&mut self, scratch: &mut PacketQueue) {
        debug_assert!(scratch.is_empty());

        let full = self.active;
        self.active ^= 1;

        mem::swap(&mut self.queues[full], scratch);
    }

    /// Discards everything captured so far in both halves.
    pub fn clear(&mut self) {
        self.queues[0].clear();
        self.queues[1].clear();
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(marker: u8) -> IncomingPacket {
        IncomingPacket::new(1.0, Address::None, &[marker, marker])
    }

    #[test]
    fn test_push_and_payload() {
        let mut queue = PacketQueue::new(4);

        assert!(queue.push(make_packet(7)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().unwrap().payload(), &[7, 7]);
    }

    #[test]
    fn test_queue_capacity() {
        let mut queue = PacketQueue::new(2);

        assert!(queue.push(make_packet(1)));
        assert!(queue.push(make_packet(2)));
        assert!(!queue.push(make_packet(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_flip_exchanges_batches() {
        let mut buffer = DoubleBuffer::new(4);
        let mut scratch = PacketQueue::new(4);

        buffer.push(make_packet(1));
        buffer.push(make_packet(2));

        buffer.flip(&mut scratch);
        assert_eq!(scratch.len(), 2);

        // New packets land in the other half while the batch is drained.
        buffer.push(make_packet(3));

        scratch.clear();
        buffer.flip(&mut scratch);
        assert_eq!(scratch.len(), 1);
        assert_eq!(scratch.iter().next().unwrap().payload(), &[3, 3]);
    }

    #[test]
    fn test_dropped_count() {
        let mut buffer = DoubleBuffer::new(1);

        buffer.push(make_packet(1));
        buffer.push(make_packet(2));

        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_clear() {
        let mut buffer = DoubleBuffer::new(4);
        let mut scratch = PacketQueue::new(4);

        buffer.push(make_packet(1));
        buffer.clear();
        buffer.flip(&mut scratch);

        assert!(scratch.is_empty());
    }
}
