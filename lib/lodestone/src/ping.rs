/// Number of RTT samples retained per probed endpoint.
pub const PING_HISTORY_ENTRY_COUNT: usize = 512;

/// Number of one second stat samples retained for the game.
pub const STATS_SAMPLE_COUNT: usize = 60;

/// A ping older than this with no pong counts as lost.
const LOSS_GRACE_SECS: f64 = 1.0;

#[derive(Debug, Copy, Clone)]
struct PingEntry {
    sequence: u64,
    time_ping_sent: f64,
    time_pong_received: f64,
}

const EMPTY_ENTRY: PingEntry = PingEntry {
    sequence: 0,
    time_ping_sent: 0.0,
    time_pong_received: 0.0,
};

/// Ring of sequence numbered RTT samples for one probed endpoint. The ring
/// index only orders insertion; queries scan all entries.
#[derive(Clone)]
pub struct PingHistory {
    entries: [PingEntry; PING_HISTORY_ENTRY_COUNT],
    sequence: u64,
    index: usize,
}

impl PingHistory {
    pub fn new() -> PingHistory {
        PingHistory {
            entries: [EMPTY_ENTRY; PING_HISTORY_ENTRY_COUNT],
            sequence: 0,
            index: 0,
        }
    }

    pub fn reset(&mut self) {
        self.entries = [EMPTY_ENTRY; PING_HISTORY_ENTRY_COUNT];
        self.sequence = 0;
        self.index = 0;
    }

    /// Records an outgoing ping at `time` and returns its sequence.
    pub fn insert(&mut self, time: f64) -> u64 {
        let sequence = self.sequence;

        self.entries[self.index] = PingEntry {
            sequence,
            time_ping_sent: time,
            time_pong_received: 0.0,
        };

        self.sequence += 1;
        self.index = (self.index + 1) % PING_HISTORY_ENTRY_COUNT;

        sequence
    }

    /// Matches a pong against its ping entry.
    pub fn pong_received(&mut self, sequence: u64, time: f64) {
        for entry in self.entries.iter_mut() {
            if entry.time_ping_sent > 0.0 && entry.sequence == sequence {
                entry.time_pong_received = time;
                break;
            }
        }
    }

    /// Computes route statistics over pings sent in `(start, end]`. Returns
    /// the no-data sentinel when no pong arrived in the window.
    pub fn stats(&self, start: f64, end: f64) -> RouteStats {
        let mut rtt_min = f64::MAX;

        for entry in self.entries.iter() {
            if entry.time_ping_sent > start && entry.time_pong_received > entry.time_ping_sent {
                let rtt = 1000.0 * (entry.time_pong_received - entry.time_ping_sent);
                if rtt < rtt_min {
                    rtt_min = rtt;
                }
            }
        }

        let mut packets_sent = 0u32;
        let mut packets_received = 0u32;
        let mut deviation = 0.0f64;

        for entry in self.entries.iter() {
            if entry.time_ping_sent > start {
                if entry.time_pong_received > entry.time_ping_sent {
                    let rtt = 1000.0 * (entry.time_pong_received - entry.time_ping_sent);
                    let error = rtt - rtt_min;
                    deviation += error * error;
                    packets_sent += 1;
                    packets_received += 1;
                } else if entry.time_ping_sent > 0.0 && entry.time_ping_sent < end - LOSS_GRACE_SECS {
                    // Pinged, never ponged, and old enough to count as lost.
                    packets_sent += 1;
                }
            }
        }

        if packets_received > 0 {
            RouteStats {
                rtt: rtt_min as f32,
                jitter: 3.0 * (deviation / f64::from(packets_received)).sqrt() as f32,
                packet_loss: 1.0 - packets_received as f32 / packets_sent as f32,
            }
        } else {
            RouteStats::no_data()
        }
    }
}

/// Latency, jitter and loss over one path. `-1` in every field signals
/// that no data was available in the query window.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RouteStats {
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

impl RouteStats {
    #[inline]
    pub fn no_data() -> RouteStats {
        RouteStats {
            rtt: -1.0,
            jitter: -1.0,
            packet_loss: -1.0,
        }
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.rtt >= 0.0
    }
}

/// One second snapshot of the direct and relay path statistics.
#[derive(Debug, Copy, Clone)]
pub struct StatsSample {
    pub time: f64,
    pub relay_rtt: f32,
    pub relay_jitter: f32,
    pub relay_packet_loss: f32,
    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,
}

const EMPTY_SAMPLE: StatsSample = StatsSample {
    time: 0.0,
    relay_rtt: 0.0,
    relay_jitter: 0.0,
    relay_packet_loss: 0.0,
    direct_rtt: 0.0,
    direct_jitter: 0.0,
    direct_packet_loss: 0.0,
};

/// Ring of the most recent `STATS_SAMPLE_COUNT` one second samples.
#[derive(Clone)]
pub struct StatsHistory {
    samples: [StatsSample; STATS_SAMPLE_COUNT],
    index: usize,
}

impl StatsHistory {
    pub fn new() -> StatsHistory {
        StatsHistory {
            samples: [EMPTY_SAMPLE; STATS_SAMPLE_COUNT],
            index: 0,
        }
    }

    pub fn reset(&mut self) {
        self.samples = [EMPTY_SAMPLE; STATS_SAMPLE_COUNT];
        self.index = 0;
    }

    pub fn insert(&mut self, sample: StatsSample) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % STATS_SAMPLE_COUNT;
    }

    /// Returns the retained samples oldest first.
    pub fn snapshot(&self) -> Vec<StatsSample> {
        let count = if self.samples[self.index].time == 0.0 {
            self.index
        } else {
            STATS_SAMPLE_COUNT
        };

        let mut samples = Vec::with_capacity(count);

        let mut read = (self.index + STATS_SAMPLE_COUNT - count) % STATS_SAMPLE_COUNT;
        for _ in 0..count {
            samples.push(self.samples[read]);
            read = (read + 1) % STATS_SAMPLE_COUNT;
        }

        samples
    }
}
