use std::time::Duration;

/// One counter record: the monotonic sum and every interval snapshot share
/// this shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub total: u64,
    pub answered: u64,
    pub noerror: u64,
}

/// Aggregate totals plus the chain of per-interval snapshots.
///
/// The last snapshot is `current` and receives live increments; index 0 is
/// the anchor created with the ledger. Every increment against `current` is
/// mirrored in `sum`, so `sum == Σ snapshots` holds at every quiescent
/// point.
#[derive(Debug)]
pub struct StatsLedger {
    pub sum: Counters,
    snapshots: Vec<Counters>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self {
            sum: Counters::default(),
            snapshots: vec![Counters::default()],
        }
    }

    fn current_mut(&mut self) -> &mut Counters {
        // the anchor snapshot exists from construction on
        self.snapshots.last_mut().expect("ledger anchor snapshot")
    }

    pub fn note_total(&mut self) {
        self.sum.total += 1;
        self.current_mut().total += 1;
    }

    pub fn note_answered(&mut self, noerror: bool) {
        self.sum.answered += 1;
        self.current_mut().answered += 1;
        if noerror {
            self.sum.noerror += 1;
            self.current_mut().noerror += 1;
        }
    }

    /// Seal the current snapshot and open a fresh one. Called by the stats
    /// interval tick.
    pub fn rotate(&mut self) {
        self.snapshots.push(Counters::default());
    }

    pub fn snapshots(&self) -> &[Counters] {
        &self.snapshots
    }
}

impl Default for StatsLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client accounting slot, indexed by the client key derived from the
/// inbound packet's destination IP. Latency fields aggregate the
/// send→answer round-trip of answered requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientSlot {
    pub req_total: u64,
    pub req_answered: u64,
    pub req_noerror: u64,
    pub latency_sum_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
}

impl ClientSlot {
    pub fn note_answered(&mut self, noerror: bool, rtt: Duration) {
        self.req_answered += 1;
        if noerror {
            self.req_noerror += 1;
        }
        let ms = rtt.as_secs_f64() * 1000.0;
        self.latency_sum_ms += ms;
        if self.req_answered == 1 || ms < self.latency_min_ms {
            self.latency_min_ms = ms;
        }
        if ms > self.latency_max_ms {
            self.latency_max_ms = ms;
        }
    }
}
