//! Capacity-bounded service queue shared by app servers and databases.
//!
//! Arrivals are this tick's inflow plus the backlog carried from earlier
//! ticks. At most the effective capacity is served; the rest stays queued up
//! to `MAX_QUEUE_MULTIPLIER * capacity` and anything beyond that is dropped.
//! Reads and writes are queued separately so the served split reflects the
//! backlog's composition.

use super::{MAX_QUEUE_MULTIPLIER, clamp_rate};

/// Share of served capacity a primary may give to writes once busy.
const PRIMARY_WRITE_CEILING: f64 = 0.9;

/// Served volume above which the primary write ceiling applies.
const PRIMARY_GUARD_MIN_PROCESSED: f64 = 5.0;

/// How served capacity is divided between reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Served split matches the composition of arrivals
    Proportional,
    /// Read replica: everything served is reported as reads
    Replica,
    /// Primary: writes first, capped to keep read headroom
    Primary,
}

/// Result of serving one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServiceOutcome {
    pub read: f64,
    pub write: f64,
}

impl ServiceOutcome {
    pub fn total(&self) -> f64 {
        self.read + self.write
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceQueue {
    pub capacity: f64,
    /// Milliseconds
    pub base_latency: f64,
    pub concurrency_limit: f64,
    /// Enables the Little's Law bound `concurrency_limit / latency`
    pub throttle_enabled: bool,
    queue_read: f64,
    queue_write: f64,
    arrival_read: f64,
    arrival_write: f64,
    incoming: f64,
    served: ServiceOutcome,
    effective_capacity: f64,
    dropped: f64,
    total_dropped: f64,
    utilization: f64,
}

impl ServiceQueue {
    pub fn new(capacity: f64, base_latency: f64) -> Self {
        let capacity = clamp_rate(capacity);
        Self {
            capacity,
            base_latency: clamp_rate(base_latency),
            effective_capacity: capacity,
            ..Default::default()
        }
    }

    pub fn queue_depth(&self) -> f64 {
        self.queue_read + self.queue_write
    }

    pub fn max_queue(&self) -> f64 {
        self.capacity * MAX_QUEUE_MULTIPLIER
    }

    /// Time to drain the current backlog at full capacity, in milliseconds.
    pub fn queue_delay_ms(&self) -> f64 {
        if self.capacity > 0.0 {
            self.queue_depth() / self.capacity * 1000.0
        } else {
            0.0
        }
    }

    /// Capacity after the optional concurrency throttle at the given latency.
    pub fn effective_capacity_at(&self, total_latency_ms: f64) -> f64 {
        if self.throttle_enabled && self.concurrency_limit > 0.0 && total_latency_ms > 0.0 {
            let bound = self.concurrency_limit / total_latency_ms * 1000.0;
            self.capacity.min(bound)
        } else {
            self.capacity
        }
    }

    /// Serves one tick of arrivals.
    ///
    /// `total_latency_ms` is the latency seen before serving; it only matters
    /// when the concurrency throttle is enabled.
    pub fn serve(
        &mut self,
        in_read: f64,
        in_write: f64,
        total_latency_ms: f64,
        allocation: Allocation,
    ) -> ServiceOutcome {
        let in_read = clamp_rate(in_read);
        let in_write = clamp_rate(in_write);
        let effective = self.effective_capacity_at(total_latency_ms);

        let arrival_read = in_read + self.queue_read;
        let arrival_write = in_write + self.queue_write;
        let arrival = arrival_read + arrival_write;
        let processed = arrival.min(effective);

        let served = match allocation {
            Allocation::Proportional => {
                let write = if arrival > 0.0 {
                    processed * arrival_write / arrival
                } else {
                    0.0
                };
                ServiceOutcome {
                    read: processed - write,
                    write,
                }
            }
            Allocation::Replica => ServiceOutcome {
                read: processed,
                write: 0.0,
            },
            Allocation::Primary => split_primary(processed, arrival_write),
        };

        // Reported splits of replicas and primaries need not match the
        // backlog's mix, so reads drain only as far as reads are waiting.
        let used_read = served.read.min(arrival_read);
        let used_write = processed - used_read;
        let mut queue_read = (arrival_read - used_read).max(0.0);
        let mut queue_write = (arrival_write - used_write).max(0.0);

        let backlog = queue_read + queue_write;
        let ceiling = self.max_queue();
        if backlog > ceiling {
            self.dropped = backlog - ceiling;
            self.total_dropped += self.dropped;
            let keep = if backlog > 0.0 { ceiling / backlog } else { 0.0 };
            queue_read *= keep;
            queue_write *= keep;
        } else {
            self.dropped = 0.0;
        }

        self.queue_read = queue_read;
        self.queue_write = queue_write;
        self.arrival_read = arrival_read;
        self.arrival_write = arrival_write;
        self.incoming = in_read + in_write;
        self.served = served;
        self.effective_capacity = effective;

        let base_utilization = if self.capacity > 0.0 {
            (self.incoming / self.capacity).min(1.0)
        } else if self.incoming > 0.0 {
            1.0
        } else {
            0.0
        };
        let throttled = processed < arrival;
        self.utilization = if self.queue_depth() > 0.0 || throttled {
            1.0
        } else {
            base_utilization
        };

        served
    }

    /// Records a tick in which the node was down: nothing served, backlog kept.
    pub fn idle(&mut self) {
        self.served = ServiceOutcome::default();
        self.arrival_read = 0.0;
        self.arrival_write = 0.0;
        self.incoming = 0.0;
        self.dropped = 0.0;
        self.utilization = 0.0;
    }

    pub fn reset(&mut self) {
        self.queue_read = 0.0;
        self.queue_write = 0.0;
    }

    pub fn served(&self) -> ServiceOutcome {
        self.served
    }

    pub fn arrivals(&self) -> (f64, f64) {
        (self.arrival_read, self.arrival_write)
    }

    pub fn effective_capacity(&self) -> f64 {
        self.effective_capacity
    }

    pub fn dropped(&self) -> f64 {
        self.dropped
    }

    pub fn total_dropped(&self) -> f64 {
        self.total_dropped
    }

    pub fn utilization(&self) -> f64 {
        self.utilization
    }

    /// Changes capacity, dropping any backlog above the new ceiling at once.
    pub fn set_capacity(&mut self, capacity: f64) {
        self.capacity = clamp_rate(capacity);
        if !self.throttle_enabled {
            self.effective_capacity = self.capacity;
        }

        let backlog = self.queue_depth();
        let ceiling = self.max_queue();
        if backlog > ceiling {
            let excess = backlog - ceiling;
            self.dropped += excess;
            self.total_dropped += excess;
            let keep = ceiling / backlog;
            self.queue_read *= keep;
            self.queue_write *= keep;
        }
    }
}

/// Writes are served first, but once the primary is busy they may not claim
/// more than 90% of the budget. Whatever writes leave is read throughput.
fn split_primary(processed: f64, arrival_write: f64) -> ServiceOutcome {
    let mut write = arrival_write.min(processed);
    if processed > PRIMARY_GUARD_MIN_PROCESSED && write >= PRIMARY_WRITE_CEILING * processed {
        write = PRIMARY_WRITE_CEILING * processed;
    }
    ServiceOutcome {
        read: processed - write,
        write,
    }
}
