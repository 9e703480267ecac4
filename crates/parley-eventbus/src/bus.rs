use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parley_protocol::{BrokerEvent, SessionId};
use tokio::sync::broadcast;

use crate::envelope::EventEnvelope;

pub const DEFAULT_BUFFER_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerEventBusConfig {
    pub buffer_capacity: usize,
}

impl Default for BrokerEventBusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Bounded ring fan-out for [`EventEnvelope`]s. Each subscriber owns a read
/// cursor; a subscriber that falls behind the ring observes `Lagged` on its
/// receiver and is expected to surface a `lag` marker downstream.
#[derive(Debug)]
pub struct BrokerEventBus {
    next_sequence: AtomicU64,
    boot_instant: Instant,
    sender: broadcast::Sender<EventEnvelope>,
}

impl Default for BrokerEventBus {
    fn default() -> Self {
        Self::new(BrokerEventBusConfig::default())
    }
}

impl BrokerEventBus {
    pub fn new(config: BrokerEventBusConfig) -> Self {
        assert!(
            config.buffer_capacity > 0,
            "buffer_capacity must be greater than 0"
        );

        let (sender, _receiver) = broadcast::channel(config.buffer_capacity);
        Self {
            next_sequence: AtomicU64::new(0),
            boot_instant: Instant::now(),
            sender,
        }
    }

    /// New subscribers start at the ring head; missed history is not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, session_id: Option<SessionId>, event: BrokerEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            session_id,
            sequence: self.next_sequence(),
            received_at_monotonic_nanos: self.monotonic_nanos_since_bus_bootstrap(),
            event,
        };

        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(envelope.clone());
        }

        envelope
    }

    fn next_sequence(&self) -> u64 {
        let mut current = self.next_sequence.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(1)
                .expect("broker event sequence exhausted");
            match self.next_sequence.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    fn monotonic_nanos_since_bus_bootstrap(&self) -> u64 {
        let nanos = self.boot_instant.elapsed().as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}
