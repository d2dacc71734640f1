//! The one-way, epoch-tagged transport channel between the sandbox and
//! the host.
//!
//! A typed sender/receiver pair with one dispatch point replaces ad hoc
//! listener registration: the sandbox only sends, the host only receives,
//! and starting a new epoch is the receiver's only cancellation
//! primitive. Stale-epoch messages are discarded, not errors.

use futures_channel::mpsc;
use glimpse_probe_protocol::{BoundaryMessage, Epoch, Payload, RunPhase};
use tracing::trace;

/// Allocates epochs, one per execution request. Monotonic until the
/// safe-integer wrap.
#[derive(Debug, Default)]
pub struct EpochCounter {
    current: Epoch,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        self.current
    }

    /// Begin a new epoch and return it.
    pub fn begin(&mut self) -> Epoch {
        self.current = self.current.next();
        self.current
    }
}

pub fn probe_channel() -> (ProbeSender, ProbeReceiver) {
    let (tx, rx) = mpsc::unbounded();
    (
        ProbeSender { tx },
        ProbeReceiver {
            rx,
            current: Epoch(0),
            coalescer: Coalescer::default(),
        },
    )
}

/// Sandbox-side handle. Sends are fire-and-forget; a closed receiver
/// means the run is stale and the message is dropped silently.
#[derive(Clone)]
pub struct ProbeSender {
    tx: mpsc::UnboundedSender<BoundaryMessage>,
}

impl ProbeSender {
    pub fn send_payload(&self, epoch: Epoch, payload: Payload) {
        let _ = self
            .tx
            .unbounded_send(BoundaryMessage::ValueCaptured { epoch, payload });
    }

    pub fn send_status(&self, epoch: Epoch, phase: RunPhase) {
        let _ = self
            .tx
            .unbounded_send(BoundaryMessage::RunStatus { epoch, phase });
    }
}

/// One non-blocking drain of the channel.
#[derive(Debug, Default)]
pub struct Drained {
    /// A coalesced batch, when the flush window elapsed.
    pub batch: Option<Vec<Payload>>,
    pub statuses: Vec<RunPhase>,
    pub disconnected: bool,
}

/// Host-side receiver: filters stale epochs, batches arrivals and
/// coalesces delivery on a trailing-edge window so tight emission loops
/// cannot flood the decoration renderer.
pub struct ProbeReceiver {
    rx: mpsc::UnboundedReceiver<BoundaryMessage>,
    current: Epoch,
    coalescer: Coalescer,
}

impl ProbeReceiver {
    /// Start a new epoch: everything still tagged with an older one is
    /// dropped from now on, including batched-but-unflushed payloads.
    pub fn begin_epoch(&mut self, epoch: Epoch) {
        self.current = epoch;
        self.coalescer.reset();
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current
    }

    /// Drain everything currently queued and poll the coalescer.
    /// `now_ms` is the caller's clock; tests drive it synthetically.
    pub fn pump(&mut self, now_ms: u64) -> Drained {
        let mut drained = Drained::default();
        loop {
            match self.rx.try_next() {
                Ok(Some(message)) => self.dispatch(message, now_ms, &mut drained),
                Ok(None) => {
                    drained.disconnected = true;
                    break;
                }
                Err(_) => break,
            }
        }
        drained.batch = self.coalescer.poll(now_ms);
        drained
    }

    /// The single dispatch point for inbound messages.
    fn dispatch(&mut self, message: BoundaryMessage, now_ms: u64, drained: &mut Drained) {
        match message {
            BoundaryMessage::ValueCaptured { epoch, payload } => {
                if epoch == self.current {
                    self.coalescer.push(payload, now_ms);
                } else {
                    trace!(stale = epoch.0, current = self.current.0, "discarding stale payload");
                }
            }
            BoundaryMessage::RunStatus { epoch, phase } => {
                if epoch == self.current {
                    drained.statuses.push(phase);
                }
            }
            // Epoch-independent; handled by the host shell, not here.
            BoundaryMessage::ThemeUpdate { .. } => {}
            // Host-bound channel never carries execute requests.
            BoundaryMessage::Execute { .. } => {}
        }
    }
}

/// Trailing-edge batcher: a batch flushes once arrivals go quiet for
/// `window_ms`, or after `max_latency_ms` under continuous emission.
#[derive(Debug)]
pub struct Coalescer {
    window_ms: u64,
    max_latency_ms: u64,
    pending: Vec<Payload>,
    first_arrival: u64,
    last_arrival: u64,
}

impl Default for Coalescer {
    fn default() -> Self {
        Coalescer::new(50, 250)
    }
}

impl Coalescer {
    pub fn new(window_ms: u64, max_latency_ms: u64) -> Self {
        Coalescer {
            window_ms,
            max_latency_ms,
            pending: Vec::new(),
            first_arrival: 0,
            last_arrival: 0,
        }
    }

    pub fn push(&mut self, payload: Payload, now_ms: u64) {
        if self.pending.is_empty() {
            self.first_arrival = now_ms;
        }
        self.last_arrival = now_ms;
        self.pending.push(payload);
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<Vec<Payload>> {
        if self.pending.is_empty() {
            return None;
        }
        let quiet = now_ms.saturating_sub(self.last_arrival) >= self.window_ms;
        let overdue = now_ms.saturating_sub(self.first_arrival) >= self.max_latency_ms;
        (quiet || overdue).then(|| std::mem::take(&mut self.pending))
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_probe_protocol::{CaptureId, CapturedValue};

    fn payload(epoch: Epoch, id: u32) -> Payload {
        Payload {
            id: CaptureId(id),
            epoch,
            is_error: false,
            result: CapturedValue::Number(id as f64),
            timestamp_ms: 0,
            promise: None,
            raw_position: None,
        }
    }

    #[test]
    fn epoch_counter_is_monotonic() {
        let mut counter = EpochCounter::new();
        let first = counter.begin();
        let second = counter.begin();
        assert!(second > first);
        assert_eq!(counter.current(), second);
    }

    #[test]
    fn stale_epoch_payloads_are_discarded() {
        let (sender, mut receiver) = probe_channel();
        let old = Epoch(1);
        let new = Epoch(2);
        receiver.begin_epoch(new);

        sender.send_payload(old, payload(old, 1));
        sender.send_payload(new, payload(new, 2));

        // Flush window elapsed well in the past.
        let drained = receiver.pump(10_000);
        let batch = drained.batch.expect("current-epoch payload flushes");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, CaptureId(2));
    }

    #[test]
    fn statuses_follow_epoch_filter_too() {
        let (sender, mut receiver) = probe_channel();
        receiver.begin_epoch(Epoch(5));
        sender.send_status(Epoch(4), RunPhase::Ready);
        sender.send_status(Epoch(5), RunPhase::ScriptComplete);
        let drained = receiver.pump(0);
        assert_eq!(drained.statuses, vec![RunPhase::ScriptComplete]);
    }

    #[test]
    fn coalescer_waits_for_trailing_edge() {
        let mut coalescer = Coalescer::new(50, 250);
        coalescer.push(payload(Epoch(1), 1), 100);
        coalescer.push(payload(Epoch(1), 2), 120);
        assert!(coalescer.poll(130).is_none(), "still inside the window");
        let batch = coalescer.poll(171).expect("quiet period elapsed");
        assert_eq!(batch.len(), 2);
        assert!(coalescer.poll(200).is_none(), "drained");
    }

    #[test]
    fn coalescer_flushes_under_continuous_emission() {
        let mut coalescer = Coalescer::new(50, 250);
        // A tight loop emitting every 10ms never goes quiet.
        let mut now = 0;
        for id in 0..40 {
            coalescer.push(payload(Epoch(1), id), now);
            now += 10;
        }
        let batch = coalescer.poll(now).expect("max latency bound fires");
        assert_eq!(batch.len(), 40);
    }

    #[test]
    fn begin_epoch_drops_unflushed_batch() {
        let (sender, mut receiver) = probe_channel();
        receiver.begin_epoch(Epoch(1));
        sender.send_payload(Epoch(1), payload(Epoch(1), 1));
        // Arrives, but not yet flushed.
        let drained = receiver.pump(0);
        assert!(drained.batch.is_none());
        // Epoch advances before the window elapses.
        receiver.begin_epoch(Epoch(2));
        let drained = receiver.pump(10_000);
        assert!(drained.batch.is_none(), "stale pending payloads are gone");
    }
}
