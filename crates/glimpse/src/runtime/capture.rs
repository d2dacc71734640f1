//! The runtime capture function: the single entry point every
//! instrumented site calls. Classifies the value, marshals it, stamps the
//! epoch and ships the payload. It never panics — a value that defeats
//! description degrades to a placeholder envelope inside the marshaller.

use std::time::{SystemTime, UNIX_EPOCH};

use glimpse_probe_protocol::{
    CaptureId, CapturedValue, Epoch, Payload, PromiseInfo, PromiseStatus, RawPosition,
};

use super::marshal::{marshal, promise_status};
use super::value::{PromiseState, Value};
use crate::transport::ProbeSender;

pub struct ProbeRuntime {
    epoch: Epoch,
    sender: ProbeSender,
}

impl ProbeRuntime {
    pub fn new(epoch: Epoch, sender: ProbeSender) -> Self {
        ProbeRuntime { epoch, sender }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Report one captured value. Called once per capture site per
    /// evaluation; promises additionally re-report when they settle.
    pub fn capture(&self, id: CaptureId, value: &Value) {
        let payload = Payload {
            id,
            epoch: self.epoch,
            is_error: matches!(value, Value::Error(_)),
            result: marshal(value),
            timestamp_ms: Self::now_ms(),
            promise: promise_status(value).map(|status| PromiseInfo { status }),
            raw_position: None,
        };
        self.sender.send_payload(self.epoch, payload);

        // Non-blocking settle observer: the updated payload reuses the
        // same id, so the decoration slot refreshes in place. Resolution
        // timing is untouched.
        if let Value::Promise(promise) = value {
            let sender = self.sender.clone();
            let epoch = self.epoch;
            promise.observe(Box::new(move |state| {
                let (status, settled) = match state {
                    PromiseState::Pending => return,
                    PromiseState::Fulfilled(settled) => (PromiseStatus::Fulfilled, settled),
                    PromiseState::Rejected(settled) => (PromiseStatus::Rejected, settled),
                };
                let payload = Payload {
                    id,
                    epoch,
                    is_error: matches!(status, PromiseStatus::Rejected),
                    result: marshal(settled),
                    timestamp_ms: Self::now_ms(),
                    promise: Some(PromiseInfo { status }),
                    raw_position: None,
                };
                sender.send_payload(epoch, payload);
            }));
        }
    }

    /// Report an uncaught runtime error under the well-known
    /// window-error id, with its position in the executed code attached
    /// for the host-side remapper.
    pub fn capture_window_error(&self, message: &str, raw_position: Option<RawPosition>) {
        let payload = Payload {
            id: CaptureId::WINDOW_ERROR,
            epoch: self.epoch,
            is_error: true,
            result: CapturedValue::Error {
                name: "Error".into(),
                message: message.to_string(),
            },
            timestamp_ms: Self::now_ms(),
            promise: None,
            raw_position,
        };
        self.sender.send_payload(self.epoch, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::PromiseValue;
    use crate::transport::probe_channel;

    #[test]
    fn capture_tags_epoch_and_classification() {
        let (sender, mut receiver) = probe_channel();
        receiver.begin_epoch(Epoch(3));
        let probe = ProbeRuntime::new(Epoch(3), sender);

        probe.capture(CaptureId(0), &Value::Number(42.0));
        probe.capture(CaptureId(1), &Value::error("TypeError", "boom"));

        let batch = receiver.pump(10_000).batch.expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].epoch, Epoch(3));
        assert!(!batch[0].is_error);
        assert!(batch[1].is_error);
    }

    #[test]
    fn pending_promise_reports_again_on_settle() {
        let (sender, mut receiver) = probe_channel();
        receiver.begin_epoch(Epoch(1));
        let probe = ProbeRuntime::new(Epoch(1), sender);

        let promise = PromiseValue::pending();
        let value = Value::Promise(promise.clone());
        probe.capture(CaptureId(7), &value);

        promise.settle(PromiseState::Fulfilled(Value::Number(5.0)));

        let batch = receiver.pump(10_000).batch.expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch[0].promise.unwrap().status,
            PromiseStatus::Pending
        );
        assert_eq!(
            batch[1].promise.unwrap().status,
            PromiseStatus::Fulfilled
        );
        assert_eq!(batch[1].result, CapturedValue::Number(5.0));
        assert_eq!(batch[1].id, CaptureId(7));
    }
}
