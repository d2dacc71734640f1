//! Host-side run coordination.
//!
//! Owns the epoch counter and the per-run compile artifacts. The context
//! table is rebuilt wholesale by every compile and swapped in atomically
//! here; payloads are only ever interpreted against the table of their
//! own epoch, never a newer one. Superseding a run disposes the previous
//! decoration set through its consumer callback.

use std::sync::Arc;

use glimpse_probe_protocol::{Decoration, Epoch, Payload};

use crate::instrument::CompileOutput;
use crate::remap::SourceMap;
use crate::render::{DecorationSet, build_decorations};
use crate::transport::{EpochCounter, ProbeReceiver};

struct ActiveRun {
    epoch: Epoch,
    output: Arc<CompileOutput>,
    payloads: Vec<Payload>,
    decorations: Option<DecorationSet>,
}

#[derive(Default)]
pub struct RunCoordinator {
    epochs: EpochCounter,
    active: Option<ActiveRun>,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap a fresh compile in under a new epoch. The previous run's
    /// decorations are disposed; its table becomes unreachable.
    pub fn begin_run(
        &mut self,
        output: CompileOutput,
        receiver: &mut ProbeReceiver,
    ) -> Epoch {
        let epoch = self.epochs.begin();
        receiver.begin_epoch(epoch);
        if let Some(previous) = self.active.take() {
            if let Some(decorations) = previous.decorations {
                decorations.dispose();
            }
        }
        self.active = Some(ActiveRun {
            epoch,
            output: Arc::new(output),
            payloads: Vec::new(),
            decorations: None,
        });
        epoch
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.active.as_ref().map(|active| active.epoch)
    }

    pub fn output(&self) -> Option<&Arc<CompileOutput>> {
        self.active.as_ref().map(|active| &active.output)
    }

    /// Fold one payload batch into the active run and rebuild its
    /// decoration set against that run's own context table and map.
    /// Payloads tagged with any other epoch are dropped here even if the
    /// receiver let them through.
    pub fn apply_batch(&mut self, batch: Vec<Payload>) -> Option<&DecorationSet> {
        let active = self.active.as_mut()?;
        active
            .payloads
            .extend(batch.into_iter().filter(|payload| payload.epoch == active.epoch));

        let chain: [SourceMap; 1] = [active.output.source_map.clone()];
        let decorations = build_decorations(&active.payloads, &active.output.table, &chain);
        // Rebuilding within one epoch is an update, not a supersession:
        // the consumer callback carries over and the old set drops silently.
        let callback = active
            .decorations
            .as_mut()
            .and_then(DecorationSet::take_callback);
        active.decorations = Some(DecorationSet::new(active.epoch, decorations, callback));
        active.decorations.as_ref()
    }

    /// Current decorations, one entry per payload in capture order.
    pub fn decorations(&self) -> &[Decoration] {
        self.active
            .as_ref()
            .and_then(|active| active.decorations.as_ref())
            .map(|set| set.decorations.as_slice())
            .unwrap_or(&[])
    }

    /// Attach the disposal callback the decoration consumer contract
    /// requires; invoked when this run is superseded.
    pub fn set_disposal(&mut self, on_dispose: Box<dyn FnOnce()>) {
        if let Some(active) = self.active.as_mut() {
            match active.decorations.as_mut() {
                Some(set) => set.set_callback(on_dispose),
                None => {
                    active.decorations =
                        Some(DecorationSet::new(active.epoch, Vec::new(), Some(on_dispose)));
                }
            }
        }
    }
}
