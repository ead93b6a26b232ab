//! Reconciliation core of the GCE PD CSI storage operator
//!
//! One invocation handles one trigger: the record is loaded, triggers
//! deferred by earlier invocations are redelivered first, then the new
//! trigger runs, and the record is written back once.

#![deny(missing_docs)]

pub mod actions;
pub mod reconciler;
pub mod record;
pub mod status;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::VecDeque;

use tracing::{error, info};

use pdcsi_common::Error;

pub use reconciler::{Context, Outcome, Paths, Reconciler, UnitInfo};
pub use record::{FileStateStore, ReconciliationRecord, StateStore};
pub use status::{FileStatusSink, MemoryStatusSink, StatusSink, UnitStatus};
pub use trigger::{EntryPoint, Trigger};

/// Run deferred triggers and then `trigger`, persisting the record once.
///
/// A trigger that fails fatally is dropped; triggers not reached yet stay
/// deferred and the error is returned after the record is saved.
pub async fn dispatch(
    reconciler: &Reconciler,
    store: &dyn StateStore,
    mut record: ReconciliationRecord,
    trigger: Trigger,
) -> Result<(), Error> {
    let mut queue: VecDeque<Trigger> = std::mem::take(&mut record.deferred).into();
    if !queue.contains(&trigger) {
        queue.push_back(trigger);
    }
    if queue.len() > 1 {
        info!(pending = queue.len() - 1, "redelivering deferred triggers");
    }

    let mut result = Ok(());
    while let Some(trigger) = queue.pop_front() {
        match reconciler.handle(&trigger, &mut record).await {
            Ok(Outcome::Done) => {}
            Ok(Outcome::Deferred) => {
                info!(trigger = %trigger, "deferring trigger");
                record.defer(trigger);
            }
            Err(e) => {
                error!(trigger = %trigger, error = %e, "trigger failed");
                for pending in queue.drain(..) {
                    record.defer(pending);
                }
                result = Err(e);
            }
        }
    }

    if let Some(identity) = reconciler.context().integrator.cached_identity() {
        record.identity = Some(identity);
    }
    store.save(&record)?;
    result
}
