//! Drift monitor: re-observes applied state between source changes.

use std::collections::BTreeSet;

use keel_core::{DesiredSet, ObjectKey};
use tracing::{debug, info};

use crate::diff::DiffEngine;
use crate::observer::ObservedStateReader;
use crate::types::{DeltaSet, DriftReport};

/// Compares the live environment with the last applied desired set.
#[derive(Clone)]
pub struct DriftMonitor {
    reader: ObservedStateReader,
    engine: DiffEngine,
}

impl DriftMonitor {
    /// Create a monitor from the scope's reader and diff engine.
    pub const fn new(reader: ObservedStateReader, engine: DiffEngine) -> Self {
        Self { reader, engine }
    }

    /// Observe and diff once.
    ///
    /// Returns the report together with the deltas so a corrective sync can
    /// reuse them without reading the environment again.
    pub async fn check(&self, desired: &DesiredSet, inventory: &BTreeSet<ObjectKey>) -> (DriftReport, DeltaSet) {
        let observed = self.reader.observe(desired, inventory, self.engine.prunes()).await;
        let deltas = self.engine.diff(desired, &observed);
        let report = DriftReport::from_deltas(desired.revision.clone(), &deltas);

        if report.has_drift() {
            info!(
                revision = %desired.revision.short(),
                drifted = report.drifted.len(),
                unknown = report.unknown.len(),
                "Drift detected"
            );
        } else {
            debug!(revision = %desired.revision.short(), "No drift");
        }
        (report, deltas)
    }
}
