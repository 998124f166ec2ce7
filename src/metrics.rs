//! Prometheus metrics
//!
//! A process-wide registry of reconcile outcomes, exported in the text
//! exposition format.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::sync::Mutex;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub kind: String,
    pub outcome: String,
}

static RECONCILIATIONS: Lazy<Family<ReconcileLabels, Counter>> =
    Lazy::new(Family::default);

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "unified_replication_reconciliations",
        "Reconcile outcomes per watched kind",
        RECONCILIATIONS.clone(),
    );
    Mutex::new(registry)
});

/// Count one reconcile outcome for a watched kind.
pub fn observe_reconcile(kind: &str, ok: bool) {
    RECONCILIATIONS
        .get_or_create(&ReconcileLabels {
            kind: kind.to_string(),
            outcome: if ok { "success" } else { "error" }.to_string(),
        })
        .inc();
}

/// Render the registry in the Prometheus text format.
pub fn render() -> String {
    let registry = REGISTRY.lock().expect("metrics registry lock poisoned");
    let mut out = String::new();
    if encode(&mut out, &registry).is_err() {
        out.clear();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_counted_and_rendered() {
        observe_reconcile("VolumeReplication", true);
        observe_reconcile("VolumeReplication", false);
        observe_reconcile("VolumeReplication", true);

        let text = render();
        assert!(text.contains("unified_replication_reconciliations"));
        assert!(text.contains("outcome=\"success\""));
        assert!(text.contains("outcome=\"error\""));
    }
}
