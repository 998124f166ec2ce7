//! Backend adapter protocol
//!
//! Every storage backend implements [`ReplicationAdapter`]: translate the
//! neutral intent, render the backend object, apply it, observe status.
//! Adapters consume a [`ReplicationIntent`] built from either CRD revision so
//! they never see revision-specific types.

mod base;
mod ceph;
mod dell;
pub mod registry;
mod status;
mod transitions;
mod trident;

pub use base::{
    run_recovery_ladder, AdapterMetrics, BaseAdapter, MetricsSnapshot, RecoveryOutcome,
    StatusCache,
};
pub use ceph::CephAdapter;
pub use dell::DellAdapter;
pub use status::{compose_status, CompositeStatus};
pub use transitions::{
    PendingTransition, TransitionPoll, TransitionTracker, DEFAULT_STATE_TRANSITION_TIMEOUT,
    MAX_STATE_TRANSITION_RETRIES, STATE_TRANSITION_RETRY_INTERVAL,
};
pub use trident::TridentAdapter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::{
    Extensions, ReplicationMode, ReplicationState, ScheduleMode, UnifiedVolumeReplication,
    VolumeGroupReplication, VolumeReplication, VolumeReplicationState,
};
use crate::error::{BackendError, Error, ErrorKind, Result};
use crate::translation::Backend;

/// Name the operator identifies itself as: label values and the server-side
/// apply field owner.
pub const OPERATOR_NAME: &str = "unified-replication-operator";
pub const FIELD_OWNER: &str = "unified-replication-operator";

/// Label stamped on every adapter-owned backend object.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const NEUTRAL_NAME_LABEL: &str = "unified-replication.io/name";
/// Label linking a group's child objects back to the group.
pub const GROUP_LABEL: &str = "unified-replication.io/group";

/// Optional capabilities an adapter may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterFeature {
    Promote,
    Demote,
    Resync,
    Pause,
    Resume,
    Failover,
    Failback,
    GroupReplication,
    AutoResync,
}

/// Identity of the neutral resource, for owner references on backend objects.
#[derive(Clone, Debug)]
pub struct OwnerInfo {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Backend-neutral desired state, distilled from either CRD revision.
#[derive(Clone, Debug)]
pub struct ReplicationIntent {
    pub name: String,
    pub namespace: String,
    pub owner: OwnerInfo,
    /// Desired role in the neutral three-state vocabulary
    pub state: VolumeReplicationState,
    /// Rich six-state value, when the intent came from the legacy revision;
    /// drives the transient-transition tracker
    pub rich_state: Option<ReplicationState>,
    pub mode: ReplicationMode,
    pub schedule_mode: ScheduleMode,
    pub rpo: Option<String>,
    pub rto: Option<String>,
    /// Participating PVCs; a single entry for non-group intents
    pub pvc_names: Vec<String>,
    /// Storage class backing the source volume, when the revision carries one
    pub storage_class: Option<String>,
    /// Destination volume handle, when the revision carries one
    pub remote_volume_handle: Option<String>,
    pub auto_resync: bool,
    /// Legacy per-backend hints
    pub extensions: Option<Extensions>,
}

impl ReplicationIntent {
    pub fn from_unified(uvr: &UnifiedVolumeReplication) -> Self {
        use crate::crd::convert::rich_state_to_lean;
        Self {
            name: uvr.name_any(),
            namespace: uvr.namespace().unwrap_or_else(|| "default".to_string()),
            owner: OwnerInfo {
                api_version: UnifiedVolumeReplication::api_version(&()).to_string(),
                kind: UnifiedVolumeReplication::kind(&()).to_string(),
                name: uvr.name_any(),
                uid: uvr.meta().uid.clone().unwrap_or_default(),
            },
            state: rich_state_to_lean(uvr.spec.replication_state),
            rich_state: Some(uvr.spec.replication_state),
            mode: uvr.spec.replication_mode,
            schedule_mode: uvr.spec.schedule.mode,
            rpo: uvr.spec.schedule.rpo.clone(),
            rto: uvr.spec.schedule.rto.clone(),
            pvc_names: vec![uvr.spec.volume_mapping.source.pvc_name.clone()],
            storage_class: Some(uvr.spec.source_endpoint.storage_class.clone()),
            remote_volume_handle: Some(uvr.spec.volume_mapping.destination.volume_handle.clone()),
            auto_resync: uvr.spec.replication_state == ReplicationState::Failed,
            extensions: uvr.spec.extensions.clone(),
        }
    }

    pub fn from_volume_replication(vr: &VolumeReplication) -> Self {
        Self {
            name: vr.name_any(),
            namespace: vr.namespace().unwrap_or_else(|| "default".to_string()),
            owner: OwnerInfo {
                api_version: VolumeReplication::api_version(&()).to_string(),
                kind: VolumeReplication::kind(&()).to_string(),
                name: vr.name_any(),
                uid: vr.meta().uid.clone().unwrap_or_default(),
            },
            state: vr.spec.replication_state,
            rich_state: None,
            mode: ReplicationMode::Asynchronous,
            schedule_mode: ScheduleMode::Continuous,
            rpo: None,
            rto: None,
            pvc_names: vec![vr.spec.pvc_name.clone()],
            storage_class: None,
            remote_volume_handle: None,
            auto_resync: vr.spec.auto_resync.unwrap_or(false),
            extensions: None,
        }
    }

    /// Group intents carry the PVC set the reconciler resolved from the
    /// group's selector.
    pub fn from_group(vgr: &VolumeGroupReplication, pvc_names: Vec<String>) -> Self {
        Self {
            name: vgr.name_any(),
            namespace: vgr.namespace().unwrap_or_else(|| "default".to_string()),
            owner: OwnerInfo {
                api_version: VolumeGroupReplication::api_version(&()).to_string(),
                kind: VolumeGroupReplication::kind(&()).to_string(),
                name: vgr.name_any(),
                uid: vgr.meta().uid.clone().unwrap_or_default(),
            },
            state: vgr.spec.replication_state,
            rich_state: None,
            mode: ReplicationMode::Asynchronous,
            schedule_mode: ScheduleMode::Continuous,
            rpo: None,
            rto: None,
            pvc_names,
            storage_class: None,
            remote_volume_handle: None,
            auto_resync: vgr.spec.auto_resync.unwrap_or(false),
            extensions: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.pvc_names.len() > 1 || self.owner.kind == "VolumeGroupReplication"
    }

    /// `namespace/name`, the identity used in errors and the transition map.
    pub fn object_ref(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Controller owner-reference pointing back at the neutral resource.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.owner.api_version.clone(),
            kind: self.owner.kind.clone(),
            name: self.owner.name.clone(),
            uid: self.owner.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Labels stamped on every backend object this intent produces.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string());
        labels.insert(NEUTRAL_NAME_LABEL.to_string(), self.name.clone());
        labels
    }
}

/// What a reconcile pass decided about requeueing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// `None` when converged; watches re-trigger as needed
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn converged() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

/// View of a replication class, shared by the single and group class kinds.
#[derive(Clone, Debug, Default)]
pub struct ReplicationClassView {
    pub name: String,
    pub provisioner: String,
    pub parameters: BTreeMap<String, String>,
}

impl ReplicationClassView {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Fetch a parameter the adapter cannot operate without.
    pub fn required_param(&self, backend: Backend, key: &str) -> Result<&str> {
        self.param(key).ok_or_else(|| {
            Error::BackendError(
                BackendError::new(
                    ErrorKind::Configuration,
                    backend,
                    "reconcile",
                    &self.name,
                    format!("class parameter '{}' is required", key),
                )
                .with_remediation(format!(
                    "set parameters.{} on the replication class '{}'",
                    key, self.name
                )),
            )
        })
    }
}

/// The adapter protocol. One implementation per backend; `Arc<dyn>` values
/// are produced by the registry.
#[async_trait]
pub trait ReplicationAdapter: Send + Sync {
    fn backend(&self) -> Backend;
    fn features(&self) -> &'static [AdapterFeature];
    fn supported_states(&self) -> &'static [VolumeReplicationState] {
        &VolumeReplicationState::ALL
    }
    fn supported_modes(&self) -> &'static [ReplicationMode] {
        &[ReplicationMode::Synchronous, ReplicationMode::Asynchronous]
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
    fn healthy(&self) -> bool {
        true
    }

    /// The adapter's transient-transition tracker, when it keeps one.
    fn transitions(&self) -> Option<&TransitionTracker> {
        None
    }

    /// Converge the backend toward the intent. Idempotent: the backend
    /// object may be absent, stale, or already current.
    async fn reconcile(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome>;

    /// Remove the backend object. Idempotent: not-found is success.
    async fn delete(&self, intent: &ReplicationIntent) -> Result<()>;

    /// Observe the backend object's status. Pure read; may be served from a
    /// short-TTL cache.
    async fn status(&self, intent: &ReplicationIntent) -> Result<CompositeStatus>;

    // Derived verbs: each reduces to a desired-state update guarded by the
    // transition graph when the intent carries a rich state.

    async fn promote_replica(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        self.drive_to(intent, class, VolumeReplicationState::Primary, ReplicationState::Promoting)
            .await
    }

    async fn demote_source(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        self.drive_to(intent, class, VolumeReplicationState::Secondary, ReplicationState::Demoting)
            .await
    }

    async fn resync(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        self.drive_to(intent, class, VolumeReplicationState::Resync, ReplicationState::Syncing)
            .await
    }

    /// Failover: force-promote this side. Unlike promote, legal from `failed`.
    async fn failover(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        let mut desired = intent.clone();
        desired.state = VolumeReplicationState::Primary;
        self.reconcile(&desired, class).await
    }

    /// Failback: return to the replica role and resynchronize.
    async fn failback(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        let mut desired = intent.clone();
        desired.state = VolumeReplicationState::Secondary;
        desired.auto_resync = true;
        self.reconcile(&desired, class).await
    }

    /// Recovery ladder for an Unhealthy observed status. Adapters override
    /// this with [`base::run_recovery_ladder`] over their own base.
    async fn recover(
        &self,
        intent: &ReplicationIntent,
        _class: Option<&ReplicationClassView>,
    ) -> Result<RecoveryOutcome> {
        Err(self.unsupported_verb(intent, "recover"))
    }

    async fn pause(
        &self,
        intent: &ReplicationIntent,
        _class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        Err(self.unsupported_verb(intent, "pause"))
    }

    async fn resume(
        &self,
        intent: &ReplicationIntent,
        _class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        Err(self.unsupported_verb(intent, "resume"))
    }

    /// Shared reduction for the graph-guarded verbs.
    async fn drive_to(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
        target: VolumeReplicationState,
        via: ReplicationState,
    ) -> Result<ReconcileOutcome> {
        if let Some(from) = intent.rich_state {
            if !from.can_transition_to(via) {
                return Err(Error::ValidationError(format!(
                    "invalid state transition from '{}' to '{}'",
                    from, via
                )));
            }
        }
        let mut desired = intent.clone();
        desired.state = target;
        desired.rich_state = intent.rich_state.map(|_| via);
        self.reconcile(&desired, class).await
    }

    fn unsupported_verb(&self, intent: &ReplicationIntent, verb: &str) -> Error {
        Error::BackendError(BackendError::new(
            ErrorKind::Operation,
            self.backend(),
            verb,
            intent.object_ref(),
            format!("{} is not supported by the {} backend", verb, self.backend()),
        ))
    }
}

/// The backend object types the adapters program, for controller watches.
pub fn owned_backend_resources() -> Vec<kube::discovery::ApiResource> {
    vec![
        ceph::volume_replication_resource(),
        trident::mirror_resource(),
        dell::replication_group_resource(),
    ]
}

/// Record a transient rich-state intent in `tracker`. Returns whether a
/// transition is now pending (the caller requeues at the poll interval).
/// Settled intents clear any stale entry instead.
pub(crate) fn track_transient(
    tracker: &TransitionTracker,
    intent: &ReplicationIntent,
) -> Result<bool> {
    let Some(rich) = intent.rich_state else {
        return Ok(false);
    };
    if !rich.is_transient() {
        tracker.clear(&intent.namespace, &intent.name);
        return Ok(false);
    }
    let to = match rich {
        ReplicationState::Promoting => ReplicationState::Source,
        ReplicationState::Demoting => ReplicationState::Replica,
        ReplicationState::Syncing => match intent.state {
            VolumeReplicationState::Primary => ReplicationState::Source,
            _ => ReplicationState::Replica,
        },
        _ => unreachable!("settled states are filtered above"),
    };
    tracker.begin(&intent.namespace, &intent.name, rich, to)?;
    Ok(true)
}

/// Shared dependencies handed to adapter factories.
#[derive(Clone)]
pub struct AdapterDeps {
    pub client: kube::Client,
    pub config: crate::config::AdapterConfig,
}

/// Constructs adapter instances; implementations self-register with the
/// global registry at process start.
pub trait AdapterFactory: Send + Sync {
    fn backend(&self) -> Backend;
    fn create(&self, deps: AdapterDeps) -> Result<Arc<dyn ReplicationAdapter>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::*;

    fn lean_vr(state: VolumeReplicationState) -> VolumeReplication {
        let mut vr = VolumeReplication::new(
            "db",
            VolumeReplicationSpec {
                volume_replication_class: "rbd-async".into(),
                pvc_name: "app-data".into(),
                replication_state: state,
                data_source: None,
                auto_resync: Some(true),
            },
        );
        vr.metadata.namespace = Some("default".into());
        vr.metadata.uid = Some("uid-1".into());
        vr
    }

    #[test]
    fn intent_from_lean_resource() {
        let intent = ReplicationIntent::from_volume_replication(&lean_vr(
            VolumeReplicationState::Primary,
        ));
        assert_eq!(intent.name, "db");
        assert_eq!(intent.namespace, "default");
        assert_eq!(intent.state, VolumeReplicationState::Primary);
        assert_eq!(intent.rich_state, None);
        assert_eq!(intent.pvc_names, vec!["app-data".to_string()]);
        assert!(intent.auto_resync);
        assert!(!intent.is_group());
        assert_eq!(intent.object_ref(), "default/db");

        let owner = intent.owner_reference();
        assert_eq!(owner.kind, "VolumeReplication");
        assert_eq!(owner.api_version, "replication.unified.io/v1alpha2");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn intent_labels_carry_operator_identity() {
        let intent = ReplicationIntent::from_volume_replication(&lean_vr(
            VolumeReplicationState::Secondary,
        ));
        let labels = intent.labels();
        assert_eq!(labels[MANAGED_BY_LABEL], OPERATOR_NAME);
        assert_eq!(labels[NEUTRAL_NAME_LABEL], "db");
    }

    #[test]
    fn required_param_is_a_configuration_error() {
        let class = ReplicationClassView {
            name: "ps-class".into(),
            provisioner: "csi-powerstore.dellemc.com".into(),
            parameters: BTreeMap::new(),
        };
        let err = class
            .required_param(Backend::Dell, "protectionPolicy")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("protectionPolicy"));
    }
}
