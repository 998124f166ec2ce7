//! `replication.unified.io/v1alpha1` — the rich legacy revision
//!
//! A single backend-neutral resource carrying endpoints, a volume mapping, a
//! six-state replication lifecycle and optional per-backend extension hints.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, Health};

/// Desired replication intent, expressed independently of any backend.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha1",
    kind = "UnifiedVolumeReplication",
    plural = "unifiedvolumereplications",
    shortname = "uvr",
    namespaced,
    status = "UnifiedVolumeReplicationStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.replicationState"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.replicationMode"}"#,
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationSpec {
    /// Where the volume currently lives
    pub source_endpoint: Endpoint,
    /// Where the replica is maintained
    pub destination_endpoint: Endpoint,
    /// The PVC being replicated and its remote counterpart
    pub volume_mapping: VolumeMapping,
    /// Desired replication role for this side
    pub replication_state: ReplicationState,
    /// Consistency model the backend should provide
    pub replication_mode: ReplicationMode,
    /// When and how often the backend synchronizes
    pub schedule: Schedule,
    /// Backend-specific hints; at most one sub-object is meaningful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// One side of a replication relationship
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Cluster identifier (e.g. "prod-east")
    pub cluster: String,
    /// Region or failure domain
    pub region: String,
    /// Storage class backing the volume on this side
    pub storage_class: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    pub source: SourceVolume,
    pub destination: DestinationVolume,
}

/// The local PVC being replicated. Immutable after creation.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceVolume {
    pub pvc_name: String,
    pub namespace: String,
}

/// The remote volume the backend replicates into.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationVolume {
    /// Backend-opaque handle of the destination volume. Immutable.
    pub volume_handle: String,
    pub namespace: String,
}

/// Six-state lifecycle of the rich revision.
///
/// `promoting`, `demoting` and `syncing` are transient: the controller tracks
/// them until the backend confirms the observed state.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    Source,
    Replica,
    Promoting,
    Demoting,
    Syncing,
    Failed,
}

impl ReplicationState {
    pub const ALL: [ReplicationState; 6] = [
        ReplicationState::Source,
        ReplicationState::Replica,
        ReplicationState::Promoting,
        ReplicationState::Demoting,
        ReplicationState::Syncing,
        ReplicationState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Source => "source",
            ReplicationState::Replica => "replica",
            ReplicationState::Promoting => "promoting",
            ReplicationState::Demoting => "demoting",
            ReplicationState::Syncing => "syncing",
            ReplicationState::Failed => "failed",
        }
    }

    /// States reachable from this one. Reflexive edges are always legal and
    /// not listed here.
    pub fn allowed_transitions(&self) -> &'static [ReplicationState] {
        use ReplicationState::*;
        match self {
            Source => &[Demoting, Syncing, Failed],
            Replica => &[Promoting, Syncing, Failed],
            Promoting => &[Source, Failed],
            Demoting => &[Replica, Failed],
            Syncing => &[Source, Replica, Failed],
            Failed => &[Syncing, Source, Replica],
        }
    }

    pub fn can_transition_to(&self, to: ReplicationState) -> bool {
        *self == to || self.allowed_transitions().contains(&to)
    }

    /// Whether the controller must track this state until the backend
    /// confirms it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationState::Promoting | ReplicationState::Demoting | ReplicationState::Syncing
        )
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Synchronous,
    Asynchronous,
    Eventual,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub mode: ScheduleMode,
    /// Recovery point objective, `\d+(ms|s|m|h)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpo: Option<String>,
    /// Recovery time objective, `\d+(ms|s|m|h)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rto: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Continuous,
    Interval,
    Manual,
}

/// Per-backend hints. The populated sub-object also selects the backend for
/// this revision.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceph: Option<CephExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trident: Option<TridentExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powerstore: Option<PowerstoreExtension>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephExtension {
    /// RBD mirroring flavor
    pub mirroring_mode: MirroringMode,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MirroringMode {
    Snapshot,
    Journal,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TridentExtension {
    /// Mirror actions to request, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PowerstoreExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpo_settings: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_groups: Vec<String>,
}

/// Observed state, owned exclusively by the reconciler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationStatus {
    /// Reverse-translated backend state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub health: Health,
    /// Coarse synchronization progress, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_progress: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sync_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_the_table() {
        use ReplicationState::*;
        assert!(Source.can_transition_to(Demoting));
        assert!(Source.can_transition_to(Syncing));
        assert!(Source.can_transition_to(Failed));
        assert!(!Source.can_transition_to(Promoting));
        assert!(!Source.can_transition_to(Replica));

        assert!(Replica.can_transition_to(Promoting));
        assert!(!Replica.can_transition_to(Demoting));
        assert!(!Replica.can_transition_to(Source));

        assert!(Promoting.can_transition_to(Source));
        assert!(!Promoting.can_transition_to(Replica));
        assert!(Demoting.can_transition_to(Replica));
        assert!(!Demoting.can_transition_to(Source));

        assert!(Syncing.can_transition_to(Source));
        assert!(Syncing.can_transition_to(Replica));
        assert!(Failed.can_transition_to(Syncing));
        assert!(!Failed.can_transition_to(Promoting));
    }

    #[test]
    fn reflexive_transitions_are_legal() {
        for state in ReplicationState::ALL {
            assert!(state.can_transition_to(state));
        }
    }

    #[test]
    fn states_serialize_lowercase() {
        let json = serde_json::to_string(&ReplicationState::Promoting).unwrap();
        assert_eq!(json, "\"promoting\"");
        let back: ReplicationState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ReplicationState::Failed);
    }

    #[test]
    fn spec_uses_camel_case_on_the_wire() {
        let spec = UnifiedVolumeReplicationSpec {
            source_endpoint: Endpoint {
                cluster: "prod-east".into(),
                region: "us-east-1".into(),
                storage_class: "ceph-rbd".into(),
            },
            destination_endpoint: Endpoint {
                cluster: "prod-west".into(),
                region: "us-west-2".into(),
                storage_class: "ceph-rbd".into(),
            },
            volume_mapping: VolumeMapping {
                source: SourceVolume {
                    pvc_name: "app-data".into(),
                    namespace: "default".into(),
                },
                destination: DestinationVolume {
                    volume_handle: "vol-1234".into(),
                    namespace: "default".into(),
                },
            },
            replication_state: ReplicationState::Source,
            replication_mode: ReplicationMode::Asynchronous,
            schedule: Schedule {
                mode: ScheduleMode::Interval,
                rpo: Some("15m".into()),
                rto: None,
            },
            extensions: None,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert!(value.get("sourceEndpoint").is_some());
        assert!(value.get("volumeMapping").is_some());
        assert_eq!(value["replicationState"], "source");
        assert_eq!(value["schedule"]["rpo"], "15m");
        // omitempty semantics: unset optionals are absent, not null
        assert!(value["schedule"].get("rto").is_none());
        assert!(value.get("extensions").is_none());
    }
}
