//! `replication.unified.io/v1alpha2` — the lean standards-aligned revision
//!
//! Wire format is kept field-for-field compatible with the upstream
//! kubernetes-csi-addons replication spec (names, JSON tags, omitempty
//! semantics) so a future pivot to that group is a rename, not a migration.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Cluster-scoped configuration naming the backend and its tunables.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha2",
    kind = "VolumeReplicationClass",
    plural = "volumereplicationclasses",
    shortname = "vrc"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationClassSpec {
    /// CSI driver that owns volumes of this class; selects the backend
    pub provisioner: String,
    /// Backend-tunable parameters, passed through to the adapter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Desired replication role of a single PVC.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha2",
    kind = "VolumeReplication",
    plural = "volumereplications",
    shortname = "vr",
    namespaced,
    status = "VolumeReplicationStatus",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.volumeReplicationClass"}"#,
    printcolumn = r#"{"name":"PVC","type":"string","jsonPath":".spec.pvcName"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.replicationState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationSpec {
    /// Name of the VolumeReplicationClass to use
    pub volume_replication_class: String,
    /// The PVC to replicate
    pub pvc_name: String,
    pub replication_state: VolumeReplicationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<TypedLocalObjectReference>,
    /// Automatically resync after a split, when the backend supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resync: Option<bool>,
}

/// Three-state lifecycle of the lean revision; also the operator's neutral
/// vocabulary for backend translation.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VolumeReplicationState {
    Primary,
    Secondary,
    Resync,
}

impl VolumeReplicationState {
    pub const ALL: [VolumeReplicationState; 3] = [
        VolumeReplicationState::Primary,
        VolumeReplicationState::Secondary,
        VolumeReplicationState::Resync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeReplicationState::Primary => "primary",
            VolumeReplicationState::Secondary => "secondary",
            VolumeReplicationState::Resync => "resync",
        }
    }
}

impl std::fmt::Display for VolumeReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mirror of core/v1 TypedLocalObjectReference, declared locally so the CRD
/// schema stays self-contained.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cluster-scoped configuration for group replication.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha2",
    kind = "VolumeGroupReplicationClass",
    plural = "volumegroupreplicationclasses",
    shortname = "vgrc"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupReplicationClassSpec {
    pub provisioner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Desired replication role of a set of PVCs, selected by label.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha2",
    kind = "VolumeGroupReplication",
    plural = "volumegroupreplications",
    shortname = "vgr",
    namespaced,
    status = "VolumeReplicationStatus",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.volumeGroupReplicationClass"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.replicationState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupReplicationSpec {
    pub volume_group_replication_class: String,
    /// Selects the PVCs participating in the group
    pub pvc_selector: PvcSelector,
    pub replication_state: VolumeReplicationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resync: Option<bool>,
}

/// Mirror of metav1 LabelSelector, declared locally for schema control.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
}

impl PvcSelector {
    /// Render as a list-params label selector string, e.g. `app=db,tier=data`.
    pub fn to_label_selector(&self) -> Option<String> {
        let labels = self.match_labels.as_ref()?;
        if labels.is_empty() {
            return None;
        }
        Some(
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lean_spec_wire_format_matches_upstream() {
        let spec = VolumeReplicationSpec {
            volume_replication_class: "ceph-rbd-async".into(),
            pvc_name: "app-data".into(),
            replication_state: VolumeReplicationState::Primary,
            data_source: Some(TypedLocalObjectReference {
                api_group: None,
                kind: "PersistentVolumeClaim".into(),
                name: "app-data".into(),
            }),
            auto_resync: None,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["volumeReplicationClass"], "ceph-rbd-async");
        assert_eq!(value["pvcName"], "app-data");
        assert_eq!(value["replicationState"], "primary");
        assert_eq!(value["dataSource"]["kind"], "PersistentVolumeClaim");
        // omitempty: absent, not null
        assert!(value.get("autoResync").is_none());
        assert!(value["dataSource"].get("apiGroup").is_none());
    }

    #[test]
    fn class_parameters_round_trip() {
        let yaml = r#"
provisioner: csi.trident.netapp.io
parameters:
  replicationPolicy: Async
  replicationSchedule: 15m
"#;
        let spec: VolumeReplicationClassSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.provisioner, "csi.trident.netapp.io");
        let params = spec.parameters.unwrap();
        assert_eq!(params["replicationPolicy"], "Async");
    }

    #[test]
    fn pvc_selector_renders_label_pairs() {
        let selector = PvcSelector {
            match_labels: Some(
                [("app".to_string(), "db".to_string())]
                    .into_iter()
                    .collect(),
            ),
        };
        assert_eq!(selector.to_label_selector().unwrap(), "app=db");
        assert!(PvcSelector::default().to_label_selector().is_none());
    }
}
