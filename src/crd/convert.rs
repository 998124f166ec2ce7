//! Conversion between the two API revisions
//!
//! The revisions are distinct entities; these functions map between them.
//! Rich-to-lean is lossy (endpoints and schedule have no lean counterpart),
//! lean-to-rich fills the dropped fields with neutral placeholders.

use kube::ResourceExt;

use super::v1alpha1::{ReplicationState, UnifiedVolumeReplication};
use super::v1alpha2::{
    TypedLocalObjectReference, VolumeReplication, VolumeReplicationSpec, VolumeReplicationState,
};

/// Map a rich six-value state onto the lean three-value vocabulary.
///
/// Transient states collapse onto their target role; `failed` maps to
/// `resync` so that re-applying the converted object drives recovery.
pub fn rich_state_to_lean(state: ReplicationState) -> VolumeReplicationState {
    match state {
        ReplicationState::Source | ReplicationState::Promoting => VolumeReplicationState::Primary,
        ReplicationState::Replica | ReplicationState::Demoting => VolumeReplicationState::Secondary,
        ReplicationState::Syncing | ReplicationState::Failed => VolumeReplicationState::Resync,
    }
}

/// Map a lean state back into the rich vocabulary (settled states only).
pub fn lean_state_to_rich(state: VolumeReplicationState) -> ReplicationState {
    match state {
        VolumeReplicationState::Primary => ReplicationState::Source,
        VolumeReplicationState::Secondary => ReplicationState::Replica,
        VolumeReplicationState::Resync => ReplicationState::Syncing,
    }
}

/// Produce the lean equivalent of a rich resource, referencing `class_name`.
pub fn unified_to_volume_replication(
    uvr: &UnifiedVolumeReplication,
    class_name: &str,
) -> VolumeReplication {
    let spec = VolumeReplicationSpec {
        volume_replication_class: class_name.to_string(),
        pvc_name: uvr.spec.volume_mapping.source.pvc_name.clone(),
        replication_state: rich_state_to_lean(uvr.spec.replication_state),
        data_source: Some(TypedLocalObjectReference {
            api_group: None,
            kind: "PersistentVolumeClaim".to_string(),
            name: uvr.spec.volume_mapping.source.pvc_name.clone(),
        }),
        auto_resync: match uvr.spec.replication_state {
            ReplicationState::Failed => Some(true),
            _ => None,
        },
    };

    let mut vr = VolumeReplication::new(&uvr.name_any(), spec);
    vr.metadata.namespace = uvr.namespace();
    vr
}
