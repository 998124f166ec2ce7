//! Custom Resource Definitions for the unified replication operator
//!
//! Two revisions of the `replication.unified.io` group coexist for a
//! deprecation window: the rich legacy shape (v1alpha1) and the lean
//! standards-aligned shape (v1alpha2).

pub mod convert;
mod types;
mod v1alpha1;
mod v1alpha2;

pub use types::{is_dns1123_subdomain, parse_duration, Condition, Health};
pub use v1alpha1::{
    CephExtension, DestinationVolume, Endpoint, Extensions, MirroringMode, PowerstoreExtension,
    ReplicationMode, ReplicationState, Schedule, ScheduleMode, SourceVolume, TridentExtension,
    UnifiedVolumeReplication, UnifiedVolumeReplicationSpec, UnifiedVolumeReplicationStatus,
    VolumeMapping,
};
pub use v1alpha2::{
    PvcSelector, TypedLocalObjectReference, VolumeGroupReplication, VolumeGroupReplicationClass,
    VolumeGroupReplicationClassSpec, VolumeGroupReplicationSpec, VolumeReplication,
    VolumeReplicationClass, VolumeReplicationClassSpec, VolumeReplicationSpec,
    VolumeReplicationState, VolumeReplicationStatus,
};
