//! Synchronous admission validation for the rich revision
//!
//! Pure functions: they inspect the candidate object (and, for uniqueness,
//! a caller-supplied list of existing siblings) and never mutate state. The
//! webhook invokes them in the admission path; the same checks guard unit
//! tests and the CLI.

use kube::ResourceExt;
use tracing::info;

use crate::crd::{
    is_dns1123_subdomain, parse_duration, Endpoint, UnifiedVolumeReplication,
    UnifiedVolumeReplicationSpec,
};
use crate::error::{Error, Result};

/// Tokens rejected in every free-form string field. Catches the common
/// script-injection and path-traversal shapes before they can reach a
/// backend object or a shell-adjacent surface.
const FORBIDDEN_TOKENS: &[&str] = &[
    "../", "..\\", "<script", "javascript:", "$(", "`", ";", "&&", "||", "\n", "\r", "\0",
];

/// Result of one validation pass: warnings surfaced to the client even on
/// success, and the first hard failure if any.
pub type Validation = (Vec<String>, Result<()>);

/// Validate a new resource against the structural, cross-field and
/// uniqueness rules. `siblings` is the set of existing resources in the same
/// namespace (the webhook lists them; tests pass slices).
pub fn validate_create(
    obj: &UnifiedVolumeReplication,
    siblings: &[UnifiedVolumeReplication],
) -> Validation {
    let mut warnings = Vec::new();
    let result = validate_create_inner(obj, siblings, &mut warnings);
    audit("create", obj, &result);
    (warnings, result)
}

/// Validate an update: all create-time rules minus uniqueness (the mapping
/// cannot change), plus immutability and the state-transition graph.
pub fn validate_update(
    old: &UnifiedVolumeReplication,
    new: &UnifiedVolumeReplication,
) -> Validation {
    let mut warnings = Vec::new();
    let result = validate_structure(&new.spec)
        .and_then(|()| validate_cross_field(new, &mut warnings))
        .and_then(|()| validate_immutable(&old.spec, &new.spec))
        .and_then(|()| validate_transition(&old.spec, &new.spec));
    audit("update", new, &result);
    (warnings, result)
}

/// Deletion is always admitted; cleanup ordering is the finalizer's job.
pub fn validate_delete(obj: &UnifiedVolumeReplication) -> Validation {
    let result = Ok(());
    audit("delete", obj, &result);
    (Vec::new(), result)
}

fn validate_create_inner(
    obj: &UnifiedVolumeReplication,
    siblings: &[UnifiedVolumeReplication],
    warnings: &mut Vec<String>,
) -> Result<()> {
    validate_structure(&obj.spec)?;
    validate_cross_field(obj, warnings)?;
    validate_uniqueness(obj, siblings)?;
    Ok(())
}

fn validate_structure(spec: &UnifiedVolumeReplicationSpec) -> Result<()> {
    for (field, value) in [
        ("sourceEndpoint.cluster", &spec.source_endpoint.cluster),
        ("sourceEndpoint.region", &spec.source_endpoint.region),
        (
            "sourceEndpoint.storageClass",
            &spec.source_endpoint.storage_class,
        ),
        (
            "destinationEndpoint.cluster",
            &spec.destination_endpoint.cluster,
        ),
        (
            "destinationEndpoint.region",
            &spec.destination_endpoint.region,
        ),
        (
            "destinationEndpoint.storageClass",
            &spec.destination_endpoint.storage_class,
        ),
        (
            "volumeMapping.source.pvcName",
            &spec.volume_mapping.source.pvc_name,
        ),
        (
            "volumeMapping.source.namespace",
            &spec.volume_mapping.source.namespace,
        ),
        (
            "volumeMapping.destination.volumeHandle",
            &spec.volume_mapping.destination.volume_handle,
        ),
        (
            "volumeMapping.destination.namespace",
            &spec.volume_mapping.destination.namespace,
        ),
    ] {
        if value.trim().is_empty() {
            return Err(Error::ValidationError(format!("{} must not be empty", field)));
        }
    }

    for (field, value) in [("schedule.rpo", &spec.schedule.rpo), ("schedule.rto", &spec.schedule.rto)] {
        if let Some(raw) = value {
            if parse_duration(raw).is_none() {
                return Err(Error::ValidationError(format!(
                    "{} '{}' is not a valid duration (expected <number><ms|s|m|h>)",
                    field, raw
                )));
            }
        }
    }

    Ok(())
}

fn validate_cross_field(
    obj: &UnifiedVolumeReplication,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let name = obj.name_any();
    if name.len() > 63 {
        return Err(Error::ValidationError(format!(
            "name '{}' exceeds 63 characters",
            name
        )));
    }
    if !is_dns1123_subdomain(&name) {
        return Err(Error::ValidationError(format!(
            "name '{}' is not a DNS-1123 subdomain",
            name
        )));
    }

    let spec = &obj.spec;
    if endpoints_identical(&spec.source_endpoint, &spec.destination_endpoint) {
        return Err(Error::ValidationError(
            "sourceEndpoint and destinationEndpoint are identical; a volume cannot replicate to itself"
                .to_string(),
        ));
    }

    for (field, value) in free_form_fields(spec) {
        if let Some(token) = FORBIDDEN_TOKENS.iter().find(|t| value.contains(**t)) {
            return Err(Error::ValidationError(format!(
                "{} contains forbidden sequence {:?}",
                field, token
            )));
        }
    }

    if let (Some(rpo), Some(rto)) = (&spec.schedule.rpo, &spec.schedule.rto) {
        // No ordering invariant between the two, but a RTO shorter than the
        // RPO is usually a typo worth flagging.
        if parse_duration(rto) < parse_duration(rpo) {
            warnings.push(format!(
                "schedule.rto '{}' is shorter than schedule.rpo '{}'",
                rto, rpo
            ));
        }
    }

    Ok(())
}

fn endpoints_identical(a: &Endpoint, b: &Endpoint) -> bool {
    a.cluster == b.cluster && a.region == b.region && a.storage_class == b.storage_class
}

fn free_form_fields(spec: &UnifiedVolumeReplicationSpec) -> Vec<(&'static str, &str)> {
    vec![
        ("sourceEndpoint.cluster", spec.source_endpoint.cluster.as_str()),
        ("sourceEndpoint.region", spec.source_endpoint.region.as_str()),
        (
            "sourceEndpoint.storageClass",
            spec.source_endpoint.storage_class.as_str(),
        ),
        (
            "destinationEndpoint.cluster",
            spec.destination_endpoint.cluster.as_str(),
        ),
        (
            "destinationEndpoint.region",
            spec.destination_endpoint.region.as_str(),
        ),
        (
            "destinationEndpoint.storageClass",
            spec.destination_endpoint.storage_class.as_str(),
        ),
        (
            "volumeMapping.source.pvcName",
            spec.volume_mapping.source.pvc_name.as_str(),
        ),
        (
            "volumeMapping.source.namespace",
            spec.volume_mapping.source.namespace.as_str(),
        ),
        (
            "volumeMapping.destination.volumeHandle",
            spec.volume_mapping.destination.volume_handle.as_str(),
        ),
        (
            "volumeMapping.destination.namespace",
            spec.volume_mapping.destination.namespace.as_str(),
        ),
    ]
}

/// A given (namespace, source PVC) pair may be referenced by at most one
/// resource. Linear scan of the caller-supplied siblings.
fn validate_uniqueness(
    obj: &UnifiedVolumeReplication,
    siblings: &[UnifiedVolumeReplication],
) -> Result<()> {
    let pvc = &obj.spec.volume_mapping.source;
    for other in siblings {
        if other.name_any() == obj.name_any() {
            continue;
        }
        let other_pvc = &other.spec.volume_mapping.source;
        if other_pvc.pvc_name == pvc.pvc_name && other_pvc.namespace == pvc.namespace {
            return Err(Error::ValidationError(format!(
                "PVC '{}/{}' is already replicated by '{}'",
                pvc.namespace,
                pvc.pvc_name,
                other.name_any()
            )));
        }
    }
    Ok(())
}

fn validate_immutable(
    old: &UnifiedVolumeReplicationSpec,
    new: &UnifiedVolumeReplicationSpec,
) -> Result<()> {
    if old.volume_mapping.source.pvc_name != new.volume_mapping.source.pvc_name {
        return Err(Error::ValidationError(
            "volumeMapping.source.pvcName is immutable".to_string(),
        ));
    }
    if old.volume_mapping.source.namespace != new.volume_mapping.source.namespace {
        return Err(Error::ValidationError(
            "volumeMapping.source.namespace is immutable".to_string(),
        ));
    }
    if old.volume_mapping.destination.volume_handle != new.volume_mapping.destination.volume_handle
    {
        return Err(Error::ValidationError(
            "volumeMapping.destination.volumeHandle is immutable".to_string(),
        ));
    }
    if old.source_endpoint != new.source_endpoint {
        return Err(Error::ValidationError(
            "sourceEndpoint is immutable".to_string(),
        ));
    }
    if old.destination_endpoint != new.destination_endpoint {
        return Err(Error::ValidationError(
            "destinationEndpoint is immutable".to_string(),
        ));
    }
    Ok(())
}

fn validate_transition(
    old: &UnifiedVolumeReplicationSpec,
    new: &UnifiedVolumeReplicationSpec,
) -> Result<()> {
    let (from, to) = (old.replication_state, new.replication_state);
    if !from.can_transition_to(to) {
        return Err(Error::ValidationError(format!(
            "invalid state transition from '{}' to '{}'",
            from, to
        )));
    }
    Ok(())
}

/// One audit record per admitted and per rejected operation.
fn audit(op: &str, obj: &UnifiedVolumeReplication, result: &Result<()>) {
    match result {
        Ok(()) => info!(
            target: "audit",
            operation = op,
            namespace = %obj.namespace().unwrap_or_default(),
            name = %obj.name_any(),
            admitted = true,
            "admission decision"
        ),
        Err(e) => info!(
            target: "audit",
            operation = op,
            namespace = %obj.namespace().unwrap_or_default(),
            name = %obj.name_any(),
            admitted = false,
            reason = %e,
            "admission decision"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::*;

    fn sample(name: &str, pvc: &str, state: ReplicationState) -> UnifiedVolumeReplication {
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
                    pvc_name: pvc.into(),
                    namespace: "default".into(),
                },
                destination: DestinationVolume {
                    volume_handle: "vol-1234".into(),
                    namespace: "default".into(),
                },
            },
            replication_state: state,
            replication_mode: ReplicationMode::Asynchronous,
            schedule: Schedule {
                mode: ScheduleMode::Interval,
                rpo: Some("15m".into()),
                rto: Some("1h".into()),
            },
            extensions: None,
        };
        let mut obj = UnifiedVolumeReplication::new(name, spec);
        obj.metadata.namespace = Some("default".into());
        obj
    }

    #[test]
    fn valid_create_is_admitted() {
        let obj = sample("db", "app-data", ReplicationState::Source);
        let (warnings, result) = validate_create(&obj, &[]);
        assert!(result.is_ok());
        assert!(warnings.is_empty());
    }

    #[test]
    fn validate_create_is_pure_and_repeatable() {
        let obj = sample("db", "app-data", ReplicationState::Source);
        let before = serde_json::to_value(&obj).unwrap();
        let first = validate_create(&obj, &[]);
        let second = validate_create(&obj, &[]);
        assert_eq!(first.1.is_ok(), second.1.is_ok());
        assert_eq!(first.0, second.0);
        assert_eq!(serde_json::to_value(&obj).unwrap(), before);
    }

    #[test]
    fn identical_endpoints_are_rejected() {
        let mut obj = sample("db", "app-data", ReplicationState::Source);
        obj.spec.destination_endpoint = obj.spec.source_endpoint.clone();
        let (_, result) = validate_create(&obj, &[]);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("identical"), "unexpected error: {}", err);
    }

    #[test]
    fn differing_on_one_endpoint_field_is_enough() {
        let mut obj = sample("db", "app-data", ReplicationState::Source);
        obj.spec.destination_endpoint = obj.spec.source_endpoint.clone();
        obj.spec.destination_endpoint.region = "us-west-2".into();
        let (_, result) = validate_create(&obj, &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn injection_tokens_are_rejected() {
        for bad in ["../../etc/passwd", "pvc;rm -rf /", "a`whoami`", "x$(id)", "<script>alert(1)</script>"] {
            let mut obj = sample("db", "app-data", ReplicationState::Source);
            obj.spec.volume_mapping.destination.volume_handle = bad.into();
            let (_, result) = validate_create(&obj, &[]);
            assert!(result.is_err(), "'{}' should be rejected", bad);
        }
    }

    #[test]
    fn bad_duration_is_rejected() {
        let mut obj = sample("db", "app-data", ReplicationState::Source);
        obj.spec.schedule.rpo = Some("15minutes".into());
        let (_, result) = validate_create(&obj, &[]);
        assert!(result.unwrap_err().to_string().contains("schedule.rpo"));
    }

    #[test]
    fn long_name_is_rejected() {
        let name = "a".repeat(64);
        let obj = sample(&name, "app-data", ReplicationState::Source);
        let (_, result) = validate_create(&obj, &[]);
        assert!(result.unwrap_err().to_string().contains("63"));
    }

    #[test]
    fn duplicate_pvc_reference_names_the_existing_owner() {
        let existing = sample("db-primary", "app-data", ReplicationState::Source);
        let duplicate = sample("db-copy", "app-data", ReplicationState::Source);
        let (_, result) = validate_create(&duplicate, &[existing]);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("db-primary"), "unexpected error: {}", err);
        assert!(err.contains("app-data"));
    }

    #[test]
    fn same_pvc_in_other_namespace_is_allowed() {
        let mut existing = sample("db-primary", "app-data", ReplicationState::Source);
        existing.spec.volume_mapping.source.namespace = "other".into();
        let obj = sample("db-copy", "app-data", ReplicationState::Source);
        let (_, result) = validate_create(&obj, &[existing]);
        assert!(result.is_ok());
    }

    #[test]
    fn illegal_transition_names_both_states() {
        let old = sample("db", "app-data", ReplicationState::Source);
        let new = sample("db", "app-data", ReplicationState::Promoting);
        let (_, result) = validate_update(&old, &new);
        let err = result.unwrap_err().to_string();
        assert!(
            err.contains("invalid state transition from 'source' to 'promoting'"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn every_edge_outside_the_graph_is_rejected() {
        for from in ReplicationState::ALL {
            for to in ReplicationState::ALL {
                let old = sample("db", "app-data", from);
                let new = sample("db", "app-data", to);
                let (_, result) = validate_update(&old, &new);
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{} -> {} should be legal", from, to);
                } else {
                    let err = result.unwrap_err().to_string();
                    assert!(err.contains(from.as_str()) && err.contains(to.as_str()));
                }
            }
        }
    }

    #[test]
    fn immutable_pvc_name_change_is_rejected() {
        let old = sample("db", "a", ReplicationState::Source);
        let new = sample("db", "b", ReplicationState::Source);
        let (_, result) = validate_update(&old, &new);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("volumeMapping.source.pvcName is immutable"));
    }

    #[test]
    fn immutable_endpoint_change_is_rejected() {
        let old = sample("db", "app-data", ReplicationState::Source);
        let mut new = sample("db", "app-data", ReplicationState::Source);
        new.spec.destination_endpoint.cluster = "dr-site".into();
        let (_, result) = validate_update(&old, &new);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("destinationEndpoint is immutable"));
    }

    #[test]
    fn mutable_fields_may_change() {
        let old = sample("db", "app-data", ReplicationState::Source);
        let mut new = sample("db", "app-data", ReplicationState::Syncing);
        new.spec.schedule.rpo = Some("5m".into());
        new.spec.replication_mode = ReplicationMode::Synchronous;
        let (_, result) = validate_update(&old, &new);
        assert!(result.is_ok());
    }

    #[test]
    fn short_rto_warns_but_admits() {
        let mut obj = sample("db", "app-data", ReplicationState::Source);
        obj.spec.schedule.rpo = Some("1h".into());
        obj.spec.schedule.rto = Some("5m".into());
        let (warnings, result) = validate_create(&obj, &[]);
        assert!(result.is_ok());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn delete_is_always_admitted() {
        let obj = sample("db", "app-data", ReplicationState::Failed);
        let (warnings, result) = validate_delete(&obj);
        assert!(result.is_ok());
        assert!(warnings.is_empty());
    }
}
