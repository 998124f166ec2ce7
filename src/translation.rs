//! Bidirectional vocabulary mapping between the neutral replication model
//! and each backend's native strings.
//!
//! These are pure tables: no I/O, no context. The reverse direction accepts a
//! handful of off-spec values seen in the wild (e.g. Trident reporting
//! `promoted`) and classifies them instead of failing.

use crate::crd::{ReplicationMode, VolumeReplicationState};
use crate::error::{Error, Result};

/// Storage backend tag, used for adapter dispatch and translation lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Ceph,
    Trident,
    Dell,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Ceph, Backend::Trident, Backend::Dell];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Ceph => "ceph",
            Backend::Trident => "trident",
            Backend::Dell => "powerstore",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trident resync is kept distinct from secondary in the table via this
/// bookkeeping label. It never appears on the wire: [`normalize_backend_state`]
/// collapses it to `reestablished` before any object is written.
const TRIDENT_RESYNC_LABEL: &str = "reestablished-resync";

/// Translate a neutral replication state into the backend's vocabulary.
///
/// Ceph speaks the neutral vocabulary natively. Trident is state-oriented
/// (`established`/`reestablished`), Dell is action-oriented
/// (`Failover`/`Sync`/`Reprotect`).
pub fn state_to_backend(backend: Backend, state: VolumeReplicationState) -> Result<&'static str> {
    let s = match (backend, state) {
        (Backend::Ceph, VolumeReplicationState::Primary) => "primary",
        (Backend::Ceph, VolumeReplicationState::Secondary) => "secondary",
        (Backend::Ceph, VolumeReplicationState::Resync) => "resync",
        (Backend::Trident, VolumeReplicationState::Primary) => "established",
        (Backend::Trident, VolumeReplicationState::Secondary) => "reestablished",
        (Backend::Trident, VolumeReplicationState::Resync) => TRIDENT_RESYNC_LABEL,
        (Backend::Dell, VolumeReplicationState::Primary) => "Failover",
        (Backend::Dell, VolumeReplicationState::Secondary) => "Sync",
        (Backend::Dell, VolumeReplicationState::Resync) => "Reprotect",
    };
    Ok(s)
}

/// Translate a backend state string back into the neutral vocabulary.
///
/// Exact table entries first; then a substring classification for values a
/// backend may report that the table does not carry; unknown values error.
pub fn state_from_backend(backend: Backend, raw: &str) -> Result<VolumeReplicationState> {
    let exact = match (backend, raw) {
        (Backend::Ceph, "primary") => Some(VolumeReplicationState::Primary),
        (Backend::Ceph, "secondary") => Some(VolumeReplicationState::Secondary),
        (Backend::Ceph, "resync") => Some(VolumeReplicationState::Resync),
        (Backend::Trident, "established") => Some(VolumeReplicationState::Primary),
        (Backend::Trident, "reestablished") => Some(VolumeReplicationState::Secondary),
        (Backend::Trident, TRIDENT_RESYNC_LABEL) => Some(VolumeReplicationState::Resync),
        (Backend::Dell, "Failover") => Some(VolumeReplicationState::Primary),
        (Backend::Dell, "Sync") => Some(VolumeReplicationState::Secondary),
        (Backend::Dell, "Reprotect") => Some(VolumeReplicationState::Resync),
        _ => None,
    };
    if let Some(state) = exact {
        return Ok(state);
    }
    classify_state(raw).ok_or_else(|| {
        Error::TranslationError(format!(
            "unknown {} state '{}': not in the supported translation table",
            backend, raw
        ))
    })
}

/// Best-effort classification of an off-spec backend state string.
fn classify_state(raw: &str) -> Option<VolumeReplicationState> {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("promot") || lower.contains("primary") || lower.contains("failover") {
        Some(VolumeReplicationState::Primary)
    } else if lower.contains("demot") || lower.contains("secondary") {
        Some(VolumeReplicationState::Secondary)
    } else if lower.contains("resync") || lower.contains("reprotect") {
        Some(VolumeReplicationState::Resync)
    } else if lower.starts_with("reestablished") {
        // Extended bookkeeping labels (reestablished-promoting, ...)
        Some(VolumeReplicationState::Secondary)
    } else if lower.starts_with("established") {
        // established-replica, established-syncing, established-failed
        Some(VolumeReplicationState::Primary)
    } else {
        None
    }
}

/// Translate a neutral replication mode into the backend's vocabulary.
/// `eventual` has no backend-native equivalent and is written as the
/// asynchronous string.
pub fn mode_to_backend(backend: Backend, mode: ReplicationMode) -> Result<&'static str> {
    let s = match (backend, mode) {
        (Backend::Ceph, ReplicationMode::Synchronous) => "sync",
        (Backend::Ceph, ReplicationMode::Asynchronous | ReplicationMode::Eventual) => "async",
        (Backend::Trident, ReplicationMode::Synchronous) => "Sync",
        (Backend::Trident, ReplicationMode::Asynchronous | ReplicationMode::Eventual) => "Async",
        (Backend::Dell, ReplicationMode::Synchronous) => "Metro",
        (Backend::Dell, ReplicationMode::Asynchronous | ReplicationMode::Eventual) => "Async",
    };
    Ok(s)
}

pub fn mode_from_backend(backend: Backend, raw: &str) -> Result<ReplicationMode> {
    let mode = match (backend, raw) {
        (Backend::Ceph, "sync") => ReplicationMode::Synchronous,
        (Backend::Ceph, "async") => ReplicationMode::Asynchronous,
        (Backend::Trident, "Sync") => ReplicationMode::Synchronous,
        (Backend::Trident, "Async") => ReplicationMode::Asynchronous,
        (Backend::Dell, "Metro") => ReplicationMode::Synchronous,
        (Backend::Dell, "Async") => ReplicationMode::Asynchronous,
        _ => {
            return Err(Error::TranslationError(format!(
                "unknown {} mode '{}'",
                backend, raw
            )))
        }
    };
    Ok(mode)
}

/// Collapse bookkeeping labels to the backend's actual wire string. Must be
/// applied to every state before it is put into an object sent to the API
/// server.
pub fn normalize_backend_state(backend: Backend, raw: &str) -> String {
    if backend == Backend::Trident {
        if raw.starts_with("established-") {
            return "established".to_string();
        }
        if raw.starts_with("reestablished-") {
            return "reestablished".to_string();
        }
    }
    raw.to_string()
}

/// Assert the backend's tables are complete and round-trip for every neutral
/// key in the supported set.
pub fn validate(backend: Backend) -> Result<()> {
    for state in VolumeReplicationState::ALL {
        let raw = state_to_backend(backend, state)?;
        let back = state_from_backend(backend, raw)?;
        if back != state {
            return Err(Error::TranslationError(format!(
                "{} state table does not round-trip: {:?} -> '{}' -> {:?}",
                backend, state, raw, back
            )));
        }
    }
    for mode in [ReplicationMode::Synchronous, ReplicationMode::Asynchronous] {
        let raw = mode_to_backend(backend, mode)?;
        let back = mode_from_backend(backend, raw)?;
        if back != mode {
            return Err(Error::TranslationError(format!(
                "{} mode table does not round-trip: {:?} -> '{}' -> {:?}",
                backend, mode, raw, back
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_backends_round_trip() {
        for backend in Backend::ALL {
            validate(backend).unwrap();
        }
    }

    #[test]
    fn trident_resync_label_never_hits_the_wire() {
        let raw = state_to_backend(Backend::Trident, VolumeReplicationState::Resync).unwrap();
        assert_eq!(raw, "reestablished-resync");
        assert_eq!(normalize_backend_state(Backend::Trident, raw), "reestablished");
    }

    #[test]
    fn extended_labels_normalize_to_valid_trident_strings() {
        for (label, expected) in [
            ("established-replica", "established"),
            ("established-syncing", "established"),
            ("established-failed", "established"),
            ("reestablished-promoting", "reestablished"),
        ] {
            assert_eq!(normalize_backend_state(Backend::Trident, label), expected);
        }
        // Other backends pass through untouched.
        assert_eq!(normalize_backend_state(Backend::Ceph, "primary"), "primary");
    }

    #[test]
    fn dell_actions_map_to_states() {
        assert_eq!(
            state_to_backend(Backend::Dell, VolumeReplicationState::Primary).unwrap(),
            "Failover"
        );
        assert_eq!(
            state_to_backend(Backend::Dell, VolumeReplicationState::Secondary).unwrap(),
            "Sync"
        );
        assert_eq!(
            state_to_backend(Backend::Dell, VolumeReplicationState::Resync).unwrap(),
            "Reprotect"
        );
        assert_eq!(
            state_from_backend(Backend::Dell, "Reprotect").unwrap(),
            VolumeReplicationState::Resync
        );
    }

    #[test]
    fn off_spec_values_classify_instead_of_failing() {
        assert_eq!(
            state_from_backend(Backend::Trident, "promoted").unwrap(),
            VolumeReplicationState::Primary
        );
        assert_eq!(
            state_from_backend(Backend::Ceph, "Demoted").unwrap(),
            VolumeReplicationState::Secondary
        );
        assert_eq!(
            state_from_backend(Backend::Trident, "established-failed").unwrap(),
            VolumeReplicationState::Primary
        );
    }

    #[test]
    fn unknown_values_error_and_are_not_retriable() {
        let err = state_from_backend(Backend::Ceph, "wedged").unwrap_err();
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("wedged"));

        let err = mode_from_backend(Backend::Dell, "Turbo").unwrap_err();
        assert!(!err.is_retriable());
    }

    #[test]
    fn eventual_mode_writes_the_async_string() {
        for backend in Backend::ALL {
            let raw = mode_to_backend(backend, ReplicationMode::Eventual).unwrap();
            assert_eq!(
                mode_from_backend(backend, raw).unwrap(),
                ReplicationMode::Asynchronous
            );
        }
    }
}
