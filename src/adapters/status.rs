//! Status composition
//!
//! After every reconcile the neutral resource's status is composed from the
//! backend object's observed fields plus derived values: reverse-translated
//! state, health, coarse sync progress and sync-time estimates.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::AUTO_RESYNC_CHECK_INTERVAL;
use crate::crd::{parse_duration, Condition, Health, ScheduleMode, VolumeReplicationState};
use crate::translation::{state_from_backend, Backend};

/// The neutral view of a backend object's status.
#[derive(Clone, Debug, Default)]
pub struct CompositeStatus {
    pub state: Option<VolumeReplicationState>,
    pub health: Health,
    pub sync_progress: Option<i32>,
    pub last_sync_time: Option<String>,
    pub next_sync_time: Option<String>,
    pub message: Option<String>,
    pub conditions: Vec<Condition>,
}

/// Compose the neutral status from a backend object's raw JSON.
pub fn compose_status(
    backend: Backend,
    data: &Value,
    schedule_mode: ScheduleMode,
    rpo: Option<&str>,
    now: DateTime<Utc>,
) -> CompositeStatus {
    let raw_state = observed_state_string(data);
    let state = raw_state
        .as_deref()
        .and_then(|raw| state_from_backend(backend, raw).ok());

    let conditions = parse_conditions(data);
    let health = derive_health(&conditions, state);
    let sync_progress = derive_sync_progress(&conditions, state, raw_state.is_some());

    let last_sync_time = data
        .pointer("/status/lastSyncTime")
        .and_then(Value::as_str)
        .map(str::to_string);

    // The estimate helper runs at most once per composition.
    let next_sync_time =
        estimate_next_sync_time(schedule_mode, rpo, last_sync_time.as_deref(), now);

    let message = data
        .pointer("/status/message")
        .and_then(Value::as_str)
        .map(str::to_string);

    CompositeStatus {
        state,
        health,
        sync_progress,
        last_sync_time,
        next_sync_time,
        message,
        conditions,
    }
}

/// The backend's reported state, falling back to the desired state when the
/// backend has not reported yet.
fn observed_state_string(data: &Value) -> Option<String> {
    for pointer in ["/status/state", "/spec/state", "/spec/replicationState", "/spec/action"] {
        if let Some(raw) = data.pointer(pointer).and_then(Value::as_str) {
            return Some(raw.to_string());
        }
    }
    None
}

fn parse_conditions(data: &Value) -> Vec<Condition> {
    let Some(items) = data.pointer("/status/conditions").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|c| {
            Some(Condition {
                type_: c.get("type")?.as_str()?.to_string(),
                status: c
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
                last_transition_time: c
                    .get("lastTransitionTime")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                reason: c
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                message: c
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}

fn condition_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.is_true())
}

fn derive_health(conditions: &[Condition], state: Option<VolumeReplicationState>) -> Health {
    if condition_true(conditions, "Degraded") {
        return Health::Degraded;
    }
    if condition_true(conditions, "Error") || condition_true(conditions, "Failed") {
        return Health::Unhealthy;
    }
    let degraded_present = conditions
        .iter()
        .any(|c| matches!(c.type_.as_str(), "Degraded" | "Error" | "Failed"));
    match state {
        Some(VolumeReplicationState::Primary) | Some(VolumeReplicationState::Secondary)
            if !degraded_present =>
        {
            Health::Healthy
        }
        _ => Health::Unknown,
    }
}

/// Percentage estimate: a Resyncing condition carrying a percent in its
/// message wins; otherwise a coarse state-based figure.
fn derive_sync_progress(
    conditions: &[Condition],
    state: Option<VolumeReplicationState>,
    observed: bool,
) -> Option<i32> {
    if let Some(resyncing) = conditions.iter().find(|c| c.type_.contains("Resyncing")) {
        if let Some(percent) = extract_percent(&resyncing.message) {
            return Some(percent);
        }
    }
    match state {
        Some(VolumeReplicationState::Primary) | Some(VolumeReplicationState::Secondary) => {
            Some(100)
        }
        Some(VolumeReplicationState::Resync) => Some(50),
        None if !observed => Some(10),
        None => None,
    }
}

fn extract_percent(message: &str) -> Option<i32> {
    let percent_pos = message.find('%')?;
    let digits: String = message[..percent_pos]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let value: i32 = digits.parse().ok()?;
    (0..=100).contains(&value).then_some(value)
}

/// Estimate when the next synchronization should happen. Interval mode:
/// last sync plus the RPO; continuous: one auto-resync check from now;
/// manual: no estimate.
pub fn estimate_next_sync_time(
    schedule_mode: ScheduleMode,
    rpo: Option<&str>,
    last_sync_time: Option<&str>,
    now: DateTime<Utc>,
) -> Option<String> {
    match schedule_mode {
        ScheduleMode::Interval => {
            let rpo = parse_duration(rpo?)?;
            let last = DateTime::parse_from_rfc3339(last_sync_time?).ok()?;
            let next = last.with_timezone(&Utc) + chrono::Duration::from_std(rpo).ok()?;
            Some(next.to_rfc3339())
        }
        ScheduleMode::Continuous => {
            let next = now + chrono::Duration::from_std(AUTO_RESYNC_CHECK_INTERVAL).ok()?;
            Some(next.to_rfc3339())
        }
        ScheduleMode::Manual => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn healthy_when_settled_and_no_bad_conditions() {
        let data = json!({
            "status": { "state": "primary", "conditions": [] }
        });
        let status =
            compose_status(Backend::Ceph, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.state, Some(VolumeReplicationState::Primary));
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.sync_progress, Some(100));
        assert_eq!(status.next_sync_time, None);
    }

    #[test]
    fn degraded_condition_wins() {
        let data = json!({
            "status": {
                "state": "secondary",
                "conditions": [
                    { "type": "Degraded", "status": "True", "message": "link flapping" }
                ]
            }
        });
        let status =
            compose_status(Backend::Ceph, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.health, Health::Degraded);
    }

    #[test]
    fn error_condition_is_unhealthy() {
        let data = json!({
            "status": {
                "state": "reestablished",
                "conditions": [
                    { "type": "Error", "status": "True", "message": "peer lost" }
                ]
            }
        });
        let status =
            compose_status(Backend::Trident, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.health, Health::Unhealthy);
        assert_eq!(status.state, Some(VolumeReplicationState::Secondary));
    }

    #[test]
    fn unknown_when_nothing_observed() {
        let data = json!({});
        let status =
            compose_status(Backend::Ceph, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.health, Health::Unknown);
        assert_eq!(status.state, None);
        assert_eq!(status.sync_progress, Some(10));
    }

    #[test]
    fn resyncing_condition_percent_wins_over_estimate() {
        let data = json!({
            "status": {
                "state": "resync",
                "conditions": [
                    { "type": "Resyncing", "status": "True", "message": "copied 73% of blocks" }
                ]
            }
        });
        let status =
            compose_status(Backend::Ceph, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.sync_progress, Some(73));
    }

    #[test]
    fn resync_without_percent_is_coarse_fifty() {
        let data = json!({ "status": { "state": "resync" } });
        let status =
            compose_status(Backend::Ceph, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.sync_progress, Some(50));
    }

    #[test]
    fn interval_estimate_adds_rpo_to_last_sync() {
        let data = json!({
            "status": { "state": "secondary", "lastSyncTime": "2025-06-01T11:45:00+00:00" }
        });
        let status = compose_status(
            Backend::Ceph,
            &data,
            ScheduleMode::Interval,
            Some("15m"),
            now(),
        );
        assert_eq!(
            status.next_sync_time.as_deref(),
            Some("2025-06-01T12:00:00+00:00")
        );
    }

    #[test]
    fn continuous_estimate_is_one_check_interval_out() {
        let data = json!({ "status": { "state": "primary" } });
        let status = compose_status(
            Backend::Ceph,
            &data,
            ScheduleMode::Continuous,
            None,
            now(),
        );
        assert_eq!(
            status.next_sync_time.as_deref(),
            Some("2025-06-01T12:02:00+00:00")
        );
    }

    #[test]
    fn dell_action_reverse_translates() {
        let data = json!({ "spec": { "action": "Reprotect" } });
        let status =
            compose_status(Backend::Dell, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.state, Some(VolumeReplicationState::Resync));
    }

    #[test]
    fn off_spec_backend_state_never_panics() {
        let data = json!({ "status": { "state": "promoted" } });
        let status =
            compose_status(Backend::Trident, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.state, Some(VolumeReplicationState::Primary));

        let data = json!({ "status": { "state": "entirely-novel" } });
        let status =
            compose_status(Backend::Trident, &data, ScheduleMode::Manual, None, now());
        assert_eq!(status.state, None);
        assert_eq!(status.health, Health::Unknown);
    }
}
