//! NetApp Trident adapter
//!
//! Translates the neutral state into Trident's relationship vocabulary and
//! programs a single `TridentMirrorRelationship` whose `volumeMappings`
//! array makes group replication first-class. Resync requests are carried by
//! a fresh `TridentActionMirrorUpdate` per request.

use std::sync::Arc;

use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tracing::info;

use crate::crd::VolumeReplicationState;
use crate::error::{Error, Result};
use crate::translation::{self, Backend};

use super::{
    compose_status, track_transient, AdapterDeps, AdapterFactory, AdapterFeature, BaseAdapter,
    CompositeStatus, ReconcileOutcome, RecoveryOutcome, ReplicationAdapter, ReplicationClassView,
    ReplicationIntent, TransitionTracker, FIELD_OWNER, STATE_TRANSITION_RETRY_INTERVAL,
};

const GROUP: &str = "trident.netapp.io";
const VERSION: &str = "v1";
const MIRROR_KIND: &str = "TridentMirrorRelationship";
const MIRROR_PLURAL: &str = "tridentmirrorrelationships";
const ACTION_KIND: &str = "TridentActionMirrorUpdate";
const ACTION_PLURAL: &str = "tridentactionmirrorupdates";

const DEFAULT_REPLICATION_POLICY: &str = "Async";

pub(crate) fn mirror_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GROUP, VERSION, MIRROR_KIND),
        MIRROR_PLURAL,
    )
}

fn action_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GROUP, VERSION, ACTION_KIND),
        ACTION_PLURAL,
    )
}

pub struct TridentAdapter {
    base: BaseAdapter,
    client: Client,
    transitions: TransitionTracker,
}

impl TridentAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self {
            base: BaseAdapter::new(Backend::Trident, deps.config),
            client: deps.client,
            transitions: TransitionTracker::new(),
        }
    }

    fn mirror_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &mirror_resource())
    }

    fn action_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &action_resource())
    }

    /// Render the TridentMirrorRelationship. Pure; the translated state is
    /// normalized so bookkeeping labels never reach the wire.
    pub fn build_mirror_relationship(
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<DynamicObject> {
        let translated = translation::state_to_backend(Backend::Trident, intent.state)?;
        let state = translation::normalize_backend_state(Backend::Trident, translated);

        let policy = class
            .and_then(|c| c.param("replicationPolicy"))
            .map(str::to_string)
            .unwrap_or_else(|| {
                translation::mode_to_backend(Backend::Trident, intent.mode)
                    .map(str::to_string)
                    .unwrap_or_else(|_| DEFAULT_REPLICATION_POLICY.to_string())
            });

        let schedule = class
            .and_then(|c| c.param("replicationSchedule"))
            .map(str::to_string)
            .or_else(|| intent.rpo.clone());

        let class_handle = class.and_then(|c| c.param("remoteVolume"));
        let mappings: Vec<_> = intent
            .pvc_names
            .iter()
            .map(|pvc| {
                let handle = intent
                    .remote_volume_handle
                    .as_deref()
                    .or(class_handle)
                    .unwrap_or(pvc.as_str());
                json!({ "localPVCName": pvc, "remoteVolumeHandle": handle })
            })
            .collect();

        let mut spec = json!({
            "state": state,
            "replicationPolicy": policy,
            "volumeMappings": mappings,
        });
        if let Some(schedule) = schedule {
            spec["replicationSchedule"] = json!(schedule);
        }

        let mut obj = DynamicObject::new(&intent.name, &mirror_resource());
        obj.metadata.namespace = Some(intent.namespace.clone());
        obj.metadata.labels = Some(intent.labels());
        obj.metadata.owner_references = Some(vec![intent.owner_reference()]);
        obj.data = json!({ "spec": spec });
        Ok(obj)
    }

    /// Render a one-shot mirror-update action for a resync request.
    pub fn build_action_update(intent: &ReplicationIntent, epoch: i64) -> DynamicObject {
        let name = format!("{}-resync-{}", intent.name, epoch);
        let mut obj = DynamicObject::new(&name, &action_resource());
        obj.metadata.namespace = Some(intent.namespace.clone());
        obj.metadata.labels = Some(intent.labels());
        obj.metadata.owner_references = Some(vec![intent.owner_reference()]);
        obj.data = json!({ "spec": { "tmrName": intent.name } });
        obj
    }

    async fn apply_mirror(&self, intent: &ReplicationIntent, obj: &DynamicObject) -> Result<()> {
        let api = self.mirror_api(&intent.namespace);
        self.base
            .with_retry("reconcile", &intent.object_ref(), || {
                let api = api.clone();
                let name = intent.name.clone();
                let obj = obj.clone();
                async move {
                    api.patch(
                        &name,
                        &PatchParams::apply(FIELD_OWNER).force(),
                        &Patch::Apply(&obj),
                    )
                    .await
                    .map_err(Error::from)?;
                    Ok(())
                }
            })
            .await
    }

    async fn request_action_update(&self, intent: &ReplicationIntent) -> Result<()> {
        let api = self.action_api(&intent.namespace);
        let obj = Self::build_action_update(intent, chrono::Utc::now().timestamp());
        let name = obj.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(Error::from)?;
        info!(object = %intent.object_ref(), action = %name, "requested mirror update");
        Ok(())
    }

    /// Rich-revision trident hints request explicit mirror updates.
    fn wants_action_update(intent: &ReplicationIntent) -> bool {
        if intent.state == VolumeReplicationState::Resync {
            return true;
        }
        intent
            .extensions
            .as_ref()
            .and_then(|e| e.trident.as_ref())
            .map(|t| {
                t.actions
                    .iter()
                    .any(|a| a == "mirror-update" || a == "resync")
            })
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl ReplicationAdapter for TridentAdapter {
    fn backend(&self) -> Backend {
        Backend::Trident
    }

    fn features(&self) -> &'static [AdapterFeature] {
        &[
            AdapterFeature::Promote,
            AdapterFeature::Demote,
            AdapterFeature::Resync,
            AdapterFeature::Failover,
            AdapterFeature::Failback,
            AdapterFeature::GroupReplication,
        ]
    }

    async fn initialize(&self) -> Result<()> {
        translation::validate(Backend::Trident)?;
        let client = self.client.clone();
        self.base.spawn_health_loop(move || {
            let client = client.clone();
            async move {
                let api: Api<DynamicObject> = Api::all_with(client, &mirror_resource());
                api.list(&ListParams::default().limit(1))
                    .await
                    .map_err(Error::from)?;
                Ok(())
            }
        });
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.base.shutdown_health_loop().await;
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.base.is_healthy()
    }

    fn transitions(&self) -> Option<&TransitionTracker> {
        Some(&self.transitions)
    }

    async fn reconcile(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        let pending = track_transient(&self.transitions, intent)?;

        let obj = Self::build_mirror_relationship(intent, class)?;
        self.apply_mirror(intent, &obj).await?;

        if Self::wants_action_update(intent) {
            self.request_action_update(intent).await?;
        }

        self.base.cache.invalidate(&intent.object_ref());
        info!(
            object = %intent.object_ref(),
            state = %obj.data["spec"]["state"],
            mappings = intent.pvc_names.len(),
            "applied TridentMirrorRelationship"
        );

        if pending {
            Ok(ReconcileOutcome::requeue(STATE_TRANSITION_RETRY_INTERVAL))
        } else {
            Ok(ReconcileOutcome::converged())
        }
    }

    async fn delete(&self, intent: &ReplicationIntent) -> Result<()> {
        let api = self.mirror_api(&intent.namespace);
        match api.delete(&intent.name, &DeleteParams::default()).await {
            Ok(_) => info!(object = %intent.object_ref(), "deleted TridentMirrorRelationship"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(Error::from(e)),
        }
        self.transitions.clear(&intent.namespace, &intent.name);
        self.base.cache.invalidate(&intent.object_ref());
        Ok(())
    }

    async fn status(&self, intent: &ReplicationIntent) -> Result<CompositeStatus> {
        let key = intent.object_ref();
        if let Some(cached) = self.base.cache.get(&key) {
            return Ok(cached);
        }

        let api = self.mirror_api(&intent.namespace);
        let data = match api.get(&intent.name).await {
            Ok(obj) => serde_json::to_value(&obj)?,
            Err(kube::Error::Api(e)) if e.code == 404 => serde_json::Value::Null,
            Err(e) => return Err(Error::from(e)),
        };

        let status = compose_status(
            Backend::Trident,
            &data,
            intent.schedule_mode,
            intent.rpo.as_deref(),
            chrono::Utc::now(),
        );
        self.base.cache.put(&key, status.clone());
        Ok(status)
    }

    async fn recover(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<RecoveryOutcome> {
        super::run_recovery_ladder(self, &self.base, intent, class).await
    }
}

struct TridentFactory;

impl AdapterFactory for TridentFactory {
    fn backend(&self) -> Backend {
        Backend::Trident
    }

    fn create(&self, deps: AdapterDeps) -> Result<Arc<dyn ReplicationAdapter>> {
        Ok(Arc::new(TridentAdapter::new(deps)))
    }
}

pub(super) fn factory() -> Arc<dyn AdapterFactory> {
    Arc::new(TridentFactory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::OwnerInfo;
    use crate::crd::{ReplicationMode, ScheduleMode};
    use std::collections::BTreeMap;

    fn intent(state: VolumeReplicationState, pvcs: &[&str]) -> ReplicationIntent {
        ReplicationIntent {
            name: "db".into(),
            namespace: "default".into(),
            owner: OwnerInfo {
                api_version: "replication.unified.io/v1alpha2".into(),
                kind: "VolumeReplication".into(),
                name: "db".into(),
                uid: "uid-1".into(),
            },
            state,
            rich_state: None,
            mode: ReplicationMode::Asynchronous,
            schedule_mode: ScheduleMode::Interval,
            rpo: Some("15m".into()),
            rto: None,
            pvc_names: pvcs.iter().map(|s| s.to_string()).collect(),
            storage_class: None,
            remote_volume_handle: None,
            auto_resync: false,
            extensions: None,
        }
    }

    fn class(params: &[(&str, &str)]) -> ReplicationClassView {
        ReplicationClassView {
            name: "trident-async".into(),
            provisioner: "csi.trident.netapp.io".into(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn primary_renders_established_with_class_parameters() {
        let intent = intent(VolumeReplicationState::Primary, &["app-data"]);
        let class = class(&[
            ("replicationPolicy", "Async"),
            ("replicationSchedule", "15m"),
            ("remoteVolume", "rv1"),
        ]);
        let obj = TridentAdapter::build_mirror_relationship(&intent, Some(&class)).unwrap();

        assert_eq!(obj.types.as_ref().unwrap().kind, "TridentMirrorRelationship");
        assert_eq!(obj.types.as_ref().unwrap().api_version, "trident.netapp.io/v1");

        let spec = &obj.data["spec"];
        assert_eq!(spec["state"], "established");
        assert_eq!(spec["replicationPolicy"], "Async");
        assert_eq!(spec["replicationSchedule"], "15m");
        assert_eq!(
            spec["volumeMappings"],
            serde_json::json!([
                { "localPVCName": "app-data", "remoteVolumeHandle": "rv1" }
            ])
        );
    }

    #[test]
    fn resync_is_normalized_before_writing() {
        let intent = intent(VolumeReplicationState::Resync, &["app-data"]);
        let obj = TridentAdapter::build_mirror_relationship(&intent, None).unwrap();
        // The bookkeeping label must not appear on the wire.
        assert_eq!(obj.data["spec"]["state"], "reestablished");
    }

    #[test]
    fn group_replication_is_one_object_with_n_mappings() {
        let intent = intent(VolumeReplicationState::Secondary, &["pvc-a", "pvc-b", "pvc-c"]);
        let obj = TridentAdapter::build_mirror_relationship(&intent, None).unwrap();
        let mappings = obj.data["spec"]["volumeMappings"].as_array().unwrap();
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[0]["localPVCName"], "pvc-a");
        // Without an explicit handle the PVC name is used.
        assert_eq!(mappings[0]["remoteVolumeHandle"], "pvc-a");
    }

    #[test]
    fn rich_destination_handle_wins_over_class_parameter() {
        let mut intent = intent(VolumeReplicationState::Primary, &["app-data"]);
        intent.remote_volume_handle = Some("vol-from-mapping".into());
        let class = class(&[("remoteVolume", "rv1")]);
        let obj = TridentAdapter::build_mirror_relationship(&intent, Some(&class)).unwrap();
        assert_eq!(
            obj.data["spec"]["volumeMappings"][0]["remoteVolumeHandle"],
            "vol-from-mapping"
        );
    }

    #[test]
    fn action_update_names_carry_the_epoch() {
        let intent = intent(VolumeReplicationState::Resync, &["app-data"]);
        let obj = TridentAdapter::build_action_update(&intent, 1748000000);
        assert_eq!(obj.metadata.name.as_deref(), Some("db-resync-1748000000"));
        assert_eq!(obj.types.as_ref().unwrap().kind, "TridentActionMirrorUpdate");
        assert_eq!(obj.data["spec"]["tmrName"], "db");
    }

    #[test]
    fn resync_state_requests_an_action_update() {
        assert!(TridentAdapter::wants_action_update(&intent(
            VolumeReplicationState::Resync,
            &["app-data"]
        )));
        assert!(!TridentAdapter::wants_action_update(&intent(
            VolumeReplicationState::Primary,
            &["app-data"]
        )));
    }

    #[test]
    fn policy_defaults_to_async_without_class_or_mode() {
        let obj = TridentAdapter::build_mirror_relationship(
            &intent(VolumeReplicationState::Primary, &["app-data"]),
            None,
        )
        .unwrap();
        assert_eq!(obj.data["spec"]["replicationPolicy"], "Async");
    }
}
