//! Ceph RBD adapter
//!
//! Ceph's native `VolumeReplication` object already speaks the neutral
//! vocabulary, so this adapter is a structural passthrough: it stamps
//! ownership and applies the spec verbatim with server-side apply. Group
//! replication creates one child object per PVC, labeled with the group.

use std::sync::Arc;

use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::translation::{self, Backend};

use super::{
    compose_status, track_transient, AdapterDeps, AdapterFactory, AdapterFeature, BaseAdapter,
    CompositeStatus, ReconcileOutcome, RecoveryOutcome, ReplicationAdapter, ReplicationClassView,
    ReplicationIntent, TransitionTracker, GROUP_LABEL, FIELD_OWNER,
    STATE_TRANSITION_RETRY_INTERVAL,
};

const GROUP: &str = "replication.storage.openshift.io";
const VERSION: &str = "v1alpha1";
const KIND: &str = "VolumeReplication";
const PLURAL: &str = "volumereplications";

pub(crate) fn volume_replication_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GROUP, VERSION, KIND),
        PLURAL,
    )
}

pub struct CephAdapter {
    base: BaseAdapter,
    client: Client,
    transitions: TransitionTracker,
}

impl CephAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self {
            base: BaseAdapter::new(Backend::Ceph, deps.config),
            client: deps.client,
            transitions: TransitionTracker::new(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &volume_replication_resource())
    }

    /// Render one VolumeReplication for `pvc_name`. Pure: unit tests assert
    /// on the rendered object directly.
    pub fn build_volume_replication(
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
        pvc_name: &str,
    ) -> DynamicObject {
        let class_name = class
            .map(|c| c.name.clone())
            .or_else(|| intent.storage_class.clone())
            .unwrap_or_else(|| intent.name.clone());

        let name = if intent.is_group() {
            format!("{}-{}", intent.name, pvc_name)
        } else {
            intent.name.clone()
        };

        let mut labels = intent.labels();
        if intent.is_group() {
            labels.insert(GROUP_LABEL.to_string(), intent.name.clone());
        }

        let mut spec = json!({
            "volumeReplicationClass": class_name,
            "pvcName": pvc_name,
            // Passthrough: the neutral state string is Ceph's own vocabulary.
            "replicationState": intent.state.as_str(),
        });
        if intent.auto_resync {
            spec["autoResync"] = json!(true);
        }

        let mut obj = DynamicObject::new(&name, &volume_replication_resource());
        obj.metadata.namespace = Some(intent.namespace.clone());
        obj.metadata.labels = Some(labels);
        obj.metadata.owner_references = Some(vec![intent.owner_reference()]);
        obj.data = json!({ "spec": spec });
        obj
    }

    async fn apply(&self, intent: &ReplicationIntent, obj: &DynamicObject) -> Result<()> {
        let api = self.api(&intent.namespace);
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.base
            .with_retry("reconcile", &intent.object_ref(), || {
                let api = api.clone();
                let name = name.clone();
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

    async fn delete_children(&self, intent: &ReplicationIntent) -> Result<()> {
        let api = self.api(&intent.namespace);
        let selector = format!("{}={}", GROUP_LABEL, intent.name);
        let children = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::from)?;
        for child in children {
            let name = child.metadata.name.clone().unwrap_or_default();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => debug!(name, "deleted group child"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicationAdapter for CephAdapter {
    fn backend(&self) -> Backend {
        Backend::Ceph
    }

    fn features(&self) -> &'static [AdapterFeature] {
        &[
            AdapterFeature::Promote,
            AdapterFeature::Demote,
            AdapterFeature::Resync,
            AdapterFeature::Failover,
            AdapterFeature::Failback,
            AdapterFeature::GroupReplication,
            AdapterFeature::AutoResync,
        ]
    }

    async fn initialize(&self) -> Result<()> {
        translation::validate(Backend::Ceph)?;
        let client = self.client.clone();
        self.base.spawn_health_loop(move || {
            let client = client.clone();
            async move {
                let api: Api<DynamicObject> =
                    Api::all_with(client, &volume_replication_resource());
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

        for pvc_name in &intent.pvc_names {
            let obj = Self::build_volume_replication(intent, class, pvc_name);
            self.apply(intent, &obj).await?;
        }
        self.base.cache.invalidate(&intent.object_ref());
        info!(
            object = %intent.object_ref(),
            state = %intent.state,
            children = intent.pvc_names.len(),
            "applied VolumeReplication"
        );

        if pending {
            Ok(ReconcileOutcome::requeue(STATE_TRANSITION_RETRY_INTERVAL))
        } else {
            Ok(ReconcileOutcome::converged())
        }
    }

    async fn delete(&self, intent: &ReplicationIntent) -> Result<()> {
        let api = self.api(&intent.namespace);
        match api.delete(&intent.name, &DeleteParams::default()).await {
            Ok(_) => info!(object = %intent.object_ref(), "deleted VolumeReplication"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(Error::from(e)),
        }
        self.delete_children(intent).await?;
        self.transitions.clear(&intent.namespace, &intent.name);
        self.base.cache.invalidate(&intent.object_ref());
        Ok(())
    }

    async fn status(&self, intent: &ReplicationIntent) -> Result<CompositeStatus> {
        let key = intent.object_ref();
        if let Some(cached) = self.base.cache.get(&key) {
            return Ok(cached);
        }

        let api = self.api(&intent.namespace);
        let lookup_name = if intent.is_group() {
            // Group health is read through the first child; children share
            // one relationship on the Ceph side.
            format!("{}-{}", intent.name, intent.pvc_names.first().map(String::as_str).unwrap_or(""))
        } else {
            intent.name.clone()
        };

        let data = match api.get(&lookup_name).await {
            Ok(obj) => serde_json::to_value(&obj)?,
            Err(kube::Error::Api(e)) if e.code == 404 => serde_json::Value::Null,
            Err(e) => return Err(Error::from(e)),
        };

        let status = compose_status(
            Backend::Ceph,
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

struct CephFactory;

impl AdapterFactory for CephFactory {
    fn backend(&self) -> Backend {
        Backend::Ceph
    }

    fn create(&self, deps: AdapterDeps) -> Result<Arc<dyn ReplicationAdapter>> {
        Ok(Arc::new(CephAdapter::new(deps)))
    }
}

pub(super) fn factory() -> Arc<dyn AdapterFactory> {
    Arc::new(CephFactory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ReplicationMode, ScheduleMode, VolumeReplicationState};
    use crate::adapters::OwnerInfo;

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
            schedule_mode: ScheduleMode::Continuous,
            rpo: None,
            rto: None,
            pvc_names: pvcs.iter().map(|s| s.to_string()).collect(),
            storage_class: None,
            remote_volume_handle: None,
            auto_resync: false,
            extensions: None,
        }
    }

    fn class() -> ReplicationClassView {
        ReplicationClassView {
            name: "rbd-async".into(),
            provisioner: "rbd.csi.ceph.com".into(),
            parameters: Default::default(),
        }
    }

    #[test]
    fn passthrough_spec_is_copied_verbatim() {
        let intent = intent(VolumeReplicationState::Primary, &["app-data"]);
        let obj =
            CephAdapter::build_volume_replication(&intent, Some(&class()), "app-data");

        assert_eq!(obj.types.as_ref().unwrap().kind, "VolumeReplication");
        assert_eq!(
            obj.types.as_ref().unwrap().api_version,
            "replication.storage.openshift.io/v1alpha1"
        );
        assert_eq!(obj.metadata.name.as_deref(), Some("db"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("default"));

        let spec = &obj.data["spec"];
        assert_eq!(spec["volumeReplicationClass"], "rbd-async");
        assert_eq!(spec["pvcName"], "app-data");
        // No state translation on the passthrough path.
        assert_eq!(spec["replicationState"], "primary");
        assert!(spec.get("autoResync").is_none());

        let owner = &obj.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "VolumeReplication");
        assert_eq!(owner.name, "db");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn rendering_is_idempotent() {
        let intent = intent(VolumeReplicationState::Secondary, &["app-data"]);
        let a = CephAdapter::build_volume_replication(&intent, Some(&class()), "app-data");
        let b = CephAdapter::build_volume_replication(&intent, Some(&class()), "app-data");
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }

    #[test]
    fn group_children_are_labeled_with_the_group() {
        let intent = intent(VolumeReplicationState::Primary, &["pvc-a", "pvc-b"]);
        let obj = CephAdapter::build_volume_replication(&intent, Some(&class()), "pvc-b");
        assert_eq!(obj.metadata.name.as_deref(), Some("db-pvc-b"));
        let labels = obj.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[GROUP_LABEL], "db");
        assert_eq!(labels[super::super::NEUTRAL_NAME_LABEL], "db");
    }

    #[test]
    fn auto_resync_is_passed_through() {
        let mut intent = intent(VolumeReplicationState::Resync, &["app-data"]);
        intent.auto_resync = true;
        let obj = CephAdapter::build_volume_replication(&intent, Some(&class()), "app-data");
        assert_eq!(obj.data["spec"]["autoResync"], true);
        assert_eq!(obj.data["spec"]["replicationState"], "resync");
    }

    #[test]
    fn class_name_falls_back_to_the_storage_class() {
        let mut intent = intent(VolumeReplicationState::Primary, &["app-data"]);
        intent.storage_class = Some("ceph-rbd".into());
        let obj = CephAdapter::build_volume_replication(&intent, None, "app-data");
        assert_eq!(obj.data["spec"]["volumeReplicationClass"], "ceph-rbd");
    }
}
