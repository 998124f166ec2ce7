//! Dell PowerStore adapter
//!
//! Dell's model is command-oriented: the neutral state translates to an
//! action on a `DellCSIReplicationGroup`. PVC membership is expressed by
//! labeling each participating claim and pointing the group's `pvcSelector`
//! at that label.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{BackendError, Error, ErrorKind, Result};
use crate::translation::{self, Backend};

use super::{
    compose_status, track_transient, AdapterDeps, AdapterFactory, AdapterFeature, BaseAdapter,
    CompositeStatus, ReconcileOutcome, RecoveryOutcome, ReplicationAdapter, ReplicationClassView,
    ReplicationIntent, TransitionTracker, FIELD_OWNER, STATE_TRANSITION_RETRY_INTERVAL,
};

const GROUP: &str = "replication.dell.com";
const VERSION: &str = "v1";
const KIND: &str = "DellCSIReplicationGroup";
const PLURAL: &str = "dellcsireplicationgroups";

/// Labels stamped on every participating PVC.
pub const DELL_REPLICATED_LABEL: &str = "replication.storage.dell.com/replicated";
pub const DELL_GROUP_LABEL: &str = "replication.storage.dell.com/group";

const PARAM_PROTECTION_POLICY: &str = "protectionPolicy";
const PARAM_REMOTE_SYSTEM: &str = "remoteSystem";
const PARAM_RPO: &str = "rpo";
const DEFAULT_RPO: &str = "15m";

pub(crate) fn replication_group_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, KIND), PLURAL)
}

pub struct DellAdapter {
    base: BaseAdapter,
    client: Client,
    transitions: TransitionTracker,
}

impl DellAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self {
            base: BaseAdapter::new(Backend::Dell, deps.config),
            client: deps.client,
            transitions: TransitionTracker::new(),
        }
    }

    fn group_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &replication_group_resource())
    }

    fn pvc_api(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Render the replication group with the translated action. Pure;
    /// `protectionPolicy` and `remoteSystem` must be present on the class.
    pub fn build_replication_group(
        intent: &ReplicationIntent,
        class: &ReplicationClassView,
    ) -> Result<DynamicObject> {
        let action = translation::state_to_backend(Backend::Dell, intent.state)?;
        let protection_policy = class.required_param(Backend::Dell, PARAM_PROTECTION_POLICY)?;
        let remote_system = class.required_param(Backend::Dell, PARAM_REMOTE_SYSTEM)?;
        let rpo = class
            .param(PARAM_RPO)
            .map(str::to_string)
            .or_else(|| {
                intent
                    .extensions
                    .as_ref()
                    .and_then(|e| e.powerstore.as_ref())
                    .and_then(|p| p.rpo_settings.clone())
            })
            .unwrap_or_else(|| DEFAULT_RPO.to_string());

        let spec = json!({
            "action": action,
            "protectionPolicy": protection_policy,
            "remoteSystem": remote_system,
            "remoteRPO": rpo,
            "pvcSelector": {
                "matchLabels": { DELL_GROUP_LABEL: intent.name }
            },
        });

        let mut obj = DynamicObject::new(&intent.name, &replication_group_resource());
        obj.metadata.namespace = Some(intent.namespace.clone());
        obj.metadata.labels = Some(intent.labels());
        obj.metadata.owner_references = Some(vec![intent.owner_reference()]);
        obj.data = json!({ "spec": spec });
        Ok(obj)
    }

    /// Membership labels applied to each participating PVC.
    pub fn membership_labels(intent: &ReplicationIntent) -> serde_json::Value {
        json!({
            "metadata": {
                "labels": {
                    DELL_REPLICATED_LABEL: "true",
                    DELL_GROUP_LABEL: intent.name,
                }
            }
        })
    }

    async fn label_pvcs(&self, intent: &ReplicationIntent) -> Result<()> {
        let api = self.pvc_api(&intent.namespace);
        let patch = Self::membership_labels(intent);
        for pvc in &intent.pvc_names {
            match api
                .patch(pvc, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    // The claim may not exist yet; retryable so the group
                    // converges once it appears.
                    return Err(Error::BackendError(
                        BackendError::new(
                            ErrorKind::Resource,
                            Backend::Dell,
                            "reconcile",
                            format!("{}/{}", intent.namespace, pvc),
                            "participating PVC not found",
                        )
                        .with_remediation("create the PVC or remove it from the replication intent"),
                    ));
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    /// Best-effort label removal: a missing PVC is not an error.
    async fn unlabel_pvcs(&self, intent: &ReplicationIntent) {
        let api = self.pvc_api(&intent.namespace);
        let patch = json!({
            "metadata": {
                "labels": {
                    DELL_REPLICATED_LABEL: null,
                    DELL_GROUP_LABEL: null,
                }
            }
        });

        let mut members: Vec<String> = intent.pvc_names.clone();
        let selector = format!("{}={}", DELL_GROUP_LABEL, intent.name);
        if let Ok(labeled) = api.list(&ListParams::default().labels(&selector)).await {
            for pvc in labeled {
                if let Some(name) = pvc.metadata.name {
                    if !members.contains(&name) {
                        members.push(name);
                    }
                }
            }
        }

        for pvc in members {
            match api
                .patch(&pvc, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(pvc, error = %e, "failed to remove membership labels"),
            }
        }
    }

    fn require_class<'c>(
        &self,
        intent: &ReplicationIntent,
        class: Option<&'c ReplicationClassView>,
    ) -> Result<&'c ReplicationClassView> {
        class.ok_or_else(|| {
            Error::BackendError(
                BackendError::new(
                    ErrorKind::Configuration,
                    Backend::Dell,
                    "reconcile",
                    intent.object_ref(),
                    "the PowerStore backend requires a replication class",
                )
                .with_remediation(format!(
                    "create a class with parameters.{} and parameters.{}",
                    PARAM_PROTECTION_POLICY, PARAM_REMOTE_SYSTEM
                )),
            )
        })
    }

    /// One-shot action write used by the pause/resume verbs.
    async fn write_action(&self, intent: &ReplicationIntent, class: &ReplicationClassView, action: &str) -> Result<()> {
        let mut obj = Self::build_replication_group(intent, class)?;
        obj.data["spec"]["action"] = json!(action);
        let api = self.group_api(&intent.namespace);
        self.base
            .with_retry(action, &intent.object_ref(), || {
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
}

#[async_trait::async_trait]
impl ReplicationAdapter for DellAdapter {
    fn backend(&self) -> Backend {
        Backend::Dell
    }

    fn features(&self) -> &'static [AdapterFeature] {
        &[
            AdapterFeature::Promote,
            AdapterFeature::Demote,
            AdapterFeature::Resync,
            AdapterFeature::Pause,
            AdapterFeature::Resume,
            AdapterFeature::Failover,
            AdapterFeature::Failback,
            AdapterFeature::GroupReplication,
        ]
    }

    async fn initialize(&self) -> Result<()> {
        translation::validate(Backend::Dell)?;
        let client = self.client.clone();
        self.base.spawn_health_loop(move || {
            let client = client.clone();
            async move {
                let api: Api<DynamicObject> =
                    Api::all_with(client, &replication_group_resource());
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
        let class = self.require_class(intent, class)?;
        let pending = track_transient(&self.transitions, intent)?;

        self.label_pvcs(intent).await?;

        let obj = Self::build_replication_group(intent, class)?;
        let api = self.group_api(&intent.namespace);
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
            .await?;

        self.base.cache.invalidate(&intent.object_ref());
        info!(
            object = %intent.object_ref(),
            action = %obj.data["spec"]["action"],
            members = intent.pvc_names.len(),
            "applied DellCSIReplicationGroup"
        );

        if pending {
            Ok(ReconcileOutcome::requeue(STATE_TRANSITION_RETRY_INTERVAL))
        } else {
            Ok(ReconcileOutcome::converged())
        }
    }

    async fn delete(&self, intent: &ReplicationIntent) -> Result<()> {
        self.unlabel_pvcs(intent).await;

        let api = self.group_api(&intent.namespace);
        match api.delete(&intent.name, &DeleteParams::default()).await {
            Ok(_) => info!(object = %intent.object_ref(), "deleted DellCSIReplicationGroup"),
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

        let api = self.group_api(&intent.namespace);
        let data = match api.get(&intent.name).await {
            Ok(obj) => serde_json::to_value(&obj)?,
            Err(kube::Error::Api(e)) if e.code == 404 => serde_json::Value::Null,
            Err(e) => return Err(Error::from(e)),
        };

        let status = compose_status(
            Backend::Dell,
            &data,
            intent.schedule_mode,
            intent.rpo.as_deref(),
            chrono::Utc::now(),
        );
        self.base.cache.put(&key, status.clone());
        Ok(status)
    }

    async fn pause(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        let class = self.require_class(intent, class)?;
        self.write_action(intent, class, "Suspend").await?;
        Ok(ReconcileOutcome::converged())
    }

    async fn resume(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<ReconcileOutcome> {
        let class = self.require_class(intent, class)?;
        self.write_action(intent, class, "Resume").await?;
        Ok(ReconcileOutcome::converged())
    }

    async fn recover(
        &self,
        intent: &ReplicationIntent,
        class: Option<&ReplicationClassView>,
    ) -> Result<RecoveryOutcome> {
        super::run_recovery_ladder(self, &self.base, intent, class).await
    }
}

struct DellFactory;

impl AdapterFactory for DellFactory {
    fn backend(&self) -> Backend {
        Backend::Dell
    }

    fn create(&self, deps: AdapterDeps) -> Result<Arc<dyn ReplicationAdapter>> {
        Ok(Arc::new(DellAdapter::new(deps)))
    }
}

pub(super) fn factory() -> Arc<dyn AdapterFactory> {
    Arc::new(DellFactory)
}
