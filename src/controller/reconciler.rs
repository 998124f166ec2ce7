//! Reconcilers for both API revisions
//!
//! Implements the controller pattern using the kube-rs runtime: one
//! controller per watched kind, a shared adapter pool, finalizer-gated
//! cleanup and status mirroring through the status subresource only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::{Api, DynamicObject, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event},
        watcher::Config,
    },
    ResourceExt,
};
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::adapters::{
    registry, AdapterDeps, CompositeStatus, ReplicationAdapter, ReplicationClassView,
    ReplicationIntent, TransitionPoll, OPERATOR_NAME, STATE_TRANSITION_RETRY_INTERVAL,
};
use crate::config::OperatorConfig;
use crate::controller::backend::{
    backend_for_extensions, backend_for_provisioner, backend_for_pvc, backend_for_storage_class,
};
use crate::crd::{
    Condition, Health, UnifiedVolumeReplication, UnifiedVolumeReplicationStatus,
    VolumeGroupReplication, VolumeGroupReplicationClass, VolumeReplication,
    VolumeReplicationClass, VolumeReplicationStatus,
};
use crate::error::{Error, Result};
use crate::translation::Backend;

pub const REPLICATION_FINALIZER: &str = "replication.unified.io/finalizer";

/// Requeue used when a retryable error escapes to the error policy.
const RETRYABLE_REQUEUE: Duration = Duration::from_secs(15);

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    adapters: RwLock<HashMap<Backend, Arc<dyn ReplicationAdapter>>>,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Look up (or lazily create and initialize) the adapter for a backend.
    pub async fn adapter(&self, backend: Backend) -> Result<Arc<dyn ReplicationAdapter>> {
        if let Some(adapter) = self.adapters.read().await.get(&backend) {
            return Ok(adapter.clone());
        }

        let deps = AdapterDeps {
            client: self.client.clone(),
            config: self.config.adapter(backend.as_str())?,
        };
        let adapter = registry::global().create(backend, deps)?;
        adapter.initialize().await?;

        let mut adapters = self.adapters.write().await;
        Ok(adapters.entry(backend).or_insert(adapter).clone())
    }

    /// Tear down every adapter (health loops included).
    pub async fn shutdown(&self) {
        let adapters: Vec<_> = self.adapters.write().await.drain().collect();
        for (backend, adapter) in adapters {
            if let Err(e) = adapter.cleanup().await {
                warn!(backend = %backend, error = %e, "adapter cleanup failed");
            }
        }
    }
}

/// Main entry point: starts one controller per watched kind and runs them
/// to completion.
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();

    let unified: Api<UnifiedVolumeReplication> = Api::all(client.clone());
    let volumes: Api<VolumeReplication> = Api::all(client.clone());
    let groups: Api<VolumeGroupReplication> = Api::all(client.clone());

    info!("Starting unified replication controllers");

    // Verify the CRDs exist before watching.
    match unified.list(&Default::default()).await {
        Ok(_) => info!("UnifiedVolumeReplication CRD is available"),
        Err(e) => {
            error!(
                "UnifiedVolumeReplication CRD not found. Please install the CRDs first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "replication.unified.io CRDs not installed".to_string(),
            ));
        }
    }

    let mut unified_controller = Controller::new(unified, Config::default());
    let mut volume_controller = Controller::new(volumes, Config::default());
    let mut group_controller = Controller::new(groups, Config::default());

    // Watch the adapter-owned backend objects so status changes re-trigger
    // reconciliation without polling.
    for resource in crate::adapters::owned_backend_resources() {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
        unified_controller =
            unified_controller.owns_with(api.clone(), resource.clone(), Config::default());
        volume_controller =
            volume_controller.owns_with(api.clone(), resource.clone(), Config::default());
        group_controller = group_controller.owns_with(api, resource, Config::default());
    }

    let unified_run = unified_controller
        .shutdown_on_signal()
        .run(reconcile_unified, error_policy, state.clone())
        .for_each(|res| async move {
            #[cfg(feature = "metrics")]
            crate::metrics::observe_reconcile("UnifiedVolumeReplication", res.is_ok());
            match res {
                Ok(obj) => info!("Reconciled UnifiedVolumeReplication: {:?}", obj),
                Err(e) => error!("UnifiedVolumeReplication reconcile error: {:?}", e),
            }
        });

    let volume_run = volume_controller
        .shutdown_on_signal()
        .run(reconcile_volume, error_policy, state.clone())
        .for_each(|res| async move {
            #[cfg(feature = "metrics")]
            crate::metrics::observe_reconcile("VolumeReplication", res.is_ok());
            match res {
                Ok(obj) => info!("Reconciled VolumeReplication: {:?}", obj),
                Err(e) => error!("VolumeReplication reconcile error: {:?}", e),
            }
        });

    let group_run = group_controller
        .shutdown_on_signal()
        .run(reconcile_group, error_policy, state.clone())
        .for_each(|res| async move {
            #[cfg(feature = "metrics")]
            crate::metrics::observe_reconcile("VolumeGroupReplication", res.is_ok());
            match res {
                Ok(obj) => info!("Reconciled VolumeGroupReplication: {:?}", obj),
                Err(e) => error!("VolumeGroupReplication reconcile error: {:?}", e),
            }
        });

    tokio::join!(unified_run, volume_run, group_run);

    state.shutdown().await;
    Ok(())
}

/// Error policy shared by the three controllers. Conflicts requeue
/// immediately, retryable errors with backoff; everything else waits for an
/// external change.
fn error_policy<K>(_obj: Arc<K>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_conflict() {
        return Action::requeue(Duration::ZERO);
    }
    if error.is_retriable() {
        Action::requeue(RETRYABLE_REQUEUE)
    } else {
        Action::await_change()
    }
}

// ============================================================================
// UnifiedVolumeReplication (rich revision)
// ============================================================================

#[instrument(skip(ctx, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_unified(
    obj: Arc<UnifiedVolumeReplication>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<UnifiedVolumeReplication> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, REPLICATION_FINALIZER, obj, |event| async {
        match event {
            Event::Apply(uvr) => apply_unified(&ctx, &uvr).await,
            Event::Cleanup(uvr) => cleanup_unified(&ctx, &uvr).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn resolve_unified_backend(
    ctx: &ControllerState,
    uvr: &UnifiedVolumeReplication,
) -> Result<Option<Backend>> {
    if let Some(extensions) = &uvr.spec.extensions {
        if let Some(backend) = backend_for_extensions(extensions) {
            return Ok(Some(backend));
        }
    }
    backend_for_storage_class(&ctx.client, &uvr.spec.source_endpoint.storage_class).await
}

async fn apply_unified(
    ctx: &ControllerState,
    uvr: &UnifiedVolumeReplication,
) -> Result<Action> {
    let backend = match resolve_unified_backend(ctx, uvr).await? {
        Some(backend) => backend,
        None => {
            warn!(name = %uvr.name_any(), "no backend matches this resource");
            let status = unknown_backend_status(uvr.metadata.generation);
            patch_unified_status(ctx, uvr, status).await?;
            return Ok(Action::await_change());
        }
    };

    let adapter = ctx.adapter(backend).await?;
    let intent = ReplicationIntent::from_unified(uvr);

    let outcome = match adapter.reconcile(&intent, None).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_conflict() => return Ok(Action::requeue(Duration::ZERO)),
        Err(e) if e.is_retriable() => return Err(e),
        Err(e) => {
            let status = failed_status(uvr.metadata.generation, &e);
            patch_unified_status(ctx, uvr, status).await?;
            return Ok(Action::await_change());
        }
    };

    let (composite, requeue) =
        observe(adapter.as_ref(), &intent, None, outcome.requeue_after).await;
    let status = unified_status(uvr.metadata.generation, composite);
    patch_unified_status(ctx, uvr, status).await?;

    Ok(match requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

async fn cleanup_unified(
    ctx: &ControllerState,
    uvr: &UnifiedVolumeReplication,
) -> Result<Action> {
    let Some(backend) = resolve_unified_backend(ctx, uvr).await? else {
        // Nothing was ever programmed for an unknown backend.
        return Ok(Action::await_change());
    };
    let adapter = ctx.adapter(backend).await?;
    let intent = ReplicationIntent::from_unified(uvr);
    adapter.delete(&intent).await?;
    info!(object = %intent.object_ref(), backend = %backend, "backend cleanup complete");
    Ok(Action::await_change())
}

// ============================================================================
// VolumeReplication (lean revision)
// ============================================================================

#[instrument(skip(ctx, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_volume(
    obj: Arc<VolumeReplication>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VolumeReplication> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, REPLICATION_FINALIZER, obj, |event| async {
        match event {
            Event::Apply(vr) => apply_volume(&ctx, &vr).await,
            Event::Cleanup(vr) => cleanup_volume(&ctx, &vr).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn fetch_class(
    ctx: &ControllerState,
    name: &str,
) -> Result<Option<ReplicationClassView>> {
    let classes: Api<VolumeReplicationClass> = Api::all(ctx.client.clone());
    match classes.get(name).await {
        Ok(class) => Ok(Some(ReplicationClassView {
            name: class.name_any(),
            provisioner: class.spec.provisioner.clone(),
            parameters: class.spec.parameters.clone().unwrap_or_default(),
        })),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn fetch_group_class(
    ctx: &ControllerState,
    name: &str,
) -> Result<Option<ReplicationClassView>> {
    let classes: Api<VolumeGroupReplicationClass> = Api::all(ctx.client.clone());
    match classes.get(name).await {
        Ok(class) => Ok(Some(ReplicationClassView {
            name: class.name_any(),
            provisioner: class.spec.provisioner.clone(),
            parameters: class.spec.parameters.clone().unwrap_or_default(),
        })),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Lean-revision backend resolution: the class provisioner, falling back to
/// the referenced PVC's storage class when ambiguous.
async fn resolve_lean_backend(
    ctx: &ControllerState,
    class: Option<&ReplicationClassView>,
    namespace: &str,
    pvc_name: Option<&str>,
) -> Result<Option<Backend>> {
    if let Some(class) = class {
        if let Some(backend) = backend_for_provisioner(&class.provisioner) {
            return Ok(Some(backend));
        }
    }
    match pvc_name {
        Some(pvc) => backend_for_pvc(&ctx.client, namespace, pvc).await,
        None => Ok(None),
    }
}

async fn apply_volume(ctx: &ControllerState, vr: &VolumeReplication) -> Result<Action> {
    let namespace = vr.namespace().unwrap_or_else(|| "default".to_string());
    let class = fetch_class(ctx, &vr.spec.volume_replication_class).await?;

    let backend = resolve_lean_backend(
        ctx,
        class.as_ref(),
        &namespace,
        Some(&vr.spec.pvc_name),
    )
    .await?;
    let Some(backend) = backend else {
        warn!(name = %vr.name_any(), class = %vr.spec.volume_replication_class, "unknown backend");
        let status = lean_unknown_backend_status(vr.metadata.generation);
        patch_volume_status(ctx, vr, status).await?;
        return Ok(Action::await_change());
    };

    let adapter = ctx.adapter(backend).await?;
    let intent = ReplicationIntent::from_volume_replication(vr);

    let outcome = match adapter.reconcile(&intent, class.as_ref()).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_conflict() => return Ok(Action::requeue(Duration::ZERO)),
        Err(e) if e.is_retriable() => return Err(e),
        Err(e) => {
            let status = lean_failed_status(vr.metadata.generation, &e);
            patch_volume_status(ctx, vr, status).await?;
            return Ok(Action::await_change());
        }
    };

    let (composite, requeue) = observe(
        adapter.as_ref(),
        &intent,
        class.as_ref(),
        outcome.requeue_after,
    )
    .await;
    let status = lean_status(vr.metadata.generation, composite);
    patch_volume_status(ctx, vr, status).await?;

    Ok(match requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

async fn cleanup_volume(ctx: &ControllerState, vr: &VolumeReplication) -> Result<Action> {
    let namespace = vr.namespace().unwrap_or_else(|| "default".to_string());
    let class = fetch_class(ctx, &vr.spec.volume_replication_class).await?;
    let backend = resolve_lean_backend(
        ctx,
        class.as_ref(),
        &namespace,
        Some(&vr.spec.pvc_name),
    )
    .await?;
    let Some(backend) = backend else {
        return Ok(Action::await_change());
    };
    let adapter = ctx.adapter(backend).await?;
    let intent = ReplicationIntent::from_volume_replication(vr);
    adapter.delete(&intent).await?;
    Ok(Action::await_change())
}

// ============================================================================
// VolumeGroupReplication (lean revision, grouped)
// ============================================================================

#[instrument(skip(ctx, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_group(
    obj: Arc<VolumeGroupReplication>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VolumeGroupReplication> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, REPLICATION_FINALIZER, obj, |event| async {
        match event {
            Event::Apply(vgr) => apply_group(&ctx, &vgr).await,
            Event::Cleanup(vgr) => cleanup_group(&ctx, &vgr).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Resolve the group's member PVC names from its selector.
async fn selected_pvcs(
    ctx: &ControllerState,
    namespace: &str,
    vgr: &VolumeGroupReplication,
) -> Result<Vec<String>> {
    let Some(selector) = vgr.spec.pvc_selector.to_label_selector() else {
        return Ok(Vec::new());
    };
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let list = pvcs.list(&ListParams::default().labels(&selector)).await?;
    let mut names: Vec<String> = list.into_iter().filter_map(|p| p.metadata.name).collect();
    names.sort();
    Ok(names)
}

async fn apply_group(ctx: &ControllerState, vgr: &VolumeGroupReplication) -> Result<Action> {
    let namespace = vgr.namespace().unwrap_or_else(|| "default".to_string());
    let class = fetch_group_class(ctx, &vgr.spec.volume_group_replication_class).await?;
    let members = selected_pvcs(ctx, &namespace, vgr).await?;

    let backend = resolve_lean_backend(
        ctx,
        class.as_ref(),
        &namespace,
        members.first().map(String::as_str),
    )
    .await?;
    let Some(backend) = backend else {
        warn!(name = %vgr.name_any(), "unknown backend for group");
        let status = lean_unknown_backend_status(vgr.metadata.generation);
        patch_group_status(ctx, vgr, status).await?;
        return Ok(Action::await_change());
    };

    let adapter = ctx.adapter(backend).await?;
    let intent = ReplicationIntent::from_group(vgr, members);

    let outcome = match adapter.reconcile(&intent, class.as_ref()).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_conflict() => return Ok(Action::requeue(Duration::ZERO)),
        Err(e) if e.is_retriable() => return Err(e),
        Err(e) => {
            let status = lean_failed_status(vgr.metadata.generation, &e);
            patch_group_status(ctx, vgr, status).await?;
            return Ok(Action::await_change());
        }
    };

    let (composite, requeue) = observe(
        adapter.as_ref(),
        &intent,
        class.as_ref(),
        outcome.requeue_after,
    )
    .await;
    let status = lean_status(vgr.metadata.generation, composite);
    patch_group_status(ctx, vgr, status).await?;

    Ok(match requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

async fn cleanup_group(ctx: &ControllerState, vgr: &VolumeGroupReplication) -> Result<Action> {
    let namespace = vgr.namespace().unwrap_or_else(|| "default".to_string());
    let class = fetch_group_class(ctx, &vgr.spec.volume_group_replication_class).await?;
    let members = selected_pvcs(ctx, &namespace, vgr).await?;
    let backend = resolve_lean_backend(
        ctx,
        class.as_ref(),
        &namespace,
        members.first().map(String::as_str),
    )
    .await?;
    let Some(backend) = backend else {
        return Ok(Action::await_change());
    };
    let adapter = ctx.adapter(backend).await?;
    let intent = ReplicationIntent::from_group(vgr, members);
    adapter.delete(&intent).await?;
    Ok(Action::await_change())
}

// ============================================================================
// Observation and status mirroring
// ============================================================================

/// Observe the backend, advance any pending transition, and run the recovery
/// ladder when the relationship is unhealthy. Returns the composite status
/// and the final requeue decision.
async fn observe(
    adapter: &dyn ReplicationAdapter,
    intent: &ReplicationIntent,
    class: Option<&ReplicationClassView>,
    mut requeue: Option<Duration>,
) -> (CompositeStatus, Option<Duration>) {
    let mut composite = match adapter.status(intent).await {
        Ok(status) => status,
        Err(e) => {
            warn!(object = %intent.object_ref(), error = %e, "status observation failed");
            CompositeStatus::default()
        }
    };

    if let Some(tracker) = adapter.transitions() {
        if tracker.pending(&intent.namespace, &intent.name).is_some() {
            let confirmed = composite.state == Some(intent.state);
            match tracker.poll(&intent.namespace, &intent.name, confirmed) {
                TransitionPoll::Pending => {
                    requeue = Some(requeue.unwrap_or(STATE_TRANSITION_RETRY_INTERVAL));
                }
                TransitionPoll::Failed(reason) => {
                    composite
                        .conditions
                        .push(Condition::degraded("TransitionFailed", &reason));
                }
                TransitionPoll::Completed => {}
            }
        }
    }

    if composite.health == Health::Unhealthy {
        match adapter.recover(intent, class).await {
            Ok(outcome) => {
                info!(object = %intent.object_ref(), ?outcome, "recovery ladder succeeded");
                requeue = Some(requeue.unwrap_or(STATE_TRANSITION_RETRY_INTERVAL));
            }
            Err(e) => {
                warn!(object = %intent.object_ref(), error = %e, "recovery ladder failed");
                composite
                    .conditions
                    .push(Condition::degraded("RecoveryFailed", &e.to_string()));
            }
        }
    }

    (composite, requeue)
}

fn ready_condition(composite: &CompositeStatus) -> Condition {
    match composite.health {
        Health::Healthy | Health::Degraded => {
            Condition::ready(true, "ReconcileSucceeded", "backend replication is programmed")
        }
        Health::Unhealthy => Condition::ready(false, "BackendUnhealthy", "backend reports errors"),
        Health::Unknown => Condition::ready(
            true,
            "AwaitingBackend",
            "backend has not reported status yet",
        ),
    }
}

fn unified_status(
    generation: Option<i64>,
    composite: CompositeStatus,
) -> UnifiedVolumeReplicationStatus {
    let mut conditions = vec![ready_condition(&composite)];
    conditions.extend(composite.conditions.clone());
    UnifiedVolumeReplicationStatus {
        state: composite.state.map(|s| s.as_str().to_string()),
        health: composite.health,
        sync_progress: composite.sync_progress,
        last_sync_time: composite.last_sync_time,
        next_sync_time: composite.next_sync_time,
        message: composite.message,
        observed_generation: generation,
        conditions,
    }
}

fn unknown_backend_status(generation: Option<i64>) -> UnifiedVolumeReplicationStatus {
    UnifiedVolumeReplicationStatus {
        health: Health::Unknown,
        message: Some("no adapter matches this resource's backend".to_string()),
        observed_generation: generation,
        conditions: vec![Condition::ready(
            false,
            "UnknownBackend",
            "no adapter matches this resource's backend",
        )],
        ..Default::default()
    }
}

fn failed_status(generation: Option<i64>, err: &Error) -> UnifiedVolumeReplicationStatus {
    UnifiedVolumeReplicationStatus {
        health: Health::Unknown,
        message: Some(err.to_string()),
        observed_generation: generation,
        conditions: vec![Condition::ready(false, &err.kind().to_string(), &err.to_string())],
        ..Default::default()
    }
}

fn lean_status(generation: Option<i64>, composite: CompositeStatus) -> VolumeReplicationStatus {
    let mut conditions = vec![ready_condition(&composite)];
    conditions.extend(composite.conditions.clone());
    VolumeReplicationStatus {
        state: composite.state.map(|s| s.as_str().to_string()),
        message: composite.message,
        last_sync_time: composite.last_sync_time,
        observed_generation: generation,
        conditions,
    }
}

fn lean_unknown_backend_status(generation: Option<i64>) -> VolumeReplicationStatus {
    VolumeReplicationStatus {
        message: Some("no adapter matches this resource's backend".to_string()),
        observed_generation: generation,
        conditions: vec![Condition::ready(
            false,
            "UnknownBackend",
            "no adapter matches this resource's backend",
        )],
        ..Default::default()
    }
}

fn lean_failed_status(generation: Option<i64>, err: &Error) -> VolumeReplicationStatus {
    VolumeReplicationStatus {
        message: Some(err.to_string()),
        observed_generation: generation,
        conditions: vec![Condition::ready(false, &err.kind().to_string(), &err.to_string())],
        ..Default::default()
    }
}

async fn patch_unified_status(
    ctx: &ControllerState,
    uvr: &UnifiedVolumeReplication,
    status: UnifiedVolumeReplicationStatus,
) -> Result<()> {
    let namespace = uvr.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<UnifiedVolumeReplication> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &uvr.name_any(),
        &PatchParams::apply(OPERATOR_NAME),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

async fn patch_volume_status(
    ctx: &ControllerState,
    vr: &VolumeReplication,
    status: VolumeReplicationStatus,
) -> Result<()> {
    let namespace = vr.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VolumeReplication> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &vr.name_any(),
        &PatchParams::apply(OPERATOR_NAME),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

async fn patch_group_status(
    ctx: &ControllerState,
    vgr: &VolumeGroupReplication,
    status: VolumeReplicationStatus,
) -> Result<()> {
    let namespace = vgr.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VolumeGroupReplication> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &vgr.name_any(),
        &PatchParams::apply(OPERATOR_NAME),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VolumeReplicationState;

    #[test]
    fn unknown_backend_condition_matches_the_contract() {
        let status = lean_unknown_backend_status(Some(3));
        assert_eq!(status.conditions.len(), 1);
        let condition = &status.conditions[0];
        assert_eq!(condition.type_, "Ready");
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason, "UnknownBackend");
        assert_eq!(status.observed_generation, Some(3));
    }

    #[test]
    fn healthy_composite_yields_ready_true() {
        let composite = CompositeStatus {
            state: Some(VolumeReplicationState::Primary),
            health: Health::Healthy,
            sync_progress: Some(100),
            ..Default::default()
        };
        let status = unified_status(Some(1), composite);
        assert_eq!(status.state.as_deref(), Some("primary"));
        assert_eq!(status.conditions[0].type_, "Ready");
        assert_eq!(status.conditions[0].status, "True");
        assert_eq!(status.sync_progress, Some(100));
    }

    #[test]
    fn failed_status_carries_the_error_kind() {
        let err = Error::ValidationError("bad transition".into());
        let status = failed_status(Some(2), &err);
        assert_eq!(status.conditions[0].status, "False");
        assert_eq!(status.conditions[0].reason, "Validation");
        assert!(status.message.unwrap().contains("bad transition"));
    }

    #[test]
    fn error_policy_requeues_by_classification() {
        let retryable = Error::TimeoutError(Duration::from_secs(30));
        assert!(retryable.is_retriable());
        let fatal = Error::ValidationError("no".into());
        assert!(!fatal.is_retriable());
    }
}
