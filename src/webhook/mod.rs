//! Validating admission webhook
//!
//! HTTPS endpoint serving AdmissionReview requests for the rich revision.
//! Validate-only: the handler never mutates the object. Registered with
//! `failurePolicy=Fail` and `sideEffects=None`.

pub mod certs;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::{Client, ResourceExt};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::crd::UnifiedVolumeReplication;
use crate::error::{Error, Result};
use crate::validation;

/// Path the ValidatingWebhookConfiguration points at.
pub const WEBHOOK_PATH: &str =
    "/validate-replication-unified-io-v1alpha1-unifiedvolumereplication";

#[derive(Clone, Debug)]
pub struct WebhookOptions {
    pub port: u16,
    /// Directory holding a mounted `tls.crt`/`tls.key` pair; self-signed
    /// certificates are generated when absent.
    pub cert_dir: Option<PathBuf>,
    pub service_name: String,
    pub namespace: String,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            port: 9443,
            cert_dir: None,
            service_name: "unified-replication-webhook".to_string(),
            namespace: "default".to_string(),
        }
    }
}

/// Run the webhook server until the process exits.
pub async fn run_webhook(client: Client, opts: WebhookOptions) -> Result<()> {
    let app = Router::new()
        .route(WEBHOOK_PATH, post(validate_handler))
        .route("/healthz", get(healthz));
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(|| async { crate::metrics::render() }));
    let app = app.layer(TraceLayer::new_for_http()).with_state(client);

    let tls = tls_config(&opts).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], opts.port));
    info!("Admission webhook listening on {}{}", addr, WEBHOOK_PATH);

    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::ConfigError(format!("webhook server error: {}", e)))
}

async fn tls_config(opts: &WebhookOptions) -> Result<RustlsConfig> {
    if let Some(dir) = &opts.cert_dir {
        if let Some((cert, key)) = certs::mounted_cert_paths(dir) {
            info!("Using mounted webhook certificates from {}", dir.display());
            return RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::ConfigError(format!("cannot load mounted certs: {}", e)));
        }
        warn!(
            "No tls.crt/tls.key under {}; generating self-signed certificates",
            dir.display()
        );
    }

    let bundle = certs::generate_self_signed(&opts.service_name, &opts.namespace)?;
    info!(
        "Generated self-signed webhook certificate, expires {}",
        bundle.expires_at()
    );
    RustlsConfig::from_pem(
        bundle.chain_pem().into_bytes(),
        bundle.server_key_pem.clone().into_bytes(),
    )
    .await
    .map_err(|e| Error::ConfigError(format!("cannot build TLS config: {}", e)))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn validate_handler(
    State(client): State<Client>,
    Json(review): Json<AdmissionReview<UnifiedVolumeReplication>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<UnifiedVolumeReplication> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            warn!("Malformed admission review: {}", err);
            return Json(
                AdmissionResponse::invalid(format!("malformed admission review: {}", err))
                    .into_review(),
            );
        }
    };

    let mut response = AdmissionResponse::from(&req);

    let (warnings, result) = match req.operation {
        Operation::Create => match &req.object {
            Some(obj) => {
                let siblings = list_siblings(&client, obj).await;
                validation::validate_create(obj, &siblings)
            }
            None => (Vec::new(), Err(Error::ValidationError("no object in request".into()))),
        },
        Operation::Update => match (&req.old_object, &req.object) {
            (Some(old), Some(new)) => validation::validate_update(old, new),
            _ => (
                Vec::new(),
                Err(Error::ValidationError("update request is missing objects".into())),
            ),
        },
        Operation::Delete => match &req.old_object {
            Some(obj) => validation::validate_delete(obj),
            None => (Vec::new(), Ok(())),
        },
        _ => (Vec::new(), Ok(())),
    };

    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    match result {
        Ok(()) => Json(response.into_review()),
        Err(err) => Json(response.deny(err.to_string()).into_review()),
    }
}

/// Other neutral resources in the candidate's namespace, for the uniqueness
/// scan. A failed list degrades to an empty set rather than blocking
/// admission on an API hiccup.
async fn list_siblings(
    client: &Client,
    obj: &UnifiedVolumeReplication,
) -> Vec<UnifiedVolumeReplication> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<UnifiedVolumeReplication> = Api::namespaced(client.clone(), &namespace);
    match api.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) => {
            warn!("Sibling list failed, skipping uniqueness check: {}", e);
            Vec::new()
        }
    }
}
