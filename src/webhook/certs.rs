//! Webhook TLS certificates
//!
//! When no certificate secret is mounted, a self-signed CA and server pair
//! is generated at startup: one-year validity, SANs covering the in-cluster
//! service DNS names. Expiry is exposed for rotation tooling.

use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::error::{Error, Result};

const VALIDITY_DAYS: i64 = 365;

/// A generated CA + server certificate pair, PEM-encoded.
pub struct CertificateBundle {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    not_after: OffsetDateTime,
}

impl CertificateBundle {
    /// When the server certificate stops being valid.
    pub fn expires_at(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Whether the certificate expires within `window`; rotation tooling
    /// polls this.
    pub fn expires_within(&self, window: std::time::Duration) -> bool {
        let window = TimeDuration::try_from(window).unwrap_or(TimeDuration::MAX);
        OffsetDateTime::now_utc() + window >= self.not_after
    }

    /// The chain presented to clients: server certificate followed by the CA.
    pub fn chain_pem(&self) -> String {
        format!("{}{}", self.server_cert_pem, self.ca_cert_pem)
    }
}

/// The in-cluster DNS names a webhook service answers to.
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
        format!("{}.{}.svc.cluster.local", service, namespace),
    ]
}

/// Generate a self-signed CA and a server certificate for the webhook
/// service.
pub fn generate_self_signed(service: &str, namespace: &str) -> Result<CertificateBundle> {
    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + TimeDuration::days(VALIDITY_DAYS);

    let ca_key = KeyPair::generate().map_err(cert_error)?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).map_err(cert_error)?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "unified-replication-webhook-ca");
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(cert_error)?;

    let sans = service_dns_names(service, namespace);
    let server_key = KeyPair::generate().map_err(cert_error)?;
    let mut server_params = CertificateParams::new(sans.clone()).map_err(cert_error)?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, sans[2].clone());
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.not_before = not_before;
    server_params.not_after = not_after;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(cert_error)?;

    Ok(CertificateBundle {
        ca_cert_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        not_after,
    })
}

/// A mounted certificate secret, when one is provided.
pub fn mounted_cert_paths(dir: &Path) -> Option<(std::path::PathBuf, std::path::PathBuf)> {
    let cert = dir.join("tls.crt");
    let key = dir.join("tls.key");
    (cert.is_file() && key.is_file()).then_some((cert, key))
}

fn cert_error(err: rcgen::Error) -> Error {
    Error::ConfigError(format!("certificate generation failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_pem_encoded_pair() {
        let bundle = generate_self_signed("unified-replication-webhook", "replication-system")
            .unwrap();
        assert!(bundle.ca_cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(bundle.server_cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(bundle.server_key_pem.contains("PRIVATE KEY"));
        // Chain is server-first.
        assert!(bundle.chain_pem().starts_with(&bundle.server_cert_pem));
    }

    #[test]
    fn validity_is_one_year() {
        let bundle = generate_self_signed("svc", "ns").unwrap();
        assert!(!bundle.expires_within(std::time::Duration::from_secs(360 * 24 * 3600)));
        assert!(bundle.expires_within(std::time::Duration::from_secs(366 * 24 * 3600)));
    }

    #[test]
    fn dns_names_cover_the_service_forms() {
        let names = service_dns_names("hook", "infra");
        assert_eq!(
            names,
            vec![
                "hook",
                "hook.infra",
                "hook.infra.svc",
                "hook.infra.svc.cluster.local"
            ]
        );
    }

    #[test]
    fn missing_mounted_certs_fall_back() {
        assert!(mounted_cert_paths(Path::new("/nonexistent")).is_none());
    }
}
