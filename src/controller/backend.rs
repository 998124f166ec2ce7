//! Backend detection
//!
//! The lean revision names its backend through the class `provisioner`; the
//! rich revision through whichever `extensions` sub-object is populated.
//! When the provisioner is ambiguous the referenced PVC's storage class is
//! consulted before giving up.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client};
use tracing::debug;

use crate::crd::Extensions;
use crate::error::Result;
use crate::translation::Backend;

/// All backends whose provisioner patterns match `provisioner`.
fn matching_backends(provisioner: &str) -> Vec<Backend> {
    let p = provisioner.to_lowercase();
    let mut matches = Vec::new();
    if p.contains("rbd.csi.ceph.com") || p.contains("ceph") {
        matches.push(Backend::Ceph);
    }
    if p.contains("csi.trident.netapp.io") || p.contains("trident") || p.contains("netapp") {
        matches.push(Backend::Trident);
    }
    if p.contains("csi-powerstore.dellemc.com") || p.contains("powerstore") || p.contains("dellemc")
    {
        matches.push(Backend::Dell);
    }
    matches
}

/// Resolve a provisioner string to a backend; `None` when it matches no
/// backend or more than one.
pub fn backend_for_provisioner(provisioner: &str) -> Option<Backend> {
    match matching_backends(provisioner).as_slice() {
        [single] => Some(*single),
        other => {
            if !other.is_empty() {
                debug!(provisioner, candidates = ?other, "ambiguous provisioner");
            }
            None
        }
    }
}

/// Rich-revision dispatch: the populated extensions sub-object names the
/// backend.
pub fn backend_for_extensions(extensions: &Extensions) -> Option<Backend> {
    match (
        extensions.ceph.is_some(),
        extensions.trident.is_some(),
        extensions.powerstore.is_some(),
    ) {
        (true, false, false) => Some(Backend::Ceph),
        (false, true, false) => Some(Backend::Trident),
        (false, false, true) => Some(Backend::Dell),
        _ => None,
    }
}

/// Fallback: resolve through the PVC's storage class provisioner.
pub async fn backend_for_pvc(
    client: &Client,
    namespace: &str,
    pvc_name: &str,
) -> Result<Option<Backend>> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let pvc = match pvcs.get(pvc_name).await {
        Ok(pvc) => pvc,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let Some(class_name) = pvc.spec.and_then(|s| s.storage_class_name) else {
        return Ok(None);
    };

    let classes: Api<StorageClass> = Api::all(client.clone());
    let class = match classes.get(&class_name).await {
        Ok(class) => class,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(backend_for_provisioner(&class.provisioner))
}

/// Resolve through a storage class name directly (rich revision fallback).
pub async fn backend_for_storage_class(
    client: &Client,
    class_name: &str,
) -> Result<Option<Backend>> {
    let classes: Api<StorageClass> = Api::all(client.clone());
    let class = match classes.get(class_name).await {
        Ok(class) => class,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(backend_for_provisioner(&class.provisioner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CephExtension, MirroringMode, TridentExtension};

    #[test]
    fn known_provisioners_resolve() {
        assert_eq!(
            backend_for_provisioner("rbd.csi.ceph.com"),
            Some(Backend::Ceph)
        );
        assert_eq!(
            backend_for_provisioner("openshift-storage.rbd.csi.ceph.com"),
            Some(Backend::Ceph)
        );
        assert_eq!(
            backend_for_provisioner("csi.trident.netapp.io"),
            Some(Backend::Trident)
        );
        assert_eq!(
            backend_for_provisioner("csi-powerstore.dellemc.com"),
            Some(Backend::Dell)
        );
        // Matching is case-insensitive.
        assert_eq!(
            backend_for_provisioner("CSI.Trident.NetApp.IO"),
            Some(Backend::Trident)
        );
    }

    #[test]
    fn unknown_provisioner_resolves_to_none() {
        assert_eq!(backend_for_provisioner("nfs.csi.k8s.io"), None);
        assert_eq!(backend_for_provisioner(""), None);
    }

    #[test]
    fn ambiguous_provisioner_resolves_to_none() {
        assert_eq!(backend_for_provisioner("ceph-on-netapp.example.io"), None);
    }

    #[test]
    fn extensions_dispatch_on_the_populated_sub_object() {
        let ext = Extensions {
            ceph: Some(CephExtension {
                mirroring_mode: MirroringMode::Snapshot,
            }),
            ..Default::default()
        };
        assert_eq!(backend_for_extensions(&ext), Some(Backend::Ceph));

        let ext = Extensions {
            trident: Some(TridentExtension::default()),
            ..Default::default()
        };
        assert_eq!(backend_for_extensions(&ext), Some(Backend::Trident));

        assert_eq!(backend_for_extensions(&Extensions::default()), None);

        // Two populated sub-objects are ambiguous.
        let ext = Extensions {
            ceph: Some(CephExtension {
                mirroring_mode: MirroringMode::Journal,
            }),
            trident: Some(TridentExtension::default()),
            ..Default::default()
        };
        assert_eq!(backend_for_extensions(&ext), None);
    }
}
