//! Unified Volume Replication Operator
//!
//! A Kubernetes operator translating a backend-neutral replication intent
//! into Ceph, NetApp Trident and Dell PowerStore native replication objects,
//! and reconciling their observed status back into the user's resource.

pub mod adapters;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;
pub mod translation;
pub mod validation;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "admission-webhook")]
pub mod webhook;

pub use crate::error::{Error, Result};
