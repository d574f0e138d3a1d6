//! # hsmvault
//!
//! Vendor-agnostic abstraction over Hardware Security Modules.
//!
//! Callers talk to an [`HsmService`]. The service resolves the active node of
//! a cluster through the [`ClusterManager`], delegates to a backend behind the
//! [`VendorAdapter`] trait, and records a tamper-evident [`AuditEntry`] for
//! every privileged operation. A software backend ([`SoftHsmAdapter`]) ships
//! with the crate; a hardware driver plugs in behind the same trait without
//! changing callers.
//!
//! ## Public API
//!
//! - Profiles: [`ConfigFactory`] builds an [`HsmConfig`] per environment and
//!   [`validate_production_config`] gates production deployment.
//! - Primitives: [`CryptoContext`] owns the entropy pool and exposes hashing,
//!   secure randomness, key derivation and nonce construction.
//! - Audit: [`AuditEntryBuilder`], [`AuditLog`] and [`FileAuditSink`].
//!
//! Key material never leaves a backend except through `export_key` on keys
//! created exportable, and is zeroized on drop.

pub mod adapter;
pub mod audit;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod context;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod lamport;
pub mod logging;
pub mod profiles;
pub mod random;
pub mod retry;
pub mod service;
pub mod soft_hsm;
pub mod validate;

pub use adapter::{
    CryptoResult, DecryptParams, EncryptParams, GenerateKeyParams, HealthLevel, HealthStatus, ImportKeyParams,
    ImportMaterial, KeyResult, SignParams, SignatureResult, VendorAdapter, VerificationResult, VerifyParams,
};
pub use audit::{AuditEntry, AuditEntryBuilder, AuditFilter, AuditLog, AuditOutcome, AuditSink, FileAuditSink};
pub use cluster::{ClusterManager, ClusterNode, ClusterView, NodeHealth, ServiceState};
pub use config::HsmConfig;
pub use connection::{Connection, ConnectionConfig};
pub use context::CryptoContext;
pub use error::{HsmError, Result};
pub use keys::{KeyFilter, KeyMetadata, KeyType, KeyUsage};
pub use profiles::{ComplianceFramework, ConfigFactory, ProfileKind};
pub use service::{Audited, HsmService};
pub use soft_hsm::{SoftHsmAdapter, SoftHsmFabric, SoftHsmNode};
pub use validate::{validate_production_config, ValidationReport};
