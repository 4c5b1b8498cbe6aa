//! node-trust - node identity and serving-certificate trust for a cloud-provider integration
//!
//! A node's network addresses, its identity labels and the serving
//! certificates its kubelet may obtain are tied together here:
//!
//! - addresses observed on the host are classified into internal and external
//!   node addresses under per-platform rules
//! - cluster name, platform and lifecycle are kept on the node object as
//!   labels through minimal, idempotent patches
//! - kubelet serving CSRs are approved only when every IP they claim is an
//!   address recorded on the node
//!
//! # Modules
//!
//! - [`address`] - Address classification
//! - [`identity`] - Identity label synchronization
//! - [`csr`] - Kubelet serving CSR recognition, evaluation and approval
//! - [`registry`] - Node registry seam over the Kubernetes API
//! - [`config`] - Cloud config file
//! - [`retry`] - Retry with exponential backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod address;
pub mod config;
pub mod csr;
pub mod error;
pub mod identity;
pub mod registry;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
