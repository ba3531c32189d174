//! `airlock` is a sandbox lifecycle controller for running untrusted incident-investigation
//! code in isolated Kubernetes pods.
//!
//! # Overview
//!
//! airlock provisions, binds, and tears down short-lived execution sandboxes. Each incident
//! investigation gets its own hardened pod that can run arbitrary tool invocations against a
//! customer's live infrastructure without ever holding the real credentials for those systems.
//! It handles:
//! - Warm pool provisioning and asynchronous backfill
//! - At-most-once claim binding of a sandbox to an investigation thread
//! - Scoped claim token issuance and verification
//! - Deadline enforcement and orphan-free teardown
//! - The credential-isolation boundary between sandboxes and third-party secrets
//!
//! # Key Features
//!
//! - **Strong Isolation**: sandbox pods run under a sandboxed-kernel runtime class
//! - **Warm Pool**: claims are served from pre-provisioned ready sandboxes
//! - **Atomic Claims**: resource-version CAS guarantees exactly one winner per sandbox
//! - **Scoped Tokens**: short-lived EdDSA capability tokens bound to sandbox, tenant, and thread
//! - **No Second Ledger**: the cluster API is the only durable store
//!
//! # Architecture
//!
//! airlock consists of several key components:
//!
//! - **Cluster**: narrow typed access to the Kubernetes objects the controller touches
//! - **Provision**: creation and teardown of a sandbox's resource set as a unit
//! - **Pool**: warm pool bookkeeping and replenishment
//! - **Claim**: the claim protocol, binding registry, and token delivery
//! - **Lifecycle**: deadline supervision and forced teardown
//! - **Token**: claim token minting, verification, and revocation
//! - **Server**: the controller REST API
//! - **Podapi**: the control endpoint served inside every sandbox pod
//!
//! # Modules
//!
//! - [`claim`] - Claim coordination and token delivery
//! - [`cli`] - Command-line interface and argument parsing
//! - [`cluster`] - Typed Kubernetes API access
//! - [`config`] - Configuration types and validation
//! - [`lifecycle`] - Deadline supervision and teardown
//! - [`podapi`] - In-pod control endpoint server
//! - [`pool`] - Warm pool management
//! - [`provision`] - Sandbox resource set provisioning
//! - [`sandbox`] - Sandbox records and the lifecycle state machine
//! - [`server`] - Controller REST API server
//! - [`token`] - Claim token issuance and verification
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod claim;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod lifecycle;
pub mod podapi;
pub mod pool;
pub mod provision;
pub mod sandbox;
pub mod server;
pub mod token;
pub mod utils;

pub use error::*;
