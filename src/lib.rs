//! # enclaverun
//!
//! **Ephemeral Enclave Orchestration Runtime**
//!
//! This crate boots isolated "enclaves" of interconnected containers for
//! integration testing and local simulation of distributed systems. A
//! declarative plan describes what an enclave should contain; the runtime
//! interprets it into typed instructions, validates them symbolically, and
//! executes them against a pluggable container backend while streaming
//! progress to the client line by line.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                            enclaverun                              │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐    │
//! │  │                 Plan Pipeline (plan)                       │    │
//! │  │  script ─▶ Interpreter ─▶ Validator ─▶ Executor ─▶ stream  │    │
//! │  └──────────────────────────────┬─────────────────────────────┘    │
//! │                                 │                                  │
//! │  ┌──────────────────────────────┼─────────────────────────────┐    │
//! │  │              Service Network (network)                     │    │
//! │  │  registrations │ IP allocator │ topology │ sidecars        │    │
//! │  └──────────────────────────────┬─────────────────────────────┘    │
//! │                                 │                                  │
//! │  ┌──────────────────────────────┼─────────────────────────────┐    │
//! │  │              Files-Artifact Store (artifacts)              │    │
//! │  │  uuid-keyed tar.gz │ atomic writes │ template rendering    │    │
//! │  └──────────────────────────────┬─────────────────────────────┘    │
//! ├─────────────────────────────────┼──────────────────────────────────┤
//! │                       Container Backends                           │
//! │        ┌───────────────┐                ┌────────────────┐         │
//! │        │ DaemonBackend │                │ ClusterBackend │         │
//! │        │  (one host)   │                │  (scheduler)   │         │
//! │        └───────────────┘                └────────────────┘         │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Service Lifecycle
//!
//! Every service moves monotonically through one state machine, whichever
//! backend runs it:
//!
//! ```text
//!              register
//!      ∅ ───────────────▶ REGISTERED
//!                             │  start
//!                             ▼
//!                          RUNNING ──stop──▶ STOPPED
//!                             │                  │
//!                             └──── destroy ─────┴──▶ ∅
//! ```
//!
//! # Key Properties
//!
//! - **Interpreter purity**: interpreting the same script + params twice
//!   yields the same plan; all backend-state lookups live in the validator
//!   and executor.
//! - **Stable labels**: every backend object carries the label keys in
//!   [`constants`], so a newer runtime finds objects an older one created.
//! - **Two-chain traffic shaping**: partition enforcement swaps complete
//!   filter chains, never leaving a window of empty rules.
//! - **Bulk results**: batch operations report per-item success/error maps
//!   and fail as a whole only when the request could not be issued.
//!
//! # Example
//!
//! ```rust,ignore
//! use enclaverun::backend::DaemonBackend;
//! use enclaverun::enclave::{EnclaveId, EnclaveManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> enclaverun::Result<()> {
//!     let backend = Arc::new(DaemonBackend::new());
//!     let manager = EnclaveManager::new(backend, "/var/lib/enclaverun".into());
//!
//!     let enclave = manager.create_enclave(&EnclaveId::new("test"), true).await?;
//!     let (ip, data_dir) = enclave
//!         .network
//!         .register_service(&"db".into(), None)
//!         .await?;
//!     println!("db will live at {ip}, scratch in {data_dir}");
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod constants;
pub mod enclave;
mod error;
pub mod network;
pub mod plan;
pub mod port_spec;
pub mod server;
pub mod service;

pub use error::{Error, Result};
