//! Partitioning of the shared backlog across workers.
//!
//! Several worker processes may run against the same document store. The
//! [`ClaimCoordinator`] hands each of them a disjoint batch of pending items:
//!
//! ```text
//!   pending ──claim (one transaction)──▶ processing ──▶ inferred | error
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use vlm_worker::scheduler::ClaimCoordinator;
//!
//! let coordinator = ClaimCoordinator::new(store.clone());
//! let batch = coordinator.claim_pending_batch().await?;
//! ```

pub mod claim;

pub use claim::{ClaimCoordinator, DEFAULT_MIN_BACKLOG};
