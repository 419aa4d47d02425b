//! Dependency-aware bulk loading.
//!
//! This module inserts large row sets into several related tables, parents
//! before children, translating the logical keys that child rows carry into
//! the physical keys their parents received on insert.
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **`resolver`**: Builds the child → parent graph and orders it with Kahn's
//!   algorithm. Cycles are rejected before any connection is opened.
//!
//! - **`registry`**: Maps each publishing table's logical keys to physical keys.
//!   Append-only, guarded by a single lock, shared by every worker.
//!
//! - **`rewriter`**: Replaces logical keys in foreign-key columns with physical
//!   keys from the registry, a whole table at a time.
//!
//! - **`executor`**: Splits a table into batches and runs each batch as one
//!   transaction, sequentially or on a pool of concurrent workers.
//!
//! - **`checkpoint`**: Persists completed tables and the registry so an
//!   interrupted run can resume.
//!
//! - **`session`**: Applies bulk-friendly session settings to every pooled
//!   connection and restores them afterwards.
//!
//! - **`coordinator`**: [`BulkLoader`], which ties the pieces together.
//!
//! ## Data Flow
//!
//! 1. **Plan**: validate tables, resolve order, build statements
//! 2. **Resume**: load the checkpoint and seed the registry from it
//! 3. **Prepare**: open the pool, apply session settings
//! 4. **Load**: per table, rewrite foreign keys, execute batches, publish keys,
//!    save the checkpoint
//! 5. **Finish**: restore session settings, clear the checkpoint on success

pub mod checkpoint;
pub mod coordinator;
pub mod executor;
pub mod plan;
pub mod registry;
pub mod resolver;
pub mod rewriter;
pub mod session;
pub mod stats;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use coordinator::BulkLoader;
pub use executor::{ExecutionMode, KeyCapture, KeyOrigin};
pub use plan::{LoadPlan, TablePlan};
pub use registry::{IdRegistry, RegistrySnapshot};
pub use resolver::{DependencyGraph, resolve_order};
pub use session::{SessionOptimizer, SessionSetting};
pub use stats::{LoadReport, TableReport};
