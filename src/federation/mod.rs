// SPDX-License-Identifier: Apache-2.0

//! Federated plan execution
//!
//! Runs the per-source calls of a plan, stages every result as a table in a
//! per-session DuckDB scratch file and combines them there with one SQL query.

pub mod ident;
pub mod manager;
pub mod policy;
pub mod sandbox;
pub mod schema;
pub mod scratch;
pub mod session;
pub mod types;

pub use manager::{metadata_of, FederationOrchestrator, StagedOutput, StagedPlan};
pub use policy::{CountBasedPolicy, ExecutionOrder, SchedulingPolicy};
pub use schema::{ColumnType, InferredSchema, SchemaColumn};
pub use scratch::ScratchStore;
pub use session::{SessionTableInfo, SessionTables};
pub use types::*;
