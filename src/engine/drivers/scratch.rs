// SPDX-License-Identifier: Apache-2.0

//! Scratch-store backend behind the reserved `__session__` source id.
//!
//! Plans read earlier staged results and session tables through this backend,
//! with the same validation and error path as any other relational source.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::engine::drivers::{returns_rows, split_statements};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::RelationalBackend;
use crate::engine::types::ResultSet;
use crate::federation::scratch::ScratchStore;

pub struct ScratchBackend {
    store: Arc<ScratchStore>,
}

impl ScratchBackend {
    pub fn new(store: Arc<ScratchStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RelationalBackend for ScratchBackend {
    fn driver_id(&self) -> &'static str {
        "duckdb"
    }

    #[instrument(skip(self, statement), fields(driver = "duckdb"))]
    async fn execute(&self, statement: &str) -> EngineResult<ResultSet> {
        let statements = split_statements(statement);
        // Reads only: writes would bypass the store's own table bookkeeping.
        if let Some(bad) = statements.iter().find(|s| !returns_rows(s)) {
            return Err(EngineError::execution_error(format!(
                "Session source only accepts read statements: {bad}"
            )));
        }
        let Some(last) = statements.last().cloned() else {
            return Err(EngineError::execution_error("empty statement"));
        };
        self.store.blocking(move |store| store.query(&last)).await
    }
}
