//! Connection seams between the tool dispatcher and the two data stores.
//!
//! A source hands out one session per tool call. Sessions release their
//! underlying connection when dropped, so every exit path of a call
//! (success, rejected input, backend failure) gives the connection back.

use crate::{error::Result, influx::FluxTable};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Ordered column → value mapping for one relational row.
pub type RelationalRow = Map<String, Value>;

#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TimeSeriesSession>>;
}

#[async_trait]
pub trait TimeSeriesSession: Send {
    async fn query(&mut self, flux: &str) -> Result<Vec<FluxTable>>;
}

#[async_trait]
pub trait RelationalSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn RelationalSession>>;
}

#[async_trait]
pub trait RelationalSession: Send {
    /// Runs a row-returning statement with text parameters bound to `$1..$n`.
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RelationalRow>>;

    /// Runs a statement and returns the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;
}
