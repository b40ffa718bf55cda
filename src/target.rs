//! Boundary to the device under operation.
//!
//! The transport (USB, network RPC) lives outside this crate; the engine only
//! consumes this trait.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use crate::error::TargetError;

/// Opaque capability over one target.
#[async_trait]
pub trait TargetHandle: Send + Sync {
    /// Run one command-equivalent and return its captured output.
    async fn execute(&self, command: &str) -> Result<String, TargetError>;

    /// Deliver a blob to the target's addressable storage.
    async fn transfer(&self, payload: &[u8], destination: &str) -> Result<bool, TargetError>;

    /// Read target attributes. Keys the target does not know are simply
    /// absent from the returned map.
    async fn query_attributes(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>, TargetError>;
}

/// Await `fut` for at most `limit`, mapping an elapsed deadline to
/// [`TargetError::Timeout`].
pub async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TargetError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TargetError::Timeout(limit).into()),
    }
}
