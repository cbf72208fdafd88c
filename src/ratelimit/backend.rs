//! Counter backend trait for abstracting the shared and in-process counters.

use async_trait::async_trait;

use super::decision::{BackendKind, Decision};
use super::identifier::Identifier;
use super::policy::RateLimitPolicy;
use crate::error::Result;

/// Trait for counter implementations.
///
/// A backend owns its counter entries exclusively. Two backends never share or
/// reconcile state, even when they count the same caller.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Record one request for `identifier` under `policy` and decide admission.
    async fn hit(&self, policy: &RateLimitPolicy, identifier: &Identifier) -> Result<Decision>;

    /// Which kind of counter this is.
    fn kind(&self) -> BackendKind;
}
