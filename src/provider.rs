use crate::error::ProviderError;
use crate::models::{SourceRequest, StreamSource};
use async_trait::async_trait;

/// An upstream source of playable results.
///
/// Returning `Ok(vec![])` means "nothing found"; an `Err` is a hard failure.
/// Both contribute nothing to the aggregate. Implementations must be safe to
/// call concurrently and must not retry on their own.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable name used for metrics, timeouts and cache keys
    fn name(&self) -> &str;

    async fn fetch(&self, request: &SourceRequest) -> Result<Vec<StreamSource>, ProviderError>;
}
