use std::future::Future;
use std::time::Duration;

use crate::error::{IngestError, Result};

/// Await `fut`, failing with [`IngestError::Timeout`] after `after`.
pub async fn with_timeout<T, E, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<IngestError>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(IngestError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}
