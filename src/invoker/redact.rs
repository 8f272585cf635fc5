//! Redaction seam. Real redactors live outside this crate.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("redaction failed: {reason}")]
pub struct RedactionError {
    pub reason: String,
}

/// Scrubs sensitive text from tool output.
#[async_trait]
pub trait Redactor: Send + Sync {
    async fn redact(&self, text: &str) -> Result<String, RedactionError>;
}

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRedactor;

#[async_trait]
impl Redactor for NoopRedactor {
    async fn redact(&self, text: &str) -> Result<String, RedactionError> {
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_passes_through() {
        assert_eq!(NoopRedactor.redact("token=abc").await.unwrap(), "token=abc");
    }
}
