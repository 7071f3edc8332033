//! Boundary to the external tag-suggestion service.
//!
//! Best effort: any failure or timeout leaves the note untouched.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TagSuggestion {
    pub tags: BTreeSet<String>,
    /// Rewritten body, if the service offers one
    pub enhanced_body: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaggingError {
    #[error("Tag service unavailable: {0}")]
    Unavailable(String),

    #[error("Tag service timed out after {0:?}")]
    Timeout(Duration),
}

/// Text in, tags out.
#[async_trait]
pub trait TagSuggester: Send + Sync {
    async fn suggest(&self, body: &str) -> Result<TagSuggestion, TaggingError>;
}

/// Ask `suggester` for tags, giving up after `timeout`.
pub async fn suggest_with_timeout<T: TagSuggester + ?Sized>(
    suggester: &T,
    body: &str,
    timeout: Duration,
) -> Result<TagSuggestion, TaggingError> {
    match tokio::time::timeout(timeout, suggester.suggest(body)).await {
        Ok(Ok(suggestion)) => {
            debug!(tags = suggestion.tags.len(), "Received tag suggestion");
            Ok(suggestion)
        }
        Ok(Err(e)) => {
            warn!("Tag suggestion failed: {}", e);
            Err(e)
        }
        Err(_) => {
            warn!(?timeout, "Tag suggestion timed out");
            Err(TaggingError::Timeout(timeout))
        }
    }
}

/// Normalize suggested tags: trimmed, lowercased, empty ones dropped.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl TagSuggester for Slow {
        async fn suggest(&self, _body: &str) -> Result<TagSuggestion, TaggingError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(TagSuggestion {
                tags: BTreeSet::new(),
                enhanced_body: None,
            })
        }
    }

    struct Fixed;

    #[async_trait]
    impl TagSuggester for Fixed {
        async fn suggest(&self, body: &str) -> Result<TagSuggestion, TaggingError> {
            Ok(TagSuggestion {
                tags: normalize_tags(body.split_whitespace()),
                enhanced_body: None,
            })
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let err = suggest_with_timeout(&Slow, "body", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, TaggingError::Timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_suggestion_passes_through() {
        let suggestion = suggest_with_timeout(&Fixed, "Rust  rust sync", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(suggestion.tags, normalize_tags(["rust", "sync"]));
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags([" Urgent ", "", "urgent", "Work"]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["urgent", "work"]);
    }
}
