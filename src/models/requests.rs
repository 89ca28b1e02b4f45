//! Request DTOs for the diagnostics API

use serde::Deserialize;

use crate::keys::CacheKey;

/// Request body for POST /invalidate
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    /// Key prefix in `seg:seg` display form
    pub prefix: String,
    /// Refetch every invalidated key in the background
    #[serde(default)]
    pub refetch: bool,
}

impl InvalidateRequest {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.prefix.trim().is_empty() {
            return Some("Prefix cannot be empty".to_string());
        }
        if self.prefix.split(':').any(str::is_empty) {
            return Some(format!("Prefix '{}' has an empty segment", self.prefix));
        }
        None
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::parse(&self.prefix)
    }
}

/// Query string of GET /cache
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheQuery {
    /// Limits the listing to keys under this prefix; all keys when absent
    #[serde(default)]
    pub prefix: Option<String>,
}

impl CacheQuery {
    pub fn key(&self) -> CacheKey {
        self.prefix
            .as_deref()
            .map(CacheKey::parse)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_request_defaults_refetch() {
        let req: InvalidateRequest = serde_json::from_str(r#"{"prefix": "orders"}"#).unwrap();
        assert_eq!(req.prefix, "orders");
        assert!(!req.refetch);
        assert!(req.validate().is_none());
    }

    #[test]
    fn test_validate_rejects_empty_segments() {
        let empty = InvalidateRequest {
            prefix: " ".to_string(),
            refetch: false,
        };
        assert!(empty.validate().is_some());

        let gap = InvalidateRequest {
            prefix: "orders::list".to_string(),
            refetch: true,
        };
        assert!(gap.validate().unwrap().contains("empty segment"));
    }

    #[test]
    fn test_cache_query_without_prefix_matches_everything() {
        let query = CacheQuery::default();
        assert!(query.key().is_empty());

        let query = CacheQuery {
            prefix: Some("products:detail".to_string()),
        };
        assert_eq!(query.key().len(), 2);
    }
}
