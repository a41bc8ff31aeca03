use serde::{Deserialize, Serialize};

use crate::api::ClientError;

/// Model used when the backend reports none and the user picked none.
pub const DEFAULT_MODEL: &str = "gpt-5-chat-latest";

/// Connection settings for an OpenWebUI-compatible backend.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    pub base_url: String,
    pub api_key: String,
    pub model: Option<String>,
}

impl Settings {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: None,
        }
    }

    /// Both the base URL and the API key must be present before any call.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_url.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(ClientError::Config(
                "base URL and API key must be configured".into(),
            ));
        }
        Ok(())
    }

    /// Join a path onto the base URL, tolerating a trailing slash.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn model(&self) -> &str {
        match self.model.as_deref() {
            Some(m) if !m.trim().is_empty() => m,
            _ => DEFAULT_MODEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_missing_key() {
        let settings = Settings::new("http://localhost:8080", "");
        assert!(settings.validate().is_err());
        let settings = Settings::new("", "sk-abc");
        assert!(settings.validate().is_err());
        let settings = Settings::new("http://localhost:8080", "sk-abc");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_url_join_trims_trailing_slash() {
        let settings = Settings::new("http://localhost:8080/", "sk-abc");
        assert_eq!(
            settings.url("/api/models"),
            "http://localhost:8080/api/models"
        );
    }

    #[test]
    fn test_model_fallback() {
        let mut settings = Settings::new("http://localhost:8080", "sk-abc");
        assert_eq!(settings.model(), DEFAULT_MODEL);
        settings.model = Some("qwen2.5".into());
        assert_eq!(settings.model(), "qwen2.5");
    }
}
