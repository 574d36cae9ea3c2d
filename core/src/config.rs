//! Client configuration.
//!
//! Credentials are passed in explicitly. `ClientConfig::from_env` is the one
//! place the process environment is consulted.

use std::fmt;

/// API version segment used when none is configured.
pub const DEFAULT_API_VERSION: &str = "api/v1";

/// Environment variable read by [`ClientConfig::from_env`].
pub const API_KEY_ENV: &str = "MEMOBASE_API_KEY";

#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub project_url: String,
    pub api_key: Option<String>,
    pub api_version: String,
}

impl ClientConfig {
    pub fn new(project_url: impl Into<String>) -> Self {
        Self {
            project_url: project_url.into(),
            api_key: None,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    /// Like [`ClientConfig::new`], with the API key taken from
    /// `MEMOBASE_API_KEY` when that variable is set and non-empty.
    pub fn from_env(project_url: impl Into<String>) -> Self {
        let mut config = Self::new(project_url);
        config.api_key = std::env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty());
        config
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }
}

// Keeps the key out of logs.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("project_url", &self.project_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .finish()
    }
}
