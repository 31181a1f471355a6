//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::FetchPolicy;
use crate::reconnect::ReconnectConfig;
use crate::retry::RetryPolicy;

/// Environment variable holding the streaming admin secret.
pub const ADMIN_SECRET_ENV: &str = "CHAT_APP_X_HASURA_ID";

/// Configuration for the chat GraphQL client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatClientConfig {
    /// GraphQL-over-HTTP endpoint for queries and mutations.
    #[serde(default = "default_http_url")]
    pub http_url: String,

    /// WebSocket endpoint for subscriptions.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Admin secret sent in the streaming connection params.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,

    /// HTTP request timeout.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,

    /// WebSocket connect timeout.
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Time to wait for the streaming connection acknowledgement.
    #[serde(default = "default_ack_timeout", with = "duration_secs")]
    pub ack_timeout: Duration,

    /// Retry policy for the HTTP transport.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Reconnect policy for the streaming transport.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Default cache interaction for queries.
    #[serde(default)]
    pub fetch: FetchPolicy,
}

fn default_http_url() -> String {
    "https://rn-hasura-chat-app.herokuapp.com/v1/graphql".into()
}

fn default_ws_url() -> String {
    "ws://rn-hasura-chat-app.herokuapp.com/v1/graphql".into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            admin_secret: None,
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectConfig::default(),
            fetch: FetchPolicy::default(),
        }
    }
}

impl ChatClientConfig {
    /// Defaults plus the admin secret from [`ADMIN_SECRET_ENV`], when set.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            admin_secret: std::env::var(ADMIN_SECRET_ENV).ok(),
            ..Self::default()
        }
    }

    /// Override both endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, http_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        self.http_url = http_url.into();
        self.ws_url = ws_url.into();
        self
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
