//! Request authentication: credential lookup and header decoration.
//!
//! Every outgoing operation carries an `authorization` header (bearer
//! username, or the empty string when no credentials are available) and an
//! `x-hasura-user-id` header from the session profile. Credential lookup is
//! best-effort: a failing store degrades the request instead of blocking it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Header carrying the session profile identifier.
pub const USER_ID_HEADER: &str = "x-hasura-user-id";

/// Username/password pair held by a credential store.
///
/// Transient: fetched per request and dropped after header resolution. The
/// password is zeroized on drop and never logged.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Account username; doubles as the bearer token for the chat backend.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credential store errors.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// The backing store could not be reached.
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    /// No credentials are stored for this device.
    #[error("no stored credentials")]
    NotFound,
}

/// Secure credential storage consumed by the client.
///
/// Implementations wrap whatever the platform provides (OS keychain, secret
/// service, test fixture). A single lookup per request; no retry.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the stored credentials.
    async fn lookup(&self) -> Result<Credentials, CredentialError>;
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    credentials: Option<Credentials>,
}

impl StaticCredentialStore {
    /// Create a store holding the given credentials.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    /// Create an empty store; every lookup fails with `NotFound`.
    #[must_use]
    pub const fn empty() -> Self {
        Self { credentials: None }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn lookup(&self) -> Result<Credentials, CredentialError> {
        self.credentials.clone().ok_or(CredentialError::NotFound)
    }
}

/// Locally cached session profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    /// User identifier.
    pub id: String,
}

impl SessionProfile {
    /// Create a profile for the given user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Source of the current session profile.
///
/// Synchronous: the profile is cached for the lifetime of the session and
/// assumed always available.
pub trait ProfileSource: Send + Sync {
    /// Return the current session profile.
    fn current(&self) -> SessionProfile;
}

/// Profile source holding a fixed profile.
#[derive(Debug, Clone)]
pub struct StaticProfile(pub SessionProfile);

impl ProfileSource for StaticProfile {
    fn current(&self) -> SessionProfile {
        self.0.clone()
    }
}

/// Whether header resolution ran with or without credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials resolved; authorization carries a bearer token.
    Authenticated,
    /// Credential lookup failed; authorization is the empty string.
    Degraded,
}

/// Resolved header set for one outgoing operation.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    /// Complete header set, prior headers included.
    pub headers: HeaderMap,
    /// Authenticated vs degraded resolution.
    pub outcome: AuthOutcome,
}

impl AuthHeaders {
    /// Returns `true` when the request runs without credentials.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.outcome == AuthOutcome::Degraded
    }
}

/// Builds the per-request header set from the credential store and the
/// session profile.
#[derive(Clone)]
pub struct RequestAuthorizer {
    credentials: Arc<dyn CredentialStore>,
    profile: Arc<dyn ProfileSource>,
}

impl RequestAuthorizer {
    /// Create a new authorizer.
    #[must_use]
    pub fn new(credentials: Arc<dyn CredentialStore>, profile: Arc<dyn ProfileSource>) -> Self {
        Self {
            credentials,
            profile,
        }
    }

    /// Resolve the header set for one operation.
    ///
    /// Never fails: a failing credential lookup is logged and degrades the
    /// authorization header to the empty string. Both the `authorization`
    /// and the user-id header are always present in the result.
    pub async fn headers(&self, prior: HeaderMap) -> AuthHeaders {
        let profile = self.profile.current();

        let (credentials, outcome) = match self.credentials.lookup().await {
            Ok(credentials) => (Some(credentials), AuthOutcome::Authenticated),
            Err(err) => {
                warn!(error = %err, "credential store lookup failed, sending empty authorization");
                (None, AuthOutcome::Degraded)
            }
        };

        let mut headers = prior;
        let authorization = credentials
            .as_ref()
            .map(|c| format!("Bearer {}", c.username))
            .unwrap_or_default();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&authorization).unwrap_or_else(|_| empty_value()),
        );
        headers.insert(
            HeaderName::from_static(USER_ID_HEADER),
            HeaderValue::from_str(&profile.id).unwrap_or_else(|_| empty_value()),
        );

        AuthHeaders { headers, outcome }
    }
}

impl fmt::Debug for RequestAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAuthorizer").finish_non_exhaustive()
    }
}

fn empty_value() -> HeaderValue {
    HeaderValue::from_static("")
}
