//! GraphQL client for the chat backend.
//!
//! This crate wires the chat application's GraphQL API into one client:
//!
//! - Per-operation transport selection: queries and mutations go over HTTP,
//!   subscriptions over a persistent WebSocket (graphql-transport-ws) with
//!   automatic reconnection.
//! - Auth header injection: every operation carries an `authorization` bearer
//!   header from the credential store (empty when the lookup fails, never
//!   blocking the request) and an `x-hasura-user-id` header from the session
//!   profile.
//! - An in-memory response cache keyed by operation + variables.
//!
//! The client is built once and passed to consumers explicitly:
//!
//! ```rust,ignore
//! let client = ChatClient::builder(ChatClientConfig::from_env())
//!     .credential_store(Arc::new(keychain))
//!     .profile_source(Arc::new(profile))
//!     .build()?;
//!
//! let response = client.execute::<Messages>(MessagesVars { limit: 50 }).await?;
//! let mut updates = client.subscribe::<OnMessage>(OnMessageVars {}).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

mod auth;
mod cache;
mod client;
mod config;
mod error;
mod operation;
mod reconnect;
mod retry;
mod subscription;
mod ws;

pub use auth::{
    AuthHeaders, AuthOutcome, CredentialError, CredentialStore, Credentials, ProfileSource,
    RequestAuthorizer, SessionProfile, StaticCredentialStore, StaticProfile, USER_ID_HEADER,
};
pub use cache::{CacheKey, FetchPolicy, ResponseCache};
pub use client::{ChatClient, ChatClientBuilder, ClientMetrics, ClientMetricsSnapshot};
pub use config::{ADMIN_SECRET_ENV, ChatClientConfig};
pub use error::{
    ChatClientError, GraphqlError, GraphqlErrorLocation, GraphqlPathSegment, HttpErrorInfo,
};
pub use operation::{
    GraphqlOperation, GraphqlQuery, GraphqlRequest, GraphqlResponse, OperationKind, Transport,
    main_operation_kind, select_transport,
};
pub use reconnect::{ReconnectConfig, ReconnectHandler};
pub use retry::{RetryDecision, RetryPolicy, RetryStrategy};
pub use subscription::{
    ADMIN_SECRET_HEADER, SubscriptionClient, SubscriptionStream,
};
pub use ws::{WsClient, WsConfig, WsConnection, WsMessage};
