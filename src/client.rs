//! The chat client facade: auth decoration, transport routing, HTTP
//! execution with retry, and the response cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use tracing::debug;

use crate::auth::{CredentialStore, ProfileSource, RequestAuthorizer};
use crate::cache::{CacheKey, FetchPolicy, ResponseCache};
use crate::config::ChatClientConfig;
use crate::error::ChatClientError;
use crate::operation::{
    GraphqlOperation, GraphqlQuery, GraphqlRequest, GraphqlResponse, OperationKind, Transport,
    main_operation_kind, select_transport,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::subscription::{SubscriptionClient, SubscriptionStream};

/// Client request metrics.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    requests_retried: AtomicU64,
}

impl ClientMetrics {
    /// Snapshot current metrics.
    #[must_use]
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_error: self.requests_error.load(Ordering::Relaxed),
            requests_retried: self.requests_retried.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    /// Total requests.
    pub requests_total: u64,
    /// Successful requests.
    pub requests_success: u64,
    /// Failed requests.
    pub requests_error: u64,
    /// Retries performed.
    pub requests_retried: u64,
}

/// Builder for [`ChatClient`].
///
/// The client is constructed once at process start and handed to consumers
/// explicitly; there is no ambient/global instance.
pub struct ChatClientBuilder {
    config: ChatClientConfig,
    credential_store: Option<Arc<dyn CredentialStore>>,
    profile_source: Option<Arc<dyn ProfileSource>>,
}

impl ChatClientBuilder {
    /// Create a builder from configuration.
    #[must_use]
    pub fn new(config: ChatClientConfig) -> Self {
        Self {
            config,
            credential_store: None,
            profile_source: None,
        }
    }

    /// Set the credential store collaborator.
    #[must_use]
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Set the session profile collaborator.
    #[must_use]
    pub fn profile_source(mut self, source: Arc<dyn ProfileSource>) -> Self {
        self.profile_source = Some(source);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    /// Returns a configuration error when a collaborator is missing, or an
    /// HTTP error when the transport cannot be constructed.
    pub fn build(self) -> Result<ChatClient, ChatClientError> {
        let credential_store = self.credential_store.ok_or(ChatClientError::Config {
            message: "credential store is required".into(),
        })?;
        let profile_source = self.profile_source.ok_or(ChatClientError::Config {
            message: "profile source is required".into(),
        })?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(self.config.timeout)
            .build()?;

        let mut subscriptions = SubscriptionClient::new(self.config.ws_url.clone())
            .with_timeouts(self.config.connect_timeout, self.config.ack_timeout)
            .with_reconnect(self.config.reconnect.clone());
        if let Some(secret) = &self.config.admin_secret {
            subscriptions = subscriptions.with_admin_secret(secret.clone());
        }

        Ok(ChatClient {
            http,
            http_url: self.config.http_url,
            authorizer: RequestAuthorizer::new(credential_store, profile_source),
            subscriptions,
            cache: Arc::new(ResponseCache::new()),
            retry: self.config.retry,
            fetch: self.config.fetch,
            metrics: Arc::new(ClientMetrics::default()),
        })
    }
}

/// GraphQL client for the chat backend.
///
/// Queries and mutations go over HTTP; subscriptions go over a persistent
/// WebSocket. Every outgoing operation is decorated with auth headers first.
/// Cloning is cheap; clones share the cache, metrics, and collaborators.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    http_url: String,
    authorizer: RequestAuthorizer,
    subscriptions: SubscriptionClient,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    fetch: FetchPolicy,
    metrics: Arc<ClientMetrics>,
}

impl ChatClient {
    /// Start building a client from configuration.
    #[must_use]
    pub fn builder(config: ChatClientConfig) -> ChatClientBuilder {
        ChatClientBuilder::new(config)
    }

    /// The response cache.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Return a metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The authorizer used to decorate outgoing operations.
    #[must_use]
    pub const fn authorizer(&self) -> &RequestAuthorizer {
        &self.authorizer
    }

    /// Execute a query or mutation with the client's default fetch policy.
    ///
    /// # Errors
    /// Returns a protocol error for subscription documents (those go through
    /// [`ChatClient::subscribe`]), or a transport/decode error.
    pub async fn execute<O: GraphqlOperation>(
        &self,
        variables: O::Variables,
    ) -> Result<GraphqlResponse<O::ResponseData>, ChatClientError> {
        self.execute_with_policy::<O>(variables, self.fetch).await
    }

    /// Execute a query or mutation with an explicit fetch policy.
    ///
    /// # Errors
    /// Returns a protocol error for subscription documents, or a
    /// transport/decode error.
    pub async fn execute_with_policy<O: GraphqlOperation>(
        &self,
        variables: O::Variables,
        fetch: FetchPolicy,
    ) -> Result<GraphqlResponse<O::ResponseData>, ChatClientError> {
        if select_transport(O::QUERY) == Transport::Streaming {
            return Err(ChatClientError::Protocol {
                message: format!(
                    "{} is a subscription; use subscribe",
                    O::OPERATION_NAME
                ),
            });
        }

        let kind = main_operation_kind(O::QUERY).unwrap_or(OperationKind::Query);
        let variables = serde_json::to_value(variables)?;
        let cache_key = CacheKey::for_operation(O::OPERATION_NAME, O::QUERY, &variables);
        let cacheable = kind == OperationKind::Query;

        if cacheable && fetch == FetchPolicy::CacheFirst {
            if let Some(data) = self.cache.get(cache_key).await {
                debug!(operation = O::OPERATION_NAME, "serving response from cache");
                return Ok(GraphqlResponse {
                    data: Some(serde_json::from_value(data)?),
                    errors: vec![],
                    extensions: None,
                });
            }
        }

        // Headers are fully resolved before dispatch.
        let auth = self.authorizer.headers(HeaderMap::new()).await;

        let request = GraphqlRequest::new(GraphqlQuery::from_static(O::QUERY), variables)
            .with_operation_name(O::OPERATION_NAME);
        let body = serde_json::to_vec(&request)?;

        let bytes = self
            .send_with_retry(body, auth.headers, O::is_idempotent())
            .await?;
        let response: GraphqlResponse<serde_json::Value> = serde_json::from_slice(&bytes)?;

        if response.errors.is_empty() {
            self.metrics
                .requests_success
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.requests_error.fetch_add(1, Ordering::Relaxed);
        }

        if cacheable && response.is_ok() && fetch != FetchPolicy::NoStore {
            if let Some(data) = &response.data {
                self.cache.store(cache_key, data.clone()).await;
            }
        }

        let data = match response.data {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        Ok(GraphqlResponse {
            data,
            errors: response.errors,
            extensions: response.extensions,
        })
    }

    /// Execute and return data only (GraphQL errors become an error value).
    ///
    /// # Errors
    /// As [`ChatClient::execute`], plus `GraphqlErrors` when the server
    /// returns error entries and `Protocol` when data is missing.
    pub async fn execute_strict<O: GraphqlOperation>(
        &self,
        variables: O::Variables,
    ) -> Result<O::ResponseData, ChatClientError> {
        let response = self.execute::<O>(variables).await?;
        if !response.errors.is_empty() {
            return Err(ChatClientError::GraphqlErrors {
                errors: response.errors,
            });
        }
        response.data.ok_or_else(|| ChatClientError::Protocol {
            message: "missing GraphQL data".to_string(),
        })
    }

    /// Subscribe to a subscription operation over the streaming transport.
    ///
    /// # Errors
    /// Returns a protocol error for non-subscription documents, or a
    /// connection/handshake error. Later failures surface through the stream.
    pub async fn subscribe<O: GraphqlOperation>(
        &self,
        variables: O::Variables,
    ) -> Result<SubscriptionStream<O::ResponseData>, ChatClientError>
    where
        O::ResponseData: 'static,
    {
        if select_transport(O::QUERY) == Transport::Http {
            return Err(ChatClientError::Protocol {
                message: format!(
                    "{} is not a subscription; use execute",
                    O::OPERATION_NAME
                ),
            });
        }

        let auth = self.authorizer.headers(HeaderMap::new()).await;
        let mut extra = HashMap::new();
        for (name, value) in &auth.headers {
            if let Ok(value) = value.to_str() {
                extra.insert(name.as_str().to_string(), value.to_string());
            }
        }

        self.subscriptions
            .subscribe_with_headers::<O>(variables, extra)
            .await
    }

    async fn send_with_retry(
        &self,
        body: Vec<u8>,
        headers: HeaderMap,
        idempotent: bool,
    ) -> Result<Vec<u8>, ChatClientError> {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 1;
        loop {
            match self.send_once(&body, &headers).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => match self.retry.decide(&err, attempt, idempotent) {
                    RetryDecision::RetryAfter(delay) => {
                        self.metrics
                            .requests_retried
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(delay_ms = delay.as_millis(), "retrying GraphQL request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::DoNotRetry => return Err(err),
                },
            }
        }
    }

    async fn send_once(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Vec<u8>, ChatClientError> {
        let response = self
            .http
            .post(&self.http_url)
            .headers(headers.clone())
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let bytes = response.bytes().await?;

        if !status.is_success() {
            self.metrics.requests_error.fetch_add(1, Ordering::Relaxed);
            return Err(ChatClientError::HttpStatus {
                status,
                body: truncate_body(&bytes),
                retry_after,
            });
        }

        Ok(bytes.to_vec())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(RETRY_AFTER)?;
    let value = header.to_str().ok()?;
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate_body(bytes: &[u8]) -> String {
    const MAX_LEN: usize = 4096;
    let mut body = String::from_utf8_lossy(bytes).to_string();
    if body.len() > MAX_LEN {
        body.truncate(MAX_LEN);
        body.push('…');
    }
    body
}
