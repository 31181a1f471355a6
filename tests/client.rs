use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

use chat_graphql::{
    ChatClient, ChatClientConfig, ChatClientError, Credentials, FetchPolicy, GraphqlOperation,
    ReconnectConfig, RetryPolicy, RetryStrategy, SessionProfile, StaticCredentialStore,
    StaticProfile,
};

#[derive(Debug, Serialize)]
struct EmptyVars {}

#[derive(Debug, Serialize)]
struct SendVars {
    text: String,
}

#[derive(Debug, Deserialize)]
struct MessagesData {
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    id: String,
    text: String,
}

struct MessagesQuery;

impl GraphqlOperation for MessagesQuery {
    type Variables = EmptyVars;
    type ResponseData = MessagesData;

    const QUERY: &'static str = "query Messages { messages { id text } }";
    const OPERATION_NAME: &'static str = "Messages";
}

struct SendMessageMutation;

impl GraphqlOperation for SendMessageMutation {
    type Variables = SendVars;
    type ResponseData = MessagesData;

    const QUERY: &'static str =
        "mutation SendMessage($text: String!) { insert_message(text: $text) { id text } }";
    const OPERATION_NAME: &'static str = "SendMessage";
}

struct OnMessageSubscription;

impl GraphqlOperation for OnMessageSubscription {
    type Variables = EmptyVars;
    type ResponseData = MessagesData;

    const QUERY: &'static str = "subscription OnMessage { messages { id text } }";
    const OPERATION_NAME: &'static str = "OnMessage";
}

fn fast_retry(strategy: RetryStrategy) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        max_jitter: Duration::ZERO,
        strategy,
    }
}

fn test_config(http_url: String, ws_url: String) -> ChatClientConfig {
    ChatClientConfig {
        admin_secret: Some("secret-1".into()),
        retry: fast_retry(RetryStrategy::IdempotentOnly),
        reconnect: ReconnectConfig {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter: false,
            ..ReconnectConfig::default()
        },
        ..ChatClientConfig::default()
    }
    .with_endpoints(http_url, ws_url)
}

fn alice_client(http_url: String, ws_url: String) -> ChatClient {
    ChatClient::builder(test_config(http_url, ws_url))
        .credential_store(Arc::new(StaticCredentialStore::new(Credentials {
            username: "alice".into(),
            password: "hunter2".into(),
        })))
        .profile_source(Arc::new(StaticProfile(SessionProfile::new("user-7"))))
        .build()
        .expect("client")
}

fn anonymous_client(http_url: String, ws_url: String) -> ChatClient {
    ChatClient::builder(test_config(http_url, ws_url))
        .credential_store(Arc::new(StaticCredentialStore::empty()))
        .profile_source(Arc::new(StaticProfile(SessionProfile::new("user-7"))))
        .build()
        .expect("client")
}

struct CountingResponder {
    counter: Arc<AtomicUsize>,
    body: serde_json::Value,
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        self.counter.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(self.body.clone())
    }
}

struct SequenceResponder {
    counter: Arc<AtomicUsize>,
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let attempt = self.counter.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "fail"}))
        } else {
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"messages": [{"id": "m-2", "text": "retry"}]}
            }))
        }
    }
}

fn messages_body() -> serde_json::Value {
    serde_json::json!({
        "data": {"messages": [{"id": "m-1", "text": "hello"}]}
    })
}

#[tokio::test]
async fn query_goes_over_http_with_auth_headers() {
    let server = MockServer::start().await;

    let expected_body = serde_json::json!({
        "query": MessagesQuery::QUERY,
        "operationName": MessagesQuery::OPERATION_NAME,
        "variables": {},
    });

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("authorization", "Bearer alice"))
        .and(header("x-hasura-user-id", "user-7"))
        .and(header("content-type", "application/json"))
        .and(body_json(&expected_body))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());
    let data = client
        .execute_strict::<MessagesQuery>(EmptyVars {})
        .await
        .expect("query should succeed");

    assert_eq!(data.messages.len(), 1);
    assert_eq!(data.messages[0].id, "m-1");
    assert_eq!(data.messages[0].text, "hello");
    assert_eq!(client.metrics().requests_total, 1);
    assert_eq!(client.metrics().requests_success, 1);
}

#[tokio::test]
async fn failed_credential_lookup_still_dispatches_with_empty_authorization() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = anonymous_client(server.uri(), "ws://unused".into());
    client
        .execute_strict::<MessagesQuery>(EmptyVars {})
        .await
        .expect("degraded request should still succeed");

    let requests = server.received_requests().await.expect("recorded requests");
    assert_eq!(requests.len(), 1);
    let headers = &requests[0].headers;
    assert_eq!(
        headers.get("authorization").map(|v| v.to_str().unwrap()),
        Some("")
    );
    assert_eq!(
        headers.get("x-hasura-user-id").map(|v| v.to_str().unwrap()),
        Some("user-7")
    );
}

#[tokio::test]
async fn cache_first_serves_repeat_queries_without_refetch() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(CountingResponder {
            counter: counter.clone(),
            body: messages_body(),
        })
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());

    let first = client
        .execute::<MessagesQuery>(EmptyVars {})
        .await
        .expect("first fetch");
    let second = client
        .execute::<MessagesQuery>(EmptyVars {})
        .await
        .expect("cached fetch");

    assert_eq!(first.data.unwrap().messages[0].id, "m-1");
    assert_eq!(second.data.unwrap().messages[0].id, "m-1");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(client.cache().hits(), 1);
}

#[tokio::test]
async fn network_only_bypasses_cache_reads() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(CountingResponder {
            counter: counter.clone(),
            body: messages_body(),
        })
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());

    for _ in 0..2 {
        client
            .execute_with_policy::<MessagesQuery>(EmptyVars {}, FetchPolicy::NetworkOnly)
            .await
            .expect("fetch");
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mutations_are_never_cached() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(CountingResponder {
            counter: counter.clone(),
            body: messages_body(),
        })
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());

    for _ in 0..2 {
        client
            .execute::<SendMessageMutation>(SendVars {
                text: "hi".into(),
            })
            .await
            .expect("mutation");
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn idempotent_query_retries_on_500() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(SequenceResponder {
            counter: counter.clone(),
        })
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());
    let data = client
        .execute_strict::<MessagesQuery>(EmptyVars {})
        .await
        .expect("should succeed after retry");

    assert_eq!(data.messages[0].id, "m-2");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(client.metrics().requests_retried, 1);
}

#[tokio::test]
async fn mutation_does_not_retry() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(SequenceResponder {
            counter: counter.clone(),
        })
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());
    let err = client
        .execute_strict::<SendMessageMutation>(SendVars {
            text: "hi".into(),
        })
        .await
        .expect_err("mutation should not retry");

    assert!(matches!(err, ChatClientError::HttpStatus { .. }));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn graphql_errors_surface_through_execute_strict() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errors": [{"message": "permission denied"}]
        })))
        .mount(&server)
        .await;

    let client = alice_client(server.uri(), "ws://unused".into());
    let err = client
        .execute_strict::<MessagesQuery>(EmptyVars {})
        .await
        .expect_err("should surface GraphQL errors");

    match err {
        ChatClientError::GraphqlErrors { errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].message, "permission denied");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn subscription_document_is_refused_by_execute() {
    let client = alice_client("http://unused".into(), "ws://unused".into());
    let err = client
        .execute::<OnMessageSubscription>(EmptyVars {})
        .await
        .expect_err("subscriptions do not go over HTTP");
    assert!(matches!(err, ChatClientError::Protocol { .. }));
}

#[tokio::test]
async fn query_document_is_refused_by_subscribe() {
    let client = alice_client("http://unused".into(), "ws://unused".into());
    let err = client
        .subscribe::<MessagesQuery>(EmptyVars {})
        .await
        .expect_err("queries do not go over the streaming transport");
    assert!(matches!(err, ChatClientError::Protocol { .. }));
}

/// Serve one graphql-transport-ws session: assert init carries the admin
/// secret, ack, read subscribe, emit `next` payloads, then `complete`.
async fn serve_subscription_session(
    stream: tokio::net::TcpStream,
    captured_headers: Arc<std::sync::Mutex<HashMap<String, String>>>,
    message_ids: Vec<&str>,
    complete: bool,
) {
    let callback = move |req: &Request, resp: Response| {
        let mut captured = captured_headers.lock().unwrap();
        for (name, value) in req.headers() {
            captured.insert(
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }
        Ok(resp)
    };
    let mut ws = accept_hdr_async(stream, callback).await.expect("accept ws");

    let init = ws.next().await.expect("init").expect("init ok");
    let init: serde_json::Value =
        serde_json::from_str(init.to_text().expect("init text")).expect("init json");
    assert_eq!(init["type"], "connection_init");
    assert_eq!(
        init["payload"]["headers"]["x-hasura-admin-secret"],
        "secret-1"
    );

    ws.send(Message::Text(
        serde_json::json!({"type": "connection_ack"}).to_string().into(),
    ))
    .await
    .expect("ack");

    let subscribe = ws.next().await.expect("subscribe").expect("subscribe ok");
    let subscribe: serde_json::Value =
        serde_json::from_str(subscribe.to_text().expect("subscribe text")).expect("subscribe json");
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(
        subscribe["payload"]["query"],
        OnMessageSubscription::QUERY
    );
    assert_eq!(subscribe["payload"]["operationName"], "OnMessage");

    for id in message_ids {
        let next = serde_json::json!({
            "type": "next",
            "id": subscribe["id"],
            "payload": {"data": {"messages": [{"id": id, "text": "update"}]}}
        });
        ws.send(Message::Text(next.to_string().into()))
            .await
            .expect("next");
    }

    if complete {
        let complete = serde_json::json!({"type": "complete", "id": subscribe["id"]});
        ws.send(Message::Text(complete.to_string().into()))
            .await
            .expect("complete");
    }
    // Dropping the socket here simulates a connection loss.
}

#[tokio::test]
async fn subscription_routes_over_websocket_with_connection_params() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let captured_headers = Arc::new(std::sync::Mutex::new(HashMap::new()));

    let server_headers = captured_headers.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        serve_subscription_session(stream, server_headers, vec!["s-1"], true).await;
    });

    let client = alice_client("http://unused".into(), format!("ws://{addr}"));
    let mut stream = client
        .subscribe::<OnMessageSubscription>(EmptyVars {})
        .await
        .expect("subscribe");

    let first = stream
        .next()
        .await
        .expect("stream item")
        .expect("subscription response");
    assert_eq!(first.data.unwrap().messages[0].id, "s-1");

    // `complete` ends the stream.
    assert!(stream.next().await.is_none());

    server.await.expect("server task");

    let headers = captured_headers.lock().unwrap();
    assert_eq!(
        headers.get("sec-websocket-protocol").map(String::as_str),
        Some("graphql-transport-ws")
    );
    assert_eq!(
        headers.get("authorization").map(String::as_str),
        Some("Bearer alice")
    );
    assert_eq!(
        headers.get("x-hasura-user-id").map(String::as_str),
        Some("user-7")
    );
}

#[tokio::test]
async fn subscription_reconnects_after_connection_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let captured_headers = Arc::new(std::sync::Mutex::new(HashMap::new()));

    let server_headers = captured_headers.clone();
    let server = tokio::spawn(async move {
        // First session drops without `complete`; the client reconnects and
        // replays the subscription.
        let (stream, _) = listener.accept().await.expect("accept first");
        serve_subscription_session(stream, server_headers.clone(), vec!["s-1"], false).await;

        let (stream, _) = listener.accept().await.expect("accept second");
        serve_subscription_session(stream, server_headers, vec!["s-2"], true).await;
    });

    let client = alice_client("http://unused".into(), format!("ws://{addr}"));
    let mut stream = client
        .subscribe::<OnMessageSubscription>(EmptyVars {})
        .await
        .expect("subscribe");

    let first = stream
        .next()
        .await
        .expect("first item")
        .expect("first response");
    assert_eq!(first.data.unwrap().messages[0].id, "s-1");

    let second = stream
        .next()
        .await
        .expect("second item")
        .expect("second response");
    assert_eq!(second.data.unwrap().messages[0].id, "s-2");

    assert!(stream.next().await.is_none());
    server.await.expect("server task");
}

#[tokio::test]
async fn subscription_server_error_ends_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_hdr_async(stream, |_req: &Request, resp: Response| Ok(resp))
            .await
            .expect("accept ws");

        let _init = ws.next().await.expect("init").expect("init ok");
        ws.send(Message::Text(
            serde_json::json!({"type": "connection_ack"}).to_string().into(),
        ))
        .await
        .expect("ack");

        let _subscribe = ws.next().await.expect("subscribe").expect("subscribe ok");
        let error = serde_json::json!({
            "type": "error",
            "id": "1",
            "payload": [{"message": "unauthorized"}]
        });
        ws.send(Message::Text(error.to_string().into()))
            .await
            .expect("error");
    });

    let client = alice_client("http://unused".into(), format!("ws://{addr}"));
    let mut stream = client
        .subscribe::<OnMessageSubscription>(EmptyVars {})
        .await
        .expect("subscribe");

    let err = stream
        .next()
        .await
        .expect("stream item")
        .expect_err("server rejection surfaces as an error");
    match err {
        ChatClientError::GraphqlErrors { errors } => {
            assert_eq!(errors[0].message, "unauthorized");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(stream.next().await.is_none());

    server.await.expect("server task");
}
