//! Operation types, typed GraphQL traits, and transport selection.

use graphql_parser::query::{Definition, OperationDefinition, parse_query};
use serde::{Deserialize, Serialize};

use crate::error::GraphqlError;

/// GraphQL query wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphqlQuery {
    query: String,
}

impl GraphqlQuery {
    /// Create a new query from a string.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    /// Create a new query from a static string.
    #[must_use]
    pub fn from_static(query: &'static str) -> Self {
        Self::new(query)
    }

    /// Return the query text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.query
    }
}

/// Kind of a GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read operation.
    Query,
    /// Write operation.
    Mutation,
    /// Streaming operation.
    Subscription,
}

/// Transport a document is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Single request/response over the HTTP endpoint.
    Http,
    /// Persistent WebSocket connection.
    Streaming,
}

/// Kind of the main (first) operation definition in a document.
///
/// Returns `None` for fragment-only or unparseable documents.
#[must_use]
pub fn main_operation_kind(document: &str) -> Option<OperationKind> {
    let parsed = parse_query::<&str>(document).ok()?;
    parsed.definitions.iter().find_map(|definition| {
        let Definition::Operation(operation) = definition else {
            return None;
        };
        Some(match operation {
            OperationDefinition::SelectionSet(_) | OperationDefinition::Query(_) => {
                OperationKind::Query
            }
            OperationDefinition::Mutation(_) => OperationKind::Mutation,
            OperationDefinition::Subscription(_) => OperationKind::Subscription,
        })
    })
}

/// Route a document to a transport.
///
/// Streaming iff the main definition is an operation definition of kind
/// subscription; HTTP otherwise. Malformed documents route to HTTP and fail
/// there with a server-side parse error rather than here.
#[must_use]
pub fn select_transport(document: &str) -> Transport {
    match main_operation_kind(document) {
        Some(OperationKind::Subscription) => Transport::Streaming,
        _ => Transport::Http,
    }
}

/// Typed GraphQL operation definition.
///
/// Implement this trait for each query/mutation/subscription.
pub trait GraphqlOperation {
    /// Variables type.
    type Variables: Serialize + Send + Sync;
    /// Response data type.
    type ResponseData: for<'de> Deserialize<'de> + Send + Sync;

    /// GraphQL query text.
    const QUERY: &'static str;
    /// Operation name (used for observability and cache keying).
    const OPERATION_NAME: &'static str;

    /// Whether this operation is safe to retry on transport errors.
    ///
    /// Defaults to the document kind: mutations are not idempotent.
    fn is_idempotent() -> bool {
        !matches!(
            main_operation_kind(Self::QUERY),
            Some(OperationKind::Mutation)
        )
    }
}

/// GraphQL request payload (the GraphQL-over-HTTP wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlRequest<V> {
    /// Query text.
    pub query: GraphqlQuery,
    /// Variables.
    pub variables: V,
    /// Optional operation name.
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl<V> GraphqlRequest<V> {
    /// Create a new request.
    #[must_use]
    pub fn new(query: GraphqlQuery, variables: V) -> Self {
        Self {
            query,
            variables,
            operation_name: None,
        }
    }

    /// Attach an operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// GraphQL response container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct GraphqlResponse<T> {
    /// Response data.
    #[serde(default)]
    pub data: Option<T>,
    /// GraphQL errors.
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
    /// Extensions payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl<T> GraphqlResponse<T> {
    /// Returns `true` if no GraphQL errors were returned.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_routes_to_http() {
        let document = "query Messages { messages { id text } }";
        assert_eq!(main_operation_kind(document), Some(OperationKind::Query));
        assert_eq!(select_transport(document), Transport::Http);
    }

    #[test]
    fn mutation_routes_to_http() {
        let document = "mutation Send($text: String!) { insert_message(text: $text) { id } }";
        assert_eq!(main_operation_kind(document), Some(OperationKind::Mutation));
        assert_eq!(select_transport(document), Transport::Http);
    }

    #[test]
    fn subscription_routes_to_streaming() {
        let document = "subscription OnMessage { messages { id text } }";
        assert_eq!(
            main_operation_kind(document),
            Some(OperationKind::Subscription)
        );
        assert_eq!(select_transport(document), Transport::Streaming);
    }

    #[test]
    fn shorthand_selection_set_is_a_query() {
        let document = "{ messages { id } }";
        assert_eq!(main_operation_kind(document), Some(OperationKind::Query));
        assert_eq!(select_transport(document), Transport::Http);
    }

    #[test]
    fn fragment_only_document_routes_to_http() {
        let document = "fragment MessageFields on Message { id text }";
        assert_eq!(main_operation_kind(document), None);
        assert_eq!(select_transport(document), Transport::Http);
    }

    #[test]
    fn malformed_document_routes_to_http() {
        let document = "subscription {{{";
        assert_eq!(main_operation_kind(document), None);
        assert_eq!(select_transport(document), Transport::Http);
    }

    #[test]
    fn first_operation_definition_wins() {
        let document = "\
fragment MessageFields on Message { id }
subscription OnMessage { messages { ...MessageFields } }";
        assert_eq!(
            main_operation_kind(document),
            Some(OperationKind::Subscription)
        );
        assert_eq!(select_transport(document), Transport::Streaming);
    }

    #[test]
    fn request_serializes_to_wire_shape() {
        #[derive(Serialize, Debug, Clone)]
        struct Vars {
            limit: u32,
        }

        let request = GraphqlRequest::new(
            GraphqlQuery::from_static("query Messages { messages { id } }"),
            Vars { limit: 10 },
        )
        .with_operation_name("Messages");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["query"], "query Messages { messages { id } }");
        assert_eq!(value["operationName"], "Messages");
        assert_eq!(value["variables"]["limit"], 10);
    }
}
