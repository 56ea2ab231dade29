//! HTTP transport shared by the connectors

use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use ecoho_core::{EndpointConfig, ErrorDetail, SourceId, SourceResult, ValidatedEndpoint};

const HTTP_SCHEMES: &[&str] = &["http", "https"];

/// Longest slice of an error body copied into a failure message
const MAX_ERROR_BODY: usize = 256;

/// Method and body for a REST-style source
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub body: Option<Value>,
}

impl RestRequest {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug)]
struct Ready {
    client: Client,
    endpoint: ValidatedEndpoint,
}

/// Validated endpoint plus client for one source
#[derive(Debug)]
pub struct HttpSource {
    source: SourceId,
    ready: Result<Ready, ErrorDetail>,
}

impl HttpSource {
    /// Validates the endpoint immediately; an invalid one makes every request
    /// fail with the same `ConfigurationError` without network I/O
    pub fn new(source: SourceId, config: &EndpointConfig) -> Self {
        let ready = config
            .validate(source.name(), HTTP_SCHEMES)
            .and_then(|endpoint| {
                Client::builder()
                    .timeout(endpoint.timeout)
                    .build()
                    .map(|client| Ready { client, endpoint })
                    .map_err(|e| ErrorDetail::configuration(source.name(), format!("HTTP client: {e}")))
            });

        if let Err(detail) = &ready {
            warn!(source = %source, "Connector disabled: {}", detail.message);
        }

        Self { source, ready }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn is_configured(&self) -> bool {
        self.ready.is_ok()
    }

    /// POST `{query}` and unwrap the `{data, errors}` envelope
    pub async fn post_graphql(&self, query: &str) -> SourceResult<Value> {
        let body = serde_json::json!({ "query": query });
        let bytes = self.send(Method::POST, Some(&body)).await?;
        parse_graphql_envelope(self.source, &bytes)
    }

    /// Send a REST request and decode the raw JSON body
    pub async fn send_json(&self, request: &RestRequest) -> SourceResult<Value> {
        let bytes = self.send(request.method.clone(), request.body.as_ref()).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ErrorDetail::protocol(self.source.name(), format!("invalid JSON body: {e}"))
        })
    }

    async fn send(&self, method: Method, body: Option<&Value>) -> SourceResult<Vec<u8>> {
        let ready = self.ready.as_ref().map_err(|e| e.clone())?;
        let timeout = ready.endpoint.timeout;

        let mut request = ready.client.request(method, &ready.endpoint.url);
        if let Some(key) = &ready.endpoint.api_key {
            request = request.header(ready.endpoint.api_key_header.as_str(), key.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(source = %self.source, url = %ready.endpoint.url, "Sending request");

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(self.source, timeout, e))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(self.source, timeout, e))?;

        if !status.is_success() {
            return Err(ErrorDetail::network(
                self.source.name(),
                format!("HTTP {}: {}", status, truncate_body(&bytes)),
            ));
        }

        Ok(bytes.to_vec())
    }
}

fn transport_error(source: SourceId, timeout: Duration, err: reqwest::Error) -> ErrorDetail {
    if err.is_timeout() {
        ErrorDetail::timeout(source.name(), format!("request exceeded {timeout:?}"))
    } else if err.is_decode() {
        ErrorDetail::protocol(source.name(), err.to_string())
    } else {
        ErrorDetail::network(source.name(), err.to_string())
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_ERROR_BODY);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Provider error arrays become `ProtocolError`, messages joined with ", "
pub fn parse_graphql_envelope(source: SourceId, body: &[u8]) -> SourceResult<Value> {
    let envelope: GraphQlEnvelope = serde_json::from_slice(body)
        .map_err(|e| ErrorDetail::protocol(source.name(), format!("invalid GraphQL envelope: {e}")))?;

    if let Some(errors) = envelope.errors.filter(|e| !e.is_empty()) {
        let joined = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ErrorDetail::protocol(source.name(), joined));
    }

    match envelope.data {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(ErrorDetail::protocol(
            source.name(),
            "response carried neither data nor errors",
        )),
    }
}
