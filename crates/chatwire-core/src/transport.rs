use futures_core::Stream;
use reqwest::header;
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::bytes::Bytes;
use tracing::debug;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication failed: {details}")]
    Unauthorized { details: String },

    #[error("Rate limited by upstream: {details}")]
    RateLimited { details: String },

    #[error("Request rejected ({status_code}): {details}")]
    Client { status_code: u16, details: String },

    #[error("Server error ({status_code}): {details}")]
    Server { status_code: u16, details: String },

    #[error("Unexpected response ({status_code}): {details}")]
    Unknown { status_code: u16, details: String },
}

/// A chat turn to stream from an upstream endpoint.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            body,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// POST `request` and hand back the response body as a byte stream.
pub async fn open_stream(
    client: &reqwest::Client,
    request: &StreamRequest,
) -> Result<ByteStream, TransportError> {
    let mut request_builder = client
        .post(&request.url)
        .header(header::ACCEPT, "text/event-stream")
        .json(&request.body);

    for (name, value) in &request.headers {
        request_builder = request_builder.header(name, value);
    }

    let response = request_builder.send().await?;

    let status = response.status();
    if !status.is_success() {
        let details = response.text().await?;
        return Err(error_for_status(status.as_u16(), details));
    }

    debug!(target: "chatwire::transport", url = %request.url, "Upstream stream opened");
    Ok(Box::pin(response.bytes_stream()))
}

fn error_for_status(status_code: u16, details: String) -> TransportError {
    match status_code {
        401 | 403 => TransportError::Unauthorized { details },
        429 => TransportError::RateLimited { details },
        400..=499 => TransportError::Client {
            status_code,
            details,
        },
        500..=599 => TransportError::Server {
            status_code,
            details,
        },
        _ => TransportError::Unknown {
            status_code,
            details,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(401, "Unauthorized")]
    #[case(403, "Unauthorized")]
    #[case(429, "RateLimited")]
    #[case(404, "Client")]
    #[case(503, "Server")]
    #[case(302, "Unknown")]
    fn test_status_mapping(#[case] status: u16, #[case] expected: &str) {
        let variant = match error_for_status(status, "body".to_string()) {
            TransportError::Network(_) => "Network",
            TransportError::Unauthorized { .. } => "Unauthorized",
            TransportError::RateLimited { .. } => "RateLimited",
            TransportError::Client { .. } => "Client",
            TransportError::Server { .. } => "Server",
            TransportError::Unknown { .. } => "Unknown",
        };
        assert_eq!(variant, expected);
    }

    #[test]
    fn test_error_message_carries_body() {
        let err = error_for_status(500, "upstream exploded".to_string());
        assert_eq!(err.to_string(), "Server error (500): upstream exploded");
    }

    #[test]
    fn test_request_builder_collects_headers() {
        let request = StreamRequest::new("http://localhost/chat", serde_json::json!({"q": 1}))
            .with_header("x-request-id", "abc");
        assert_eq!(
            request.headers,
            vec![("x-request-id".to_string(), "abc".to_string())]
        );
    }
}
