//! Stateless per-call HTTP transport.

use crate::decoder::{EventStream, Framing, decode};
use crate::{Error, Result};
use serde_json::Value;
use std::time::Duration;

/// POSTs one request per call and decodes the streamed body.
///
/// `timeout` bounds connecting and waiting for the response headers. The
/// body itself has no deadline; idle gaps are the worker's read timeout.
///
/// The underlying `reqwest::Client` is reused across calls for connection
/// pooling; each call's connection is released when its event stream is
/// dropped.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
    api_key: Option<String>,
    framing: Framing,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        framing: Framing,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            framing,
        })
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Absolute URL for an endpoint path such as `/chat/completions`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send `body` to `path` and return the decoded event stream.
    ///
    /// A non-success status is read in full and returned as [`Error::Api`]
    /// before any event is decoded.
    pub async fn open(&self, path: &str, body: &Value) -> Result<EventStream> {
        let url = self.endpoint(path);
        let accept = match self.framing {
            Framing::Sse => "text/event-stream",
            Framing::Ndjson => "application/x-ndjson",
        };

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .json(body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| Error::timeout())?
            .map_err(Error::Http)?;

        // Catches authentication, rate limits, unknown models, etc.
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|e| {
                log::warn!("Failed to read error response body: {}", e);
                "Unknown error (failed to read response body)".to_string()
            });
            return Err(Error::api(status.as_u16(), body));
        }

        log::debug!("streaming {} response from {}", framing_label(self.framing), url);
        Ok(decode(self.framing, response.bytes_stream()))
    }
}

fn framing_label(framing: Framing) -> &'static str {
    match framing {
        Framing::Sse => "SSE",
        Framing::Ndjson => "NDJSON",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let transport = HttpTransport::new(
            "http://localhost:1234/v1/",
            None,
            Framing::Sse,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            transport.endpoint("/chat/completions"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(transport.framing(), Framing::Sse);
    }
}
