//! Minimal HTTP seam used for identity provisioning and the REST directory backend.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET", "PUT", "POST" or "DELETE"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    fn with_method(method: &str, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::with_method("POST", url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::with_method("PUT", url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::with_method("DELETE", url)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// A simple structure for the HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body_string(self) -> Result<String> {
        Ok(String::from_utf8(self.body)?)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Blocking `ureq` agent driven from `spawn_blocking`.
///
/// Non-2xx statuses come back as responses, not errors: the relay and the
/// directory both inspect status codes themselves.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: ureq::Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn run_blocking(agent: &ureq::Agent, request: HttpRequest) -> Result<HttpResponse> {
    if !matches!(request.method.as_str(), "GET" | "PUT" | "POST" | "DELETE") {
        bail!("unsupported HTTP method: {}", request.method);
    }
    let mut builder = ureq::http::Request::builder()
        .method(request.method.as_str())
        .uri(&request.url);
    for (key, value) in &request.headers {
        builder = builder.header(key, value);
    }

    let mut response = match request.body {
        Some(body) => agent.run(builder.body(body)?)?,
        None => agent.run(builder.body(())?)?,
    };
    Ok(HttpResponse {
        status_code: response.status().as_u16(),
        body: response.body_mut().read_to_vec()?,
    })
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || run_blocking(&agent, request)).await?
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every request and replies from a queue of canned responses,
    /// falling back to `200 null`.
    #[derive(Default)]
    pub struct RecordingHttpClient {
        pub requests: Mutex<Vec<HttpRequest>>,
        pub responses: Mutex<VecDeque<Result<HttpResponse>>>,
    }

    impl RecordingHttpClient {
        pub fn respond_with(&self, status_code: u16, body: &str) {
            self.responses.lock().unwrap().push_back(Ok(HttpResponse {
                status_code,
                body: body.as_bytes().to_vec(),
            }));
        }

        pub fn fail_next(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(anyhow::anyhow!(message.to_string())));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for RecordingHttpClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(HttpResponse {
                        status_code: 200,
                        body: b"null".to_vec(),
                    })
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = HttpRequest::put("https://db.test/rooms/r1.json")
            .with_header("Content-Type", "application/json")
            .with_body(b"{}".to_vec());
        assert_eq!(request.method, "PUT");
        assert_eq!(request.headers["Content-Type"], "application/json");
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_response_status() {
        let ok = HttpResponse {
            status_code: 204,
            body: Vec::new(),
        };
        let missing = HttpResponse {
            status_code: 404,
            body: b"null".to_vec(),
        };
        assert!(ok.is_success());
        assert!(!missing.is_success());
        assert_eq!(missing.body_string().unwrap(), "null");
    }

    #[tokio::test]
    async fn test_unsupported_method_is_rejected() {
        let mut request = HttpRequest::get("http://127.0.0.1:9/peerjs/id");
        request.method = "PATCH".to_string();
        let err = UreqHttpClient::new().execute(request).await.unwrap_err();
        assert!(err.to_string().contains("PATCH"));
    }
}
