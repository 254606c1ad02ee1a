use super::{Children, DirectoryError, DirectoryStore};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct RestDirectoryConfig {
    /// Database root, e.g. `https://example-default-rtdb.firebaseio.com`.
    pub base_url: String,
    pub auth_token: Option<String>,
    /// How often subscriptions re-read the watched node.
    pub poll_interval: Duration,
}

impl RestDirectoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Directory backed by a Realtime-Database style REST API
/// (`PUT`/`DELETE`/`GET` on `{base}/{path}.json`). Subscriptions poll.
#[derive(Clone)]
pub struct RestDirectory {
    config: RestDirectoryConfig,
    http_client: Arc<dyn HttpClient>,
}

impl RestDirectory {
    pub fn new(config: RestDirectoryConfig, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        let mut url = format!(
            "{}/{}.json",
            self.config.base_url.trim_end_matches('/'),
            path.trim_matches('/')
        );
        if let Some(token) = &self.config.auth_token {
            url.push_str("?auth=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    async fn execute(&self, path: &str, request: HttpRequest) -> Result<HttpResponse, DirectoryError> {
        let response = self.http_client.execute(request).await?;
        if !response.is_success() {
            return Err(DirectoryError::Status {
                status: response.status_code,
                path: path.to_string(),
            });
        }
        Ok(response)
    }
}

fn parse_children(path: &str, body: &[u8]) -> Result<Children, DirectoryError> {
    let invalid = |reason: String| DirectoryError::InvalidData {
        path: path.to_string(),
        reason,
    };
    let value: Value = serde_json::from_slice(body).map_err(|e| invalid(e.to_string()))?;
    match value {
        Value::Null => Ok(Children::new()),
        Value::Object(map) => Ok(map
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(text) => Some((key, text)),
                Value::Object(_) | Value::Array(_) => None,
                scalar => Some((key, scalar.to_string())),
            })
            .collect()),
        other => Err(invalid(format!("expected an object, got {other}"))),
    }
}

#[async_trait]
impl DirectoryStore for RestDirectory {
    async fn set(&self, path: &str, value: String) -> Result<(), DirectoryError> {
        let body = serde_json::to_vec(&Value::String(value))?;
        let request = HttpRequest::put(self.url(path))
            .with_header("Content-Type", "application/json")
            .with_body(body);
        self.execute(path, request).await?;
        debug!(target: "Directory/Rest", "PUT {path}");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), DirectoryError> {
        self.execute(path, HttpRequest::delete(self.url(path)))
            .await?;
        debug!(target: "Directory/Rest", "DELETE {path}");
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Children, DirectoryError> {
        let response = self.execute(path, HttpRequest::get(self.url(path))).await?;
        parse_children(path, &response.body)
    }

    async fn subscribe(&self, path: &str) -> Result<watch::Receiver<Children>, DirectoryError> {
        let initial = self.children(path).await?;
        let (tx, rx) = watch::channel(initial);
        let store = self.clone();
        let path = path.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(store.config.poll_interval) => {}
                }
                match store.children(&path).await {
                    Ok(snapshot) => {
                        tx.send_if_modified(|current| {
                            if *current == snapshot {
                                return false;
                            }
                            *current = snapshot;
                            true
                        });
                    }
                    Err(e) => warn!(target: "Directory/Rest", "Polling {path} failed: {e}"),
                }
            }
            debug!(target: "Directory/Rest", "Stopped polling {path}");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::RecordingHttpClient;

    fn directory(http: &Arc<RecordingHttpClient>) -> RestDirectory {
        RestDirectory::new(
            RestDirectoryConfig::new("https://db.test/").with_auth_token("s3cr3t"),
            http.clone(),
        )
    }

    #[tokio::test]
    async fn test_set_puts_json_string() {
        let http = Arc::new(RecordingHttpClient::default());
        let dir = directory(&http);

        dir.set("rooms/r1/peers/a", r#"{"peerId":"a"}"#.to_string())
            .await
            .unwrap();

        let request = &http.requests()[0];
        assert_eq!(request.method, "PUT");
        assert_eq!(request.url, "https://db.test/rooms/r1/peers/a.json?auth=s3cr3t");
        let body: Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, Value::String(r#"{"peerId":"a"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_remove_and_status_errors() {
        let http = Arc::new(RecordingHttpClient::default());
        let dir = directory(&http);

        dir.remove("rooms/r1").await.unwrap();
        assert_eq!(http.requests()[0].method, "DELETE");

        http.respond_with(401, "");
        let err = dir.remove("rooms/r1").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Status { status: 401, .. }));

        http.fail_next("offline");
        assert!(matches!(
            dir.remove("rooms/r1").await.unwrap_err(),
            DirectoryError::Request(_)
        ));
    }

    #[tokio::test]
    async fn test_children_parsing() {
        let http = Arc::new(RecordingHttpClient::default());
        let dir = directory(&http);

        assert!(dir.children("rooms/r1/peers").await.unwrap().is_empty());

        http.respond_with(200, r#"{"a":"{\"peerId\":\"a\"}","b":{"deep":1},"c":7}"#);
        let children = dir.children("rooms/r1/peers").await.unwrap();
        assert_eq!(children.get("a").unwrap(), r#"{"peerId":"a"}"#);
        assert_eq!(children.get("c").unwrap(), "7");
        assert!(!children.contains_key("b"));

        http.respond_with(200, "[1,2]");
        assert!(matches!(
            dir.children("x").await.unwrap_err(),
            DirectoryError::InvalidData { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_polls_for_changes() {
        let http = Arc::new(RecordingHttpClient::default());
        let dir = directory(&http);

        let mut rx = dir.subscribe("rooms/r1/peers").await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        http.respond_with(200, r#"{"b":"{\"peerId\":\"b\"}"}"#);
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow().contains_key("b"));
    }
}
