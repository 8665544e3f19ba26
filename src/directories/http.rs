//! [`GroupDirectory`] over HTTP with `reqwest`.
//!
//! | Operation       | Request                      | Timeout |
//! |-----------------|------------------------------|---------|
//! | `current_user`  | `GET /auth/me`               | 5 s     |
//! | `list_groups`   | `GET /groups`                | 10 s    |
//! | `group_detail`  | `GET /groups/{id}`           | 10 s    |
//! | `create_group`  | `POST /groups` (multipart)   | 15 s    |
//! | `join_group`    | `POST /groups/{id}/join`     | 10 s    |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::directory::{GroupDirectory, NewGroup};
use crate::error::HuddleError;
use crate::protocol::{Group, GroupDetail, GroupId, User};

const PROFILE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const CREATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest error body excerpt carried into [`HuddleError::Directory`].
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Deserialize)]
struct JoinResponse {
    group: Group,
}

/// Talks to the chat server's REST API under `base_url`.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    http: Client,
    base_url: String,
}

impl HttpDirectory {
    /// Create a directory rooted at `base_url` (for example
    /// `https://chat.example.com`). A trailing slash is ignored.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Like [`new`](Self::new) with a caller-configured client.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base_url` with `segments` appended, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, HuddleError> {
        let invalid = |reason: String| HuddleError::Directory {
            status: None,
            message: format!("{}: {reason}", self.base_url),
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base url cannot take a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        path: &str,
    ) -> Result<T, HuddleError> {
        let response = request.send().await.map_err(|e| map_reqwest(e, path))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(path, status = status.as_u16(), "directory request failed");
            return Err(HuddleError::Directory {
                status: Some(status.as_u16()),
                message: format!(
                    "{path}: {status}: {}",
                    body.chars().take(ERROR_BODY_LIMIT).collect::<String>()
                ),
            });
        }
        response.json().await.map_err(|e| map_reqwest(e, path))
    }
}

fn map_reqwest(e: reqwest::Error, path: &str) -> HuddleError {
    if e.is_timeout() {
        return HuddleError::Timeout;
    }
    HuddleError::Directory {
        status: e.status().map(|s| s.as_u16()),
        message: format!("{path}: {e}"),
    }
}

fn multipart_form(group: NewGroup) -> Result<Form, HuddleError> {
    let mut form = Form::new()
        .text("name", group.name)
        .text("description", group.description)
        .text("isPublic", group.is_public.to_string());
    if let Some(image) = group.image {
        let part = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(&image.mime)
            .map_err(|e| HuddleError::Directory {
                status: None,
                message: format!("invalid image type: {e}"),
            })?;
        form = form.part("image", part);
    }
    Ok(form)
}

#[async_trait]
impl GroupDirectory for HttpDirectory {
    async fn current_user(&self, token: &str) -> Result<User, HuddleError> {
        let url = self.url(&["auth", "me"])?;
        let path = url.path().to_owned();
        let request = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(PROFILE_TIMEOUT);
        self.fetch(request, &path).await
    }

    async fn list_groups(&self, token: &str) -> Result<Vec<Group>, HuddleError> {
        let url = self.url(&["groups"])?;
        let path = url.path().to_owned();
        let request = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(READ_TIMEOUT);
        let groups: Vec<Group> = self.fetch(request, &path).await?;
        debug!(count = groups.len(), "groups listed");
        Ok(groups)
    }

    async fn group_detail(&self, token: &str, group_id: &str) -> Result<GroupDetail, HuddleError> {
        let url = self.url(&["groups", group_id])?;
        let path = url.path().to_owned();
        let request = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(READ_TIMEOUT);
        self.fetch(request, &path).await
    }

    async fn create_group(&self, token: &str, group: NewGroup) -> Result<Group, HuddleError> {
        let url = self.url(&["groups"])?;
        let path = url.path().to_owned();
        let request = self
            .http
            .post(url)
            .bearer_auth(token)
            .multipart(multipart_form(group)?)
            .timeout(CREATE_TIMEOUT);
        self.fetch(request, &path).await
    }

    async fn join_group(&self, token: &str, group_id: &GroupId) -> Result<Group, HuddleError> {
        let url = self.url(&["groups", group_id.as_str(), "join"])?;
        let path = url.path().to_owned();
        let request = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .timeout(READ_TIMEOUT);
        let joined: JoinResponse = self.fetch(request, &path).await?;
        Ok(joined.group)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    /// Serve one canned HTTP response and report the raw request.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(request);
        });
        (format!("http://{addr}"), rx)
    }

    /// Read the request head and, when announced, its body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up before sending headers");
            raw.extend_from_slice(&chunk[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&raw[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while raw.len() < head_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let directory = HttpDirectory::new("https://chat.example.com//");
        assert_eq!(directory.base_url(), "https://chat.example.com");
        assert_eq!(
            directory.url(&["groups"]).unwrap().as_str(),
            "https://chat.example.com/groups"
        );
    }

    #[test]
    fn base_path_is_kept() {
        let directory = HttpDirectory::new("https://chat.example.com/api/");
        assert_eq!(
            directory.url(&["auth", "me"]).unwrap().as_str(),
            "https://chat.example.com/api/auth/me"
        );
    }

    #[test]
    fn unusable_base_url_is_an_error() {
        assert_err!(HttpDirectory::new("not a url").url(&["groups"]));
        assert_err!(HttpDirectory::new("mailto:ops@example.com").url(&["groups"]));
    }

    #[tokio::test]
    async fn group_id_is_escaped_into_one_segment() {
        let (url, head) = serve_once("200 OK", r#"{"group":{"_id":"a/b","name":"odd"}}"#).await;
        let directory = HttpDirectory::new(url);
        assert_ok!(directory.join_group("a.b.c", &"a/b?c#d".to_owned()).await);
        assert!(head
            .await
            .unwrap()
            .starts_with("POST /groups/a%2Fb%3Fc%23d/join "));
    }

    #[tokio::test]
    async fn current_user_sends_bearer_token() {
        let (url, head) = serve_once("200 OK", r#"{"_id":"u1","username":"alice"}"#).await;
        let directory = HttpDirectory::new(url);
        let user = assert_ok!(directory.current_user("a.b.c").await);
        assert_eq!(user.id, "u1");

        let head = head.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /auth/me "));
        assert!(head.contains("authorization: bearer a.b.c"));
    }

    #[tokio::test]
    async fn unauthorized_is_reported_with_status() {
        let (url, _head) = serve_once("401 Unauthorized", r#"{"error":"expired"}"#).await;
        let directory = HttpDirectory::new(url);
        let err = assert_err!(directory.list_groups("a.b.c").await);
        assert!(err.is_unauthorized(), "got {err:?}");
    }

    #[tokio::test]
    async fn server_error_is_not_unauthorized() {
        let (url, _head) = serve_once("500 Internal Server Error", "{}").await;
        let directory = HttpDirectory::new(url);
        let err = assert_err!(directory.group_detail("a.b.c", "g1").await);
        assert!(matches!(
            err,
            HuddleError::Directory {
                status: Some(500),
                ..
            }
        ));
        assert!(!err.is_unauthorized());
    }

    #[tokio::test]
    async fn join_unwraps_group_envelope() {
        let (url, head) = serve_once("200 OK", r#"{"group":{"_id":"g7","name":"lounge"}}"#).await;
        let directory = HttpDirectory::new(url);
        let group = assert_ok!(directory.join_group("a.b.c", &"g7".to_owned()).await);
        assert_eq!(group.id, "g7");
        assert!(head.await.unwrap().starts_with("POST /groups/g7/join "));
    }

    #[tokio::test]
    async fn create_sends_multipart_fields() {
        let (url, head) = serve_once("201 Created", r#"{"_id":"g8","name":"crabs"}"#).await;
        let directory = HttpDirectory::new(url);
        let group = directory
            .create_group(
                "a.b.c",
                NewGroup::new("crabs")
                    .with_description("shell talk")
                    .with_visibility(false),
            )
            .await
            .unwrap();
        assert_eq!(group.id, "g8");

        let head = head.await.unwrap();
        assert!(head.to_ascii_lowercase().contains("multipart/form-data"));
    }

    #[test]
    fn rejects_bad_image_mime() {
        let group = NewGroup::new("crabs").with_image(crate::directory::GroupImage {
            file_name: "x.png".into(),
            mime: "not a mime".into(),
            bytes: vec![1, 2, 3],
        });
        assert_err!(multipart_form(group));
    }
}
