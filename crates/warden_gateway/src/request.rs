//! Request/response envelope for external dispatchers.
//!
//! Dispatchers deserialize a [`Request`] from their own framing, hand it to
//! [`Gateway::execute`] together with the authenticated tenant, and
//! serialize the [`Response`] back. Errors only ever surface through
//! [`WardenError::public`].

use crate::gateway::Gateway;
use crate::types::{ListOptions, ReadOptions, ReadResult, SearchOptions};
use serde::{Deserialize, Serialize};
use warden_core::{ContentDigest, ErrorCode, TenantId, WardenError, WardenResult};

fn root() -> String {
    ".".to_string()
}

fn any_name() -> String {
    "*".to_string()
}

fn yes() -> bool {
    true
}

/// How file content is carried in JSON
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Text
    #[default]
    Utf8,
    /// Lowercase hex of the raw bytes
    Hex,
}

impl Encoding {
    /// Decode a payload into bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the payload is not valid hex
    pub fn decode(self, content: &str) -> WardenResult<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(content.as_bytes().to_vec()),
            Self::Hex => hex::decode(content)
                .map_err(|e| WardenError::invalid_request(format!("bad hex content: {e}"))),
        }
    }

    /// Encode bytes, preferring text when they are valid UTF-8
    #[must_use]
    pub fn encode(bytes: &[u8]) -> (String, Self) {
        match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), Self::Utf8),
            Err(_) => (hex::encode(bytes), Self::Hex),
        }
    }
}

/// One gateway operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Describe a path
    Stat {
        /// Tenant-relative path
        path: String,
    },
    /// List a directory
    List {
        /// Tenant-relative directory
        #[serde(default = "root")]
        path: String,
        /// Include dotfiles
        #[serde(default)]
        show_hidden: bool,
        /// Entry limit
        #[serde(default)]
        max_items: Option<usize>,
    },
    /// Read a file
    Read {
        /// Tenant-relative path
        path: String,
        /// Line limit; the whole file when absent
        #[serde(default)]
        max_lines: Option<usize>,
    },
    /// Replace a file's content
    Write {
        /// Tenant-relative path
        path: String,
        /// Payload
        content: String,
        /// Payload encoding
        #[serde(default)]
        encoding: Encoding,
    },
    /// Append to a file
    Append {
        /// Tenant-relative path
        path: String,
        /// Payload
        content: String,
        /// Payload encoding
        #[serde(default)]
        encoding: Encoding,
    },
    /// Remove a path
    Delete {
        /// Tenant-relative path
        path: String,
        /// Remove directories with their contents
        #[serde(default)]
        recursive: bool,
    },
    /// Move a path
    Move {
        /// Source
        from: String,
        /// Destination
        to: String,
    },
    /// Copy a file
    Copy {
        /// Source
        from: String,
        /// Destination
        to: String,
    },
    /// Create a directory
    #[serde(rename = "mkdir")]
    CreateDir {
        /// Tenant-relative path
        path: String,
        /// Create missing parents
        #[serde(default = "yes")]
        parents: bool,
    },
    /// Find entries by name
    Search {
        /// Directory to search below
        #[serde(default = "root")]
        path: String,
        /// Glob matched against names
        #[serde(default = "any_name")]
        pattern: String,
        /// Skip directories
        #[serde(default = "yes")]
        files_only: bool,
        /// Match limit
        #[serde(default)]
        max_results: Option<usize>,
    },
    /// Quota and rate state
    Usage,
}

impl Request {
    /// Operation name as it appears on the wire
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Stat { .. } => "stat",
            Self::List { .. } => "list",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Append { .. } => "append",
            Self::Delete { .. } => "delete",
            Self::Move { .. } => "move",
            Self::Copy { .. } => "copy",
            Self::CreateDir { .. } => "mkdir",
            Self::Search { .. } => "search",
            Self::Usage => "usage",
        }
    }

    /// Whether the operation changes the sandbox
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Write { .. }
                | Self::Append { .. }
                | Self::Delete { .. }
                | Self::Move { .. }
                | Self::Copy { .. }
                | Self::CreateDir { .. }
        )
    }
}

/// Read result with its content encoded for JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadView {
    /// Tenant-relative path
    pub path: String,
    /// Encoded content
    pub content: String,
    /// How `content` is encoded
    pub encoding: Encoding,
    /// Content size
    pub size: u64,
    /// BLAKE3 digest of the whole file
    pub digest: ContentDigest,
    /// Whether `content` stops at the line limit
    pub truncated: bool,
}

impl From<ReadResult> for ReadView {
    fn from(result: ReadResult) -> Self {
        let (content, encoding) = Encoding::encode(&result.content);
        Self {
            path: result.path,
            content,
            encoding,
            size: result.size,
            digest: result.digest,
            truncated: result.truncated,
        }
    }
}

/// Outcome of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the operation succeeded
    pub ok: bool,
    /// Public error code on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Public error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether retrying later may succeed
    #[serde(default)]
    pub retryable: bool,
    /// Operation result on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Successful response carrying `data`
    #[must_use]
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            code: None,
            message: None,
            retryable: false,
            data: Some(data),
        }
    }

    /// Failed response; only the public view of `err` is exposed
    #[must_use]
    pub fn failure(err: &WardenError) -> Self {
        let public = err.public();
        Self {
            ok: false,
            code: Some(public.code),
            message: Some(public.message),
            retryable: public.retryable,
            data: None,
        }
    }

    fn from_result<T: Serialize>(result: WardenResult<T>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|e| WardenError::storage(format!("cannot encode result: {e}")))
        }) {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

impl Gateway {
    /// Run one enveloped request for an authenticated tenant
    pub async fn execute(&self, tenant: &TenantId, request: Request) -> Response {
        tracing::debug!(
            %tenant,
            op = request.op(),
            mutation = request.is_mutation(),
            "executing request"
        );
        match request {
            Request::Stat { path } => Response::from_result(self.stat(tenant, &path).await),
            Request::List {
                path,
                show_hidden,
                max_items,
            } => {
                let defaults = ListOptions::default();
                let options = ListOptions {
                    show_hidden,
                    max_items: max_items.unwrap_or(defaults.max_items),
                };
                Response::from_result(self.list(tenant, &path, options).await)
            }
            Request::Read { path, max_lines } => {
                let options = ReadOptions { max_lines };
                Response::from_result(
                    self.read_with(tenant, &path, options)
                        .await
                        .map(ReadView::from),
                )
            }
            Request::Write {
                path,
                content,
                encoding,
            } => match encoding.decode(&content) {
                Ok(data) => Response::from_result(self.write(tenant, &path, &data).await),
                Err(err) => Response::failure(&err),
            },
            Request::Append {
                path,
                content,
                encoding,
            } => match encoding.decode(&content) {
                Ok(data) => Response::from_result(self.append(tenant, &path, &data).await),
                Err(err) => Response::failure(&err),
            },
            Request::Delete { path, recursive } => {
                Response::from_result(self.delete(tenant, &path, recursive).await)
            }
            Request::Move { from, to } => {
                Response::from_result(self.r#move(tenant, &from, &to).await)
            }
            Request::Copy { from, to } => {
                Response::from_result(self.copy(tenant, &from, &to).await)
            }
            Request::CreateDir { path, parents } => {
                Response::from_result(self.create_dir(tenant, &path, parents).await)
            }
            Request::Search {
                path,
                pattern,
                files_only,
                max_results,
            } => {
                let defaults = SearchOptions::default();
                let options = SearchOptions {
                    pattern,
                    files_only,
                    max_results: max_results.unwrap_or(defaults.max_results),
                };
                Response::from_result(self.search(tenant, &path, &options).await)
            }
            Request::Usage => Response::from_result(self.usage(tenant).await),
        }
    }

    /// Decode a JSON request and run it
    pub async fn execute_json(&self, tenant: &TenantId, request: &str) -> Response {
        match serde_json::from_str::<Request>(request) {
            Ok(request) => self.execute(tenant, request).await,
            Err(e) => Response::failure(&WardenError::invalid_request(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use warden_core::{GatewayConfig, ManualClock};
    use warden_storage::MemoryStorage;

    async fn gateway() -> Gateway {
        Gateway::builder(GatewayConfig::new("/ws").with_rate(1_000, 1.0))
            .with_backend(Arc::new(MemoryStorage::new()))
            .with_clock(Arc::new(ManualClock::new()))
            .open()
            .await
            .unwrap()
    }

    fn tenant() -> TenantId {
        TenantId::new("alice").unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request =
            serde_json::from_str(r#"{"op": "write", "path": "a.txt", "content": "hi"}"#).unwrap();
        assert_eq!(
            request,
            Request::Write {
                path: "a.txt".to_string(),
                content: "hi".to_string(),
                encoding: Encoding::Utf8,
            }
        );
        assert!(request.is_mutation());

        let request: Request = serde_json::from_str(r#"{"op": "mkdir", "path": "d"}"#).unwrap();
        assert_eq!(request.op(), "mkdir");
        assert_eq!(
            request,
            Request::CreateDir {
                path: "d".to_string(),
                parents: true,
            }
        );

        let request: Request = serde_json::from_str(r#"{"op": "read", "path": "a.md"}"#).unwrap();
        assert_eq!(
            request,
            Request::Read {
                path: "a.md".to_string(),
                max_lines: None,
            }
        );

        let request: Request = serde_json::from_str(r#"{"op": "search"}"#).unwrap();
        assert_eq!(
            request,
            Request::Search {
                path: ".".to_string(),
                pattern: "*".to_string(),
                files_only: true,
                max_results: None,
            }
        );
        assert!(!request.is_mutation());
    }

    #[test]
    fn test_encoding() {
        assert_eq!(Encoding::Hex.decode("00ff").unwrap(), vec![0, 255]);
        assert_eq!(
            Encoding::Hex.decode("zz").unwrap_err().code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(Encoding::encode(b"text"), ("text".to_string(), Encoding::Utf8));
        assert_eq!(Encoding::encode(&[0xff]), ("ff".to_string(), Encoding::Hex));
    }

    #[tokio::test]
    async fn test_execute_write_then_read() {
        let gateway = gateway().await;
        let t = tenant();

        let written = gateway
            .execute(
                &t,
                Request::Write {
                    path: "bin.dat".to_string(),
                    content: "0001ff".to_string(),
                    encoding: Encoding::Hex,
                },
            )
            .await;
        assert!(written.ok, "{written:?}");
        assert_eq!(written.data.unwrap()["size"], 3);

        let read = gateway
            .execute_json(&t, r#"{"op": "read", "path": "bin.dat"}"#)
            .await;
        assert!(read.ok);
        let data = read.data.unwrap();
        assert_eq!(data["content"], "0001ff");
        assert_eq!(data["encoding"], "hex");
    }

    #[tokio::test]
    async fn test_execute_escape_looks_missing() {
        let gateway = gateway().await;
        let t = tenant();

        let escaped = gateway
            .execute_json(&t, r#"{"op": "read", "path": "../other/secret.txt"}"#)
            .await;
        let missing = gateway
            .execute_json(&t, r#"{"op": "read", "path": "absent.txt"}"#)
            .await;
        assert!(!escaped.ok);
        assert_eq!(escaped.code, Some(ErrorCode::NotFound));
        assert_eq!(escaped.code, missing.code);
        assert!(!escaped.retryable);
    }

    #[tokio::test]
    async fn test_execute_bad_envelope() {
        let gateway = gateway().await;
        let response = gateway.execute_json(&tenant(), r#"{"op": "explode"}"#).await;
        assert!(!response.ok);
        assert_eq!(response.code, Some(ErrorCode::InvalidRequest));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], "INVALID_REQUEST");
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn test_execute_usage() {
        let gateway = gateway().await;
        let t = tenant();
        gateway
            .execute(
                &t,
                Request::Write {
                    path: "a.txt".to_string(),
                    content: "12345".to_string(),
                    encoding: Encoding::Utf8,
                },
            )
            .await;

        let usage = gateway.execute(&t, Request::Usage).await;
        let data = usage.data.unwrap();
        assert_eq!(data["bytes_used"], json!(5));
        assert_eq!(data["max_file_size"], json!(10 * 1024 * 1024));
        let extensions = data["allowed_extensions"].as_array().unwrap();
        assert!(extensions.contains(&json!(".txt")));
    }

    #[tokio::test]
    async fn test_execute_read_max_lines() {
        let gateway = gateway().await;
        let t = tenant();
        gateway.write(&t, "log.txt", b"a\nb\nc\n").await.unwrap();

        let head = gateway
            .execute_json(&t, r#"{"op": "read", "path": "log.txt", "max_lines": 2}"#)
            .await;
        let data = head.data.unwrap();
        assert_eq!(data["content"], "a\nb\n");
        assert_eq!(data["size"], 6);
        assert_eq!(data["truncated"], true);
        assert_eq!(data["digest"], json!(ContentDigest::compute(b"a\nb\nc\n")));

        let whole = gateway
            .execute_json(&t, r#"{"op": "read", "path": "log.txt"}"#)
            .await;
        assert_eq!(whole.data.unwrap()["truncated"], false);
    }

    #[tokio::test]
    async fn test_execute_mkdir_creates_parents() {
        let gateway = gateway().await;
        let t = tenant();

        let nested = gateway
            .execute_json(&t, r#"{"op": "mkdir", "path": "a/b/c"}"#)
            .await;
        assert!(nested.ok, "{nested:?}");

        let strict = gateway
            .execute_json(&t, r#"{"op": "mkdir", "path": "x/y", "parents": false}"#)
            .await;
        assert_eq!(strict.code, Some(ErrorCode::NotFound));
    }
}
