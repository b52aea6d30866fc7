//! HTTP client for the native storage API
//!
//! Every call carries an `X-Blazer-Request-ID` from the client's own
//! [`RequestCounter`] and an `X-Blazer-Method` naming the operation, so
//! request and response log lines can be paired up. Authorization headers
//! are never logged.

use super::{
    range_header, AuthContext, LargeFileApi, ObjectSource, RangeResponse, Reauthenticate,
    RemoteFile, RemoteObjectHandle, StartLargeFile, UploadTarget,
};
use crate::config::TransferConfig;
use crate::error::{ProtocolError, Result, TransferError, TransportKind};
use crate::util::lock;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skyhaul_core_resilience::Operation;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

const API_V1: &str = "/b2api/v1/";
const INFO_HEADER_PREFIX: &str = "x-bz-info-";

/// Source of request ids for one client
///
/// Clones share the same sequence, so several clients can be made to number
/// their requests jointly.
#[derive(Debug, Clone, Default)]
pub struct RequestCounter {
    next: Arc<AtomicU64>,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id (ids start at 1)
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of requests issued so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// A bucket as listed by the service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    pub bucket_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub bucket_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    account_id: String,
    authorization_token: String,
    api_url: String,
    download_url: String,
    #[serde(default)]
    minimum_part_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountRequest<'a> {
    account_id: &'a str,
}

#[derive(Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketRequest<'a> {
    bucket_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdRequest<'a> {
    file_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileRequest<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
    file_info: &'a HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileRequest<'a> {
    file_id: &'a str,
    part_sha1_array: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResponse {
    file_id: String,
    file_name: String,
    #[serde(default)]
    content_length: u64,
}

#[derive(Deserialize)]
struct IgnoredResponse {}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Client for the native HTTP API
pub struct HttpRemote {
    client: Client,
    account_id: String,
    application_key: String,
    api_base: String,
    fail_some_uploads: bool,
    counter: RequestCounter,
    session: RwLock<Option<AuthContext>>,
    bucket_ids: Mutex<HashMap<String, String>>,
}

impl HttpRemote {
    /// Build an unauthorized client from configuration
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let account_id = config
            .account
            .account_id
            .clone()
            .ok_or_else(|| TransferError::Config("account_id is not set".to_string()))?;
        let application_key = config
            .account
            .application_key
            .clone()
            .ok_or_else(|| TransferError::Config("application_key is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_seconds))
            .build()
            .map_err(|e| TransferError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            account_id,
            application_key,
            api_base: config.account.api_base.trim_end_matches('/').to_string(),
            fail_some_uploads: config.http.fail_some_uploads,
            counter: RequestCounter::new(),
            session: RwLock::new(None),
            bucket_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Build a client and authorize it
    pub async fn connect(config: &TransferConfig) -> Result<Self> {
        let remote = Self::new(config)?;
        remote.authorize().await?;
        Ok(remote)
    }

    /// Number requests from a shared counter
    pub fn with_request_counter(mut self, counter: RequestCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn request_counter(&self) -> &RequestCounter {
        &self.counter
    }

    /// Current session, if authorized
    pub fn auth_context(&self) -> Option<AuthContext> {
        self.session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn session(&self) -> Result<AuthContext> {
        self.auth_context().ok_or_else(|| {
            TransferError::Config("client is not authorized; call authorize first".to_string())
        })
    }

    fn api_url(session: &AuthContext, operation: Operation) -> String {
        format!("{}{}{}", session.api_url, API_V1, operation.api_name())
    }

    /// Exchange the account credentials for a fresh session
    pub async fn authorize(&self) -> Result<AuthContext> {
        let operation = Operation::AuthorizeAccount;
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.account_id, self.application_key));
        let url = format!("{}{}{}", self.api_base, API_V1, operation.api_name());

        let request = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Basic {}", credentials));
        let reply: AuthorizeResponse = self
            .send(operation, request)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let context = AuthContext {
            account_id: reply.account_id,
            api_url: reply.api_url,
            download_url: reply.download_url,
            auth_token: reply.authorization_token,
            min_part_size: reply.minimum_part_size,
        };
        *self
            .session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(context.clone());
        debug!(account = %context.account_id, api_url = %context.api_url, "authorized");
        Ok(context)
    }

    /// List the account's buckets
    pub async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let session = self.session()?;
        let reply: ListBucketsResponse = self
            .call(
                Operation::ListBuckets,
                &session,
                &AccountRequest {
                    account_id: &session.account_id,
                },
            )
            .await?;

        let mut ids = lock(&self.bucket_ids);
        for bucket in &reply.buckets {
            ids.insert(bucket.bucket_name.clone(), bucket.bucket_id.clone());
        }
        Ok(reply.buckets)
    }

    /// Resolve a bucket name to its id, listing buckets on first use
    pub async fn bucket_id(&self, bucket_name: &str) -> Result<String> {
        let cached = lock(&self.bucket_ids).get(bucket_name).cloned();
        if let Some(id) = cached {
            return Ok(id);
        }
        self.list_buckets()
            .await?
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| TransferError::validation(format!("no such bucket: {}", bucket_name)))
    }

    /// Get an upload URL for single-request uploads into a bucket
    pub async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadTarget> {
        let session = self.session()?;
        let reply: UploadUrlResponse = self
            .call(
                Operation::GetUploadUrl,
                &session,
                &BucketRequest { bucket_id },
            )
            .await?;
        Ok(UploadTarget {
            url: reply.upload_url,
            token: reply.authorization_token,
        })
    }

    /// Upload a whole object in a single request
    pub async fn upload_file(
        &self,
        target: &UploadTarget,
        name: &str,
        content_type: &str,
        info: &HashMap<String, String>,
        data: Bytes,
    ) -> Result<RemoteFile> {
        let sha1 = crate::digest::sha1_hex(&data);
        let size = data.len() as u64;
        let mut request = self
            .client
            .post(&target.url)
            .header(AUTHORIZATION, &target.token)
            .header("X-Bz-File-Name", encode_file_name(name))
            .header(CONTENT_TYPE, content_type)
            .header("X-Bz-Content-Sha1", sha1);
        for (key, value) in info {
            request = request.header(format!("X-Bz-Info-{}", key), value);
        }

        let reply: FileResponse = self
            .send(Operation::UploadFile, request.body(data))
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(RemoteFile {
            file_id: reply.file_id,
            name: reply.file_name,
            size,
        })
    }

    /// Look up an object's size with a HEAD request
    pub async fn stat_object(&self, bucket: &str, name: &str) -> Result<RemoteObjectHandle> {
        let session = self.session()?;
        let request = self
            .client
            .head(download_url(&session, bucket, name)?)
            .header(AUTHORIZATION, &session.auth_token);
        let response = self.send(Operation::DownloadFileByName, request).await?;
        let size = header_u64(response.headers(), CONTENT_LENGTH.as_str()).ok_or_else(|| {
            TransferError::transport(TransportKind::Body, "response has no Content-Length")
        })?;
        Ok(RemoteObjectHandle::new(bucket, name, size))
    }

    /// POST a JSON request to an API endpoint and decode the JSON reply
    async fn call<Req, Resp>(
        &self,
        operation: Operation,
        session: &AuthContext,
        body: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = self
            .client
            .post(Self::api_url(session, operation))
            .header(AUTHORIZATION, &session.auth_token)
            .json(body);
        self.send(operation, request)
            .await?
            .json()
            .await
            .map_err(transport_error)
    }

    /// Send a request, logging it and turning error statuses into errors
    async fn send(&self, operation: Operation, request: RequestBuilder) -> Result<Response> {
        let request_id = self.counter.next_id();
        let mut request = request
            .header("X-Blazer-Request-ID", request_id.to_string())
            .header("X-Blazer-Method", operation.api_name());
        if self.fail_some_uploads {
            request = request.header("X-Bz-Test-Mode", "fail_some_uploads");
        }

        debug!(request_id, operation = %operation, "request");
        let response = request.send().await.map_err(|e| {
            warn!(request_id, operation = %operation, error = %e, "request failed");
            transport_error(e)
        })?;

        let status = response.status();
        debug!(request_id, operation = %operation, status = status.as_u16(), "response");
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.unwrap_or_default();
        Err(parse_error_body(operation, status.as_u16(), retry_after.as_deref(), &body).into())
    }
}

/// Build a protocol error from a non-success response.
///
/// The body is JSON `{status, code, message}`; anything else is kept verbatim as
/// the message. `Retry-After` is whole seconds, and zero means no wait was given.
pub fn parse_error_body(
    operation: Operation,
    status: u16,
    retry_after: Option<&str>,
    body: &[u8],
) -> ProtocolError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_else(|_| ErrorBody {
        code: String::new(),
        message: String::from_utf8_lossy(body).trim().to_string(),
    });

    let mut err = ProtocolError::new(operation, status, parsed.message).with_code(parsed.code);
    if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
        if secs > 0 {
            err = err.with_retry_after(Duration::from_secs(secs));
        }
    }
    err
}

fn transport_error(err: reqwest::Error) -> TransferError {
    let kind = if err.is_timeout() {
        TransportKind::Timeout
    } else if err.is_connect() {
        TransportKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportKind::Body
    } else {
        TransportKind::Other
    };
    TransferError::transport(kind, err.to_string())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Custom metadata from `X-Bz-Info-*` headers, keyed without the prefix
fn info_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(INFO_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn download_url(session: &AuthContext, bucket: &str, name: &str) -> Result<Url> {
    let mut url = Url::parse(&session.download_url)
        .map_err(|e| TransferError::Config(format!("bad download url: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| TransferError::Config("download url cannot be a base".to_string()))?
        .pop_if_empty()
        .push("file")
        .push(bucket)
        .extend(name.split('/'));
    Ok(url)
}

/// Percent-encode an object name for the `X-Bz-File-Name` header, keeping `/`
fn encode_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl ObjectSource for HttpRemote {
    async fn fetch_range(
        &self,
        object: &RemoteObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<RangeResponse> {
        let session = self.session()?;
        let mut request = self
            .client
            .get(download_url(&session, &object.bucket, &object.name)?)
            .header(AUTHORIZATION, &session.auth_token);
        if let Some(range) = range_header(offset, length) {
            request = request.header(RANGE, range);
        }

        let response = self.send(Operation::DownloadFileByName, request).await?;
        let headers = response.headers();
        let content_length = header_u64(headers, CONTENT_LENGTH.as_str()).ok_or_else(|| {
            TransferError::transport(TransportKind::Body, "response has no Content-Length")
        })?;
        let content_sha1 = header_string(headers, "x-bz-content-sha1");
        let content_type = header_string(headers, CONTENT_TYPE.as_str());
        let info = info_headers(headers);

        let body = response.bytes_stream().map_err(transport_error).boxed();
        Ok(RangeResponse {
            body,
            content_length,
            content_sha1,
            content_type,
            info,
        })
    }
}

#[async_trait]
impl LargeFileApi for HttpRemote {
    async fn start_large_file(&self, params: &StartLargeFile) -> Result<String> {
        let session = self.session()?;
        let reply: FileResponse = self
            .call(
                Operation::StartLargeFile,
                &session,
                &StartLargeFileRequest {
                    bucket_id: &params.bucket_id,
                    file_name: &params.name,
                    content_type: &params.content_type,
                    file_info: &params.info,
                },
            )
            .await?;
        Ok(reply.file_id)
    }

    async fn get_upload_part_target(&self, file_id: &str) -> Result<UploadTarget> {
        let session = self.session()?;
        let reply: UploadUrlResponse = self
            .call(
                Operation::GetUploadPartUrl,
                &session,
                &FileIdRequest { file_id },
            )
            .await?;
        Ok(UploadTarget {
            url: reply.upload_url,
            token: reply.authorization_token,
        })
    }

    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        sha1: &str,
        data: Bytes,
    ) -> Result<()> {
        let request = self
            .client
            .post(&target.url)
            .header(AUTHORIZATION, &target.token)
            .header("X-Bz-Part-Number", part_number.to_string())
            .header("X-Bz-Content-Sha1", sha1)
            .body(data);
        let _: IgnoredResponse = self
            .send(Operation::UploadPart, request)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn finish_large_file(&self, file_id: &str, part_sha1s: &[String]) -> Result<RemoteFile> {
        let session = self.session()?;
        let reply: FileResponse = self
            .call(
                Operation::FinishLargeFile,
                &session,
                &FinishLargeFileRequest {
                    file_id,
                    part_sha1_array: part_sha1s,
                },
            )
            .await?;
        Ok(RemoteFile {
            file_id: reply.file_id,
            name: reply.file_name,
            size: reply.content_length,
        })
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<()> {
        let session = self.session()?;
        let _: IgnoredResponse = self
            .call(
                Operation::CancelLargeFile,
                &session,
                &FileIdRequest { file_id },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Reauthenticate for HttpRemote {
    async fn reauthenticate(&self) -> Result<()> {
        self.authorize().await.map(|_| ())
    }
}
