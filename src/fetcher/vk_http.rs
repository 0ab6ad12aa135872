//! VK method API client
//!
//! Implements [`RemoteApi`] over `https://api.vk.com/method/<name>`:
//! - one collection → one list method, offset or `next_from` paging
//! - remote error codes and HTTP statuses mapped onto [`FetcherError`]
//! - story bundles and conversation attachments unwrapped into plain items
//!
//! The client makes exactly one attempt per call. Rate limiting, deadlines and
//! retries are applied by the caller.

use super::{
    AttachmentMedia, Collection, Cursor, FetcherError, FetcherResult, Page, PageRequest, RemoteApi,
};
use crate::downloader::config::DEFAULT_CALL_TIMEOUT;
use crate::{Target, TargetDescriptor, TargetKind, CONVERSATION_PEER_OFFSET};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Production API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.vk.com";

/// API version sent with every call
pub const API_VERSION: &str = "5.199";

/// Connection establishment timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle connections kept per host
const POOL_MAX_IDLE_PER_HOST: usize = 8;

const PROFILE_FIELDS: &str =
    "description,members_count,activity,status,site,city,country,contacts,links,cover,photo_200";
const USER_FIELDS: &str =
    "about,activities,bdate,city,country,domain,interests,status,site,photo_max_orig";

/// HTTP client for the VK method API
#[derive(Debug, Clone)]
pub struct VkHttpClient {
    client: Client,
    base_url: String,
    token: String,
    version: String,
    timeout: Duration,
}

impl VkHttpClient {
    /// Create a client authenticated with `token`
    pub fn new(token: impl Into<String>) -> FetcherResult<Self> {
        Self::with_timeout(token, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a client whose transport gives up after `timeout`
    pub fn with_timeout(token: impl Into<String>, timeout: Duration) -> FetcherResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .user_agent(concat!("vk-archiver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetcherError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            version: API_VERSION.to_string(),
            timeout,
        })
    }

    /// Point the client at another endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Call one API method and return its `response` member
    pub async fn call_method(&self, method: &str, params: &[(&str, String)]) -> FetcherResult<Value> {
        let url = format!("{}/method/{}", self.base_url, method);
        debug!(method, params = params.len(), "Calling API method");

        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("access_token", self.token.as_str()), ("v", self.version.as_str())])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetcherError::Parse(format!("{method}: {e}")))?;

        if let Some(error) = body.get("error") {
            let code = error.get("error_code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("error_msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(api_error(code, message));
        }

        body.get("response")
            .cloned()
            .ok_or_else(|| FetcherError::Parse(format!("{method}: missing response member")))
    }

    fn transport_error(&self, err: reqwest::Error) -> FetcherError {
        if err.is_timeout() {
            FetcherError::Timeout(self.timeout)
        } else {
            FetcherError::Network(err.to_string())
        }
    }

    async fn list_offset_page(
        &self,
        method: &str,
        mut params: Vec<(&str, String)>,
        request: &PageRequest,
    ) -> FetcherResult<Page> {
        let offset = request.cursor.as_ref().and_then(Cursor::offset).unwrap_or(0);
        params.push(("offset", offset.to_string()));
        params.push(("count", request.page_size.to_string()));

        let response = self.call_method(method, &params).await?;
        let items = items_of(&response, method)?;
        let total = response.get("count").and_then(Value::as_u64);
        let next = next_offset(offset, items.len(), request.page_size, total);

        let mut page = Page::new(items, next);
        if let Some(total) = total {
            page = page.with_total(total);
        }
        Ok(page)
    }

    async fn profile(&self, owner: &Target) -> FetcherResult<Value> {
        let response = match owner.kind {
            TargetKind::Group => {
                self.call_method(
                    "groups.getById",
                    &[("group_id", owner.id.to_string()), ("fields", PROFILE_FIELDS.to_string())],
                )
                .await?
            }
            TargetKind::User => {
                self.call_method(
                    "users.get",
                    &[("user_ids", owner.id.to_string()), ("fields", USER_FIELDS.to_string())],
                )
                .await?
            }
            TargetKind::Conversation => {
                self.call_method(
                    "messages.getConversationsById",
                    &[("peer_ids", owner.owner_id().to_string())],
                )
                .await?
            }
        };
        first_entry(&response)
            .ok_or_else(|| FetcherError::NotFound(format!("{} {}", owner.kind, owner.id)))
    }

    async fn attachments_page(
        &self,
        media: AttachmentMedia,
        request: &PageRequest,
    ) -> FetcherResult<Page> {
        let mut params = vec![
            ("peer_id", request.owner.owner_id().to_string()),
            ("media_type", media.as_str().to_string()),
            ("count", request.page_size.to_string()),
        ];
        if let Some(Cursor::Token { token }) = &request.cursor {
            params.push(("start_from", token.clone()));
        }

        let response = self
            .call_method("messages.getHistoryAttachments", &params)
            .await?;
        let items = items_of(&response, "messages.getHistoryAttachments")?
            .into_iter()
            .filter_map(|entry| {
                entry
                    .get("attachment")
                    .and_then(|a| a.get(media.as_str()))
                    .cloned()
            })
            .collect::<Vec<_>>();
        let next = response
            .get("next_from")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(|token| Cursor::Token {
                token: token.to_string(),
            });
        Ok(Page::new(items, next))
    }
}

#[async_trait]
impl RemoteApi for VkHttpClient {
    async fn resolve_target(&self, descriptor: &TargetDescriptor) -> FetcherResult<Target> {
        let not_found = || FetcherError::NotFound(format!("target {descriptor}"));
        let resolved = match descriptor.kind {
            TargetKind::Group => {
                let response = self
                    .call_method("groups.getById", &[("group_id", descriptor.handle.clone())])
                    .await
                    .map_err(|e| invalid_id_as_not_found(e, descriptor))?;
                let group = first_entry(&response).ok_or_else(not_found)?;
                let id = group.get("id").and_then(Value::as_i64).ok_or_else(not_found)?;
                let name = group.get("name").and_then(Value::as_str).unwrap_or_default();
                Target::new(TargetKind::Group, id, name)
            }
            TargetKind::User => {
                let response = self
                    .call_method("users.get", &[("user_ids", descriptor.handle.clone())])
                    .await
                    .map_err(|e| invalid_id_as_not_found(e, descriptor))?;
                let user = first_entry(&response).ok_or_else(not_found)?;
                let id = user.get("id").and_then(Value::as_i64).ok_or_else(not_found)?;
                let first = user.get("first_name").and_then(Value::as_str).unwrap_or_default();
                let last = user.get("last_name").and_then(Value::as_str).unwrap_or_default();
                Target::new(TargetKind::User, id, format!("{first} {last}").trim())
            }
            TargetKind::Conversation => {
                let id = descriptor.numeric_id().ok_or_else(not_found)?;
                let response = self
                    .call_method(
                        "messages.getConversationsById",
                        &[("peer_ids", (CONVERSATION_PEER_OFFSET + id).to_string())],
                    )
                    .await?;
                let conversation = first_entry(&response).ok_or_else(not_found)?;
                let title = conversation
                    .pointer("/chat_settings/title")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("conversation {id}"));
                Target::new(TargetKind::Conversation, id, title)
            }
        };
        debug!(resolved = %resolved, "Resolved target");
        Ok(resolved)
    }

    async fn list_page(&self, request: &PageRequest) -> FetcherResult<Page> {
        let owner_id = request.owner.owner_id().to_string();
        match &request.collection {
            Collection::Profile => {
                let profile = self.profile(&request.owner).await?;
                Ok(Page::new(vec![profile], None).with_total(1))
            }
            Collection::Wall => {
                self.list_offset_page("wall.get", vec![("owner_id", owner_id)], request)
                    .await
            }
            Collection::Albums => {
                self.list_offset_page(
                    "photos.getAlbums",
                    vec![("owner_id", owner_id), ("need_system", "1".to_string())],
                    request,
                )
                .await
            }
            Collection::AlbumPhotos { album_id } => {
                self.list_offset_page(
                    "photos.get",
                    vec![
                        ("owner_id", owner_id),
                        ("album_id", album_id.to_string()),
                        ("photo_sizes", "1".to_string()),
                    ],
                    request,
                )
                .await
            }
            Collection::Videos => {
                self.list_offset_page("video.get", vec![("owner_id", owner_id)], request)
                    .await
            }
            Collection::Documents => {
                self.list_offset_page("docs.get", vec![("owner_id", owner_id)], request)
                    .await
            }
            Collection::Stories => {
                let response = self
                    .call_method("stories.get", &[("owner_id", owner_id)])
                    .await?;
                let items = flatten_stories(items_of(&response, "stories.get")?);
                let total = items.len() as u64;
                // Listed in one call; an offset cursor skips what earlier runs consumed
                let skip = request.cursor.as_ref().and_then(Cursor::offset).unwrap_or(0);
                let items = items.into_iter().skip(skip as usize).collect();
                Ok(Page::new(items, None).with_total(total))
            }
            Collection::Attachments { media } => self.attachments_page(*media, request).await,
        }
    }

    async fn fetch_binary(&self, url: &str) -> FetcherResult<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url.to_string()));
        }
        response.bytes().await.map_err(|e| self.transport_error(e))
    }
}

/// Map a remote error code onto the fetcher taxonomy
pub fn api_error(code: i64, message: String) -> FetcherError {
    match code {
        6 | 9 | 29 => FetcherError::RateLimitExceeded(message),
        1 | 10 => FetcherError::Server {
            status: code as u16,
            message,
        },
        5 | 7 | 15 | 30 | 200 | 201 | 203 | 212 | 260 => FetcherError::Authorization(message),
        18 | 104 | 113 => FetcherError::NotFound(message),
        _ => FetcherError::Api { code, message },
    }
}

fn status_error(status: StatusCode, detail: String) -> FetcherError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetcherError::RateLimitExceeded(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetcherError::Authorization(detail),
        StatusCode::NOT_FOUND | StatusCode::GONE => FetcherError::NotFound(detail),
        s if s.is_server_error() => FetcherError::Server {
            status: s.as_u16(),
            message: detail,
        },
        s => FetcherError::Api {
            code: i64::from(s.as_u16()),
            message: detail,
        },
    }
}

fn invalid_id_as_not_found(err: FetcherError, descriptor: &TargetDescriptor) -> FetcherError {
    match err {
        FetcherError::Api { code: 100, message } => {
            FetcherError::NotFound(format!("target {descriptor}: {message}"))
        }
        other => other,
    }
}

/// Next offset cursor after a page of `len` items requested at `offset`
fn next_offset(offset: u64, len: usize, page_size: u32, total: Option<u64>) -> Option<Cursor> {
    if len == 0 {
        return None;
    }
    let next = offset + len as u64;
    let more = match total {
        Some(total) => next < total,
        None => len as u64 >= u64::from(page_size),
    };
    more.then_some(Cursor::Offset { offset: next })
}

fn items_of(response: &Value, method: &str) -> FetcherResult<Vec<Value>> {
    match response.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        None => Ok(Vec::new()),
        Some(_) => Err(FetcherError::Parse(format!("{method}: items is not an array"))),
    }
}

/// First record of a by-id lookup, which comes back as an array, `{groups: [...]}` or `{items: [...]}`
fn first_entry(response: &Value) -> Option<Value> {
    match response {
        Value::Array(entries) => entries.first().cloned(),
        Value::Object(map) => ["groups", "items"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .and_then(|entries| entries.first().cloned()),
        _ => None,
    }
}

/// Stories come grouped per author; unwrap bundles into individual stories
fn flatten_stories(entries: Vec<Value>) -> Vec<Value> {
    entries
        .into_iter()
        .flat_map(|entry| match entry.get("stories").and_then(Value::as_array) {
            Some(stories) => stories.clone(),
            None => vec![entry],
        })
        .collect()
}
