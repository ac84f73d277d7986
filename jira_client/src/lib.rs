//! HTTP client for the upstream JIRA-like issue tracker.
//!
//! Mirrors the paginated-stream shape of a Chron-style client: pages are
//! fetched eagerly (the next page's request is spawned while the caller is
//! still consuming the current one), and errors are classified into
//! transient (worth retrying) and fatal so callers above this layer never
//! have to look at HTTP status codes directly.

mod issue;
pub mod retry;

pub use issue::{dedup_by_max_updated, Issue, UpdatedFieldError};

use futures::{stream, Stream, StreamExt};
use log::debug;
use miette::Diagnostic;
use retry::Transience;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_PAGE_SIZE: usize = 100;
/// Keep sub-query URIs for key-batched full-refresh fetches comfortably
/// under the server's URI length limit.
const MAX_KEYS_PER_SUBQUERY: usize = 100;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error, Diagnostic)]
pub enum SourceError {
    #[error("error building source request")]
    RequestBuildError(#[source] reqwest::Error),

    #[error("error executing source request")]
    RequestExecuteError(#[source] reqwest::Error),

    #[error("source reported a server error")]
    ServerError(#[source] reqwest::Error),

    #[error("source reported throttling (429)")]
    Throttled(#[source] reqwest::Error),

    #[error("source rejected the request: {status} {body}")]
    ClientError { status: u16, body: String },

    #[error("error reading source response body")]
    ResponseBodyError(#[source] reqwest::Error),

    #[error("error deserializing source response")]
    DeserializeError(#[source] serde_json::Error),

    #[error("background fetch task exited abnormally")]
    JoinFailure(#[source] tokio::task::JoinError),

    #[error("issue had a malformed `updated` field")]
    BadUpdatedField(#[from] UpdatedFieldError),
}

impl Transience for SourceError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::RequestExecuteError(_)
                | SourceError::ServerError(_)
                | SourceError::Throttled(_)
                | SourceError::ResponseBodyError(_)
                | SourceError::JoinFailure(_)
        )
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct SearchPage {
    #[serde(rename = "startAt")]
    start_at: usize,
    total: usize,
    issues: Vec<Issue>,
}

#[derive(Debug, Clone)]
pub struct SourceClient {
    client: reqwest::Client,
    base_url: Arc<str>,
    username: Arc<str>,
    password: Arc<str>,
    page_size: usize,
}

impl SourceClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Arc::from(base_url.into()),
            username: Arc::from(username.into()),
            password: Arc::from(password.into()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// One issue by key, with retries.
    pub async fn get(&self, key: &str, fields: Option<&[&str]>) -> Result<Issue, SourceError> {
        retry::retry_with_backoff(MAX_RETRIES, || self.get_once(key, fields)).await
    }

    async fn get_once(&self, key: &str, fields: Option<&[&str]>) -> Result<Issue, SourceError> {
        let url = format!("{}/rest/api/2/issue/{key}", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .basic_auth(self.username.as_ref(), Some(self.password.as_ref()));

        if let Some(fields) = fields {
            request = request.query(&[("fields", fields.join(","))]);
        }

        let response = self.send(request).await?;
        let body = response
            .text()
            .await
            .map_err(SourceError::ResponseBodyError)?;
        serde_json::from_str(&body).map_err(SourceError::DeserializeError)
    }

    /// Streams every issue matching `filter_expression`. This stream can
    /// yield duplicate keys across page boundaries if the source mutates
    /// concurrently with pagination; deduplication by greatest `updated` is
    /// [`dedup_by_max_updated`], applied by callers that need a finished set.
    pub fn search(
        &self,
        filter_expression: &str,
        fields: Option<Vec<String>>,
    ) -> impl Stream<Item = Result<Issue, SourceError>> {
        self.pages(filter_expression.to_string(), fields)
            .flat_map(|page| match page {
                Ok(issues) => {
                    let results = issues.into_iter().map(Ok);
                    stream::iter(results).left_stream()
                }
                Err(e) => stream::once(async { Err(e) }).right_stream(),
            })
    }

    /// Collects `search` into a deduplicated `Vec`, atomically: on the first
    /// error the whole result is discarded rather than handed to the caller
    /// as a truncated set, because a partial set would let the pipeline
    /// record a completed cycle against input it never actually saw in
    /// full.
    pub async fn search_collect(
        &self,
        filter_expression: &str,
        fields: Option<Vec<String>>,
    ) -> Result<Vec<Issue>, SourceError> {
        let stream = self.search(filter_expression, fields);
        futures::pin_mut!(stream);

        let mut issues = Vec::new();
        while let Some(item) = stream.next().await {
            issues.push(item?);
        }
        Ok(dedup_by_max_updated(issues))
    }

    /// Fetches a specific set of keys (full-refresh mode), partitioning
    /// into sub-queries of at most [`MAX_KEYS_PER_SUBQUERY`] keys to keep
    /// request URIs bounded, and composing the results. Atomic in the same
    /// sense as [`search_collect`](Self::search_collect).
    pub async fn get_by_keys(&self, keys: &[String]) -> Result<Vec<Issue>, SourceError> {
        let mut issues = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(MAX_KEYS_PER_SUBQUERY) {
            let jql = format!(
                "key in ({})",
                chunk
                    .iter()
                    .map(|k| format!("\"{k}\""))
                    .collect::<Vec<_>>()
                    .join(",")
            );
            let page = self.search_collect(&jql, None).await?;
            issues.extend(page);
        }

        Ok(dedup_by_max_updated(issues))
    }

    fn pages(
        &self,
        jql: String,
        fields: Option<Vec<String>>,
    ) -> impl Stream<Item = Result<Vec<Issue>, SourceError>> {
        let page_size = self.page_size;
        let client = self.clone();

        let jql_for_first = jql.clone();
        let fields_for_first = fields.clone();
        let next_page = tokio::spawn(async move {
            get_page(client, jql_for_first, fields_for_first, 0, page_size).await
        });

        stream::unfold(Some(next_page), move |next_page| {
            let jql = jql.clone();
            let fields = fields.clone();
            async move {
                let Some(next_page) = next_page else {
                    debug!("source page stream finished");
                    return None;
                };

                let page = match next_page.await {
                    Ok(Ok(page)) => page,
                    Ok(Err(err)) => return Some((Err(err), None)),
                    Err(join_err) => {
                        return Some((Err(SourceError::JoinFailure(join_err)), None))
                    }
                };

                let fetched_so_far = page.start_at + page.issues.len();
                if fetched_so_far < page.total && !page.issues.is_empty() {
                    let client = page.client.clone();
                    let next_fut = tokio::spawn(async move {
                        get_page(client, jql, fields, fetched_so_far, page_size).await
                    });
                    Some((Ok(page.issues), Some(next_fut)))
                } else {
                    Some((Ok(page.issues), None))
                }
            }
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SourceError> {
        let request = request.build().map_err(SourceError::RequestBuildError)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(SourceError::RequestExecuteError)?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.as_u16() == 429 {
            Err(SourceError::Throttled(
                response.error_for_status().unwrap_err(),
            ))
        } else if status.is_server_error() {
            Err(SourceError::ServerError(
                response.error_for_status().unwrap_err(),
            ))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::ClientError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

struct FetchedPage {
    client: SourceClient,
    start_at: usize,
    total: usize,
    issues: Vec<Issue>,
}

async fn get_page(
    client: SourceClient,
    jql: String,
    fields: Option<Vec<String>>,
    start_at: usize,
    page_size: usize,
) -> Result<FetchedPage, SourceError> {
    let url = format!("{}/rest/api/2/search", client.base_url);
    let mut request = client
        .client
        .get(&url)
        .basic_auth(client.username.as_ref(), Some(client.password.as_ref()))
        .query(&[
            ("jql", jql.as_str()),
            ("startAt", &start_at.to_string()),
            ("maxResults", &page_size.to_string()),
        ]);

    if let Some(fields) = &fields {
        request = request.query(&[("fields", fields.join(","))]);
    }

    let response = client.send(request).await?;
    let body = response
        .text()
        .await
        .map_err(SourceError::ResponseBodyError)?;
    let page: SearchPage = serde_json::from_str(&body).map_err(SourceError::DeserializeError)?;

    Ok(FetchedPage {
        client,
        start_at: page.start_at,
        total: page.total,
        issues: page.issues,
    })
}
