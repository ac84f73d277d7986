//! HTTP client for the Lark Base sink. Shaped after the source client's
//! retry/error-classification split: every request-level failure is
//! categorized once here so callers above never branch on HTTP status
//! codes, and the tenant access token is refreshed lazily and cached for
//! its advertised lifetime rather than fetched per call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jira_client::retry::{retry_with_backoff, Transience};
use log::debug;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const TOKEN_URL: &str = "https://open.larksuite.com/open-apis/auth/v3/tenant_access_token/internal";
const MAX_RETRIES: u32 = 3;
/// Lark's hard per-request cap on `batch_create` (there is no batch update).
/// The BatchProcessor is responsible for staying under this; this client
/// sends exactly what it's given and lets the API reject an oversized
/// request.
pub const MAX_RECORDS_PER_REQUEST: usize = 500;

#[derive(Debug, Error, Diagnostic)]
pub enum SinkError {
    #[error("error building sink request")]
    RequestBuildError(#[source] reqwest::Error),

    #[error("error executing sink request")]
    RequestExecuteError(#[source] reqwest::Error),

    #[error("sink reported a server error")]
    ServerError(#[source] reqwest::Error),

    #[error("sink reported throttling (429)")]
    Throttled(#[source] reqwest::Error),

    #[error("sink rejected the request: {status} {body}")]
    ClientError { status: u16, body: String },

    #[error("sink reported the target row no longer exists")]
    RecordNotFound,

    #[error("error reading sink response body")]
    ResponseBodyError(#[source] reqwest::Error),

    #[error("error deserializing sink response")]
    DeserializeError(#[source] serde_json::Error),

    #[error("sink reported application error {code}: {msg}")]
    ApiError { code: i64, msg: String },

    #[error("sink rejected application credentials")]
    AuthError { code: i64, msg: String },

    #[error("background fetch task exited abnormally")]
    JoinFailure(#[source] tokio::task::JoinError),
}

impl SinkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::AuthError { .. } | SinkError::ClientError { .. })
    }
}

impl Transience for SinkError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            SinkError::RequestExecuteError(_)
                | SinkError::ServerError(_)
                | SinkError::Throttled(_)
                | SinkError::ResponseBodyError(_)
                | SinkError::JoinFailure(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkUser {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

/// A created or updated row: the sink-assigned row id and the column
/// values that were written.
#[derive(Debug, Clone)]
pub struct SinkRow {
    pub row_id: String,
    pub fields: Map<String, Value>,
}

/// One column definition as reported by the table itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkColumn {
    pub name: String,
    /// Bitable's `ui_type` string, e.g. `"Url"`, `"Text"`, `"SingleSelect"`.
    pub field_type: String,
}

impl SinkColumn {
    /// Whether this column can hold a hyperlink value. Every binding's
    /// identity column must resolve to one of these, since it's how a sink
    /// row links back to its source issue.
    pub fn is_hyperlink(&self) -> bool {
        self.field_type == "Url"
    }
}

#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Every column currently defined on the table, used to validate a
    /// configured identity-column candidate before the first cycle runs
    /// against it.
    async fn list_columns(&self, workspace_token: &str, table_id: &str) -> Result<Vec<SinkColumn>, SinkError>;

    /// Every `(row_id, identity value)` pair currently in the table, used to
    /// seed the ProcessingLog on cold start and to support full-refresh
    /// reconciliation. `identity_column` names the sink column carrying the
    /// issue key.
    async fn scan_rows(
        &self,
        workspace_token: &str,
        table_id: &str,
        identity_column: &str,
    ) -> Result<Vec<(String, String)>, SinkError>;

    async fn create_records(
        &self,
        workspace_token: &str,
        table_id: &str,
        records: Vec<Map<String, Value>>,
    ) -> Result<Vec<String>, SinkError>;

    /// The sink has no native batch update, unlike `create_records`: one
    /// row per call, so a rejection of one row never blocks any other.
    async fn update_record(
        &self,
        workspace_token: &str,
        table_id: &str,
        row_id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), SinkError>;

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<SinkUser>, SinkError>;
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct LarkClient {
    client: reqwest::Client,
    app_id: Arc<str>,
    app_secret: Arc<str>,
    base_url: Arc<str>,
    token: Mutex<Option<CachedToken>>,
}

impl LarkClient {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            app_id: Arc::from(app_id.into()),
            app_secret: Arc::from(app_secret.into()),
            base_url: Arc::from("https://open.larksuite.com"),
            token: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Arc::from(base_url.into());
        self
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Utc::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let fetched = retry_with_backoff(MAX_RETRIES, || self.fetch_token()).await?;
        let mut guard = self.token.lock().await;
        *guard = Some(CachedToken {
            token: fetched.tenant_access_token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(fetched.expire - 60),
        });
        Ok(fetched.tenant_access_token)
    }

    async fn fetch_token(&self) -> Result<TokenResponse, SinkError> {
        #[derive(Serialize)]
        struct TokenRequest<'a> {
            app_id: &'a str,
            app_secret: &'a str,
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .json(&TokenRequest {
                app_id: &self.app_id,
                app_secret: &self.app_secret,
            })
            .send()
            .await
            .map_err(SinkError::RequestExecuteError)?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(SinkError::ResponseBodyError)?;

        if body.code != 0 {
            return Err(SinkError::AuthError {
                code: body.code,
                msg: body.msg.clone(),
            });
        }

        Ok(body)
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        build: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
        method: reqwest::Method,
        url: &str,
    ) -> Result<T, SinkError> {
        retry_with_backoff(MAX_RETRIES, || async {
            let token = self.access_token().await?;
            let request = build(self.client.request(method.clone(), url)).bearer_auth(&token);
            let envelope: ApiEnvelope<T> = self.send(request).await?;
            envelope.data.ok_or_else(|| SinkError::ApiError {
                code: envelope.code,
                msg: "response carried no data".to_string(),
            })
        })
        .await
    }

    /// Like [`Self::request`], but succeeds even when the response carries
    /// no `data` field, for endpoints (like `batch_update`) that only
    /// report success via `code`.
    async fn request_ignore_data(
        &self,
        build: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
        method: reqwest::Method,
        url: &str,
    ) -> Result<(), SinkError> {
        retry_with_backoff(MAX_RETRIES, || async {
            let token = self.access_token().await?;
            let request = build(self.client.request(method.clone(), url)).bearer_auth(&token);
            let _: ApiEnvelope<serde_json::Value> = self.send(request).await?;
            Ok(())
        })
        .await
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiEnvelope<T>, SinkError> {
        let request = request.build().map_err(SinkError::RequestBuildError)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(SinkError::RequestExecuteError)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SinkError::Throttled(response.error_for_status().unwrap_err()));
        }
        if status.is_server_error() {
            return Err(SinkError::ServerError(response.error_for_status().unwrap_err()));
        }
        if status.as_u16() == 404 {
            return Err(SinkError::RecordNotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::ClientError {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiEnvelope<T> = response.json().await.map_err(SinkError::ResponseBodyError)?;
        if envelope.code != 0 {
            return Err(SinkError::ApiError {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(envelope)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    msg: String,
    tenant_access_token: String,
    expire: i64,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListFieldsData {
    items: Vec<FieldItem>,
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FieldItem {
    field_name: String,
    ui_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecordsData {
    items: Vec<RecordItem>,
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordItem {
    record_id: String,
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BatchCreateData {
    records: Vec<RecordItem>,
}

#[derive(Debug, Serialize)]
struct RecordPayload {
    fields: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct UpdateRecordPayload {
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BatchGetIdData {
    user_list: Vec<UserIdItem>,
}

#[derive(Debug, Deserialize)]
struct UserIdItem {
    email: Option<String>,
    user_id: Option<String>,
}

#[async_trait]
impl SinkClient for LarkClient {
    async fn list_columns(&self, workspace_token: &str, table_id: &str) -> Result<Vec<SinkColumn>, SinkError> {
        let mut columns = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let url = format!(
                "{}/open-apis/bitable/v1/apps/{workspace_token}/tables/{table_id}/fields",
                self.base_url
            );
            let page_token_clone = page_token.clone();
            let page: ListFieldsData = self
                .request(
                    move |req| {
                        let req = req.query(&[("page_size", "100")]);
                        match &page_token_clone {
                            Some(t) => req.query(&[("page_token", t.as_str())]),
                            None => req,
                        }
                    },
                    reqwest::Method::GET,
                    &url,
                )
                .await?;

            columns.extend(page.items.into_iter().map(|item| SinkColumn {
                name: item.field_name,
                field_type: item.ui_type.unwrap_or_default(),
            }));

            if page.has_more {
                page_token = page.page_token;
            } else {
                break;
            }
        }

        Ok(columns)
    }

    async fn scan_rows(
        &self,
        workspace_token: &str,
        table_id: &str,
        identity_column: &str,
    ) -> Result<Vec<(String, String)>, SinkError> {
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let url = format!(
                "{}/open-apis/bitable/v1/apps/{workspace_token}/tables/{table_id}/records",
                self.base_url
            );
            let page_token_clone = page_token.clone();
            let page: ListRecordsData = self
                .request(
                    move |req| {
                        let req = req.query(&[("page_size", "500")]);
                        match &page_token_clone {
                            Some(t) => req.query(&[("page_token", t.as_str())]),
                            None => req,
                        }
                    },
                    reqwest::Method::GET,
                    &url,
                )
                .await?;

            for item in page.items {
                if let Some(value) = item.fields.get(identity_column).and_then(|v| v.as_str()) {
                    rows.push((item.record_id, value.to_string()));
                }
            }

            if page.has_more {
                page_token = page.page_token;
                debug!("scanning next page of {table_id}");
            } else {
                break;
            }
        }

        Ok(rows)
    }

    async fn create_records(
        &self,
        workspace_token: &str,
        table_id: &str,
        records: Vec<Map<String, Value>>,
    ) -> Result<Vec<String>, SinkError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/open-apis/bitable/v1/apps/{workspace_token}/tables/{table_id}/records/batch_create",
            self.base_url
        );

        #[derive(Serialize)]
        struct Body {
            records: Vec<RecordPayload>,
        }
        let body = Body {
            records: records.into_iter().map(|fields| RecordPayload { fields }).collect(),
        };

        let result: BatchCreateData = self
            .request(
                move |req| req.json(&body),
                reqwest::Method::POST,
                &url,
            )
            .await?;

        Ok(result.records.into_iter().map(|r| r.record_id).collect())
    }

    async fn update_record(
        &self,
        workspace_token: &str,
        table_id: &str,
        row_id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), SinkError> {
        let url = format!(
            "{}/open-apis/bitable/v1/apps/{workspace_token}/tables/{table_id}/records/{row_id}",
            self.base_url
        );

        let body = UpdateRecordPayload { fields };

        self.request_ignore_data(move |req| req.json(&body), reqwest::Method::PUT, &url)
            .await
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<SinkUser>, SinkError> {
        let url = format!("{}/open-apis/contact/v3/users/batch_get_id", self.base_url);
        let email = email.to_string();

        #[derive(Serialize)]
        struct Body {
            emails: Vec<String>,
        }
        let body = Body {
            emails: vec![email.clone()],
        };

        let result: BatchGetIdData = self
            .request(move |req| req.json(&body), reqwest::Method::POST, &url)
            .await?;

        Ok(result
            .user_list
            .into_iter()
            .find(|u| u.email.as_deref() == Some(email.as_str()))
            .and_then(|u| {
                Some(SinkUser {
                    user_id: u.user_id?,
                    email: u.email.unwrap_or_default(),
                    display_name: String::new(),
                })
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_client_errors_are_fatal() {
        assert!(SinkError::AuthError { code: 99991663, msg: "bad secret".into() }.is_fatal());
        assert!(SinkError::ClientError { status: 400, body: String::new() }.is_fatal());
    }

    #[test]
    fn server_errors_are_transient_not_fatal() {
        let err = SinkError::ApiError { code: 1, msg: "transient".into() };
        assert!(!err.is_fatal());
    }
}
