use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::session::Session;

pub mod model;

pub use model::{
    parse_page, parse_push_outcome, Change, Page, PageRequest, PushOutcome, PushRequest,
    RejectedChange,
};

const VOTERS_PATH: &str = "api/voters";
const BULK_PATH: &str = "api/voters/bulk";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid gateway configuration: {0}")]
    InvalidConfiguration(String),
    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed remote payload: {0}")]
    Payload(String),
}

/// Remote side of synchronization: paged export plus bulk upsert.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, GatewayError>;

    async fn push_changes(&self, request: &PushRequest) -> Result<PushOutcome, GatewayError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    base_url: Url,
    session: Session,
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

fn parse_base_url(base_url: &str) -> Result<Url, GatewayError> {
    let trimmed = base_url.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|err| GatewayError::InvalidConfiguration(format!("{trimmed}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::InvalidConfiguration(format!(
            "base url must be http(s): {trimmed}"
        )));
    }
    // Url::join drops the last path segment unless it ends with a slash.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn truncate_body(body: String) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        return body;
    }
    let mut cut: String = body.chars().take(MAX_ERROR_BODY).collect();
    cut.push('…');
    cut
}

impl HttpGateway {
    pub fn new(base_url: &str, session: Session) -> Result<Self, GatewayError> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .user_agent(concat!("roster-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path)
            .map_err(|err| GatewayError::InvalidConfiguration(err.to_string()))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub fn build_fetch_request(&self, request: &PageRequest) -> Result<reqwest::Request, GatewayError> {
        let mut query: Vec<(&str, String)> = vec![
            ("databaseId", request.database_id.clone()),
            ("page", request.page.to_string()),
            ("limit", request.page_size.to_string()),
        ];
        if let Some(q) = request.query.as_deref().filter(|q| !q.trim().is_empty()) {
            query.push(("q", q.trim().to_string()));
        }
        if let Some(since) = request.since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
        }
        let builder = self
            .http
            .get(self.endpoint(VOTERS_PATH)?)
            .header("Accept", "application/json")
            .query(&query);
        Ok(self.authorize(builder).build()?)
    }

    pub fn build_push_request(&self, request: &PushRequest) -> Result<reqwest::Request, GatewayError> {
        let builder = self
            .http
            .post(self.endpoint(BULK_PATH)?)
            .header("Accept", "application/json")
            .json(request);
        Ok(self.authorize(builder).build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String, GatewayError> {
        debug!(method = %request.method(), url = %request.url(), "remote request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("rate limited by remote");
        }
        if !status.is_success() {
            let body = truncate_body(res.text().await.unwrap_or_default());
            warn!(status = status.as_u16(), %body, "remote error response");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res.text().await?)
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    #[instrument(skip_all, fields(page = request.page))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, GatewayError> {
        let http_request = self.build_fetch_request(request)?;
        let body = self.execute(http_request).await?;
        let page = parse_page(&body, request.page_size)?;
        debug!(items = page.items.len(), has_more = page.has_more, "page received");
        Ok(page)
    }

    #[instrument(skip_all, fields(changes = request.changes.len()))]
    async fn push_changes(&self, request: &PushRequest) -> Result<PushOutcome, GatewayError> {
        let http_request = self.build_push_request(request)?;
        let body = self.execute(http_request).await?;
        parse_push_outcome(&body)
    }
}
