use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::types::{FileMetadata, Id, PushEvent, QueryItem, QueryParameters};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Error)]
pub enum DriveApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("listing page has no items field")]
    MissingItems,
    #[error("malformed push event: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DriveApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DriveApiError::Api { status, .. } => Some(*status),
            DriveApiError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Fetches one page of the item listing. `page_token` comes from the
    /// previous page; `None` starts from the beginning.
    pub async fn list_page(
        &self,
        query: &QueryParameters,
        page_token: Option<&str>,
    ) -> Result<ListingPage, DriveApiError> {
        let mut url = self.endpoint("/v1/items")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("page_size", &query.page_size.to_string());
            if let Some(token) = page_token.filter(|t| !t.is_empty()) {
                pairs.append_pair("page_token", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let page: ListingPage = Self::handle_response(response).await?;
        if page.items.is_none() {
            return Err(DriveApiError::MissingItems);
        }
        Ok(page)
    }

    pub async fn set_pinned_by_id(&self, id: Id, pinned: bool) -> Result<(), DriveApiError> {
        let mut url = self.endpoint(&format!("/v1/items/{}/pin", id.get()))?;
        url.query_pairs_mut()
            .append_pair("pinned", if pinned { "true" } else { "false" });
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    pub async fn get_metadata_by_id(&self, id: Id) -> Result<FileMetadata, DriveApiError> {
        let url = self.endpoint(&format!("/v1/items/{}", id.get()))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Opens the push subscription. The service answers with one JSON
    /// encoded [`PushEvent`] per line and keeps the response open.
    pub async fn subscribe_events(&self) -> Result<EventStream, DriveApiError> {
        let url = self.endpoint("/v1/events")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", "application/x-ndjson")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveApiError::Api { status, body });
        }
        Ok(EventStream {
            response,
            buffer: Vec::new(),
        })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveApiError::Api { status, body })
        }
    }

    async fn handle_empty_response(response: reqwest::Response) -> Result<(), DriveApiError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveApiError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListingPage {
    #[serde(default)]
    pub items: Option<Vec<QueryItem>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Newline-delimited stream of push events.
pub struct EventStream {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

impl EventStream {
    /// Returns the next event, or `None` once the service closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<PushEvent>, DriveApiError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }

            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    let rest = rest.trim_ascii();
                    if rest.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(serde_json::from_slice(rest)?));
                }
            }
        }
    }
}
