// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::credentials::IndexCredentials;
use crate::errors::IndexError;
use crate::http::build_client;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRequest {
    pub index: String,
    pub doc_type: String,
    /// Caller supplied id. The index assigns one when absent.
    pub id: Option<String>,
    pub document: serde_json::Value,
}

/// Client side of the search index.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Indexes (or replaces) a document and returns its id.
    async fn index(&self, request: IndexRequest) -> Result<String, IndexError>;

    /// Releases the client. Later calls to `index` fail.
    async fn close(&self);
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_id")]
    id: Option<String>,
}

/// Elasticsearch document API over HTTPS with basic auth.
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    closed: AtomicBool,
}

impl std::fmt::Debug for ElasticsearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchIndex")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"*********")
            .finish_non_exhaustive()
    }
}

impl ElasticsearchIndex {
    /// `base_url` overrides the `https://HOST:PORT` location from the credentials.
    pub fn new(
        credentials: &IndexCredentials,
        base_url: Option<&str>,
        https_proxy: Option<&str>,
    ) -> Result<Self, IndexError> {
        let client = build_client(https_proxy, Some(REQUEST_TIMEOUT))
            .map_err(|e| IndexError::Client(e.to_string()))?;
        let base_url = base_url.map_or_else(
            || format!("https://{}:{}", credentials.host, credentials.port),
            |url| url.trim_end_matches('/').to_string(),
        );
        info!("Index client targeting {base_url}");

        Ok(Self {
            client,
            base_url,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn document_url(&self, request: &IndexRequest) -> String {
        match &request.id {
            Some(id) => format!(
                "{}/{}/{}/{}",
                self.base_url, request.index, request.doc_type, id
            ),
            None => format!("{}/{}/{}", self.base_url, request.index, request.doc_type),
        }
    }
}

#[async_trait]
impl DocumentIndex for ElasticsearchIndex {
    async fn index(&self, request: IndexRequest) -> Result<String, IndexError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }

        let url = self.document_url(&request);
        let builder = match request.id {
            Some(_) => self.client.put(&url),
            None => self.client.post(&url),
        };

        let response = builder
            .basic_auth(&self.username, Some(&self.password))
            .json(&request.document)
            .send()
            .await
            .map_err(|e| IndexError::Transport {
                url: url.clone(),
                cause: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| IndexError::Transport {
            url: url.clone(),
            cause: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(IndexError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        match serde_json::from_str::<IndexResponse>(&body) {
            Ok(IndexResponse { id: Some(id) }) => {
                debug!("Indexed document {id} at {url}");
                Ok(id)
            }
            _ => Err(IndexError::MissingId(body)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Index client closed");
        }
    }
}
