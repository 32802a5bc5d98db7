//! Request/response layer over the supervised translation-server.

use std::time::Duration;

use tokio::sync::Mutex;

use crate::response::{TranslationResult, normalize_payload};
use crate::supervisor::{ReadinessState, Supervisor};
use crate::{Result, TranslatorConfig, TranslatorError};

/// What to translate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationRequest {
    /// A web page; the helper runs its site translators on it.
    ByUrl(String),
    /// A DOI, ISBN, PMID or arXiv ID.
    ByIdentifier(String),
}

impl TranslationRequest {
    /// Endpoint on the helper serving this kind of request.
    pub fn endpoint(&self) -> &'static str {
        match self {
            TranslationRequest::ByUrl(_) => "/web",
            TranslationRequest::ByIdentifier(_) => "/search",
        }
    }

    pub fn body(&self) -> &str {
        match self {
            TranslationRequest::ByUrl(url) => url,
            TranslationRequest::ByIdentifier(id) => id,
        }
    }
}

/// Translates URLs and identifiers through a helper it keeps alive.
///
/// The helper is started on first use and left running between calls; it
/// is stopped by [`shutdown`](Self::shutdown) or when the client is dropped.
pub struct TranslationClient {
    supervisor: Mutex<Supervisor>,
    http: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
}

impl TranslationClient {
    pub fn new(config: TranslatorConfig) -> Self {
        Self::with_supervisor(Supervisor::new(config))
    }

    pub fn with_supervisor(supervisor: Supervisor) -> Self {
        let base_url = supervisor.config().base_url();
        let default_timeout = supervisor.config().request_timeout;
        Self {
            supervisor: Mutex::new(supervisor),
            http: reqwest::Client::new(),
            base_url,
            default_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Metadata for a web page, in Zotero API JSON shape.
    pub async fn translate_by_url(&self, url: &str, timeout: Duration) -> Result<TranslationResult> {
        self.translate(&TranslationRequest::ByUrl(url.to_string()), timeout)
            .await
    }

    /// Metadata for a DOI, ISBN, PMID or arXiv ID. DOIs resolve through
    /// CrossRef, which usually carries no abstract.
    pub async fn translate_by_identifier(
        &self,
        identifier: &str,
        timeout: Duration,
    ) -> Result<TranslationResult> {
        self.translate(
            &TranslationRequest::ByIdentifier(identifier.to_string()),
            timeout,
        )
        .await
    }

    /// Translate with the configured request timeout.
    pub async fn translate_default(&self, request: &TranslationRequest) -> Result<TranslationResult> {
        self.translate(request, self.default_timeout).await
    }

    pub async fn translate(
        &self,
        request: &TranslationRequest,
        timeout: Duration,
    ) -> Result<TranslationResult> {
        self.supervisor.lock().await.ensure_ready().await?;

        let url = format!("{}{}", self.base_url, request.endpoint());
        tracing::debug!(url, body = request.body(), "sending translation request");
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(request.body().to_string())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TranslatorError::TranslationRequestFailed(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TranslatorError::TranslationRequestFailed(e.to_string()))?;
        tracing::debug!(url, status = %status, bytes = body.len(), "translation response");

        // Error statuses still carry a message body worth normalizing.
        normalize_payload(&body)
    }

    pub async fn readiness(&self) -> ReadinessState {
        self.supervisor.lock().await.readiness().await
    }

    /// Stop the helper if this client started it.
    pub async fn shutdown(&self) {
        self.supervisor.lock().await.stop().await;
    }
}
