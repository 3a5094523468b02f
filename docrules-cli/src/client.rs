use docrules_protocol::document::Document;
use docrules_rules::{RuleType, RunOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Typed HTTP client for a running rule service.
#[derive(Clone)]
pub struct RulesServiceClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RulesServiceClient {
    /// Creates a new client bound to the provided base URL.
    pub fn new(base_url: &str) -> Result<Self, CliError> {
        let mut url = Url::parse(base_url).map_err(|err| CliError::InvalidUrl {
            url: base_url.to_string(),
            source: err,
        })?;

        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_string();
            path.push('/');
            url.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, CliError> {
        self.base_url.join(path).map_err(|err| CliError::InvalidUrl {
            url: format!("{}{}", self.base_url, path),
            source: err,
        })
    }

    /// Sends the document for evaluation against the tenant's rule set.
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        document: &Document,
        tipos: &[RuleType],
    ) -> Result<RunOutcome, CliError> {
        let url = self.endpoint(&format!(
            "tenants/{}/evaluate",
            encode_path_segment(tenant_id)
        ))?;
        let request = EvaluationRequest {
            document,
            tipos,
        };

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|err| CliError::Http(err.to_string()))?;
        parse_response(response).await
    }

    /// Enables or disables a global rule for the tenant.
    pub async fn set_link(
        &self,
        tenant_id: &str,
        codigo: &str,
        activa: bool,
    ) -> Result<LinkResponse, CliError> {
        let url = self.endpoint(&format!(
            "tenants/{}/global-rules/{}/link",
            encode_path_segment(tenant_id),
            encode_path_segment(codigo)
        ))?;

        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "activa": activa }))
            .send()
            .await
            .map_err(|err| CliError::Http(err.to_string()))?;
        parse_response(response).await
    }
}

fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

async fn parse_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, CliError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| CliError::Decode(err.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ServiceError>(&body)
        .map(|err| format!("{}: {}", err.code, err.message))
        .unwrap_or(body);
    Err(CliError::Service { status, message })
}

#[derive(Debug, Serialize)]
struct EvaluationRequest<'a> {
    document: &'a Document,
    tipos: &'a [RuleType],
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    code: String,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResponse {
    pub tenant_id: String,
    pub codigo: String,
    pub state: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid rules service url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("rules HTTP request failed: {0}")]
    Http(String),
    #[error("rules service returned {status}: {message}")]
    Service {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("failed to decode rules response: {0}")]
    Decode(String),
    #[error("rule service failed: {0}")]
    Server(String),
    #[error("failed to read {path}: {message}")]
    Input { path: String, message: String },
    #[error(transparent)]
    Rules(#[from] docrules_rules::RuleError),
    #[error(transparent)]
    Run(#[from] docrules_rules::RunError),
    #[error(transparent)]
    Core(#[from] docrules_core::DocRulesError),
}
