//! Summarizer seam.
//!
//! Digest aggregation hands a message to an opaque summarizer and gets a
//! structured result back — or `None` when the content is not worth
//! surfacing. The model call itself is someone else's problem;
//! `HttpSummarizer` posts to a configured endpoint that owns it.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::SummarizerConfig;
use crate::error::SummarizerError;
use crate::queue::DigestMessage;

/// A structured summary of one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSummary {
    pub headline: String,
    #[serde(default)]
    pub details: Vec<String>,
}

/// Summarizes message content for digests.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `Ok(None)` means the content is not worth a digest entry.
    async fn summarize(
        &self,
        message: &DigestMessage,
    ) -> Result<Option<DigestSummary>, SummarizerError>;
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    from: &'a str,
    subject: Option<&'a str>,
    content: &'a str,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    /// False when the endpoint judged the content noise.
    #[serde(default = "default_true")]
    worth_surfacing: bool,
    #[serde(default)]
    headline: Option<String>,
    #[serde(default)]
    details: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Reference summarizer calling an HTTP endpoint.
pub struct HttpSummarizer {
    config: SummarizerConfig,
    client: reqwest::Client,
}

impl HttpSummarizer {
    pub fn new(config: SummarizerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(
        &self,
        message: &DigestMessage,
    ) -> Result<Option<DigestSummary>, SummarizerError> {
        let body = SummarizeRequest {
            from: &message.from,
            subject: message.subject.as_deref(),
            content: &message.content,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SummarizerError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SummarizerError::RequestFailed(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let parsed: SummarizeResponse = response
            .json()
            .await
            .map_err(|e| SummarizerError::InvalidResponse(e.to_string()))?;

        if !parsed.worth_surfacing {
            return Ok(None);
        }
        let headline = parsed
            .headline
            .ok_or_else(|| SummarizerError::InvalidResponse("missing headline".into()))?;
        Ok(Some(DigestSummary {
            headline,
            details: parsed.details,
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_serializes() {
        let summary = DigestSummary {
            headline: "Invoice #42 due Friday".into(),
            details: vec!["From Acme Corp".into()],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["headline"], "Invoice #42 due Friday");
        assert_eq!(json["details"][0], "From Acme Corp");
    }

    #[test]
    fn response_defaults_to_worth_surfacing() {
        let parsed: SummarizeResponse =
            serde_json::from_str(r#"{"headline": "hi"}"#).unwrap();
        assert!(parsed.worth_surfacing);
        assert_eq!(parsed.headline.as_deref(), Some("hi"));
    }

    #[test]
    fn response_can_decline() {
        let parsed: SummarizeResponse =
            serde_json::from_str(r#"{"worth_surfacing": false}"#).unwrap();
        assert!(!parsed.worth_surfacing);
    }
}
