use crate::agent::types::ValueCategory;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_NLU_URL: &str = "http://localhost:8400";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Natural-language understanding port. Turns a free-form utterance into
/// scored candidate token sequences plus the entity table they reference.
#[async_trait]
pub trait NluClient: Send + Sync {
    async fn parse(&self, utterance: &str, expecting: Option<ValueCategory>) -> Result<NluResult>;
}

#[derive(Debug, Clone, Default)]
pub struct NluResult {
    pub candidates: Vec<NluCandidate>,
    pub entities: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NluCandidate {
    pub code: Vec<String>,
    pub score: f64,
}

impl NluCandidate {
    /// The server marks candidates it is sure about with score >= 1; below
    /// that the analysis is nonconfident.
    pub fn is_confident(&self) -> bool {
        self.score >= 1.0
    }
}

/// HTTP client against the semantic-parser service.
#[derive(Clone)]
pub struct HttpNluClient {
    client: Client,
    base_url: String,
    locale: String,
}

#[derive(Serialize)]
struct ParseRequest<'a> {
    q: &'a str,
    locale: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expect: Option<&'a str>,
}

#[derive(Deserialize)]
struct ParseResponse {
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    entities: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct WireCandidate {
    code: Vec<String>,
    score: f64,
}

impl HttpNluClient {
    pub fn new(base_url: impl Into<String>, locale: impl Into<String>) -> Self {
        let timeout_ms = std::env::var("CONVERSE_NLU_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Self {
            client: Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            locale: locale.into(),
        }
    }

    pub fn from_env() -> Self {
        let url = std::env::var("CONVERSE_NLU_URL").unwrap_or_else(|_| DEFAULT_NLU_URL.to_string());
        let locale = std::env::var("CONVERSE_LOCALE").unwrap_or_else(|_| "en-US".to_string());
        Self::new(url, locale)
    }
}

#[async_trait]
impl NluClient for HttpNluClient {
    async fn parse(&self, utterance: &str, expecting: Option<ValueCategory>) -> Result<NluResult> {
        let expect = expecting.map(|c| match c {
            ValueCategory::YesNo => "YesNo",
            ValueCategory::Number => "Number",
            ValueCategory::Location => "Location",
            ValueCategory::Time => "Time",
            ValueCategory::Date => "Date",
            ValueCategory::PhoneNumber => "PhoneNumber",
            ValueCategory::EmailAddress => "EmailAddress",
            ValueCategory::Contact => "Contact",
            _ => "Generic",
        });
        let request = ParseRequest { q: utterance, locale: &self.locale, expect };

        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("NLU server error: {}", response.status()));
        }

        let parsed: ParseResponse = response.json().await?;
        Ok(NluResult {
            candidates: parsed
                .candidates
                .into_iter()
                .map(|c| NluCandidate { code: c.code, score: c.score })
                .collect(),
            entities: parsed.entities,
        })
    }
}
