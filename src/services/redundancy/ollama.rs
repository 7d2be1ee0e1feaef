use super::recommend::{AiReasoner, PairContext};
use super::types::SoftwareFeatures;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const PROMPT_FEATURE_LIMIT: usize = 10;

/// AI reasoner backed by an Ollama-compatible `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaReasoner {
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaReasoner {
    pub fn new(base_url: String, model: String, timeout: Duration, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
            http,
        }
    }
}

#[async_trait]
impl AiReasoner for OllamaReasoner {
    fn model_label(&self) -> String {
        self.model.clone()
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.http.get(url).timeout(AVAILABILITY_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, base_url = %self.base_url, "ollama availability check failed");
                false
            }
        }
    }

    async fn judge(&self, context: &PairContext<'_>) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": self.model,
            "prompt": build_prompt(context),
            "stream": false,
            "options": {
                "temperature": 0.3,
                "num_predict": 1024,
                "top_p": 0.9,
            },
        });

        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("ollama generate request failed for {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ollama generate returned {}: {}", status, body);
        }
        let parsed: GenerateResponse = resp
            .json()
            .await
            .context("ollama generate response was not JSON")?;
        Ok(parsed.response)
    }
}

fn describe(label: &str, software: &SoftwareFeatures) -> String {
    let names: Vec<&str> = software
        .features
        .iter()
        .take(PROMPT_FEATURE_LIMIT)
        .map(|feature| feature.name.as_str())
        .collect();
    let ellipsis = if software.features.len() > PROMPT_FEATURE_LIMIT {
        "..."
    } else {
        ""
    };
    format!(
        "{label}: {} by {}\n- Annual Cost: ${:.0}\n- Features ({}): {}{}",
        software.record.name,
        software.record.vendor,
        software.record.annual_cost,
        software.features.len(),
        names.join(", "),
        ellipsis
    )
}

pub fn build_prompt(context: &PairContext<'_>) -> String {
    format!(
        r#"You are a SaaS consolidation expert. Analyze these two overlapping software products and recommend which one to keep.

{}

{}

Overlap: {:.1}%
Shared Features: {}

Provide a recommendation in this JSON format:
{{
  "keep_software": 1 or 2,
  "reasoning": "Brief explanation (2-3 sentences)",
  "features_covered": ["feature1", "feature2"],
  "features_at_risk": ["feature1", "feature2"],
  "migration_effort": "low" | "medium" | "high",
  "business_risk": "low" | "medium" | "high",
  "confidence_score": 0.0 to 1.0
}}

Return ONLY valid JSON:"#,
        describe("Software 1", context.first),
        describe("Software 2", context.second),
        context.overlap_percentage,
        context.shared_features.join(", ")
    )
}
