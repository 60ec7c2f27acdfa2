use anyhow::{anyhow, Context};
use async_trait::async_trait;
use indoc::{formatdoc, indoc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    backfill::is_empty_analysis,
    rate_limiters::RateLimiters,
    server_config::{cfg, ModelConfig},
    HttpClient,
};

use super::{AnalysisService, AnalyzeError};

const RATE_LIMIT_MESSAGE: &str = "rate limit exceeded";

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: PromptUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

const SYSTEM_PROMPT: &str = indoc! {r#"
    You are a lexicographer writing entries for a learner's dictionary.
    Analyze the given term in the given language.
    Respond only with a JSON object with the keys:
    "part_of_speech", "definition", "translation" (English), "romanization" (or null),
    and "examples" (a list of at most three objects with "sentence" and "translation").
    Do not provide explanations."#
};

pub fn analysis_user_prompt(term: &str, language: &str) -> String {
    formatdoc!(
        r#"Analyze the following term.

            <language>{}</language>
            <term>{}</term>"#,
        language,
        term
    )
}

/// Analysis service backed by the Mistral chat completions API.
#[derive(Clone)]
pub struct MistralAnalyzer {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    endpoint: String,
    api_key: String,
    model: ModelConfig,
}

impl MistralAnalyzer {
    pub fn new(
        http_client: HttpClient,
        rate_limiters: RateLimiters,
        endpoint: String,
        api_key: String,
        model: ModelConfig,
    ) -> Self {
        Self {
            http_client,
            rate_limiters,
            endpoint,
            api_key,
            model,
        }
    }

    pub fn from_config(http_client: HttpClient, rate_limiters: RateLimiters) -> Self {
        Self::new(
            http_client,
            rate_limiters,
            cfg.api.endpoint.clone(),
            cfg.api.key.clone(),
            cfg.model.clone(),
        )
    }
}

#[async_trait]
impl AnalysisService for MistralAnalyzer {
    async fn analyze(&self, term: &str, language: &str) -> Result<Value, AnalyzeError> {
        self.rate_limiters.acquire_one().await;

        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!(
              {
                "model": &self.model.id,
                "temperature": self.model.temperature,
                "messages": [
                  {
                    "role": "system",
                    "content": SYSTEM_PROMPT
                  },
                  {
                    "role": "user",
                    "content": analysis_user_prompt(term, language)
                  }
                ],
                "response_format": {
                    "type": "json_object",
                }
              }
            ))
            .send()
            .await
            .map_err(|e| anyhow!(e).context(format!("Analysis request for '{}' failed", term)))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AnalyzeError::RateLimited(format!(
                "{} for '{}'",
                status, term
            )));
        }

        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| anyhow!(e).context(format!("Unreadable response body ({})", status)))?;

        classify_response(status, body)
    }
}

/// Turns a chat completions response into an analysis payload or a classified error.
pub fn classify_response(status: StatusCode, body: Value) -> Result<Value, AnalyzeError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AnalyzeError::RateLimited(body.to_string()));
    }

    let parsed = serde_json::from_value::<ChatApiResponseOrError>(body.clone())
        .context(format!("Could not parse chat response ({}): {}", status, body))?;

    let parsed = match parsed {
        ChatApiResponseOrError::Error(error) => {
            if error.message.to_lowercase().contains(RATE_LIMIT_MESSAGE) {
                return Err(AnalyzeError::RateLimited(error.message));
            }
            return Err(anyhow!("Chat API error ({}): {}", status, error.message).into());
        }
        ChatApiResponseOrError::Response(_) if !status.is_success() => {
            return Err(anyhow!("Chat API returned {}", status).into());
        }
        ChatApiResponseOrError::Response(parsed) => parsed,
    };

    let choice = parsed.choices.first().context("No choices in response")?;
    let payload: Value = serde_json::from_str(&choice.message.content).context(format!(
        "Could not parse JSON response: {}",
        choice.message.content
    ))?;

    if is_empty_analysis(Some(&payload)) || !payload.is_object() {
        return Err(anyhow!("Empty analysis returned: {}", choice.message.content).into());
    }

    tracing::trace!(
        "Analysis used {} tokens ({} prompt)",
        parsed.usage.total_tokens,
        parsed.usage.prompt_tokens
    );

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(content: &str) -> Value {
        json!({
            "choices": [
                {
                    "index": 0,
                    "message": { "role": "assistant", "content": content },
                    "finish_reason": "stop"
                }
            ],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
        })
    }

    #[test]
    fn test_successful_completion_yields_payload() {
        let body = completion(r#"{"part_of_speech": "noun", "definition": "water"}"#);
        let payload = classify_response(StatusCode::OK, body).unwrap();
        assert_eq!(payload["definition"], "water");
    }

    #[test]
    fn test_too_many_requests_is_rate_limited() {
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, json!({})).unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_rate_limit_message_is_rate_limited() {
        let body = json!({ "message": "Requests rate limit exceeded" });
        let err = classify_response(StatusCode::OK, body).unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_other_api_errors_are_terminal() {
        let body = json!({ "message": "Invalid model" });
        let err = classify_response(StatusCode::BAD_REQUEST, body).unwrap_err();
        assert!(!err.is_rate_limited());
        assert!(err.to_string().contains("Invalid model"));
    }

    #[test]
    fn test_unparsable_content_is_terminal() {
        let err = classify_response(StatusCode::OK, completion("not json")).unwrap_err();
        assert!(!err.is_rate_limited());

        let err = classify_response(StatusCode::OK, completion("{}")).unwrap_err();
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_user_prompt_contains_term_and_language() {
        let prompt = analysis_user_prompt("물", "ko");
        assert!(prompt.contains("<term>물</term>"));
        assert!(prompt.contains("<language>ko</language>"));
    }
}
