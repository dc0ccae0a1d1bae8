use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::normalizer::TextKind;

const ORACLE_SERVICE: &str = "oracle";
const TEMPERATURE: f32 = 0.3;

const FIX_ADDRESS_PROMPT: &str = r#"You are a helpful assistant that fixes malformed addresses in Perth, Western Australia.
The addresses are missing spaces between words. Fix the address by adding proper spacing and formatting.
Return ONLY the corrected address, nothing else. Make sure it's a valid Perth address format.
Examples:
- "CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035" -> "Capricorn Beach, Riverside Esplanade, Yanchep WA 6035"
- "WACA GROUNDNELSON CREAST PERTH WA 6004" -> "WACA Ground, Nelson Crescent, Perth WA 6004"
- "SWAN RIVER – BARGERIVERSIDE DRPERTH WA 6000" -> "Swan River - Barge, Riverside Drive, Perth WA 6000"
- "ELIZABETH QUAY -FLOATING STAGE IN THE INLETTHE ESPLANADEPERTH WA 6000" -> "Elizabeth Quay - Floating Stage in the Inlet, The Esplanade, Perth WA 6000""#;

const FIX_PURPOSE_PROMPT: &str = r#"You are a helpful assistant that fixes malformed event titles scraped from a fireworks schedule in Perth, Western Australia.
The titles are missing spaces between words. Fix the title by adding proper spacing and sensible capitalisation.
Return ONLY the corrected title, nothing else.
Examples:
- "CITY OF PERTHFESTIVE LIGHTS" -> "City of Perth Festive Lights"
- "YANCHEP SURFCLUB CHRISTMASPARTY" -> "Yanchep Surf Club Christmas Party""#;

/// A single system + user exchange with the text-completion oracle.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

/// Untrusted text-completion service: returns free-form text or fails.
#[async_trait]
pub trait CompletionOracle: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> AppResult<String>;
}

/// Builds the oracle for the current configuration; without an API key every call fails fast
/// and callers fall back to their deterministic paths.
pub fn oracle_from_config(http: Client, config: &AppConfig) -> Arc<dyn CompletionOracle> {
    match config.openai_api_key.clone() {
        Some(key) => Arc::new(OpenAiOracle::new(
            http,
            &config.openai_api_base,
            &config.openai_model,
            key,
        )),
        None => {
            debug!("no OPENAI_API_KEY configured; using offline oracle");
            Arc::new(OfflineOracle)
        }
    }
}

pub struct OpenAiOracle {
    http: Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiOracle {
    pub fn new(http: Client, api_base: &str, model: &str, api_key: SecretString) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionOracle for OpenAiOracle {
    async fn complete(&self, prompt: &Prompt) -> AppResult<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: prompt.max_tokens,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                service: ORACLE_SERVICE,
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AppError::Parse("oracle response had no message content".into()))
    }
}

/// Stand-in used when no oracle credentials are configured.
#[derive(Debug, Default)]
pub struct OfflineOracle;

#[async_trait]
impl CompletionOracle for OfflineOracle {
    async fn complete(&self, _prompt: &Prompt) -> AppResult<String> {
        Err(AppError::Config("text-completion oracle is not configured".into()))
    }
}

/// Repairs the spacing of one location or purpose string.
#[async_trait]
pub trait TextFixer: Send + Sync {
    async fn fix(&self, text: &str) -> AppResult<String>;
}

pub struct OracleTextFixer {
    oracle: Arc<dyn CompletionOracle>,
    kind: TextKind,
}

impl OracleTextFixer {
    pub fn new(oracle: Arc<dyn CompletionOracle>, kind: TextKind) -> Self {
        Self { oracle, kind }
    }

    fn prompt(&self, text: &str) -> Prompt {
        match self.kind {
            TextKind::Address => Prompt {
                system: FIX_ADDRESS_PROMPT.to_string(),
                user: format!("Fix this address: \"{text}\""),
                max_tokens: 150,
            },
            TextKind::Purpose => Prompt {
                system: FIX_PURPOSE_PROMPT.to_string(),
                user: format!("Fix this event title: \"{text}\""),
                max_tokens: 100,
            },
        }
    }
}

#[async_trait]
impl TextFixer for OracleTextFixer {
    async fn fix(&self, text: &str) -> AppResult<String> {
        let reply = self.oracle.complete(&self.prompt(text)).await.map_err(|err| {
            warn!(?err, kind = self.kind.as_str(), "text fix call failed");
            err
        })?;
        let fixed = strip_wrapping_quotes(reply.lines().next().unwrap_or_default());
        if fixed.is_empty() {
            return Err(AppError::Parse("oracle returned an empty text fix".into()));
        }
        Ok(fixed)
    }
}

fn strip_wrapping_quotes(text: &str) -> String {
    text.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httptest::matchers::{all_of, json_decoded, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    fn oracle(server: &Server) -> OpenAiOracle {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let base = server.url("/v1").to_string();
        OpenAiOracle::new(http, &base, "gpt-4o-mini", SecretString::from("sk-test".to_string()))
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "system".into(),
            user: "user".into(),
            max_tokens: 50,
        }
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::body(json_decoded(|body: &serde_json::Value| {
                    body["model"] == "gpt-4o-mini" && body["messages"][1]["content"] == "user"
                })),
            ])
            .respond_with(json_encoded(json!({
                "choices": [{ "message": { "content": "  [\"WACA Ground Perth\"]  " } }]
            }))),
        );

        let reply = oracle(&server).complete(&prompt()).await.unwrap();
        assert_eq!(reply, "[\"WACA Ground Perth\"]");
    }

    #[tokio::test]
    async fn maps_non_success_status_to_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(status_code(429)),
        );

        let err = oracle(&server).complete(&prompt()).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Status {
                service: "oracle",
                status: 429
            }
        ));
    }

    #[tokio::test]
    async fn offline_oracle_always_fails() {
        let err = OfflineOracle.complete(&prompt()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    struct CannedOracle(&'static str);

    #[async_trait]
    impl CompletionOracle for CannedOracle {
        async fn complete(&self, prompt: &Prompt) -> AppResult<String> {
            assert!(prompt.user.contains("WACA GROUNDNELSON"));
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn text_fixer_strips_quotes_and_rejects_empty_output() {
        let fixer = OracleTextFixer::new(
            Arc::new(CannedOracle("\"WACA Ground, Nelson Crescent, Perth WA 6004\"")),
            TextKind::Address,
        );
        let fixed = fixer.fix("WACA GROUNDNELSON CREAST PERTH WA 6004").await.unwrap();
        assert_eq!(fixed, "WACA Ground, Nelson Crescent, Perth WA 6004");

        let empty = OracleTextFixer::new(Arc::new(CannedOracle("\"\"")), TextKind::Address);
        let err = empty.fix("WACA GROUNDNELSON").await.unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }
}
