use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::BackendError;
use crate::services::dispatch::{BatchRequest, TranslationBackend};
use crate::services::terminology::GlossaryHint;

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TEMPERATURE: f32 = 0.3;

const DEFAULT_SYSTEM_PROMPT: &str = "You translate Stardew Valley mod text. \
Translate each numbered line and answer with the same numbering. \
Keep every ⟦P#⟧ placeholder exactly as written. \
Use the glossary renderings for the listed terms.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatBackendConfig {
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Default endpoint and model for the known OpenAI-compatible providers.
fn provider_defaults(provider: &str) -> Option<(&'static str, &'static str)> {
    match provider {
        "openai" => Some(("https://api.openai.com/v1/chat/completions", "gpt-4o-mini")),
        "deepseek" => Some(("https://api.deepseek.com/v1/chat/completions", "deepseek-chat")),
        "siliconflow" => Some((
            "https://api.siliconflow.cn/v1/chat/completions",
            "deepseek-ai/DeepSeek-V3",
        )),
        "qwen" => Some((
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions",
            "qwen-plus",
        )),
        "kimi" => Some(("https://api.moonshot.cn/v1/chat/completions", "moonshot-v1-8k")),
        "zhipu" => Some((
            "https://open.bigmodel.cn/api/paas/v4/chat/completions",
            "glm-4-flash",
        )),
        "local" => Some(("http://127.0.0.1:1234/v1/chat/completions", "local-model")),
        _ => None,
    }
}

/// Sends each batch as one chat completion with a numbered prompt.
#[derive(Debug)]
pub struct ChatBackend {
    client: Client,
    name: String,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
    system_prompt: String,
}

impl ChatBackend {
    pub fn new(cfg: &ChatBackendConfig) -> Result<Self, BackendError> {
        let defaults = provider_defaults(&cfg.provider);

        let endpoint = match (&cfg.endpoint, defaults) {
            (Some(e), _) if !e.trim().is_empty() => e.trim().to_string(),
            (_, Some((e, _))) => e.to_string(),
            _ => {
                return Err(BackendError::Permanent(format!(
                    "unsupported provider {:?} and no endpoint given",
                    cfg.provider
                )))
            }
        };
        let model = match (&cfg.model, defaults) {
            (Some(m), _) if !m.trim().is_empty() => m.trim().to_string(),
            (_, Some((_, m))) => m.to_string(),
            _ => return Err(BackendError::Permanent("no model configured".into())),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| BackendError::Permanent(e.to_string()))?;

        Ok(Self {
            client,
            name: cfg.provider.clone(),
            endpoint,
            model,
            api_key: cfg.api_key.clone(),
            temperature: cfg.temperature,
            system_prompt: cfg
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl TranslationBackend for ChatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate_batch(&self, request: &BatchRequest) -> Result<Vec<String>, BackendError> {
        if request.texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": build_prompt(request) }
            ],
            "temperature": self.temperature
        });

        let mut call = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            call = call.bearer_auth(&self.api_key);
        }

        let resp = call.send().map_err(classify_transport)?;
        let status = resp.status();
        // read as text first so an error body is never lost to a JSON failure
        let text = resp.text().map_err(classify_transport)?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let content = extract_content(&text)?;
        parse_numbered(&content, request.texts.len())
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    match err.status() {
        Some(status) => classify_status(status, &err.to_string()),
        None => BackendError::Transient(err.to_string()),
    }
}

fn classify_status(status: StatusCode, body: &str) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return BackendError::RateLimited;
    }
    let message = extract_error_message(status, body);
    if should_retry_http(status) {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

fn should_retry_http(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn extract_error_message(status: StatusCode, body_text: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body_text) {
        let msg = v
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str());
        if let Some(msg) = msg {
            return format!("HTTP {}: {}", status.as_u16(), msg);
        }
    }

    let trimmed = body_text.trim();
    let snippet: String = if trimmed.chars().count() > 400 {
        format!("{}...", trimmed.chars().take(400).collect::<String>())
    } else {
        trimmed.to_string()
    };

    format!("HTTP {}: {}", status.as_u16(), snippet)
}

fn extract_content(body: &str) -> Result<String, BackendError> {
    let v: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| BackendError::Transient(format!("invalid JSON from backend: {e}")))?;

    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            BackendError::Transient("invalid response: missing choices[0].message.content".into())
        })
}

fn glossary_section(glossary: &[GlossaryHint]) -> String {
    let mut s = String::from("Glossary:\n");
    if glossary.is_empty() {
        s.push_str("(none)\n");
    }
    for hint in glossary {
        s.push_str(&format!("{}: {}\n", hint.source, hint.target));
    }
    s
}

pub(crate) fn build_prompt(request: &BatchRequest) -> String {
    let mut p = format!(
        "Translate from {} to {}.\n\n",
        request.source_lang, request.target_lang
    );
    p.push_str(&glossary_section(&request.glossary));
    p.push_str("\nText:\n");
    for (i, text) in request.texts.iter().enumerate() {
        p.push_str(&format!("{}. {}\n", i + 1, text.trim()));
    }
    p
}

/// Reads `N. text` items back; continuation lines belong to the item above.
pub(crate) fn parse_numbered(content: &str, expected: usize) -> Result<Vec<String>, BackendError> {
    let mut slots: Vec<Option<Vec<&str>>> = vec![None; expected];
    let mut current: Option<usize> = None;

    for line in content.trim().lines() {
        let line = line.trim_end();

        if let Some((n, rest)) = numbered_line(line) {
            if (1..=expected).contains(&n) {
                current = Some(n - 1);
                slots[n - 1] = Some(vec![rest]);
                continue;
            }
        }

        if let Some(i) = current {
            if let Some(lines) = slots[i].as_mut() {
                lines.push(line);
            }
        }
    }

    let got = slots.iter().filter(|s| s.is_some()).count();
    if got != expected {
        return Err(BackendError::MalformedResponse { expected, got });
    }

    Ok(slots
        .into_iter()
        .map(|s| s.unwrap_or_default().join("\n").trim().to_string())
        .collect())
}

fn numbered_line(line: &str) -> Option<(usize, &str)> {
    let (num, rest) = line.split_once(". ")?;
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_glossary_and_numbers_texts() {
        let req = BatchRequest {
            texts: vec!["Hi ⟦P1⟧".into(), "  Visit Pierre's  ".into()],
            source_lang: "en".into(),
            target_lang: "zh".into(),
            glossary: vec![GlossaryHint {
                source: "Pierre".into(),
                target: "皮埃尔".into(),
            }],
        };
        let p = build_prompt(&req);
        assert!(p.contains("Pierre: 皮埃尔\n"));
        assert!(p.contains("1. Hi ⟦P1⟧\n2. Visit Pierre's\n"));
    }

    #[test]
    fn parses_multiline_items() {
        let out = parse_numbered("1. 你好\n2. 第一行\n第二行\n3. 再见", 3).unwrap();
        assert_eq!(out, vec!["你好", "第一行\n第二行", "再见"]);
    }

    #[test]
    fn missing_items_are_malformed() {
        assert_eq!(
            parse_numbered("1. 你好\n3. 再见", 3),
            Err(BackendError::MalformedResponse {
                expected: 3,
                got: 2
            })
        );
        // numbers beyond the request are continuation text, not items
        let out = parse_numbered("1. 共有\n2. 件物品", 1).unwrap();
        assert_eq!(out, vec!["共有\n2. 件物品"]);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            BackendError::RateLimited
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "oops"),
            BackendError::Transient(_)
        ));
        assert_eq!(
            classify_status(
                StatusCode::UNAUTHORIZED,
                r#"{"error": {"message": "bad key"}}"#
            ),
            BackendError::Permanent("HTTP 401: bad key".into())
        );
    }

    #[test]
    fn content_extraction() {
        let body = r#"{"choices": [{"message": {"content": "1. 你好"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "1. 你好");
        assert!(extract_content("{}").is_err());
    }

    #[test]
    fn unknown_provider_needs_endpoint() {
        let mut cfg = ChatBackendConfig {
            provider: "acme".into(),
            api_key: String::new(),
            endpoint: None,
            model: Some("m".into()),
            temperature: 0.3,
            timeout_secs: 10,
            system_prompt: None,
        };
        assert!(ChatBackend::new(&cfg).is_err());
        cfg.endpoint = Some("http://localhost:9/v1/chat/completions".into());
        let backend = ChatBackend::new(&cfg).unwrap();
        assert_eq!(backend.model(), "m");
    }
}
