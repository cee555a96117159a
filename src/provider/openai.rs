//! OpenAI Chat Completions クライアント実装
//!
//! # 責務
//!
//! - OpenAI 互換の `POST {base_url}/chat/completions` との通信を担当
//! - [`LanguageModel`] トレイトを実装し、統一インターフェースを提供
//! - HTTP ステータスを [`ProviderError`] に分類
//!
//! # 認証
//!
//! `Authorization: Bearer {api_key}` ヘッダーを付与します。
//! APIキーは [`Settings`](crate::config::settings::Settings) の
//! `OPENAI_API_KEY` から渡されます。
//!
//! # レスポンス形式
//!
//! ```json
//! {
//!   "model": "gpt-4o-mini",
//!   "choices": [
//!     { "message": { "role": "assistant", "content": "{\"tool\": \"send_text\", ...}" } }
//!   ]
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::LanguageModel;
use crate::error::ProviderError;

/// デフォルトのAPIエンドポイント
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// 1リクエストのタイムアウト
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 抽出は再現性を優先する
const TEMPERATURE: f32 = 0.1;

/// OpenAI Chat Completions クライアント
pub struct OpenAIClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIClient {
    /// 新しいクライアントを生成
    ///
    /// # エラー
    ///
    /// - [`ProviderError::AuthenticationError`] - APIキーが空
    /// - [`ProviderError::Http`] - HTTPクライアントの初期化に失敗
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::AuthenticationError(
                "OPENAI_API_KEY が設定されていません".to_string(),
            ));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// エンドポイントを差し替える（OpenAI 互換サーバー向け）
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// レスポンスボディから生成テキストを取り出す
    fn parse_completion(body: &str) -> Result<String, ProviderError> {
        let completion: ChatCompletion = serde_json::from_str(body).map_err(|e| {
            ProviderError::InvalidResponse(format!("JSON parse error: {}: {}", e, body))
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("No content in response".to_string()))
    }

    /// 失敗ステータスをエラーに分類
    fn classify_status(status: StatusCode, body: &str) -> ProviderError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::AuthenticationError(body.to_string())
            }
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimitExceeded,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                ProviderError::Timeout(body.to_string())
            }
            other => ProviderError::InvalidResponse(format!("API returned {}: {}", other, body)),
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn extract(&self, system_prompt: &str, prompt: &str) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: TEMPERATURE,
        };

        debug!(model = %self.model, "Chat Completions を呼び出します");
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }
        Self::parse_completion(&body)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_api_key() {
        let result = OpenAIClient::new("  ", "gpt-4o-mini");
        assert!(matches!(result, Err(ProviderError::AuthenticationError(_))));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = OpenAIClient::new("sk-test", "gpt-4o-mini")
            .unwrap()
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_parse_completion_success() {
        let body = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "{\"tool\":\"send_text\"}"}}]
        }"#;
        let content = OpenAIClient::parse_completion(body).unwrap();
        assert_eq!(content, r#"{"tool":"send_text"}"#);
    }

    #[test]
    fn test_parse_completion_empty_choices() {
        let result = OpenAIClient::parse_completion(r#"{"choices": []}"#);
        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_completion_invalid_json() {
        let result = OpenAIClient::parse_completion("not valid json");
        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            OpenAIClient::classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            ProviderError::AuthenticationError(_)
        ));
        assert!(matches!(
            OpenAIClient::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimitExceeded
        ));
        assert!(matches!(
            OpenAIClient::classify_status(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            ProviderError::InvalidResponse(_)
        ));
    }
}
