//! 言語モデルによるアクション抽出
//!
//! # 責務
//!
//! - 固定のプロンプトテンプレートとステップテキストからプロンプトを組み立てる
//! - モデルの回答（信頼できないテキスト）を JSON として読み、Action スキーマで検証する
//!
//! ## 回答形式
//!
//! ```json
//! {"tool": "send_text", "parameters": {"body": "odometer"}}
//! ```
//!
//! コードフェンスや前後の説明文は許容し、最初の `{` から最後の `}` までを読みます。

use serde::Deserialize;

use crate::config::action::ActionPayload;

/// システムプロンプト
pub const SYSTEM_PROMPT: &str = "You are a WhatsApp flow analyzer. Return only valid JSON. \
Support text, location, image, and voice tools.";

const PROMPT_TEMPLATE: &str = r#"Analyze this WhatsApp flow step and determine the tool and parameters.

Step: {step}

RULES:
- For text messages, extract ONLY the actual message text in quotes
- For images and voice messages, use the file path written in the step
- Do NOT add names or extra words to the message body
- Keep messages simple and direct

Return JSON only, in this format:
{"tool": "send_text" | "send_location" | "send_image" | "send_voice",
 "parameters": {
   "body": "exact text" (send_text),
   "latitude": number, "longitude": number (send_location),
   "image_path": "path/to/image", "caption": "image description" (send_image),
   "voice_path": "path/to/voice" (send_voice)
 }}

Examples:
- "User sends message 'Hello'" -> {"tool": "send_text", "parameters": {"body": "Hello"}}
- "User sends voice message 'voice.wav'" -> {"tool": "send_voice", "parameters": {"voice_path": "voice.wav"}}
- "User sends location" -> {"tool": "send_location", "parameters": {"latitude": 16.5423, "longitude": 81.4969}}"#;

/// ステップテキストからプロンプトを組み立てる
///
/// `previous_error` がある場合は、前回の回答が不正だった理由を追記します。
pub fn build_prompt(step_text: &str, previous_error: Option<&str>) -> String {
    let mut prompt = PROMPT_TEMPLATE.replace("{step}", step_text);
    if let Some(error) = previous_error {
        prompt.push_str(&format!(
            "\n\nYour previous answer was rejected: {}\nAnswer again with a single JSON object that follows the format exactly.",
            error
        ));
    }
    prompt
}

/// モデルの回答形式
#[derive(Debug, Deserialize)]
#[serde(tag = "tool", content = "parameters")]
enum ModelAnswer {
    #[serde(rename = "send_text")]
    Text { body: String },
    #[serde(rename = "send_location")]
    Location { latitude: f64, longitude: f64 },
    #[serde(rename = "send_image")]
    Image {
        image_path: String,
        #[serde(default)]
        caption: Option<String>,
    },
    #[serde(rename = "send_voice")]
    Voice { voice_path: String },
}

impl From<ModelAnswer> for ActionPayload {
    fn from(answer: ModelAnswer) -> Self {
        match answer {
            ModelAnswer::Text { body } => ActionPayload::Text { body },
            ModelAnswer::Location {
                latitude,
                longitude,
            } => ActionPayload::Location {
                latitude,
                longitude,
            },
            ModelAnswer::Image {
                image_path,
                caption,
            } => ActionPayload::Image {
                image_path,
                caption: caption.unwrap_or_else(|| "Image".to_string()),
            },
            ModelAnswer::Voice { voice_path } => ActionPayload::Voice { voice_path },
        }
    }
}

/// モデルの回答を検証済みペイロードに変換
///
/// # エラー
///
/// 不正な理由を表す文字列（再試行時のプロンプトに使用）
pub fn parse_answer(raw: &str) -> Result<ActionPayload, String> {
    let json = json_object(raw).ok_or_else(|| "回答に JSON オブジェクトがありません".to_string())?;
    let answer: ModelAnswer =
        serde_json::from_str(json).map_err(|e| format!("JSON がスキーマに一致しません: {}", e))?;
    let payload = ActionPayload::from(answer);
    payload.validate()?;
    Ok(payload)
}

/// 最初の `{` から最後の `}` までを切り出す
fn json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}
