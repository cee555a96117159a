//! フロー定義の生成
//!
//! # 責務
//!
//! ボットとのやり取りを自由記述したプロンプトから、ユーザー操作だけを並べた
//! [`FlowDefinition`] を生成します。
//!
//! # 処理フロー
//!
//! 1. 先頭に会話をリセットする `'Stop'` ステップを置く
//! 2. 言語モデルにユーザー操作だけを書き出させ、`User sends…` / `User uploads…`
//!    の行だけを採用
//! 3. 1件も採用できなかった場合（モデル無し・失敗を含む）は、プロンプトの
//!    `StepN:` 行からユーザー操作を抜き出す
//!
//! ステップ番号は採用した順に振り直します。

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::config::flow::FlowDefinition;
use crate::provider::LanguageModel;

/// 生成フローの先頭ステップ
pub const RESET_STEP: &str = "User sends a message 'Stop' to initiate the flow.";

const DESCRIPTION: &str = "Generated flow from prompt";
const MEDIA_PATH: &str = "media/images";

const SYSTEM_PROMPT: &str = "You are a WhatsApp flow tester. Convert a flow description into \
a list of WhatsApp USER actions only. Never include agent, system or tool responses.";

static STEP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*step\s*\d+\s*[:.)-]\s*").expect("valid step prefix regex"));

static STEP_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)step\s*\d+\s*:").expect("valid step boundary regex"));

static USER_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\buser\s+(?:sends|uploads)\b.*$").expect("valid user clause regex")
});

const STRICT_ACTIONS: [&str; 4] = [
    "user sends a message",
    "user uploads an image",
    "user sends location",
    "user sends a voice message",
];

/// プロンプトからフロー定義を生成する
pub struct FlowGenerator {
    model: Option<Arc<dyn LanguageModel>>,
}

impl FlowGenerator {
    pub fn new(model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self { model }
    }

    /// フロー定義を生成する
    ///
    /// # 引数
    ///
    /// - `trigger`: 生成するフローのトリガー名
    /// - `prompt`: ボットとのやり取りの自由記述
    pub async fn generate(&self, trigger: &str, prompt: &str) -> FlowDefinition {
        let steps = self.user_steps(prompt).await;
        info!(trigger, steps = steps.len(), "フロー定義を生成しました");
        FlowDefinition::new(trigger, DESCRIPTION, steps).with_media_path(MEDIA_PATH)
    }

    /// `StepN: ...` 形式のユーザー操作ステップ（先頭は必ずリセット）
    pub async fn user_steps(&self, prompt: &str) -> Vec<String> {
        let mut actions = match &self.model {
            Some(model) => match model.extract(SYSTEM_PROMPT, &build_prompt(prompt)).await {
                Ok(raw) => strict_actions(&raw),
                Err(error) => {
                    warn!(model = model.name(), error = %error, "ステップ生成に失敗しました");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if actions.is_empty() {
            actions = fallback_actions(prompt);
        }

        std::iter::once(RESET_STEP.to_string())
            .chain(actions)
            .enumerate()
            .map(|(index, action)| format!("Step{}: {}", index + 1, action))
            .collect()
    }
}

fn build_prompt(prompt: &str) -> String {
    format!(
        "Instructions:\n\
         1. Only include explicit actions a real WhatsApp user performs: sending a message, \
         uploading an image, sending a location, sending a voice message.\n\
         2. Include every user response (confirm, cancel, select, right) as its own step.\n\
         3. Format each step as: StepN: User sends a message '...'\n\
         4. For image uploads use: StepN: User uploads an image '<path>' as proof of ...\n\
         5. Number the steps starting from Step2.\n\n\
         Flow description:\n{prompt}"
    )
}

/// モデル出力からユーザー操作の行だけを取り出す（番号は外す）
fn strict_actions(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| STEP_PREFIX.replace(line.trim(), "").trim().to_string())
        .filter(|line| is_strict_action(line))
        .collect()
}

fn is_strict_action(line: &str) -> bool {
    let lower = line.to_lowercase();
    STRICT_ACTIONS.iter().any(|action| lower.starts_with(action))
}

/// プロンプトの `StepN:` 行からユーザー操作の節を取り出す
fn fallback_actions(prompt: &str) -> Vec<String> {
    split_steps(prompt)
        .into_iter()
        .filter(|segment| STEP_PREFIX.is_match(segment))
        .filter_map(|segment| USER_CLAUSE.find(&segment).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// 改行と `StepN:` の位置で区切る
fn split_steps(prompt: &str) -> Vec<String> {
    let mut segments = Vec::new();
    for line in prompt.lines() {
        let starts: Vec<usize> = STEP_BOUNDARY.find_iter(line).map(|m| m.start()).collect();
        let mut cursor = 0;
        for start in starts.into_iter().filter(|&start| start > 0) {
            segments.push(line[cursor..start].trim().to_string());
            cursor = start;
        }
        segments.push(line[cursor..].trim().to_string());
    }
    segments.retain(|s| !s.is_empty());
    segments
}
