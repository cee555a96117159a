//! ステップ解釈器
//!
//! # 責務
//!
//! 自由記述のステップテキストを実行可能な [`Action`] に変換します。
//! 解釈は決して失敗せず、必ず1ステップにつき1つの Action を返します。
//!
//! # パイプライン
//!
//! ```text
//! StepSpec
//!   ↓ 1. 決定的ルール（rules）       一致 → Action (source = Rule)
//!   ↓ 2. 言語モデル抽出（extract）   検証OK → Action (source = Model)
//!   ↓    スキーマ不一致 → 理由を添えて再試行（interpreter_retries 回まで）
//!   ↓ 3. 縮退                         Action (Text, valid = false, source = Fallback)
//! ```
//!
//! 実行エンジンはどの段で生成された Action かを区別しません。
//! `valid = false` の Action は送信されず、そのステップは失敗として記録されます。

pub mod extract;
pub mod rules;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::action::{Action, ActionPayload, ActionSource};
use crate::config::flow::FlowDefinition;
use crate::config::step::StepSpec;
use crate::provider::LanguageModel;

/// ステップ解釈器
#[derive(Clone)]
pub struct StepInterpreter {
    model: Option<Arc<dyn LanguageModel>>,
    retries: u32,
}

impl StepInterpreter {
    /// 決定的ルールのみで解釈する
    pub fn rules_only() -> Self {
        Self {
            model: None,
            retries: 0,
        }
    }

    /// 言語モデルを併用する
    ///
    /// # 引数
    ///
    /// - `model`: 抽出に使う言語モデル
    /// - `retries`: スキーマ不一致時の再試行回数（通常は1）
    pub fn with_model(model: Arc<dyn LanguageModel>, retries: u32) -> Self {
        Self {
            model: Some(model),
            retries,
        }
    }

    /// 1ステップを解釈する
    pub async fn interpret(&self, step: &StepSpec) -> Action {
        if let Some(action) = rules::match_rule(step) {
            debug!(ordinal = step.ordinal(), tool = %action.tool(), "ルールに一致しました");
            return action;
        }

        if let Some(model) = &self.model {
            if let Some(action) = self.extract_with_model(model.as_ref(), step).await {
                return action;
            }
        }

        warn!(
            ordinal = step.ordinal(),
            text = step.text(),
            "ステップを解釈できませんでした（低信頼度）"
        );
        Action::low_confidence(step.ordinal(), step.text())
    }

    /// フローの全ステップを順に解釈する
    ///
    /// 戻り値の Action の ordinal はステップと1対1で対応します。
    pub async fn interpret_all(&self, flow: &FlowDefinition) -> Vec<Action> {
        let mut actions = Vec::with_capacity(flow.steps().len());
        for step in flow.steps() {
            actions.push(self.interpret(step).await);
        }
        let low_confidence = actions.iter().filter(|a| !a.is_valid()).count();
        info!(
            trigger = flow.trigger(),
            steps = actions.len(),
            low_confidence,
            "ステップの解釈が完了しました"
        );
        actions
    }

    async fn extract_with_model(&self, model: &dyn LanguageModel, step: &StepSpec) -> Option<Action> {
        let mut previous_error: Option<String> = None;

        for attempt in 0..=self.retries {
            let prompt = extract::build_prompt(step.text(), previous_error.as_deref());
            let raw = match model.extract(extract::SYSTEM_PROMPT, &prompt).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(ordinal = step.ordinal(), attempt, error = %e, model = model.name(), "言語モデルの呼び出しに失敗しました");
                    previous_error = None;
                    continue;
                }
            };

            match extract::parse_answer(&raw) {
                Ok(payload) => {
                    let payload = prefer_step_media_path(payload, step.text());
                    debug!(ordinal = step.ordinal(), attempt, tool = %payload.tool(), "言語モデルで解釈しました");
                    return Some(Action::new(step.ordinal(), payload, ActionSource::Model));
                }
                Err(reason) => {
                    warn!(ordinal = step.ordinal(), attempt, reason = %reason, "言語モデルの回答が不正です");
                    previous_error = Some(reason);
                }
            }
        }
        None
    }
}

/// ステップに引用符付きのパスがあれば、モデルの回答より優先する
fn prefer_step_media_path(payload: ActionPayload, step_text: &str) -> ActionPayload {
    match payload {
        ActionPayload::Image {
            image_path,
            caption,
        } => ActionPayload::Image {
            image_path: rules::quoted_media_path(step_text, true).unwrap_or(image_path),
            caption,
        },
        ActionPayload::Voice { voice_path } => ActionPayload::Voice {
            voice_path: rules::quoted_media_path(step_text, false).unwrap_or(voice_path),
        },
        other => other,
    }
}
