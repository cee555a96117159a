//! 成功基準の判定
//!
//! 判定はステップ結果とフロー定義だけから導かれます。実行エンジンと
//! レポート作成の両方がこのモジュールを使い、同じ結論になります。
//!
//! # 完了ステップ数
//!
//! 会話は状態を持つため、失敗したステップより後のステップは会話を
//! 進めません。完了ステップ数は先頭から連続して成功したステップの数です。
//!
//! # 判定内容
//!
//! - 完了ステップ数が `min_steps_completed`（省略時はステップ数の半分、切り上げ）以上
//! - すべての必須フラグが、いずれかの成功ステップのフラグに含まれる
//! - すべての必須メディア種別が、いずれかの成功ステップで送られている

use std::collections::BTreeSet;

use serde::Serialize;

use super::result::StepResult;
use crate::config::action::{Action, ToolKind};
use crate::config::flow::{FlowDefinition, MediaKind};
use crate::messaging::webhook::{FLAG_IMAGE_EXTRACTED, FLAG_VOICE_TRANSCRIBED};

/// 成功基準の判定結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub completed_steps: usize,
    pub required_steps: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_flags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_media: Vec<MediaKind>,
}

/// 確定したステップ結果を成功基準で判定する
pub fn evaluate(flow: &FlowDefinition, steps: &[StepResult]) -> Verdict {
    let succeeded: Vec<&StepResult> = steps.iter().filter(|s| s.is_succeeded()).collect();
    let completed_steps = completed_steps(steps);
    let required_steps = flow.min_steps_required();

    let realized_flags: BTreeSet<&str> = succeeded
        .iter()
        .flat_map(|s| s.flags.iter().map(String::as_str))
        .collect();
    let missing_flags: Vec<String> = flow
        .success_criteria()
        .required_flags()
        .iter()
        .filter(|flag| !realized_flags.contains(flag.as_str()))
        .cloned()
        .collect();

    let missing_media: Vec<MediaKind> = flow
        .validation_rules()
        .required_media()
        .iter()
        .copied()
        .filter(|kind| !succeeded.iter().any(|s| s.tool == kind.tool()))
        .collect();

    Verdict {
        passed: completed_steps >= required_steps
            && missing_flags.is_empty()
            && missing_media.is_empty(),
        completed_steps,
        required_steps,
        missing_flags,
        missing_media,
    }
}

/// 先頭から連続して成功したステップの数
pub fn completed_steps(steps: &[StepResult]) -> usize {
    steps.iter().take_while(|s| s.is_succeeded()).count()
}

/// 残りのステップがすべて成功すれば成功基準を満たしうるか
///
/// 失敗が1つでもあれば完了ステップ数はそれ以上増えません。必須メディアは
/// 成功済みのステップか残りの有効なアクションで送れる必要があります。
/// メディア処理フラグ（`image_extracted` / `voice_transcribed`）も同様で、
/// それ以外のフラグはどのステップの応答からも得られうるものとして扱います。
pub fn still_reachable(flow: &FlowDefinition, steps: &[StepResult], remaining: &[Action]) -> bool {
    let completed = completed_steps(steps);
    let reachable = if completed == steps.len() {
        completed + remaining.len()
    } else {
        completed
    };
    if reachable < flow.min_steps_required() {
        return false;
    }

    let can_send = |tool: ToolKind| {
        steps.iter().any(|s| s.is_succeeded() && s.tool == tool)
            || remaining.iter().any(|a| a.is_valid() && a.tool() == tool)
    };
    let media_reachable = flow
        .validation_rules()
        .required_media()
        .iter()
        .all(|kind| can_send(kind.tool()));

    let flags_reachable = flow.success_criteria().required_flags().iter().all(|flag| {
        let realized = steps
            .iter()
            .any(|s| s.is_succeeded() && s.flags.contains(flag));
        realized || media_flag_tool(flag).is_none_or(can_send)
    });

    media_reachable && flags_reachable
}

/// メディア処理結果を表すフラグと、それを生むツール
fn media_flag_tool(flag: &str) -> Option<ToolKind> {
    match flag {
        FLAG_IMAGE_EXTRACTED => Some(ToolKind::Image),
        FLAG_VOICE_TRANSCRIBED => Some(ToolKind::Voice),
        _ => None,
    }
}
