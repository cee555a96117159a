//! 実行結果の型定義
//!
//! # 責務
//!
//! - ステップ実行結果 [`StepResult`] と試行記録 [`AttemptRecord`] の型定義
//! - 受信者ごとの状態 [`RecipientState`] と実行記録 [`RecipientRecord`] の型定義
//! - 試行単位の失敗理由 [`ExecutionError`] とフロー実行の致命的エラー [`RunError`]
//!
//! # 主要な型
//!
//! - [`StepResult`][]: 1つの Action を1人の受信者に送った結果（試行回数、レイテンシ、フラグ等）
//! - [`StepStatus`][]: 成功/失敗/再試行/スキップ
//! - [`RecipientRecord`][]: 受信者1人分のステップ結果の列と最終状態
//!
//! # ステータスの使い分け
//!
//! 確定した [`StepResult`] のステータスは `Succeeded`・`Failed`・`Skipped`
//! のいずれかです。`Retried` は一時的な失敗のあと再試行された
//! 試行記録（[`AttemptRecord`]）にだけ現れます。

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::action::{Action, ToolKind};
use crate::error::{DataSourceError, DispatchError};
use crate::recipients::Recipient;

/// ステップ実行ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 成功
    Succeeded,

    /// 失敗
    Failed,

    /// 一時的な失敗のため再試行された（試行記録のみ）
    Retried,

    /// スキップ（成功基準に届かなくなった、または中断された）
    Skipped,
}

/// 1回の送信試行の記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 試行番号（1始まり）
    pub attempt: u32,

    /// 試行の結果
    pub status: StepStatus,

    /// 試行にかかった時間（ミリ秒）
    pub latency_ms: u64,

    /// 失敗理由
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// ステップ実行結果
///
/// 1つの Action を1人の受信者に送った結果です。確定後は変更されません。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    /// ステップ番号（1始まり）
    pub ordinal: u32,

    /// ツール種別
    pub tool: ToolKind,

    /// 確定ステータス
    pub status: StepStatus,

    /// 送信試行回数（送信しなかった場合は0）
    pub attempt_count: u32,

    /// 再試行の待機を含む所要時間（ミリ秒）
    pub latency_ms: u64,

    /// エラーメッセージ（失敗時のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 応答から得たフラグ（`voice_transcribed` など）
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<String>,

    /// 試行ごとの記録
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl StepResult {
    /// 実行されなかったステップ
    pub fn skipped(action: &Action) -> Self {
        Self {
            ordinal: action.ordinal(),
            tool: action.tool(),
            status: StepStatus::Skipped,
            attempt_count: 0,
            latency_ms: 0,
            error: None,
            flags: BTreeSet::new(),
            attempts: Vec::new(),
        }
    }

    /// 送信前に失敗と判定されたステップ（再試行しない）
    pub fn rejected(action: &Action, error: &ExecutionError) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.to_string()),
            ..Self::skipped(action)
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// 最初の試行以降に行った再試行の回数
    pub fn retries(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }
}

/// 受信者ごとの実行状態
///
/// ```text
/// Pending → Running → {Succeeded, Failed, Aborted}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RecipientState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecipientState::Succeeded | RecipientState::Failed | RecipientState::Aborted
        )
    }
}

/// 受信者1人分の実行記録
///
/// 1つのワーカーだけが書き込みます。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientRecord {
    pub recipient: Recipient,
    pub state: RecipientState,
    pub steps: Vec<StepResult>,
}

impl RecipientRecord {
    pub fn new(recipient: Recipient) -> Self {
        Self {
            recipient,
            state: RecipientState::Pending,
            steps: Vec::new(),
        }
    }

    /// 開始されないまま中断された受信者（全ステップがスキップ）
    pub fn never_started(recipient: Recipient, actions: &[Action]) -> Self {
        Self {
            recipient,
            state: RecipientState::Aborted,
            steps: actions.iter().map(StepResult::skipped).collect(),
        }
    }
}

/// 試行単位の失敗理由
///
/// # エラー種別
///
/// - [`ExecutionError::LowConfidence`] - 解釈できなかったステップ（送信しない）
/// - [`ExecutionError::DisallowedValue`] - 検証ルールの許可値に反する（送信しない）
/// - [`ExecutionError::Dispatch`] - 対応するハンドラーが無い（再試行しない）
/// - [`ExecutionError::Transient`] / [`ExecutionError::Timeout`] - 再試行の対象
/// - [`ExecutionError::Permanent`] - 再試行しない
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// 解釈の信頼度が低い
    #[error("ステップを解釈できませんでした: {0}")]
    LowConfidence(String),

    /// 許可されていない値
    #[error("検証ルールに違反しています: {0}")]
    DisallowedValue(String),

    /// 振り分けエラー
    #[error("{0}")]
    Dispatch(String),

    /// 一時的な送信失敗
    #[error("一時的な送信失敗: {0}")]
    Transient(String),

    /// 恒久的な送信失敗
    #[error("送信に失敗しました: {0}")]
    Permanent(String),

    /// タイムアウト
    #[error("タイムアウト: ステップ {ordinal} が {timeout_secs}秒以内に完了しませんでした")]
    Timeout {
        /// タイムアウトしたステップ番号
        ordinal: u32,
        /// タイムアウト時間（秒）
        timeout_secs: u64,
    },
}

impl ExecutionError {
    pub fn timeout(ordinal: u32, timeout: Duration) -> Self {
        Self::Timeout {
            ordinal,
            timeout_secs: timeout.as_secs(),
        }
    }

    /// 再試行で成功しうる失敗かどうか
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

impl From<DispatchError> for ExecutionError {
    fn from(error: DispatchError) -> Self {
        Self::Dispatch(error.to_string())
    }
}

/// フロー実行を開始できなかったエラー
///
/// どちらの場合もレポートは作成されません。
#[derive(Debug, Error)]
pub enum RunError {
    /// データソースの解決に失敗
    #[error("データソースを解決できません: {0}")]
    DataSource(#[from] DataSourceError),

    /// 受信者が1人もいない
    #[error("フロー '{0}' の受信者が1人も見つかりませんでした")]
    NoRecipients(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::action::{ActionPayload, ActionSource};

    fn text_action(ordinal: u32) -> Action {
        Action::new(
            ordinal,
            ActionPayload::Text {
                body: "hi".to_string(),
            },
            ActionSource::Rule,
        )
    }

    #[test]
    fn test_skipped_and_rejected_results() {
        let action = text_action(2);

        let skipped = StepResult::skipped(&action);
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.attempt_count, 0);
        assert_eq!(skipped.error, None);

        let rejected = StepResult::rejected(&action, &ExecutionError::LowConfidence("x".into()));
        assert_eq!(rejected.status, StepStatus::Failed);
        assert_eq!(rejected.ordinal, 2);
        assert_eq!(rejected.attempt_count, 0);
        assert!(rejected.error.unwrap().contains("解釈できません"));
    }

    #[test]
    fn test_never_started_record() {
        let actions = [text_action(1), text_action(2)];
        let record = RecipientRecord::never_started(Recipient::new("1"), &actions);
        assert_eq!(record.state, RecipientState::Aborted);
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Skipped));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ExecutionError::Transient("429".into()).is_retryable());
        assert!(ExecutionError::timeout(1, Duration::from_secs(30)).is_retryable());
        assert!(!ExecutionError::Permanent("400".into()).is_retryable());
        assert!(!ExecutionError::from(DispatchError::UnsupportedTool(ToolKind::Voice)).is_retryable());
    }

    #[test]
    fn test_execution_error_messages() {
        assert_eq!(
            ExecutionError::timeout(3, Duration::from_secs(30)).to_string(),
            "タイムアウト: ステップ 3 が 30秒以内に完了しませんでした"
        );
        assert_eq!(
            RunError::NoRecipients("odometer".into()).to_string(),
            "フロー 'odometer' の受信者が1人も見つかりませんでした"
        );
    }

    #[test]
    fn test_step_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert!(RecipientState::Aborted.is_terminal());
        assert!(!RecipientState::Running.is_terminal());
    }
}
