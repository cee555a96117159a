//! フロー実行エンジン
//!
//! # 責務
//!
//! - 解釈済みの Action を受信者ごとにステップ順で送信
//! - 受信者をまたいだ並行実行と同時実行数の制御
//! - タイムアウトと再試行の制御
//! - 成功基準による受信者の判定と実行の中断
//!
//! # モジュール構成
//!
//! - [`runner`][]: 受信者の解決からレポート作成までの入口
//! - [`executor`][]: 受信者ごとのステップ実行本体
//! - [`attempt`][]: 1ステップ分の試行の状態遷移
//! - [`criteria`][]: 成功基準の判定
//! - [`cancel`][]: 実行の中断
//! - [`result`][]: 実行結果型（ステップ&受信者）

pub mod attempt;
pub mod cancel;
pub mod criteria;
pub mod executor;
pub mod result;
pub mod runner;

// 公開APIの再エクスポート
pub use attempt::{AttemptMachine, AttemptState};
pub use cancel::{CancelSignal, RunHandle, cancellation};
pub use criteria::Verdict;
pub use executor::{ExecutionOutcome, FlowExecutor};
pub use result::{
    AttemptRecord, ExecutionError, RecipientRecord, RecipientState, RunError, StepResult,
    StepStatus,
};
pub use runner::FlowRunner;
