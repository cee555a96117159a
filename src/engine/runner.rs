//! フロー実行の組み立て
//!
//! # 責務
//!
//! 設定・解釈器・メッセージ送信・受信者データソースを受け取り、
//! 1つのフローを最初から最後まで実行してレポートを返す [`FlowRunner`] を提供します。
//!
//! # 処理フロー
//!
//! 1. 受信者を解決（失敗または0人の場合はレポートを作らずにエラー）
//! 2. 全ステップを Action に解釈
//! 3. フローの上書き値を反映した実行ポリシーと振り分け先を用意
//! 4. [`FlowExecutor`] で実行
//! 5. [`ReportBuilder`] でレポートを組み立て
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flow_tester::config::catalog::FlowCatalog;
//! use flow_tester::config::settings::Settings;
//! use flow_tester::engine::FlowRunner;
//! use flow_tester::interpreter::StepInterpreter;
//! use flow_tester::messaging::WebhookMessenger;
//! use flow_tester::recipients::JsonFileSource;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(None)?;
//!     let flow = FlowCatalog::load("flows/odometer.json")?;
//!
//!     let runner = FlowRunner::new(
//!         settings.clone(),
//!         StepInterpreter::rules_only(),
//!         Arc::new(WebhookMessenger::new(settings.messaging.clone())?),
//!         Arc::new(JsonFileSource::new(settings.clone())),
//!     );
//!     let report = runner.run(&flow).await?;
//!
//!     for line in report.summary_lines() {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::cancel::{CancelSignal, RunHandle, cancellation};
use super::executor::FlowExecutor;
use super::result::RunError;
use crate::config::action::Action;
use crate::config::flow::FlowDefinition;
use crate::config::settings::Settings;
use crate::dispatch::ToolDispatcher;
use crate::interpreter::StepInterpreter;
use crate::messaging::Messenger;
use crate::recipients::RecipientSource;
use crate::report::{ReportBuilder, RunReport, RunWindow};

/// フロー実行の入口
pub struct FlowRunner {
    settings: Settings,
    interpreter: StepInterpreter,
    messenger: Arc<dyn Messenger>,
    recipients: Arc<dyn RecipientSource>,
    worker_limit: Option<usize>,
    handle: RunHandle,
    signal: CancelSignal,
}

impl FlowRunner {
    pub fn new(
        settings: Settings,
        interpreter: StepInterpreter,
        messenger: Arc<dyn Messenger>,
        recipients: Arc<dyn RecipientSource>,
    ) -> Self {
        let (handle, signal) = cancellation();
        Self {
            settings,
            interpreter,
            messenger,
            recipients,
            worker_limit: None,
            handle,
            signal,
        }
    }

    /// 同時実行数の上限を設定値から上書きする
    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = Some(limit.max(1));
        self
    }

    /// 実行を中断するためのハンドル
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    /// 送信せずに全ステップを解釈する（ドライラン）
    pub async fn plan(&self, flow: &FlowDefinition) -> Vec<Action> {
        self.interpreter.interpret_all(flow).await
    }

    /// フローを実行してレポートを返す
    ///
    /// # エラー
    ///
    /// - [`RunError::DataSource`] - 受信者データを読み込めない
    /// - [`RunError::NoRecipients`] - 受信者が0人
    ///
    /// 送信の失敗はエラーではなく、レポートの中に記録されます。
    pub async fn run(&self, flow: &FlowDefinition) -> Result<RunReport, RunError> {
        let recipients = self.recipients.resolve(flow).await?;
        if recipients.is_empty() {
            return Err(RunError::NoRecipients(flow.trigger().to_string()));
        }

        let started_at = Utc::now();
        let actions: Arc<[Action]> = self.interpreter.interpret_all(flow).await.into();

        let mut policy = self.settings.policy(flow);
        if let Some(limit) = self.worker_limit {
            policy.worker_limit = limit;
        }
        let dispatcher = ToolDispatcher::standard(
            Arc::clone(&self.messenger),
            self.settings.media_resolver(flow),
        );
        let executor = FlowExecutor::new(dispatcher, policy)
            .with_reset_message(self.settings.execution.reset_message.clone());

        let outcome = executor
            .execute(
                Arc::new(flow.clone()),
                actions,
                recipients,
                self.signal.clone(),
            )
            .await;

        let window = RunWindow {
            started_at,
            finished_at: Utc::now(),
        };
        let report = ReportBuilder::build(flow, &outcome.records, window, outcome.aborted);
        info!(
            trigger = flow.trigger(),
            passed = report.summary.passed,
            failed = report.summary.failed,
            aborted = report.summary.aborted,
            "レポートを作成しました"
        );
        Ok(report)
    }
}
