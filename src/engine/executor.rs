//! フロー実行エンジン
//!
//! # 責務
//!
//! このモジュールは、1つのフローを複数の受信者に対して実行する
//! [`FlowExecutor`] を提供します。
//!
//! # 実行フロー
//!
//! 1. 受信者ごとにタスクを起動（同時実行数は `worker_limit` まで）
//! 2. 各タスクはステップ番号順に Action を1つずつ送信
//!    - 解釈できなかった Action と許可値違反は送信せずに失敗
//!    - 一時的な失敗は `max_retries` 回まで `execution_delay` を挟んで再試行
//!    - 各試行は `timeout` で打ち切り
//! 3. ステップが失敗したら成功基準を再評価し、届かなければ残りをスキップ
//! 4. 全ステップの結果から受信者の最終状態を決定
//!
//! 1人の受信者のステップが並行・前後して送られることはありません。
//! 受信者同士は独立しており、共有するのは読み取り専用のフロー定義と
//! 実行ポリシーだけです。
//!
//! # 中断
//!
//! [`CancelSignal`] が中断を示すと、新しい受信者は開始されません。
//! 実行中の受信者は送信中のステップを最後まで終え、残りのステップを
//! スキップして `Aborted` になります。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::attempt::{AttemptMachine, AttemptState, millis};
use super::cancel::CancelSignal;
use super::criteria;
use super::result::{ExecutionError, RecipientRecord, RecipientState, StepResult, StepStatus};
use crate::config::action::{Action, ActionPayload, ActionSource};
use crate::config::flow::FlowDefinition;
use crate::config::settings::RunPolicy;
use crate::dispatch::ToolDispatcher;
use crate::messaging::{Conversation, Delivery, Receipt};
use crate::recipients::Recipient;

/// フロー実行の結果
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// 受信者の入力順に並んだ実行記録
    pub records: Vec<RecipientRecord>,
    /// 中断されたかどうか
    pub aborted: bool,
}

/// フロー実行エンジン
///
/// # フィールド
///
/// - `dispatcher`: ツール種別ごとの送信先
/// - `policy`: 再試行・タイムアウト・同時実行数（実行中は不変）
/// - `reset_message`: 複数受信者の実行前に送る会話リセットメッセージ
#[derive(Clone)]
pub struct FlowExecutor {
    dispatcher: ToolDispatcher,
    policy: RunPolicy,
    reset_message: Option<String>,
}

type Owners = HashMap<Id, (usize, Recipient)>;

impl FlowExecutor {
    pub fn new(dispatcher: ToolDispatcher, policy: RunPolicy) -> Self {
        Self {
            dispatcher,
            policy,
            reset_message: None,
        }
    }

    /// 会話リセットメッセージを設定
    ///
    /// 受信者が2人以上のとき、ステップ1の前に送ります。
    /// 送信に失敗しても警告のみで実行を続けます。
    pub fn with_reset_message(mut self, message: Option<String>) -> Self {
        self.reset_message = message.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    /// フローを全受信者に対して実行
    ///
    /// # 引数
    ///
    /// - `flow`: 実行するフロー定義
    /// - `actions`: 解釈済みの Action（ステップ番号順）
    /// - `recipients`: 受信者（結果もこの順に並ぶ）
    /// - `cancel`: 中断の監視側
    pub async fn execute(
        &self,
        flow: Arc<FlowDefinition>,
        actions: Arc<[Action]>,
        recipients: Vec<Recipient>,
        mut cancel: CancelSignal,
    ) -> ExecutionOutcome {
        let total = recipients.len();
        let send_reset = total > 1;
        let limit = self.policy.worker_limit.max(1);
        let worker = Arc::new(self.clone());

        let mut slots: Vec<Option<RecipientRecord>> = (0..total).map(|_| None).collect();
        let mut owners: Owners = HashMap::new();
        let mut tasks: JoinSet<RecipientRecord> = JoinSet::new();
        let mut aborted = false;

        info!(
            trigger = flow.trigger(),
            recipients = total,
            steps = actions.len(),
            workers = limit,
            "フローの実行を開始します"
        );

        let mut queue = recipients.into_iter().enumerate();
        while let Some((index, recipient)) = queue.next() {
            if tasks.len() >= limit {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    Some(joined) = tasks.join_next_with_id() => {
                        collect(joined, &mut slots, &mut owners, &actions);
                    }
                }
            }

            if cancel.is_cancelled() {
                aborted = true;
                let unstarted = total - index;
                warn!(unstarted, "中断されたため、残りの受信者は開始しません");
                slots[index] = Some(RecipientRecord::never_started(recipient, &actions));
                for (index, recipient) in queue.by_ref() {
                    slots[index] = Some(RecipientRecord::never_started(recipient, &actions));
                }
                break;
            }

            let worker = Arc::clone(&worker);
            let flow = Arc::clone(&flow);
            let actions = Arc::clone(&actions);
            let signal = cancel.clone();
            let owned = recipient.clone();
            let handle = tasks.spawn(async move {
                worker
                    .run_recipient(&flow, &actions, recipient, send_reset, &signal)
                    .await
            });
            owners.insert(handle.id(), (index, owned));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            collect(joined, &mut slots, &mut owners, &actions);
        }

        let aborted = aborted || cancel.is_cancelled();
        let records: Vec<RecipientRecord> = slots.into_iter().flatten().collect();
        info!(
            trigger = flow.trigger(),
            succeeded = records.iter().filter(|r| r.state == RecipientState::Succeeded).count(),
            failed = records.iter().filter(|r| r.state == RecipientState::Failed).count(),
            aborted,
            "フローの実行が完了しました"
        );
        ExecutionOutcome { records, aborted }
    }

    /// 1人の受信者に対して全ステップを順に実行
    async fn run_recipient(
        &self,
        flow: &FlowDefinition,
        actions: &[Action],
        recipient: Recipient,
        send_reset: bool,
        cancel: &CancelSignal,
    ) -> RecipientRecord {
        let mut record = RecipientRecord::new(recipient);
        record.state = RecipientState::Running;
        info!(recipient = record.recipient.display_name(), "受信者の実行を開始します");

        let mut reply_to: Option<String> = None;
        if send_reset {
            reply_to = self.send_reset(&record.recipient).await;
        }

        for (index, action) in actions.iter().enumerate() {
            if cancel.is_cancelled() {
                record.steps.extend(actions[index..].iter().map(StepResult::skipped));
                record.state = RecipientState::Aborted;
                warn!(
                    recipient = record.recipient.display_name(),
                    skipped = actions.len() - index,
                    "中断されました"
                );
                return record;
            }

            if index > 0 && !self.policy.step_delay.is_zero() {
                tokio::time::sleep(self.policy.step_delay).await;
            }

            let to = Conversation::new(&record.recipient).replying_to(reply_to.as_deref());
            let (result, reply) = self.run_step(flow, action, to).await;
            if reply.is_some() {
                reply_to = reply;
            }

            let failed = result.status == StepStatus::Failed;
            record.steps.push(result);

            let rest = &actions[index + 1..];
            let remaining = rest.len();
            if failed && remaining > 0 && !criteria::still_reachable(flow, &record.steps, rest) {
                info!(
                    recipient = record.recipient.display_name(),
                    ordinal = action.ordinal(),
                    skipped = remaining,
                    "成功基準に届かないため残りのステップをスキップします"
                );
                record
                    .steps
                    .extend(rest.iter().map(StepResult::skipped));
                break;
            }
        }

        let verdict = criteria::evaluate(flow, &record.steps);
        record.state = if verdict.passed {
            RecipientState::Succeeded
        } else {
            RecipientState::Failed
        };
        info!(
            recipient = record.recipient.display_name(),
            state = ?record.state,
            completed = verdict.completed_steps,
            required = verdict.required_steps,
            "受信者の実行が完了しました"
        );
        record
    }

    /// 会話リセットメッセージを送り、返信先IDを返す
    async fn send_reset(&self, recipient: &Recipient) -> Option<String> {
        let message = self.reset_message.as_ref()?;
        let reset = Action::new(
            0,
            ActionPayload::Text {
                body: message.clone(),
            },
            ActionSource::Rule,
        );
        match self.attempt(&reset, Conversation::new(recipient)).await {
            Ok(receipt) => {
                debug!(recipient = recipient.display_name(), "会話をリセットしました");
                receipt.reply_id
            }
            Err(e) => {
                warn!(recipient = recipient.display_name(), error = %e, "会話のリセットに失敗しました");
                None
            }
        }
    }

    /// 1ステップを実行して確定した結果を返す
    ///
    /// 2つ目の戻り値はボットの最新メッセージID（次のステップの返信先）です。
    async fn run_step(
        &self,
        flow: &FlowDefinition,
        action: &Action,
        to: Conversation<'_>,
    ) -> (StepResult, Option<String>) {
        if !action.is_valid() {
            let body = action.payload().field_value("body").unwrap_or_default();
            let error = ExecutionError::LowConfidence(body);
            warn!(ordinal = action.ordinal(), error = %error, "低信頼度のステップは送信しません");
            return (StepResult::rejected(action, &error), None);
        }
        if let Err(reason) = flow.check_action(action) {
            let error = ExecutionError::DisallowedValue(reason);
            warn!(ordinal = action.ordinal(), error = %error, "検証ルールに違反するため送信しません");
            return (StepResult::rejected(action, &error), None);
        }

        let started = Instant::now();
        let mut machine = AttemptMachine::new(self.policy.max_retries);
        let mut receipt: Option<Receipt> = None;
        let mut last_error: Option<ExecutionError> = None;

        while let Some(attempt) = machine.begin() {
            let attempt_started = Instant::now();
            let outcome = self.attempt(action, to).await;
            let state = machine.finish(
                outcome.as_ref().map(|_| ()),
                attempt_started.elapsed(),
            );

            match outcome {
                Ok(r) => receipt = Some(r),
                Err(e) => {
                    warn!(
                        recipient = to.recipient.display_name(),
                        ordinal = action.ordinal(),
                        attempt,
                        retryable = e.is_retryable(),
                        error = %e,
                        "送信に失敗しました"
                    );
                    last_error = Some(e);
                }
            }

            if let AttemptState::Retrying { .. } = state
                && !self.policy.execution_delay.is_zero()
            {
                tokio::time::sleep(self.policy.execution_delay).await;
            }
        }

        let attempt_count = machine.attempts();
        let status = match machine.state() {
            AttemptState::Succeeded { .. } => StepStatus::Succeeded,
            _ => StepStatus::Failed,
        };
        let (flags, reply_id, error) = match (status, receipt) {
            (StepStatus::Succeeded, Some(receipt)) => (receipt.flags, receipt.reply_id, None),
            _ => (
                Default::default(),
                None,
                last_error.map(|e| {
                    if e.is_retryable() {
                        format!("再試行の上限 ({} 回) に達しました: {}", attempt_count, e)
                    } else {
                        e.to_string()
                    }
                }),
            ),
        };

        debug!(
            ordinal = action.ordinal(),
            tool = %action.tool(),
            status = ?status,
            attempt_count,
            "ステップが完了しました"
        );

        let result = StepResult {
            ordinal: action.ordinal(),
            tool: action.tool(),
            status,
            attempt_count,
            latency_ms: millis(started.elapsed()),
            error,
            flags,
            attempts: machine.into_records(),
        };
        (result, reply_id)
    }

    /// タイムアウト付きで1回送信し、結果を分類する
    async fn attempt(&self, action: &Action, to: Conversation<'_>) -> Result<Receipt, ExecutionError> {
        let sent = tokio::time::timeout(self.policy.timeout, self.dispatcher.send(action, to)).await;
        match sent {
            Err(_) => Err(ExecutionError::timeout(action.ordinal(), self.policy.timeout)),
            Ok(Err(e)) => Err(ExecutionError::from(e)),
            Ok(Ok(Delivery::Succeeded(receipt))) => Ok(receipt),
            Ok(Ok(Delivery::Transient(reason))) => Err(ExecutionError::Transient(reason)),
            Ok(Ok(Delivery::Permanent(reason))) => Err(ExecutionError::Permanent(reason)),
        }
    }
}

/// 終了したタスクの記録を入力順の位置に格納する
///
/// タスクが異常終了した場合、その受信者は全ステップをスキップした
/// 失敗として記録します。
fn collect(
    joined: Result<(Id, RecipientRecord), JoinError>,
    slots: &mut [Option<RecipientRecord>],
    owners: &mut Owners,
    actions: &[Action],
) {
    match joined {
        Ok((id, record)) => {
            if let Some((index, _)) = owners.remove(&id) {
                slots[index] = Some(record);
            }
        }
        Err(join_error) => {
            if let Some((index, recipient)) = owners.remove(&join_error.id()) {
                error!(
                    recipient = recipient.display_name(),
                    error = %join_error,
                    "受信者のタスクが異常終了しました"
                );
                let mut record = RecipientRecord::never_started(recipient, actions);
                record.state = RecipientState::Failed;
                slots[index] = Some(record);
            }
        }
    }
}
