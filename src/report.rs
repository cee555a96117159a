//! 実行レポート
//!
//! # 責務
//!
//! - 実行記録とフロー定義から [`RunReport`] を組み立てる [`ReportBuilder`]
//! - レポートの保存先を抽象化する [`ReportSink`] トレイト（[`sink`] モジュール）
//!
//! [`ReportBuilder::build`] は入力だけに依存する純粋な関数です。同じ入力からは
//! バイト単位で同一の JSON が得られます（現在時刻は [`RunWindow`] として
//! 呼び出し側が渡します）。
//!
//! # 出力例
//!
//! ```json
//! {
//!   "trigger": "odometer",
//!   "status": "completed",
//!   "started_at": "2026-10-19T09:00:00Z",
//!   "summary": { "recipients": 2, "passed": 2, "failed": 0, "aborted": 0, ... },
//!   "recipients": [
//!     { "recipient": { "id": "919700000001" }, "verdict": "passed", "steps": [ ... ] }
//!   ]
//! }
//! ```

pub mod sink;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::flow::{FlowDefinition, MediaKind};
use crate::engine::criteria;
use crate::engine::result::{RecipientRecord, RecipientState, StepResult, StepStatus};
use crate::recipients::Recipient;

pub use sink::{JsonFileSink, ReportSink};

/// 実行の開始・終了時刻
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunWindow {
    /// 開始時刻から終了時刻までのミリ秒（負にはならない）
    fn duration_ms(&self) -> u64 {
        u64::try_from((self.finished_at - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}

/// 実行全体のステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// 受信者ごとの判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientVerdict {
    Passed,
    Failed,
    Aborted,
}

/// フローの成功基準（レポートに記録する形）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriteriaSummary {
    pub min_steps_completed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_flags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_media: Vec<MediaKind>,
}

/// 集計
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub recipients: usize,
    pub passed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub total_steps: usize,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub retries: u32,
}

/// 受信者1人分のレポート
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientReport {
    pub recipient: Recipient,
    pub verdict: RecipientVerdict,
    pub state: RecipientState,
    pub completed_steps: usize,
    pub required_steps: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_flags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_media: Vec<MediaKind>,
    pub retries: u32,
    pub latency_ms: u64,
    pub steps: Vec<StepResult>,
}

/// フロー1回分の実行レポート
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub trigger: String,
    pub description: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success_criteria: CriteriaSummary,
    pub summary: RunSummary,
    pub recipients: Vec<RecipientReport>,
}

impl RunReport {
    /// 整形済み JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// 全受信者が成功基準を満たしたかどうか
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.summary.passed == self.summary.recipients
    }

    /// コンソール表示用の要約
    pub fn summary_lines(&self) -> Vec<String> {
        let s = &self.summary;
        let mut lines = vec![
            format!("Flow: {} ({:?})", self.trigger, self.status),
            format!(
                "Recipients: {} passed / {} failed / {} aborted (total {})",
                s.passed, s.failed, s.aborted, s.recipients
            ),
            format!(
                "Steps: {} succeeded / {} failed / {} skipped (total {}, retries {})",
                s.succeeded_steps, s.failed_steps, s.skipped_steps, s.total_steps, s.retries
            ),
            format!("Duration: {} ms", self.duration_ms),
        ];
        for recipient in &self.recipients {
            lines.push(format!(
                "  {} [{:?}] {}/{} steps",
                recipient.recipient.display_name(),
                recipient.verdict,
                recipient.completed_steps,
                recipient.required_steps
            ));
            for step in recipient.steps.iter().filter(|s| s.status == StepStatus::Failed) {
                lines.push(format!(
                    "    step {} ({}): {}",
                    step.ordinal,
                    step.tool,
                    step.error.as_deref().unwrap_or("failed")
                ));
            }
        }
        lines
    }
}

/// 実行レポートの組み立て
pub struct ReportBuilder;

impl ReportBuilder {
    /// 実行記録からレポートを組み立てる
    ///
    /// # 引数
    ///
    /// - `flow`: 実行したフロー定義（成功基準の出所）
    /// - `records`: 受信者ごとの実行記録（この順にレポートに並ぶ）
    /// - `window`: 実行の開始・終了時刻
    /// - `aborted`: 実行が中断されたかどうか
    pub fn build(
        flow: &FlowDefinition,
        records: &[RecipientRecord],
        window: RunWindow,
        aborted: bool,
    ) -> RunReport {
        let recipients: Vec<RecipientReport> =
            records.iter().map(|record| Self::recipient_report(flow, record)).collect();

        let mut summary = RunSummary {
            recipients: recipients.len(),
            ..RunSummary::default()
        };
        for report in &recipients {
            match report.verdict {
                RecipientVerdict::Passed => summary.passed += 1,
                RecipientVerdict::Failed => summary.failed += 1,
                RecipientVerdict::Aborted => summary.aborted += 1,
            }
            summary.retries += report.retries;
            for step in &report.steps {
                summary.total_steps += 1;
                match step.status {
                    StepStatus::Succeeded => summary.succeeded_steps += 1,
                    StepStatus::Failed => summary.failed_steps += 1,
                    StepStatus::Skipped => summary.skipped_steps += 1,
                    StepStatus::Retried => {}
                }
            }
        }

        RunReport {
            trigger: flow.trigger().to_string(),
            description: flow.description().to_string(),
            status: if aborted {
                RunStatus::Aborted
            } else {
                RunStatus::Completed
            },
            started_at: window.started_at,
            finished_at: window.finished_at,
            duration_ms: window.duration_ms(),
            success_criteria: CriteriaSummary {
                min_steps_completed: flow.min_steps_required(),
                required_flags: flow.success_criteria().required_flags().iter().cloned().collect(),
                required_media: flow.validation_rules().required_media().iter().copied().collect(),
            },
            summary,
            recipients,
        }
    }

    fn recipient_report(flow: &FlowDefinition, record: &RecipientRecord) -> RecipientReport {
        let verdict = criteria::evaluate(flow, &record.steps);
        RecipientReport {
            recipient: record.recipient.clone(),
            verdict: match (record.state, verdict.passed) {
                (RecipientState::Aborted, _) => RecipientVerdict::Aborted,
                (RecipientState::Succeeded, true) => RecipientVerdict::Passed,
                _ => RecipientVerdict::Failed,
            },
            state: record.state,
            completed_steps: verdict.completed_steps,
            required_steps: verdict.required_steps,
            missing_flags: verdict.missing_flags,
            missing_media: verdict.missing_media,
            retries: record.steps.iter().map(StepResult::retries).sum(),
            latency_ms: record.steps.iter().map(|s| s.latency_ms).sum(),
            steps: record.steps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::action::ToolKind;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn window() -> RunWindow {
        RunWindow {
            started_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
            finished_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 42).unwrap(),
        }
    }

    fn step(ordinal: u32, status: StepStatus, attempt_count: u32) -> StepResult {
        StepResult {
            ordinal,
            tool: ToolKind::Text,
            status,
            attempt_count,
            latency_ms: 10,
            error: (status == StepStatus::Failed).then(|| "送信に失敗しました: 400".to_string()),
            flags: BTreeSet::new(),
            attempts: Vec::new(),
        }
    }

    fn record(id: &str, state: RecipientState, steps: Vec<StepResult>) -> RecipientRecord {
        RecipientRecord {
            recipient: Recipient::new(id),
            state,
            steps,
        }
    }

    #[test]
    fn test_failed_state_is_never_passed() {
        // 実行タスクの異常終了で Failed になった受信者は、基準が緩くても不合格
        let flow = FlowDefinition::from_json(
            r#"{"trigger": "t", "flow_steps": ["a", "b"], "success_criteria": {"min_steps_completed": 0}}"#,
        )
        .unwrap();
        let records = vec![record(
            "1",
            RecipientState::Failed,
            vec![step(1, StepStatus::Skipped, 0), step(2, StepStatus::Skipped, 0)],
        )];

        let report = ReportBuilder::build(&flow, &records, window(), false);

        assert_eq!(report.recipients[0].verdict, RecipientVerdict::Failed);
        assert_eq!(report.summary.failed, 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_build_counts_and_verdicts() {
        let flow = FlowDefinition::new("odometer", "Odometer flow", ["a", "b", "c"]);
        let records = vec![
            record(
                "1",
                RecipientState::Succeeded,
                vec![
                    step(1, StepStatus::Succeeded, 1),
                    step(2, StepStatus::Succeeded, 3),
                    step(3, StepStatus::Succeeded, 1),
                ],
            ),
            record(
                "2",
                RecipientState::Failed,
                vec![
                    step(1, StepStatus::Failed, 1),
                    step(2, StepStatus::Skipped, 0),
                    step(3, StepStatus::Skipped, 0),
                ],
            ),
            record(
                "3",
                RecipientState::Aborted,
                vec![
                    step(1, StepStatus::Skipped, 0),
                    step(2, StepStatus::Skipped, 0),
                    step(3, StepStatus::Skipped, 0),
                ],
            ),
        ];

        let report = ReportBuilder::build(&flow, &records, window(), true);

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.duration_ms, 42_000);
        assert_eq!(report.success_criteria.min_steps_completed, 2);
        assert_eq!(
            report
                .recipients
                .iter()
                .map(|r| r.verdict)
                .collect::<Vec<_>>(),
            vec![
                RecipientVerdict::Passed,
                RecipientVerdict::Failed,
                RecipientVerdict::Aborted
            ]
        );
        assert_eq!(
            report.summary,
            RunSummary {
                recipients: 3,
                passed: 1,
                failed: 1,
                aborted: 1,
                total_steps: 9,
                succeeded_steps: 3,
                failed_steps: 1,
                skipped_steps: 5,
                retries: 2,
            }
        );
        assert!(!report.is_success());
    }

    #[test]
    fn test_build_is_byte_identical() {
        let flow = FlowDefinition::new("t", "", ["a"]);
        let records = vec![record(
            "1",
            RecipientState::Succeeded,
            vec![step(1, StepStatus::Succeeded, 1)],
        )];

        let first = ReportBuilder::build(&flow, &records, window(), false).to_json().unwrap();
        let second = ReportBuilder::build(&flow, &records, window(), false).to_json().unwrap();
        assert_eq!(first, second);
        assert!(first.contains("\"started_at\": \"2026-10-19T09:00:00Z\""));
        assert!(first.contains("\"verdict\": \"passed\""));
    }

    #[test]
    fn test_summary_lines_list_failures() {
        let flow = FlowDefinition::new("t", "", ["a", "b"]);
        let records = vec![record(
            "919700000001",
            RecipientState::Failed,
            vec![step(1, StepStatus::Failed, 1), step(2, StepStatus::Skipped, 0)],
        )];
        let lines = ReportBuilder::build(&flow, &records, window(), false).summary_lines();

        assert!(lines[0].starts_with("Flow: t"));
        assert!(lines.iter().any(|l| l.contains("919700000001 [Failed] 0/1 steps")));
        assert!(lines.iter().any(|l| l.contains("step 1 (text): 送信に失敗しました")));
    }
}
