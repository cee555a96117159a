//! 送信試行の状態機械
//!
//! 1つの Action の再試行を、ループカウンタではなく明示的な状態遷移で
//! 表現します。I/O を持たないため単体でテストできます。
//!
//! ```text
//! Pending ──begin──▶ Attempting ──finish(ok)──────────────▶ Succeeded
//!                      ▲   │
//!                      │   ├──finish(一時的, 残りあり)──▶ Retrying ──begin──┐
//!                      │   │                                                │
//!                      └───┼────────────────────────────────────────────────┘
//!                          └──finish(恒久的 or 上限到達)──▶ Failed
//! ```

use std::time::Duration;

use super::result::{AttemptRecord, ExecutionError, StepStatus};

/// 試行の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32 },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// 1つの Action の試行を管理する状態機械
#[derive(Debug, Clone)]
pub struct AttemptMachine {
    max_attempts: u32,
    state: AttemptState,
    records: Vec<AttemptRecord>,
}

impl AttemptMachine {
    /// # 引数
    ///
    /// - `max_retries`: 一時的な失敗のあとに再試行する最大回数
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            state: AttemptState::Pending,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// 次の試行を開始する
    ///
    /// `Pending` または `Retrying` からのみ遷移でき、開始した試行番号
    /// （1始まり）を返します。それ以外の状態では `None` です。
    pub fn begin(&mut self) -> Option<u32> {
        let attempt = match self.state {
            AttemptState::Pending => 1,
            AttemptState::Retrying { attempt } => attempt + 1,
            _ => return None,
        };
        self.state = AttemptState::Attempting { attempt };
        Some(attempt)
    }

    /// 試行の結果を記録して次の状態へ遷移する
    ///
    /// `Attempting` 以外で呼ばれた場合は何もしません。
    pub fn finish(&mut self, outcome: Result<(), &ExecutionError>, latency: Duration) -> AttemptState {
        let AttemptState::Attempting { attempt } = self.state else {
            return self.state;
        };

        let (next, status) = match outcome {
            Ok(()) => (
                AttemptState::Succeeded { attempts: attempt },
                StepStatus::Succeeded,
            ),
            Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                (AttemptState::Retrying { attempt }, StepStatus::Retried)
            }
            Err(_) => (AttemptState::Failed { attempts: attempt }, StepStatus::Failed),
        };

        self.records.push(AttemptRecord {
            attempt,
            status,
            latency_ms: millis(latency),
            error: outcome.err().map(ToString::to_string),
        });
        self.state = next;
        next
    }

    /// 開始済みの試行回数
    pub fn attempts(&self) -> u32 {
        match self.state {
            AttemptState::Pending => 0,
            AttemptState::Attempting { attempt } | AttemptState::Retrying { attempt } => attempt,
            AttemptState::Succeeded { attempts } | AttemptState::Failed { attempts } => attempts,
        }
    }

    pub fn into_records(self) -> Vec<AttemptRecord> {
        self.records
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
