//! レポートの保存先
//!
//! コアは [`RunReport`] の値を返すだけで、保存形式は [`ReportSink`] の
//! 実装が決めます。標準の実装は JSON ファイルに書き出す [`JsonFileSink`] です。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::RunReport;
use crate::error::ReportError;

/// レポートの保存先
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// レポートを保存し、保存場所を返す
    async fn persist(&self, report: &RunReport) -> Result<PathBuf, ReportError>;
}

/// `<directory>/<trigger>_<開始時刻>.json` に書き出す
pub struct JsonFileSink {
    directory: PathBuf,
}

impl JsonFileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// レポートのファイル名
    pub fn file_name(report: &RunReport) -> String {
        let trigger: String = report
            .trigger
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{}_{}.json",
            trigger,
            report.started_at.format("%Y-%m-%d_%H-%M-%S")
        )
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn persist(&self, report: &RunReport) -> Result<PathBuf, ReportError> {
        let json = report.to_json()?;
        let path = self.directory.join(Self::file_name(report));

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| ReportError::Write {
                path: self.directory.clone(),
                source,
            })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| ReportError::Write {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "レポートを保存しました");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::flow::FlowDefinition;
    use crate::report::{ReportBuilder, RunWindow};
    use chrono::{TimeZone, Utc};

    fn report(trigger: &str) -> RunReport {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 5, 7).unwrap();
        ReportBuilder::build(
            &FlowDefinition::new(trigger, "", ["a"]),
            &[],
            RunWindow {
                started_at: at,
                finished_at: at,
            },
            false,
        )
    }

    #[test]
    fn test_file_name_is_sanitized() {
        assert_eq!(
            JsonFileSink::file_name(&report("expense claim/v2")),
            "expense_claim_v2_2026-10-19_09-05-07.json"
        );
    }

    #[tokio::test]
    async fn test_persist_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("reports").join("flow_results"));

        let path = sink.persist(&report("odometer")).await.unwrap();

        assert!(path.starts_with(sink.directory()));
        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["trigger"], "odometer");
        assert_eq!(json["status"], "completed");
    }
}
