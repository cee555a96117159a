//! フローカタログ
//!
//! # 責務
//!
//! - フロー定義ディレクトリの走査（遅延・再開可能なシーケンス）
//! - 個別ドキュメントの読み込みとバリデーション
//! - フロー定義の保存（テンプレート作成）
//! - 実行前の前提条件チェック（データソース、メディアファイル）
//!
//! 走査順はファイルシステム順で、プラットフォーム間で安定しません。
//! 表示用にのみ並べ替えて使用してください。

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::flow::{DocumentFormat, FlowDefinition};
use super::settings::Settings;
use crate::error::FlowError;

/// フロー定義ディレクトリ
#[derive(Debug, Clone)]
pub struct FlowCatalog {
    directory: PathBuf,
}

/// 走査で見つかった1ドキュメント
#[derive(Debug)]
pub struct DiscoveredFlow {
    pub path: PathBuf,
    pub result: Result<FlowDefinition, FlowError>,
}

/// フロー定義の遅延シーケンス
///
/// ドキュメントは `next()` のたびに1件ずつ読み込まれます。
/// 再走査するには [`FlowCatalog::discover`] を再度呼び出してください。
pub struct Discovery {
    entries: Option<fs::ReadDir>,
}

impl Iterator for Discovery {
    type Item = DiscoveredFlow;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        for entry in entries.by_ref() {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "ディレクトリエントリの読み込みに失敗しました");
                    continue;
                }
            };
            if !path.is_file() || DocumentFormat::from_path(&path).is_none() {
                continue;
            }
            let result = FlowCatalog::load(&path);
            if let Err(e) = &result {
                warn!(path = %path.display(), error = %e, "無効なフロー定義です");
            }
            return Some(DiscoveredFlow { path, result });
        }
        None
    }
}

/// 前提条件チェックの結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequirementReport {
    /// 実行を妨げる問題
    pub errors: Vec<String>,
    /// 実行は可能だが注意が必要な問題
    pub warnings: Vec<String>,
}

impl RequirementReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl FlowCatalog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// ディレクトリ内の `*.json` / `*.toml` を走査
    ///
    /// ディレクトリが存在しない場合は警告を出して空のシーケンスを返します。
    pub fn discover(&self) -> Discovery {
        match fs::read_dir(&self.directory) {
            Ok(entries) => Discovery {
                entries: Some(entries),
            },
            Err(e) => {
                warn!(directory = %self.directory.display(), error = %e, "フローディレクトリが見つかりません");
                Discovery { entries: None }
            }
        }
    }

    /// トリガー名でフローを検索
    pub fn find(&self, trigger: &str) -> Option<FlowDefinition> {
        self.discover()
            .filter_map(|d| d.result.ok())
            .find(|flow| flow.trigger() == trigger)
    }

    /// ファイルからフロー定義を読み込む
    ///
    /// # エラー
    ///
    /// - [`FlowError::Read`] - ファイルの読み込みに失敗
    /// - [`FlowError::Malformed`] - 必須フィールドの欠落・型不一致、未対応の拡張子
    /// - [`FlowError::ValidationRule`] - 検証ルールが不正
    pub fn load(path: impl AsRef<Path>) -> Result<FlowDefinition, FlowError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let format = DocumentFormat::from_path(path)
            .ok_or_else(|| FlowError::malformed(&origin, "拡張子は .json または .toml である必要があります"))?;
        let content = fs::read_to_string(path).map_err(|source| FlowError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let flow = FlowDefinition::parse(&content, format, &origin)?;
        debug!(trigger = flow.trigger(), steps = flow.steps().len(), "フロー定義を読み込みました");
        Ok(flow)
    }

    /// フロー定義をディレクトリに保存
    ///
    /// ファイル名は `<trigger>.<拡張子>` です。保存先のパスを返します。
    ///
    /// # エラー
    ///
    /// - [`FlowError::Malformed`] - トリガー名がパス区切り文字を含む
    /// - [`FlowError::Write`] - 書き込みに失敗
    pub fn save(&self, flow: &FlowDefinition, format: DocumentFormat) -> Result<PathBuf, FlowError> {
        if flow.trigger().contains(['/', '\\']) {
            return Err(FlowError::malformed(
                flow.trigger(),
                "トリガー名にパス区切り文字は使えません",
            ));
        }
        let content = flow.serialize(format)?;
        let path = self
            .directory
            .join(format!("{}.{}", flow.trigger(), format.extension()));
        fs::create_dir_all(&self.directory)
            .and_then(|_| fs::write(&path, content))
            .map_err(|source| FlowError::Write {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "フロー定義を保存しました");
        Ok(path)
    }

    /// 実行前の前提条件をチェック
    ///
    /// 指定されたデータソースが無い場合はエラー、
    /// ステップが参照するメディアファイルが無い場合は警告になります。
    pub fn check_requirements(flow: &FlowDefinition, settings: &Settings) -> RequirementReport {
        let mut report = RequirementReport::default();

        if let Err(e) = settings.resolve_data_source(flow.data_source()) {
            report.errors.push(e.to_string());
        }

        let resolver = settings.media_resolver(flow);
        for (kind, files) in flow.media_requirements() {
            for file in files {
                if resolver.resolve(&file).is_none() {
                    report
                        .warnings
                        .push(format!("{} ファイルが見つかりません: {}", kind, file));
                }
            }
        }

        report
    }
}
