//! フロー定義ドキュメントのデシリアライズ用 DTO (Data Transfer Object)
//!
//! # 責務
//!
//! このモジュールは、JSON / TOML ファイルからのデータ読み込み専用の構造体を提供します。
//! DTO はバリデーション前の「生データ」を表現し、ドメインモデルとは分離されています。
//!
//! ## 変換フロー
//!
//! ```text
//! JSON / TOML ファイル
//!   ↓ (デシリアライズ)
//! FlowDocumentDto
//!   ↓ (FlowDefinition::from_dto でバリデーション)
//! FlowDefinition (ドメインモデル)
//! ```
//!
//! 必須フィールドも `Option` で受け取り、欠落をドメイン側で
//! 具体的なエラーメッセージとして報告できるようにしています。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// フロー定義 DTO
///
/// **注**: この構造体は config モジュール内部の実装詳細です。
/// 外部からは [`FlowDefinition`](super::flow::FlowDefinition) を使用してください。
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct FlowDocumentDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) trigger: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) data_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) user_count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) timeout_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) retry_count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) flow_steps: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) media_paths: Vec<String>,

    /// 旧形式: トップレベルに置かれた必須メディア種別
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) required_media: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) validation_rules: Option<ValidationRulesDto>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) success_criteria: Option<SuccessCriteriaDto>,
}

/// 検証ルール DTO
///
/// `allowed_values` テーブルの他に、フィールド名を直接キーにした
/// 許可値リスト（`"body": ["yes", "no"]`）も受け付けます。
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct ValidationRulesDto {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) required_media: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(super) allowed_values: BTreeMap<String, Vec<String>>,

    #[serde(flatten)]
    pub(super) fields: BTreeMap<String, serde_json::Value>,
}

/// 成功基準 DTO
///
/// `"voice_transcribed": true` のような真偽値エントリは必須フラグとして扱います。
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct SuccessCriteriaDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) min_steps_completed: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(super) required_flags: Vec<String>,

    #[serde(flatten)]
    pub(super) flags: BTreeMap<String, serde_json::Value>,
}
