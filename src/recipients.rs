//! 受信者データソース
//!
//! # 責務
//!
//! - 受信者 [`Recipient`] の型定義
//! - フロー定義のデータソースから受信者を解決する [`RecipientSource`] トレイト
//! - JSON ファイルから受信者を読み込む [`JsonFileSource`]
//!
//! ## JSON ファイル形式
//!
//! ```json
//! [
//!   { "Employee Phone": "919700000001", "Employee Name": "Asha", "Team": "Field" },
//!   { "phone": "919700000002", "name": "Ravi" }
//! ]
//! ```
//!
//! 電話番号と名前はいくつかの列名を順に探します。それ以外の文字列・数値の
//! 列はメタデータとして保持されます。

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::flow::FlowDefinition;
use crate::config::settings::Settings;
use crate::error::DataSourceError;

const PHONE_KEYS: [&str; 8] = [
    "Employee Phone",
    "employee_phone",
    "Phone",
    "phone",
    "phone_number",
    "Mobile",
    "mobile",
    "id",
];

const NAME_KEYS: [&str; 6] = [
    "Employee Name",
    "employee_name",
    "Name",
    "name",
    "full_name",
    "display_name",
];

/// フローの実行対象となる受信者
///
/// コアからは読み取り専用です。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    /// 電話番号相当の識別子
    pub id: String,
    /// 表示名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// データソースのその他の列
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Recipient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// ログ・メッセージ用の表示名（名前が無ければ識別子）
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// 受信者データソース
///
/// 解決に失敗した場合、そのフローの実行は開始されません。
#[async_trait]
pub trait RecipientSource: Send + Sync {
    async fn resolve(&self, flow: &FlowDefinition) -> Result<Vec<Recipient>, DataSourceError>;
}

/// JSON ファイルの受信者データソース
///
/// フローの `data_source` が無い場合はデフォルトの受信者ファイルを使います。
/// 指定されたファイルが存在しない場合は既定ファイルに切り替えず失敗します。読み込む件数は
/// [`FlowDefinition::expected_recipients`] までです。
pub struct JsonFileSource {
    settings: Settings,
}

impl JsonFileSource {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

}

#[async_trait]
impl RecipientSource for JsonFileSource {
    async fn resolve(&self, flow: &FlowDefinition) -> Result<Vec<Recipient>, DataSourceError> {
        let path = self.settings.resolve_data_source(flow.data_source())?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| DataSourceError::Read {
                path: path.clone(),
                source,
            })?;

        let recipients = parse_recipients(&content, flow.expected_recipients())
            .map_err(|reason| DataSourceError::Format {
                path: path.clone(),
                reason,
            })?;

        info!(
            path = %path.display(),
            count = recipients.len(),
            expected = flow.expected_recipients(),
            "受信者を読み込みました"
        );
        Ok(recipients)
    }
}

/// JSON 配列から最大 `limit` 件の受信者を読み取る
///
/// 電話番号の無い行は警告を出してスキップします。
pub fn parse_recipients(content: &str, limit: usize) -> Result<Vec<Recipient>, String> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(content).map_err(|e| format!("オブジェクトの配列である必要があります: {}", e))?;

    let mut recipients = Vec::new();
    for (index, row) in rows.into_iter().enumerate() {
        if recipients.len() >= limit {
            break;
        }

        let mut fields: BTreeMap<String, String> = row
            .into_iter()
            .filter_map(|(key, value)| scalar(&value).map(|text| (key, text)))
            .collect();

        let Some(id) = take_first(&mut fields, &PHONE_KEYS) else {
            warn!(row = index + 1, "電話番号がありません");
            continue;
        };
        let name = take_first(&mut fields, &NAME_KEYS);

        recipients.push(Recipient {
            id,
            name,
            metadata: fields,
        });
    }
    Ok(recipients)
}

fn scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 候補キーのうち最初に見つかった値を取り出し、残りの候補キーも取り除く
fn take_first(fields: &mut BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        if let Some(value) = fields.remove(*key) {
            found.get_or_insert(value);
        }
    }
    found
}
