//! Action スキーマの定義
//!
//! # 責務
//!
//! ステップ解釈の結果として得られる実行可能な [`Action`] の型を提供します。
//! ツール種別は閉じた列挙 [`ToolKind`] で表現し、新しいツールを追加する際は
//! バリアントの追加が必要になります（網羅性はコンパイラがチェック）。
//!
//! フロー定義の検証ルールはここで定義されるフィールド名
//! （[`ToolKind::fields`]）に対してのみ記述できます。

use std::fmt;

use serde::{Deserialize, Serialize};

/// テキスト本文の最大文字数（WhatsApp のテキストメッセージ上限）
pub const MAX_BODY_CHARS: usize = 4096;

/// メッセージングツールの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// テキストメッセージ送信
    Text,
    /// 位置情報送信
    Location,
    /// 画像送信
    Image,
    /// 音声メッセージ送信
    Voice,
}

impl ToolKind {
    /// 全ツール種別
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Text,
        ToolKind::Location,
        ToolKind::Image,
        ToolKind::Voice,
    ];

    /// このツールが生成するペイロードのフィールド名
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            ToolKind::Text => &["body"],
            ToolKind::Location => &["latitude", "longitude"],
            ToolKind::Image => &["image_path", "caption"],
            ToolKind::Voice => &["voice_path"],
        }
    }

    /// いずれかのツールが生成するフィールドかどうか
    pub fn is_producible_field(field: &str) -> bool {
        Self::ALL.iter().any(|kind| kind.fields().contains(&field))
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolKind::Text => "text",
            ToolKind::Location => "location",
            ToolKind::Image => "image",
            ToolKind::Voice => "voice",
        };
        f.write_str(name)
    }
}

/// ツール種別ごとのペイロード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ActionPayload {
    Text {
        body: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Image {
        image_path: String,
        caption: String,
    },
    Voice {
        voice_path: String,
    },
}

impl ActionPayload {
    /// ペイロードのツール種別
    pub fn tool(&self) -> ToolKind {
        match self {
            ActionPayload::Text { .. } => ToolKind::Text,
            ActionPayload::Location { .. } => ToolKind::Location,
            ActionPayload::Image { .. } => ToolKind::Image,
            ActionPayload::Voice { .. } => ToolKind::Voice,
        }
    }

    /// ペイロードのスキーマ検証
    ///
    /// - 本文は空でなく [`MAX_BODY_CHARS`] 文字以内
    /// - 緯度は -90..=90、経度は -180..=180
    /// - メディアパスは空でない
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ActionPayload::Text { body } => {
                if body.trim().is_empty() {
                    return Err("body が空です".to_string());
                }
                if body.chars().count() > MAX_BODY_CHARS {
                    return Err(format!("body は {} 文字以内である必要があります", MAX_BODY_CHARS));
                }
            }
            ActionPayload::Location {
                latitude,
                longitude,
            } => {
                if !(-90.0..=90.0).contains(latitude) {
                    return Err(format!("latitude {} は範囲外です", latitude));
                }
                if !(-180.0..=180.0).contains(longitude) {
                    return Err(format!("longitude {} は範囲外です", longitude));
                }
            }
            ActionPayload::Image { image_path, .. } => {
                if image_path.trim().is_empty() {
                    return Err("image_path が空です".to_string());
                }
            }
            ActionPayload::Voice { voice_path } => {
                if voice_path.trim().is_empty() {
                    return Err("voice_path が空です".to_string());
                }
            }
        }
        Ok(())
    }

    /// フィールド名から値を文字列として取り出す
    ///
    /// 検証ルール（許可値リスト）との照合に使用します。
    pub fn field_value(&self, field: &str) -> Option<String> {
        match (self, field) {
            (ActionPayload::Text { body }, "body") => Some(body.clone()),
            (ActionPayload::Location { latitude, .. }, "latitude") => Some(latitude.to_string()),
            (ActionPayload::Location { longitude, .. }, "longitude") => Some(longitude.to_string()),
            (ActionPayload::Image { image_path, .. }, "image_path") => Some(image_path.clone()),
            (ActionPayload::Image { caption, .. }, "caption") => Some(caption.clone()),
            (ActionPayload::Voice { voice_path }, "voice_path") => Some(voice_path.clone()),
            _ => None,
        }
    }
}

/// Action を生成したパイプライン段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    /// 決定的ルールによる一致
    Rule,
    /// 言語モデルによる抽出
    Model,
    /// 解釈不能時の縮退
    Fallback,
}

/// 1ステップを解釈した実行可能なアクション
///
/// 1つの [`StepSpec`](super::step::StepSpec) からちょうど1つ生成され、
/// 生成後に変更されることはありません。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    ordinal: u32,
    payload: ActionPayload,
    valid: bool,
    source: ActionSource,
}

impl Action {
    /// 検証済みのアクションを生成
    pub fn new(ordinal: u32, payload: ActionPayload, source: ActionSource) -> Self {
        Self {
            ordinal,
            payload,
            valid: true,
            source,
        }
    }

    /// 低信頼度のアクション（本文 = 生のステップテキスト）を生成
    pub fn low_confidence(ordinal: u32, raw_text: &str) -> Self {
        Self {
            ordinal,
            payload: ActionPayload::Text {
                body: raw_text.to_string(),
            },
            valid: false,
            source: ActionSource::Fallback,
        }
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn payload(&self) -> &ActionPayload {
        &self.payload
    }

    pub fn tool(&self) -> ToolKind {
        self.payload.tool()
    }

    /// スキーマ検証を通過したかどうか
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn source(&self) -> ActionSource {
        self.source
    }
}
