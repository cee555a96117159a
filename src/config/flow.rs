//! Flow 定義の読み込みと管理を行うモジュール
//!
//! # 責務
//!
//! メッセージングボットに対する会話シナリオ（フロー）を JSON / TOML 形式で定義し、
//! それを Rust の型として扱うための機能を提供します。
//!
//! ## 主な機能
//!
//! - **パース**: ドキュメントを [`FlowDocumentDto`] にデシリアライズし、
//!   バリデーションを経て [`FlowDefinition`] に変換
//! - **シリアライズ**: 同じ DTO を経由して書き戻す（load → save → load で同一）
//! - **派生情報**: 必要メディア、想定受信者数、アクションの許可値チェック
//!
//! ## 使用例
//!
//! ```json
//! {
//!   "trigger": "odometer",
//!   "description": "Odometer reading flow for 2 users",
//!   "data_source": "data/employees.json",
//!   "flow_steps": [
//!     "Step1: User sends a message 'odometer'",
//!     "Step2: User uploads an image 'odometer/reading.jpg' as proof",
//!     "Step3: User sends a message 'confirm'"
//!   ],
//!   "validation_rules": { "required_media": ["image"] },
//!   "success_criteria": { "min_steps_completed": 3 }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::action::{Action, ToolKind};
use super::dto::{FlowDocumentDto, SuccessCriteriaDto, ValidationRulesDto};
use super::step::{StepSpec, number_steps};
use crate::error::FlowError;

pub(crate) static IMAGE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)'([^']*\.(?:jpg|jpeg|png|gif|bmp|webp))'").expect("valid image regex")
});

pub(crate) static AUDIO_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)'([^']*\.(?:wav|mp3|mp4|ogg|flac|m4a|aac|opus))'").expect("valid audio regex")
});

static USER_COUNT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(\d+)\s+users?",
        r"(\d+)\s+employees?",
        r"(\d+)\s+people",
        r"(\d+)\s+workers?",
        r"for\s+(\d+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid user count regex"))
    .collect()
});

pub(crate) const IMAGE_KEYWORDS: [&str; 4] = ["image", "photo", "picture", "upload"];
pub(crate) const AUDIO_KEYWORDS: [&str; 3] = ["voice", "audio", "recording"];

/// ドキュメント形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Toml,
}

impl DocumentFormat {
    /// 拡張子から形式を判定（対象外なら `None`）
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Toml => "toml",
        }
    }
}

/// メディア種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Voice,
}

impl MediaKind {
    /// このメディアを送信するツール
    pub fn tool(self) -> ToolKind {
        match self {
            MediaKind::Image => ToolKind::Image,
            MediaKind::Voice => ToolKind::Voice,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Voice => "voice",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "images" | "photo" | "picture" => Ok(MediaKind::Image),
            "voice" | "audio" | "recording" => Ok(MediaKind::Voice),
            other => Err(format!("'{}' はメディアツールではありません", other)),
        }
    }
}

/// 検証ルール
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationRules {
    required_media: BTreeSet<MediaKind>,
    allowed_values: BTreeMap<String, Vec<String>>,
}

impl ValidationRules {
    pub fn required_media(&self) -> &BTreeSet<MediaKind> {
        &self.required_media
    }

    pub fn allowed_values(&self) -> &BTreeMap<String, Vec<String>> {
        &self.allowed_values
    }
}

/// 成功基準
///
/// 必須フラグは不透明な述語として扱い、成功したステップ結果の
/// フラグ集合と照合されます。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuccessCriteria {
    min_steps_completed: Option<usize>,
    required_flags: BTreeSet<String>,
}

impl SuccessCriteria {
    pub fn min_steps_completed(&self) -> Option<usize> {
        self.min_steps_completed
    }

    pub fn required_flags(&self) -> &BTreeSet<String> {
        &self.required_flags
    }
}

/// フロー定義（ドメインモデル）
///
/// バリデーション済みの状態を保証します。読み込み後は不変です。
///
/// ## DTO との違い
///
/// - [`FlowDocumentDto`]: デシリアライズ専用、バリデーション前の生データ
/// - [`FlowDefinition`]: バリデーション済み、ドメインロジックを持つ
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    trigger: String,
    description: String,
    data_source: Option<String>,
    user_count: Option<u32>,
    steps: Vec<StepSpec>,
    media_paths: Vec<String>,
    validation_rules: ValidationRules,
    success_criteria: SuccessCriteria,
    timeout_seconds: Option<u64>,
    retry_count: Option<u32>,
}

impl FlowDefinition {
    /// 最小構成のフロー定義を生成
    ///
    /// 生成されたステップを持つフローを組み立てる際に使用します。
    pub fn new<I, S>(trigger: impl Into<String>, description: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trigger: trigger.into(),
            description: description.into(),
            data_source: None,
            user_count: None,
            steps: number_steps(steps),
            media_paths: Vec::new(),
            validation_rules: ValidationRules::default(),
            success_criteria: SuccessCriteria::default(),
            timeout_seconds: None,
            retry_count: None,
        }
    }

    /// データソースを設定
    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = Some(data_source.into());
        self
    }

    /// メディアパスの接頭辞を追加
    pub fn with_media_path(mut self, prefix: impl Into<String>) -> Self {
        self.media_paths.push(prefix.into());
        self
    }

    /// 文字列からフロー定義を読み込む
    ///
    /// # 処理フロー
    ///
    /// 1. デシリアライズ → [`FlowDocumentDto`]
    /// 2. バリデーション & 変換 → [`FlowDefinition`]
    ///
    /// `origin` はエラーメッセージ用の出所（通常はファイルパス）です。
    pub fn parse(content: &str, format: DocumentFormat, origin: &str) -> Result<Self, FlowError> {
        let dto: FlowDocumentDto = match format {
            DocumentFormat::Json => serde_json::from_str(content)
                .map_err(|e| FlowError::malformed(origin, e.to_string()))?,
            DocumentFormat::Toml => {
                toml::from_str(content).map_err(|e| FlowError::malformed(origin, e.to_string()))?
            }
        };
        Self::from_dto(dto, origin)
    }

    /// JSON 文字列から読み込む
    pub fn from_json(content: &str) -> Result<Self, FlowError> {
        Self::parse(content, DocumentFormat::Json, "<json>")
    }

    /// TOML 文字列から読み込む
    pub fn from_toml(content: &str) -> Result<Self, FlowError> {
        Self::parse(content, DocumentFormat::Toml, "<toml>")
    }

    /// 指定形式の文字列に変換
    pub fn serialize(&self, format: DocumentFormat) -> Result<String, FlowError> {
        let dto = self.to_dto();
        match format {
            DocumentFormat::Json => {
                serde_json::to_string_pretty(&dto).map_err(|e| FlowError::Serialize(e.to_string()))
            }
            DocumentFormat::Toml => {
                toml::to_string(&dto).map_err(|e| FlowError::Serialize(e.to_string()))
            }
        }
    }

    fn from_dto(dto: FlowDocumentDto, origin: &str) -> Result<Self, FlowError> {
        let trigger = match dto.trigger.map(|t| t.trim().to_string()) {
            Some(trigger) if !trigger.is_empty() => trigger,
            _ => return Err(FlowError::malformed(origin, "trigger は必須です")),
        };

        let raw_steps = match dto.flow_steps {
            Some(steps) if !steps.is_empty() => steps,
            _ => return Err(FlowError::malformed(origin, "flow_steps は必須です")),
        };
        if let Some(index) = raw_steps.iter().position(|step| step.trim().is_empty()) {
            return Err(FlowError::malformed(
                origin,
                format!("flow_steps の {} 番目が空です", index + 1),
            ));
        }
        let steps = number_steps(raw_steps);

        let user_count = positive(dto.user_count, "user_count", origin)?.map(|n| n as u32);
        let timeout_seconds = positive(dto.timeout_seconds, "timeout_seconds", origin)?;
        let retry_count = match dto.retry_count {
            Some(n) if n < 0 => {
                return Err(FlowError::malformed(origin, "retry_count は0以上である必要があります"));
            }
            other => other.map(|n| n as u32),
        };

        let validation_rules =
            convert_rules(dto.required_media, dto.validation_rules.unwrap_or_default(), origin)?;
        let success_criteria =
            convert_criteria(dto.success_criteria.unwrap_or_default(), steps.len(), origin)?;

        Ok(Self {
            trigger,
            description: dto.description.unwrap_or_default(),
            data_source: dto.data_source.filter(|s| !s.trim().is_empty()),
            user_count,
            steps,
            media_paths: dto.media_paths,
            validation_rules,
            success_criteria,
            timeout_seconds,
            retry_count,
        })
    }

    /// ドメインモデルから DTO への変換（書き込み方向、失敗しない）
    fn to_dto(&self) -> FlowDocumentDto {
        let rules = &self.validation_rules;
        let validation_rules = (!rules.required_media.is_empty() || !rules.allowed_values.is_empty())
            .then(|| ValidationRulesDto {
                required_media: rules.required_media.iter().map(|m| m.to_string()).collect(),
                allowed_values: rules.allowed_values.clone(),
                fields: BTreeMap::new(),
            });

        let criteria = &self.success_criteria;
        let success_criteria = (criteria.min_steps_completed.is_some()
            || !criteria.required_flags.is_empty())
        .then(|| SuccessCriteriaDto {
            min_steps_completed: criteria.min_steps_completed.map(|n| n as i64),
            required_flags: criteria.required_flags.iter().cloned().collect(),
            flags: BTreeMap::new(),
        });

        FlowDocumentDto {
            trigger: Some(self.trigger.clone()),
            description: Some(self.description.clone()),
            data_source: self.data_source.clone(),
            user_count: self.user_count.map(i64::from),
            timeout_seconds: self.timeout_seconds.map(|n| n as i64),
            retry_count: self.retry_count.map(i64::from),
            flow_steps: Some(self.steps.iter().map(|s| s.text().to_string()).collect()),
            media_paths: self.media_paths.clone(),
            required_media: Vec::new(),
            validation_rules,
            success_criteria,
        }
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn data_source(&self) -> Option<&str> {
        self.data_source.as_deref()
    }

    pub fn user_count(&self) -> Option<u32> {
        self.user_count
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn media_paths(&self) -> &[String] {
        &self.media_paths
    }

    pub fn validation_rules(&self) -> &ValidationRules {
        &self.validation_rules
    }

    pub fn success_criteria(&self) -> &SuccessCriteria {
        &self.success_criteria
    }

    /// フロー固有のタイムアウト（秒）
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout_seconds
    }

    /// フロー固有のリトライ回数
    pub fn retry_count(&self) -> Option<u32> {
        self.retry_count
    }

    /// 成功に必要な完了ステップ数
    ///
    /// 明示されていない場合はステップ数の半分（切り上げ）です。
    pub fn min_steps_required(&self) -> usize {
        self.success_criteria
            .min_steps_completed
            .unwrap_or_else(|| self.steps.len().div_ceil(2))
    }

    /// 想定受信者数
    ///
    /// `user_count` → 説明文中の人数表現（"20 users" 等）→ 1 の順に決定します。
    pub fn expected_recipients(&self) -> usize {
        if let Some(count) = self.user_count {
            return count as usize;
        }
        let description = self.description.to_lowercase();
        USER_COUNT
            .iter()
            .find_map(|pattern| pattern.captures(&description))
            .and_then(|caps| caps[1].parse::<usize>().ok())
            .filter(|count| *count > 0)
            .unwrap_or(1)
    }

    /// ステップテキストから必要なメディアファイルを抽出
    ///
    /// キーワードを含むステップ内の、引用符で囲まれたファイルパスを集めます。
    pub fn media_requirements(&self) -> BTreeMap<MediaKind, Vec<String>> {
        let mut requirements: BTreeMap<MediaKind, Vec<String>> = BTreeMap::new();
        for step in &self.steps {
            let lower = step.text().to_lowercase();
            if IMAGE_KEYWORDS.iter().any(|k| lower.contains(k)) {
                let paths = requirements.entry(MediaKind::Image).or_default();
                paths.extend(IMAGE_PATH.captures_iter(step.text()).map(|c| c[1].to_string()));
            }
            if AUDIO_KEYWORDS.iter().any(|k| lower.contains(k)) {
                let paths = requirements.entry(MediaKind::Voice).or_default();
                paths.extend(AUDIO_PATH.captures_iter(step.text()).map(|c| c[1].to_string()));
            }
        }
        requirements
    }

    /// アクションが許可値ルールを満たしているか確認
    pub fn check_action(&self, action: &Action) -> Result<(), String> {
        for (field, allowed) in &self.validation_rules.allowed_values {
            if let Some(value) = action.payload().field_value(field) {
                if !allowed.iter().any(|candidate| candidate == &value) {
                    return Err(format!(
                        "フィールド '{}' の値 '{}' は許可されていません (許可値: {})",
                        field,
                        value,
                        allowed.join(", ")
                    ));
                }
            }
        }
        Ok(())
    }
}

fn positive(value: Option<i64>, field: &str, origin: &str) -> Result<Option<u64>, FlowError> {
    match value {
        Some(n) if n < 1 => Err(FlowError::malformed(
            origin,
            format!("{} は正の整数である必要があります", field),
        )),
        other => Ok(other.map(|n| n as u64)),
    }
}

fn convert_rules(
    legacy_required_media: Vec<String>,
    dto: ValidationRulesDto,
    origin: &str,
) -> Result<ValidationRules, FlowError> {
    let mut required_media = BTreeSet::new();
    for name in legacy_required_media.iter().chain(dto.required_media.iter()) {
        let kind = name
            .parse::<MediaKind>()
            .map_err(|reason| FlowError::rule(origin, format!("required_media: {}", reason)))?;
        required_media.insert(kind);
    }

    let mut allowed_values = dto.allowed_values;
    for (field, value) in dto.fields {
        if !ToolKind::is_producible_field(&field) {
            return Err(FlowError::rule(
                origin,
                format!("フィールド '{}' はどのツールも生成しません", field),
            ));
        }
        let values: Vec<String> = serde_json::from_value(value).map_err(|_| {
            FlowError::malformed(origin, format!("validation_rules.{} は文字列の配列である必要があります", field))
        })?;
        allowed_values.entry(field).or_default().extend(values);
    }
    if let Some(field) = allowed_values.keys().find(|f| !ToolKind::is_producible_field(f)) {
        return Err(FlowError::rule(
            origin,
            format!("フィールド '{}' はどのツールも生成しません", field),
        ));
    }

    Ok(ValidationRules {
        required_media,
        allowed_values,
    })
}

fn convert_criteria(
    dto: SuccessCriteriaDto,
    step_count: usize,
    origin: &str,
) -> Result<SuccessCriteria, FlowError> {
    let min_steps_completed = match dto.min_steps_completed {
        Some(n) if n < 0 => {
            return Err(FlowError::malformed(
                origin,
                "min_steps_completed は0以上である必要があります",
            ));
        }
        Some(n) if n as usize > step_count => {
            return Err(FlowError::rule(
                origin,
                format!(
                    "min_steps_completed ({}) がステップ数 ({}) を超えています",
                    n, step_count
                ),
            ));
        }
        other => other.map(|n| n as usize),
    };

    let mut required_flags: BTreeSet<String> = dto.required_flags.into_iter().collect();
    for (flag, value) in dto.flags {
        match value {
            serde_json::Value::Bool(true) => {
                required_flags.insert(flag);
            }
            serde_json::Value::Bool(false) => {}
            _ => {
                return Err(FlowError::malformed(
                    origin,
                    format!("success_criteria.{} は真偽値である必要があります", flag),
                ));
            }
        }
    }

    Ok(SuccessCriteria {
        min_steps_completed,
        required_flags,
    })
}
