//! アプリケーション設定
//!
//! # 責務
//!
//! - TOML 設定ファイル（任意）の読み込み
//! - 環境変数（`.env` を含む）による上書き
//! - 設定値のバリデーション
//! - 1回の実行で不変となる [`RunPolicy`] の導出
//!
//! ## 優先順位
//!
//! 1. 環境変数（`EXECUTION_DELAY`, `MAX_RETRIES`, `TIMEOUT_SECONDS` など）
//! 2. TOML 設定ファイル
//! 3. デフォルト値
//!
//! ## 使用例
//!
//! ```toml
//! [execution]
//! execution_delay = 2
//! max_retries = 3
//! timeout_seconds = 30
//! worker_limit = 4
//!
//! [paths]
//! flows_directory = "flows"
//! media_directory = "media"
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use super::flow::FlowDefinition;
use crate::error::{ConfigError, DataSourceError};

/// 言語モデルプロバイダーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI Chat Completions API
    OpenAI,
    /// 任意のCLIコマンド
    Command,
    /// 言語モデルを使用しない（決定的ルールのみ）
    None,
}

/// 実行ポリシー
///
/// 1回の実行の間は不変です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// 一時的失敗時の最大リトライ回数
    pub max_retries: u32,
    /// リトライ間の待機時間
    pub execution_delay: Duration,
    /// 1回の送信試行のタイムアウト
    pub timeout: Duration,
    /// 同時に処理する受信者数の上限
    pub worker_limit: usize,
    /// 連続するステップ間の待機時間
    pub step_delay: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            execution_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
            worker_limit: 4,
            step_delay: Duration::ZERO,
        }
    }
}

/// 実行設定
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub execution_delay_secs: u64,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub worker_limit: usize,
    pub step_delay_ms: u64,
    pub interpreter_retries: u32,
    /// 複数受信者の実行前に送る会話リセット用メッセージ
    pub reset_message: Option<String>,
}

/// パス設定
#[derive(Debug, Clone)]
pub struct PathSettings {
    pub base_path: PathBuf,
    pub flows_directory: PathBuf,
    pub media_directory: PathBuf,
    pub results_directory: PathBuf,
    pub default_employee_data: PathBuf,
}

/// 言語モデル設定
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub command: Option<String>,
}

/// メッセージング設定
#[derive(Debug, Clone)]
pub struct MessagingSettings {
    pub phone_number_id: String,
    /// ボットの Webhook を受けるサーバー
    pub server_url: String,
    /// 最新メッセージ取得・メディアアップロードを提供する API
    pub message_api_url: String,
    /// 送信後に応答を待つ時間（ミリ秒）
    pub response_wait_ms: u64,
}

impl MessagingSettings {
    pub fn webhook_endpoint(&self) -> String {
        format!("{}/process-whatsapp-webhook", self.server_url.trim_end_matches('/'))
    }

    pub fn latest_message_endpoint(&self) -> String {
        format!("{}/latest_message", self.message_api_url.trim_end_matches('/'))
    }

    pub fn media_upload_endpoint(&self) -> String {
        format!("{}/media/upload", self.message_api_url.trim_end_matches('/'))
    }
}

/// アプリケーション設定
#[derive(Debug, Clone)]
pub struct Settings {
    pub execution: ExecutionSettings,
    pub paths: PathSettings,
    pub llm: LlmSettings,
    pub messaging: MessagingSettings,
    pub log_level: String,
    /// 読み込みは続行できたが報告すべき問題（不正な `.env` など）
    pub load_warnings: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let base_path = PathBuf::from(".");
        Self {
            execution: ExecutionSettings {
                execution_delay_secs: 2,
                max_retries: 3,
                timeout_seconds: 30,
                worker_limit: 4,
                step_delay_ms: 1000,
                interpreter_retries: 1,
                reset_message: Some("Stop".to_string()),
            },
            paths: PathSettings {
                flows_directory: base_path.join("flows"),
                media_directory: base_path.join("media"),
                results_directory: base_path.join("results"),
                default_employee_data: base_path.join("data").join("employees.json"),
                base_path,
            },
            llm: LlmSettings {
                provider: LlmProvider::OpenAI,
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                command: None,
            },
            messaging: MessagingSettings {
                phone_number_id: String::new(),
                server_url: "http://localhost:3000".to_string(),
                message_api_url: "http://localhost:8000".to_string(),
                response_wait_ms: 2000,
            },
            log_level: "info".to_string(),
            load_warnings: Vec::new(),
        }
    }
}

/// TOML 設定ファイル DTO（すべて任意）
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    execution: ExecutionSection,
    paths: PathSection,
    llm: LlmSection,
    messaging: MessagingSection,
    logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExecutionSection {
    execution_delay: Option<u64>,
    max_retries: Option<u32>,
    timeout_seconds: Option<u64>,
    worker_limit: Option<usize>,
    step_delay_ms: Option<u64>,
    interpreter_retries: Option<u32>,
    reset_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PathSection {
    base_path: Option<PathBuf>,
    flows_directory: Option<PathBuf>,
    media_directory: Option<PathBuf>,
    results_directory: Option<PathBuf>,
    default_employee_data: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LlmSection {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessagingSection {
    phone_number_id: Option<String>,
    server_url: Option<String>,
    message_api_url: Option<String>,
    response_wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingSection {
    level: Option<String>,
}

impl Settings {
    /// 設定を読み込む
    ///
    /// # 処理フロー
    ///
    /// 1. `.env` を読み込み（存在する場合。不正な内容は `load_warnings` に記録）
    /// 2. TOML 設定ファイルを読み込み（指定された場合）
    /// 3. 環境変数で上書き
    /// 4. バリデーション
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let dotenv = dotenvy::dotenv();

        let file = match config_path {
            Some(path) => toml::from_str::<SettingsFile>(&std::fs::read_to_string(path)?)?,
            None => SettingsFile::default(),
        };

        let mut settings = Self::from_sources(file, |key| std::env::var(key).ok())?;
        settings.validate()?;
        settings.load_warnings.extend(dotenv_warning(dotenv));
        Ok(settings)
    }

    /// 読み込み時の警告をログに出す
    ///
    /// ロガーの初期化は設定に依存するため、初期化後に呼び出します。
    pub fn log_load_warnings(&self) {
        for warning in &self.load_warnings {
            warn!("{}", warning);
        }
    }

    /// TOML 文字列と環境変数の参照関数から設定を構築
    pub fn from_toml_with_env<F>(toml: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: SettingsFile = toml::from_str(toml)?;
        let settings = Self::from_sources(file, lookup)?;
        settings.validate()?;
        Ok(settings)
    }

    fn from_sources<F>(file: SettingsFile, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();

        // TOML ファイル
        let e = file.execution;
        set(&mut s.execution.execution_delay_secs, e.execution_delay);
        set(&mut s.execution.max_retries, e.max_retries);
        set(&mut s.execution.timeout_seconds, e.timeout_seconds);
        set(&mut s.execution.worker_limit, e.worker_limit);
        set(&mut s.execution.step_delay_ms, e.step_delay_ms);
        set(&mut s.execution.interpreter_retries, e.interpreter_retries);
        if let Some(message) = e.reset_message {
            s.execution.reset_message = Some(message).filter(|m| !m.is_empty());
        }

        let p = file.paths;
        if let Some(base) = p.base_path.or_else(|| lookup("BASE_PATH").map(PathBuf::from)) {
            s.paths = PathSettings {
                flows_directory: base.join("flows"),
                media_directory: base.join("media"),
                results_directory: base.join("results"),
                default_employee_data: base.join("data").join("employees.json"),
                base_path: base,
            };
        }
        let base = s.paths.base_path.clone();
        set(&mut s.paths.flows_directory, p.flows_directory.map(|d| base.join(d)));
        set(&mut s.paths.media_directory, p.media_directory.map(|d| base.join(d)));
        set(&mut s.paths.results_directory, p.results_directory.map(|d| base.join(d)));
        set(
            &mut s.paths.default_employee_data,
            p.default_employee_data.map(|d| base.join(d)),
        );

        let l = file.llm;
        set(&mut s.llm.provider, l.provider);
        s.llm.api_key = l.api_key.or(s.llm.api_key);
        set(&mut s.llm.model, l.model);
        set(&mut s.llm.base_url, l.base_url);
        s.llm.command = l.command.or(s.llm.command);

        let m = file.messaging;
        set(&mut s.messaging.phone_number_id, m.phone_number_id);
        set(&mut s.messaging.server_url, m.server_url);
        set(&mut s.messaging.message_api_url, m.message_api_url);
        set(&mut s.messaging.response_wait_ms, m.response_wait_ms);

        set(&mut s.log_level, file.logging.level);

        // 環境変数
        set(&mut s.execution.execution_delay_secs, parse_env(&lookup, "EXECUTION_DELAY")?);
        set(&mut s.execution.max_retries, parse_env(&lookup, "MAX_RETRIES")?);
        set(&mut s.execution.timeout_seconds, parse_env(&lookup, "TIMEOUT_SECONDS")?);
        set(&mut s.execution.worker_limit, parse_env(&lookup, "WORKER_LIMIT")?);
        set(&mut s.execution.step_delay_ms, parse_env(&lookup, "STEP_DELAY")?);
        set(
            &mut s.execution.interpreter_retries,
            parse_env(&lookup, "INTERPRETER_RETRIES")?,
        );
        set(
            &mut s.paths.flows_directory,
            lookup("FLOWS_DIRECTORY").map(|d| base.join(d)),
        );
        set(
            &mut s.paths.media_directory,
            lookup("MEDIA_DIRECTORY").map(|d| base.join(d)),
        );
        set(
            &mut s.paths.results_directory,
            lookup("RESULTS_DIRECTORY").map(|d| base.join(d)),
        );
        set(
            &mut s.paths.default_employee_data,
            lookup("DEFAULT_EMPLOYEE_DATA").map(|d| base.join(d)),
        );

        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            s.llm.api_key = Some(key);
        }
        set(&mut s.llm.model, lookup("OPENAI_MODEL"));
        if let Some(command) = lookup("LLM_COMMAND").filter(|c| !c.is_empty()) {
            s.llm.command = Some(command);
            if s.llm.api_key.is_none() {
                s.llm.provider = LlmProvider::Command;
            }
        }
        if let Some(provider) = lookup("LLM_PROVIDER") {
            s.llm.provider = match provider.to_ascii_lowercase().as_str() {
                "openai" => LlmProvider::OpenAI,
                "command" => LlmProvider::Command,
                "none" => LlmProvider::None,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "LLM_PROVIDER '{}' は未対応です",
                        other
                    )));
                }
            };
        }

        set(&mut s.messaging.phone_number_id, lookup("WHATSAPP_PHONE_NUMBER_ID"));
        set(&mut s.messaging.server_url, lookup("NESTJS_SERVER_URL"));
        set(&mut s.messaging.message_api_url, lookup("MESSAGE_API_URL"));
        set(&mut s.log_level, lookup("LOG_LEVEL").map(|l| l.to_lowercase()));

        Ok(s)
    }

    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.execution.timeout_seconds == 0 {
            errors.push("TIMEOUT_SECONDS は1以上である必要があります".to_string());
        }
        if self.execution.worker_limit == 0 {
            errors.push("WORKER_LIMIT は1以上である必要があります".to_string());
        }
        if self.llm.provider == LlmProvider::Command && self.llm.command.is_none() {
            errors.push("LLM_COMMAND が設定されていません".to_string());
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(format!("LOG_LEVEL '{}' は不正です", self.log_level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join(", ")))
        }
    }

    /// フローの上書き値を反映した実行ポリシー
    pub fn policy(&self, flow: &FlowDefinition) -> RunPolicy {
        RunPolicy {
            max_retries: flow.retry_count().unwrap_or(self.execution.max_retries),
            execution_delay: Duration::from_secs(self.execution.execution_delay_secs),
            timeout: Duration::from_secs(
                flow.timeout_seconds().unwrap_or(self.execution.timeout_seconds),
            ),
            worker_limit: self.execution.worker_limit,
            step_delay: Duration::from_millis(self.execution.step_delay_ms),
        }
    }

    /// フローのデータソースを解決
    ///
    /// フローが指定しない場合に限り、デフォルトの受信者データを使います。
    ///
    /// # エラー
    ///
    /// - [`DataSourceError::NotFound`] - 指定されたファイル（指定が無ければ既定ファイル）が存在しない
    pub fn resolve_data_source(&self, data_source: Option<&str>) -> Result<PathBuf, DataSourceError> {
        let path = match data_source {
            Some(source) => self.paths.base_path.join(source),
            None => self.paths.default_employee_data.clone(),
        };
        if path.exists() {
            Ok(path)
        } else {
            Err(DataSourceError::NotFound(path))
        }
    }

    /// フローのメディアパス解決器
    pub fn media_resolver(&self, flow: &FlowDefinition) -> MediaResolver {
        MediaResolver {
            media_directory: self.paths.media_directory.clone(),
            base_path: self.paths.base_path.clone(),
            prefixes: flow.media_paths().to_vec(),
        }
    }

    /// レポートの保存先ディレクトリ
    pub fn report_directory(&self) -> PathBuf {
        self.paths.results_directory.join("reports").join("flow_results")
    }

    /// ログの保存先ディレクトリ
    pub fn log_directory(&self) -> PathBuf {
        self.paths.results_directory.join("logs").join("execution_logs")
    }
}

/// メディアファイルのパス解決
///
/// 絶対パスはそのまま、相対パスはメディアディレクトリ → フローの接頭辞 →
/// ベースディレクトリの順に探索します。
#[derive(Debug, Clone)]
pub struct MediaResolver {
    media_directory: PathBuf,
    base_path: PathBuf,
    prefixes: Vec<String>,
}

impl MediaResolver {
    /// 探索候補（優先順）
    pub fn candidates(&self, file: &str) -> Vec<PathBuf> {
        let path = Path::new(file);
        if path.is_absolute() {
            return vec![path.to_path_buf()];
        }
        let mut candidates = vec![self.media_directory.join(path)];
        candidates.extend(
            self.prefixes
                .iter()
                .map(|prefix| self.base_path.join(prefix).join(path)),
        );
        candidates.push(self.base_path.join(path));
        candidates
    }

    /// 最初に存在したファイル
    pub fn resolve(&self, file: &str) -> Option<PathBuf> {
        self.candidates(file).into_iter().find(|path| path.is_file())
    }
}

/// `.env` の読み込み結果のうち報告すべきもの（ファイルが無いだけなら無し）
fn dotenv_warning(result: Result<PathBuf, dotenvy::Error>) -> Option<String> {
    match result {
        Err(e) if !e.not_found() => Some(format!(".env の読み込みに失敗しました: {}", e)),
        _ => None,
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Validation(format!("{} の値 '{}' は数値ではありません", key, raw))),
        None => Ok(None),
    }
}
