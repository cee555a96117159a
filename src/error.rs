//! エラー型の定義
//!
//! このモジュールは、Flow Tester 全体で使用されるエラー型を定義します。
//! 実行エンジン固有のエラーは [`crate::engine::result`] にあります。

use std::path::PathBuf;

use thiserror::Error;

use crate::config::action::ToolKind;

/// 設定関連のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// ファイルの読み込みに失敗
    #[error("設定ファイルの読み込みに失敗しました: {0}")]
    FileRead(#[from] std::io::Error),

    /// TOML のデシリアライズに失敗
    #[error("TOML のデシリアライズに失敗しました: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    /// バリデーションエラー
    #[error("設定のバリデーションに失敗しました: {0}")]
    Validation(String),
}

/// フロー定義ドキュメントのエラー
///
/// どちらもフローにとって致命的で、該当フローは実行されません。
#[derive(Debug, Error)]
pub enum FlowError {
    /// ファイルの読み込みに失敗
    #[error("フロー定義 {path} の読み込みに失敗しました: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 必須フィールドの欠落・型不一致・パース失敗
    #[error("フロー定義が不正です ({origin}): {reason}")]
    Malformed { origin: String, reason: String },

    /// どのツールも生成しないフィールドを参照する検証ルール
    #[error("検証ルールが不正です ({origin}): {reason}")]
    ValidationRule { origin: String, reason: String },

    /// ファイルの書き込みに失敗
    #[error("フロー定義 {path} の書き込みに失敗しました: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// シリアライズに失敗
    #[error("フロー定義のシリアライズに失敗しました: {0}")]
    Serialize(String),
}

impl FlowError {
    pub(crate) fn malformed(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn rule(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationRule {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

/// 言語モデルプロバイダーのエラー
#[derive(Debug, Error)]
pub enum ProviderError {
    /// CLIツールが見つからない（コマンド名, インストール案内）
    #[error("CLIツール '{0}' が見つかりません。{1} をインストールしてください")]
    CliNotFound(String, String),

    /// CLI実行エラー
    #[error("CLIの実行に失敗しました: {0}")]
    CliExecutionError(String),

    /// 認証エラー
    #[error("認証に失敗しました: {0}")]
    AuthenticationError(String),

    /// レート制限
    #[error("レート制限を超えました")]
    RateLimitExceeded,

    /// タイムアウト
    #[error("タイムアウトしました: {0}")]
    Timeout(String),

    /// HTTP通信エラー
    #[error("HTTP通信に失敗しました: {0}")]
    Http(#[from] reqwest::Error),

    /// 不正なレスポンス
    #[error("不正なレスポンスです: {0}")]
    InvalidResponse(String),

    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    /// 出力がUTF-8ではない
    #[error("出力のUTF-8変換に失敗しました: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// メッセージング連携のエラー
///
/// ハンドラーはこれを [`crate::messaging::Delivery`] の三値に分類します。
#[derive(Debug, Error)]
pub enum MessagingError {
    /// HTTP通信エラー
    #[error("HTTP通信に失敗しました: {0}")]
    Http(#[from] reqwest::Error),

    /// メディアファイルが見つからない
    #[error("メディアファイルが見つかりません: {0}")]
    MediaNotFound(String),

    /// メディアのアップロード失敗
    #[error("メディアのアップロードに失敗しました (status {status}): {body}")]
    Upload { status: u16, body: String },

    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),
}

/// ツール振り分けのエラー
///
/// 実行エンジンはこれを再試行しない失敗として記録します。
#[derive(Debug, Error)]
pub enum DispatchError {
    /// ハンドラーが登録されていないツール種別
    #[error("ツール '{0}' のハンドラーが登録されていません")]
    UnsupportedTool(ToolKind),
}

/// 実行レポートの保存エラー
#[derive(Debug, Error)]
pub enum ReportError {
    /// シリアライズに失敗
    #[error("レポートのシリアライズに失敗しました: {0}")]
    Serialize(#[from] serde_json::Error),

    /// 書き込みに失敗
    #[error("レポート {path} の書き込みに失敗しました: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 受信者データソースのエラー（そのフローの実行にとって致命的）
#[derive(Debug, Error)]
pub enum DataSourceError {
    /// データファイルが存在しない
    #[error("データソースが見つかりません: {0}")]
    NotFound(PathBuf),

    /// ファイルの読み込みに失敗
    #[error("データソース {path} の読み込みに失敗しました: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 形式が不正
    #[error("データソース {path} の形式が不正です: {reason}")]
    Format { path: PathBuf, reason: String },
}
