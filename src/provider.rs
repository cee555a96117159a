//! 言語モデル連携の抽象化レイヤー
//!
//! # 責務
//!
//! - 言語モデルを統一的に扱うインターフェース [`LanguageModel`] を提供
//! - 設定に応じた適切なクライアントを生成するファクトリー機能
//!
//! # モジュール構成
//!
//! - `traits` - 共通インターフェース（[`LanguageModel`]トレイト）
//! - `openai` - OpenAI Chat Completions HTTP クライアント
//! - `command` - 任意のCLIツールを呼び出すクライアント
//!
//! # 使用例
//!
//! ```rust,no_run
//! use flow_tester::config::settings::Settings;
//! use flow_tester::provider::create_provider;
//!
//! let settings = Settings::load(None).unwrap();
//! match create_provider(&settings.llm).unwrap() {
//!     Some(model) => println!("using {}", model.name()),
//!     None => println!("rules only"),
//! }
//! ```

pub mod command;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use tracing::warn;

pub use traits::LanguageModel;

use crate::config::settings::{LlmProvider, LlmSettings};
use crate::error::ProviderError;

/// 言語モデルクライアントを生成するファクトリー関数
///
/// # 戻り値
///
/// - `Ok(Some(_))`: 設定されたクライアント
/// - `Ok(None)`: 言語モデルを使用しない（`provider = "none"`、または
///   OpenAI が選択されているがAPIキーが無い）
///
/// # エラー
///
/// - [`ProviderError::CliExecutionError`] - `LLM_COMMAND` が空
/// - [`ProviderError::Http`] - HTTPクライアントの初期化に失敗
pub fn create_provider(
    settings: &LlmSettings,
) -> Result<Option<Arc<dyn LanguageModel>>, ProviderError> {
    match settings.provider {
        LlmProvider::None => Ok(None),
        LlmProvider::OpenAI => match settings.api_key.as_deref() {
            Some(key) => {
                let client = openai::OpenAIClient::new(key, &settings.model)?
                    .with_base_url(&settings.base_url);
                Ok(Some(Arc::new(client)))
            }
            None => {
                warn!("OPENAI_API_KEY が無いため決定的ルールのみで解釈します");
                Ok(None)
            }
        },
        LlmProvider::Command => {
            let command_line = settings.command.as_deref().unwrap_or_default();
            let client = command::CommandClient::from_command_line(command_line)?;
            Ok(Some(Arc::new(client)))
        }
    }
}

/// 設定されたプロバイダーが実行可能か事前に確認する
///
/// CLIプロバイダーの場合のみコマンドの存在を確認します。
///
/// # エラー
///
/// - [`ProviderError::CliNotFound`] - `LLM_COMMAND` のツールが見つからない
/// - [`ProviderError::CliExecutionError`] - `LLM_COMMAND` が空
pub async fn check_available(settings: &LlmSettings) -> Result<(), ProviderError> {
    match settings.provider {
        LlmProvider::Command => {
            let command_line = settings.command.as_deref().unwrap_or_default();
            command::CommandClient::from_command_line(command_line)?
                .check_available()
                .await
        }
        LlmProvider::OpenAI | LlmProvider::None => Ok(()),
    }
}
