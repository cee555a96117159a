//! 言語モデルの共通インターフェース定義
//!
//! # 責務
//!
//! - 言語モデル連携の共通トレイト [`LanguageModel`] を定義
//!
//! 言語モデルは非決定的で、指示に従わない出力を返すことがあります。
//! 戻り値は信頼できないテキストとして扱い、呼び出し側で必ず
//! スキーマ検証を行ってください。
//!
//! # 使用例
//!
//! ```rust,no_run
//! use flow_tester::provider::LanguageModel;
//!
//! async fn example(model: &dyn LanguageModel) {
//!     let answer = model
//!         .extract("Answer with JSON only.", "Step: User sends a message 'hi'")
//!         .await
//!         .unwrap();
//!     println!("{}", answer);
//! }
//! ```

use async_trait::async_trait;

use crate::error::ProviderError;

/// 言語モデルの共通インターフェース
///
/// # 実装要件
///
/// - `Send + Sync`: 複数の受信者タスクから共有される
/// - 非同期実行対応（`async_trait`を使用）
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// プロンプトを送り、生成テキストを取得する
    ///
    /// # 引数
    ///
    /// - `system_prompt`: システムプロンプト（役割・出力形式の制約）
    /// - `prompt`: 処理対象のテキスト
    ///
    /// # エラー
    ///
    /// - [`ProviderError::AuthenticationError`] - 認証失敗
    /// - [`ProviderError::RateLimitExceeded`] - レート制限超過
    /// - [`ProviderError::Timeout`] - タイムアウト
    /// - [`ProviderError::InvalidResponse`] - 不正なレスポンス
    async fn extract(&self, system_prompt: &str, prompt: &str) -> Result<String, ProviderError>;

    /// ログ出力用の名前
    fn name(&self) -> &str;
}
