//! メッセージング連携の共通インターフェース定義
//!
//! # 責務
//!
//! - ツール種別ごとの送信操作を持つ [`Messenger`] トレイト
//! - 送信結果の三値分類 [`Delivery`]
//! - 送信先と返信先をまとめた [`Conversation`]
//!
//! コアはプロバイダー固有のエラーコードを解釈せず、[`Delivery`] の
//! 三値だけを見てリトライの可否を判断します。

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;

use crate::recipients::Recipient;

/// 送信先の会話
///
/// `reply_to` は直前にボットから受け取ったメッセージのIDです。
#[derive(Debug, Clone, Copy)]
pub struct Conversation<'a> {
    pub recipient: &'a Recipient,
    pub reply_to: Option<&'a str>,
}

impl<'a> Conversation<'a> {
    pub fn new(recipient: &'a Recipient) -> Self {
        Self {
            recipient,
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, message_id: Option<&'a str>) -> Self {
        self.reply_to = message_id;
        self
    }
}

/// 送信成功時の受領情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    /// ボットの最新メッセージID（次の送信の返信先）
    pub reply_id: Option<String>,
    /// 応答から読み取ったフラグ（`voice_transcribed` など）
    pub flags: BTreeSet<String>,
}

impl Receipt {
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }
}

/// 送信結果の三値分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 送信成功
    Succeeded(Receipt),
    /// 再試行で成功しうる失敗（タイムアウト、レート制限、5xx、接続エラー）
    Transient(String),
    /// 再試行しても成功しない失敗（不正な受信者、不正なペイロード、その他の4xx）
    Permanent(String),
}

impl Delivery {
    pub fn succeeded() -> Self {
        Delivery::Succeeded(Receipt::default())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Delivery::Succeeded(_))
    }
}

/// メッセージング連携
///
/// ツール種別ごとに1つの送信操作を持ちます。メディアのパスは
/// 呼び出し側で解決済みです。
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, to: Conversation<'_>, body: &str) -> Delivery;

    async fn send_location(&self, to: Conversation<'_>, latitude: f64, longitude: f64) -> Delivery;

    async fn send_image(&self, to: Conversation<'_>, image: &Path, caption: &str) -> Delivery;

    async fn send_voice(&self, to: Conversation<'_>, voice: &Path) -> Delivery;
}
