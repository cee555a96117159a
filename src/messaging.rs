//! メッセージング連携
//!
//! テスト対象のボットへメッセージを届ける層です。コアは
//! [`Messenger`] トレイトだけに依存し、実際の送信は
//! [`webhook::WebhookMessenger`] が担います。

pub mod media;
pub mod payload;
pub mod traits;
pub mod webhook;

pub use traits::{Conversation, Delivery, Messenger, Receipt};
pub use webhook::WebhookMessenger;
