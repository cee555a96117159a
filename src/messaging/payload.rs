//! WhatsApp Business Webhook 形式のペイロード
//!
//! ボットの Webhook に、利用者から届いたメッセージと同じ形の
//! エンベロープを送ります。
//!
//! ```json
//! {
//!   "object": "whatsapp_business_account",
//!   "entry": [{
//!     "id": "...",
//!     "changes": [{
//!       "field": "messages",
//!       "value": {
//!         "messaging_product": "whatsapp",
//!         "metadata": { "display_phone_number": "...", "phone_number_id": "..." },
//!         "contacts": [{ "profile": { "name": "..." }, "wa_id": "..." }],
//!         "messages": [{ "from": "...", "id": "wamid....", "timestamp": 0, "type": "text", "text": { "body": "..." } }]
//!       }
//!     }]
//!   }]
//! }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::traits::Conversation;

/// Webhook エンベロープ
#[derive(Debug, Serialize)]
pub struct WebhookEnvelope {
    object: &'static str,
    entry: Vec<Entry>,
}

#[derive(Debug, Serialize)]
struct Entry {
    id: String,
    changes: Vec<Change>,
}

#[derive(Debug, Serialize)]
struct Change {
    field: &'static str,
    value: ChangeValue,
}

#[derive(Debug, Serialize)]
struct ChangeValue {
    messaging_product: &'static str,
    metadata: Metadata,
    contacts: Vec<Contact>,
    messages: Vec<InboundMessage>,
}

#[derive(Debug, Serialize)]
struct Metadata {
    display_phone_number: String,
    phone_number_id: String,
}

#[derive(Debug, Serialize)]
struct Contact {
    profile: Profile,
    wa_id: String,
}

#[derive(Debug, Serialize)]
struct Profile {
    name: String,
}

#[derive(Debug, Serialize)]
struct InboundMessage {
    from: String,
    id: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<ReplyContext>,
    #[serde(flatten)]
    content: MessageContent,
}

#[derive(Debug, Serialize)]
struct ReplyContext {
    id: String,
}

/// メッセージ本体（`type` フィールドで種別を表す）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { text: TextBody },
    Location { location: LocationBody },
    Image { image: MediaBody },
    Audio { audio: MediaBody },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationBody {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaBody {
    pub id: String,
    pub mime_type: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<bool>,
}

impl WebhookEnvelope {
    /// 1通のメッセージを包んだエンベロープを生成
    pub fn new(
        to: Conversation<'_>,
        phone_number_id: &str,
        content: MessageContent,
        timestamp: i64,
    ) -> Self {
        let recipient = to.recipient;
        let message = InboundMessage {
            from: recipient.id.clone(),
            id: format!("wamid.HBgM{}", Uuid::new_v4().simple().to_string().to_uppercase()),
            timestamp,
            context: to.reply_to.map(|id| ReplyContext { id: id.to_string() }),
            content,
        };

        Self {
            object: "whatsapp_business_account",
            entry: vec![Entry {
                id: Uuid::new_v4().to_string(),
                changes: vec![Change {
                    field: "messages",
                    value: ChangeValue {
                        messaging_product: "whatsapp",
                        metadata: Metadata {
                            display_phone_number: recipient.id.clone(),
                            phone_number_id: phone_number_id.to_string(),
                        },
                        contacts: vec![Contact {
                            profile: Profile {
                                name: recipient.display_name().to_string(),
                            },
                            wa_id: recipient.id.clone(),
                        }],
                        messages: vec![message],
                    },
                }],
            }],
        }
    }
}

/// 最新メッセージ API のレスポンス（ボットの直近の返信）
#[derive(Debug, Default, Deserialize)]
pub struct LatestMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    /// 返信の宛先（受信者の識別子）
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    wa_id: Option<String>,
    #[serde(default)]
    text: Option<TextReply>,
    #[serde(default)]
    interactive: Option<InteractiveReply>,
}

#[derive(Debug, Default, Deserialize)]
struct TextReply {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Default, Deserialize)]
struct InteractiveReply {
    #[serde(default)]
    body: Option<InteractiveBody>,
}

#[derive(Debug, Default, Deserialize)]
struct InteractiveBody {
    #[serde(default)]
    text: String,
}

/// メディア処理結果らしい応答に含まれる語
const EXTRACTION_KEYWORDS: [&str; 19] = [
    "odometer",
    "reading",
    "miles",
    "km",
    "kilometers",
    "invoice",
    "receipt",
    "amount",
    "total",
    "date",
    "extracted",
    "details",
    "confirm",
    "transcription",
    "voice",
    "audio",
    "spoken",
    "said",
    "transcript",
];

impl LatestMessage {
    /// 返信先として使うメッセージID
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref().or(self.id.as_deref())
    }

    /// 返信の宛先
    pub fn addressee(&self) -> Option<&str> {
        self.to.as_deref().or(self.wa_id.as_deref())
    }

    /// 指定した受信者宛ての返信か
    ///
    /// 宛先を含まないレスポンスは、受信者を指定した取得の結果として受け入れます。
    pub fn is_addressed_to(&self, recipient_id: &str) -> bool {
        self.addressee().is_none_or(|to| to == recipient_id)
    }

    /// メディアの処理結果（抽出・文字起こし）と見なせる本文
    ///
    /// インタラクティブメッセージの本文はそのまま、テキストメッセージは
    /// 抽出結果らしい語を含む場合のみ返します。
    pub fn extracted_content(&self) -> Option<&str> {
        if let Some(text) = self
            .interactive
            .as_ref()
            .and_then(|i| i.body.as_ref())
            .map(|b| b.text.as_str())
            .filter(|t| !t.trim().is_empty())
        {
            return Some(text);
        }

        let body = self.text.as_ref()?.body.as_str();
        let lower = body.to_lowercase();
        EXTRACTION_KEYWORDS
            .iter()
            .any(|k| lower.contains(k))
            .then_some(body)
    }
}
