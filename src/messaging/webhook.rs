//! WhatsApp Webhook を模したメッセンジャー実装
//!
//! # 責務
//!
//! - 利用者からの受信メッセージと同じ形のペイロードをボットの Webhook に送る
//! - 画像・音声をメッセージ API にアップロードし、メディアIDを得る
//! - 送信後に最新メッセージ API からボットの返信を読み取る
//!
//! # 処理フロー
//!
//! ```text
//! (メディアの場合) POST {message_api}/media/upload → media id
//!   ↓
//! POST {server}/process-whatsapp-webhook（短いタイムアウト）
//!   ↓
//! response_wait_ms 待機
//!   ↓
//! GET {message_api}/latest_message → Receipt（返信先ID・フラグ）
//! ```
//!
//! # 結果の分類
//!
//! | 状況                                  | Delivery    |
//! |---------------------------------------|-------------|
//! | 2xx、または Webhook の応答待ちタイムアウト | Succeeded  |
//! | 接続エラー、429、5xx                   | Transient   |
//! | その他の 4xx、メディアファイル不在      | Permanent   |
//!
//! Webhook は受信後すぐに応答しないことがあるため、応答待ちの
//! タイムアウトは受理として扱います。
//!
//! # 受信者の分離
//!
//! 最新メッセージ API はボット全体で1つのカーソルです。Webhook 送信から
//! 最新メッセージ取得までの1往復はメッセンジャー内で直列化し、
//! 取得時は `wa_id` で受信者を指定します。別の受信者宛ての返信は
//! 受領情報に使いません。アップロードや再試行待ちは直列化の対象外です。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::media::MediaFile;
use super::payload::{LatestMessage, LocationBody, MediaBody, MessageContent, TextBody, WebhookEnvelope};
use super::traits::{Conversation, Delivery, Messenger, Receipt};
use crate::config::settings::MessagingSettings;
use crate::error::MessagingError;

/// Webhook への送信は受理されれば十分
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(2);

const LATEST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// 画像の処理結果を受け取ったことを示すフラグ
pub const FLAG_IMAGE_EXTRACTED: &str = "image_extracted";

/// 音声の文字起こしを受け取ったことを示すフラグ
pub const FLAG_VOICE_TRANSCRIBED: &str = "voice_transcribed";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// Webhook メッセンジャー
pub struct WebhookMessenger {
    http: reqwest::Client,
    settings: MessagingSettings,
    /// 送信から最新メッセージ取得までの1往復を保護する
    exchange: Mutex<()>,
}

impl WebhookMessenger {
    /// 新しいメッセンジャーを生成
    ///
    /// # エラー
    ///
    /// - [`MessagingError::Http`] - HTTPクライアントの初期化に失敗
    pub fn new(settings: MessagingSettings) -> Result<Self, MessagingError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            settings,
            exchange: Mutex::new(()),
        })
    }

    /// ペイロードを送り、ボットの返信を受領情報にまとめる
    async fn deliver(
        &self,
        to: Conversation<'_>,
        content: MessageContent,
        media_flag: Option<&'static str>,
    ) -> Delivery {
        let envelope = WebhookEnvelope::new(
            to,
            &self.settings.phone_number_id,
            content,
            Utc::now().timestamp(),
        );

        let _exchange = self.exchange.lock().await;
        if let Err(failure) = self.post_webhook(&envelope).await {
            return failure;
        }

        tokio::time::sleep(Duration::from_millis(self.settings.response_wait_ms)).await;
        Delivery::Succeeded(self.latest_receipt(&to.recipient.id, media_flag).await)
    }

    async fn post_webhook(&self, envelope: &WebhookEnvelope) -> Result<(), Delivery> {
        let endpoint = self.settings.webhook_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .timeout(WEBHOOK_TIMEOUT)
            .json(envelope)
            .send()
            .await;

        match response {
            Ok(response) => match classify_status(response.status()) {
                None => {
                    debug!(status = %response.status(), "Webhook に送信しました");
                    Ok(())
                }
                Some(failure) => Err(failure),
            },
            Err(e) if e.is_timeout() => {
                debug!("Webhook の応答待ちがタイムアウトしました（受理済みとして扱います）");
                Ok(())
            }
            Err(e) => Err(Delivery::Transient(format!(
                "Webhook に接続できません ({}): {}",
                endpoint, e
            ))),
        }
    }

    /// 最新メッセージを取得して受領情報を組み立てる
    ///
    /// 取得に失敗した場合や別の受信者宛ての返信だった場合も送信自体は
    /// 成功しているため、警告のみ出して空の受領情報を返します。
    async fn latest_receipt(&self, recipient_id: &str, media_flag: Option<&'static str>) -> Receipt {
        let latest = match self.fetch_latest(recipient_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "最新メッセージの取得に失敗しました");
                return Receipt::default();
            }
        };
        if !latest.is_addressed_to(recipient_id) {
            warn!(
                recipient = recipient_id,
                addressee = latest.addressee().unwrap_or_default(),
                "別の受信者宛ての返信を無視しました"
            );
            return Receipt::default();
        }

        let mut receipt = Receipt {
            reply_id: latest.message_id().map(str::to_string),
            ..Receipt::default()
        };
        if let Some(flag) = media_flag
            && let Some(content) = latest.extracted_content()
        {
            info!(flag, content, "メディアの処理結果を受け取りました");
            receipt = receipt.with_flag(flag);
        }
        receipt
    }

    async fn fetch_latest(&self, recipient_id: &str) -> Result<LatestMessage, MessagingError> {
        let mut request = self
            .http
            .get(self.settings.latest_message_endpoint())
            .timeout(LATEST_MESSAGE_TIMEOUT)
            .build()?;
        request
            .url_mut()
            .query_pairs_mut()
            .append_pair("wa_id", recipient_id);
        let response = self.http.execute(request).await?.error_for_status()?;
        Ok(response.json::<LatestMessage>().await?)
    }

    /// メディアをアップロードしてメディアIDを得る
    ///
    /// # エラー
    ///
    /// - [`MessagingError::Upload`] - アップロード先が失敗ステータスを返した
    /// - [`MessagingError::Http`] - 通信エラー、または不正なレスポンス
    async fn upload(&self, media: &MediaFile) -> Result<String, MessagingError> {
        let part = reqwest::multipart::Part::bytes(media.bytes.clone())
            .file_name(media.file_name.clone())
            .mime_str(media.mime_type)?;
        let form = reqwest::multipart::Form::new()
            .text("type", media.mime_type)
            .text("messaging_product", "whatsapp")
            .part("file", part);

        let response = self
            .http
            .post(self.settings.media_upload_endpoint())
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MessagingError::Upload {
                status: status.as_u16(),
                body,
            });
        }

        let uploaded: UploadResponse = response.json().await?;
        let media_id = normalize_media_id(&uploaded.id);
        info!(file = %media.file_name, media_id, "メディアをアップロードしました");
        Ok(media_id.to_string())
    }

    async fn upload_body(&self, path: &Path, caption: Option<&str>) -> Result<MediaBody, Delivery> {
        let media = MediaFile::load(path).await.map_err(classify_media_error)?;
        let id = self.upload(&media).await.map_err(classify_media_error)?;
        Ok(MediaBody {
            id,
            mime_type: media.mime_type.to_string(),
            sha256: media.sha256,
            caption: caption.map(str::to_string),
            voice: caption.is_none().then_some(true),
        })
    }
}

#[async_trait]
impl Messenger for WebhookMessenger {
    async fn send_text(&self, to: Conversation<'_>, body: &str) -> Delivery {
        let content = MessageContent::Text {
            text: TextBody {
                body: body.to_string(),
            },
        };
        self.deliver(to, content, None).await
    }

    async fn send_location(&self, to: Conversation<'_>, latitude: f64, longitude: f64) -> Delivery {
        let content = MessageContent::Location {
            location: LocationBody {
                latitude,
                longitude,
            },
        };
        self.deliver(to, content, None).await
    }

    async fn send_image(&self, to: Conversation<'_>, image: &Path, caption: &str) -> Delivery {
        let image = match self.upload_body(image, Some(caption)).await {
            Ok(body) => body,
            Err(failure) => return failure,
        };
        self.deliver(to, MessageContent::Image { image }, Some(FLAG_IMAGE_EXTRACTED))
            .await
    }

    async fn send_voice(&self, to: Conversation<'_>, voice: &Path) -> Delivery {
        let audio = match self.upload_body(voice, None).await {
            Ok(body) => body,
            Err(failure) => return failure,
        };
        self.deliver(to, MessageContent::Audio { audio }, Some(FLAG_VOICE_TRANSCRIBED))
            .await
    }
}

/// 失敗ステータスを分類する（成功なら `None`）
pub fn classify_status(status: StatusCode) -> Option<Delivery> {
    if status.is_success() {
        return None;
    }
    let reason = format!("Webhook が {} を返しました", status);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(Delivery::Transient(reason))
    } else {
        Some(Delivery::Permanent(reason))
    }
}

fn classify_media_error(error: MessagingError) -> Delivery {
    let reason = error.to_string();
    match error {
        MessagingError::MediaNotFound(_) | MessagingError::Io(_) => Delivery::Permanent(reason),
        MessagingError::Upload { status, .. }
            if status == StatusCode::TOO_MANY_REQUESTS.as_u16() || status >= 500 =>
        {
            Delivery::Transient(reason)
        }
        MessagingError::Upload { .. } => Delivery::Permanent(reason),
        MessagingError::Http(_) => Delivery::Transient(reason),
    }
}

/// アップロード API が付ける `media_` 接頭辞を取り除く
fn normalize_media_id(id: &str) -> &str {
    id.strip_prefix("media_").unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::Recipient;

    fn settings(server_url: &str) -> MessagingSettings {
        MessagingSettings {
            phone_number_id: "PHONE_ID".to_string(),
            server_url: server_url.to_string(),
            message_api_url: server_url.to_string(),
            response_wait_ms: 0,
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(classify_status(StatusCode::ACCEPTED), None);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(Delivery::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(Delivery::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            Some(Delivery::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Some(Delivery::Permanent(_))
        ));
    }

    #[test]
    fn test_classify_media_error() {
        assert!(matches!(
            classify_media_error(MessagingError::MediaNotFound("a.png".to_string())),
            Delivery::Permanent(_)
        ));
        assert!(matches!(
            classify_media_error(MessagingError::Upload {
                status: 503,
                body: String::new()
            }),
            Delivery::Transient(_)
        ));
        assert!(matches!(
            classify_media_error(MessagingError::Upload {
                status: 413,
                body: String::new()
            }),
            Delivery::Permanent(_)
        ));
    }

    #[test]
    fn test_normalize_media_id() {
        assert_eq!(normalize_media_id("media_abc123"), "abc123");
        assert_eq!(normalize_media_id("abc123"), "abc123");
    }

    #[tokio::test]
    async fn test_missing_media_is_permanent() {
        let messenger = WebhookMessenger::new(settings("http://127.0.0.1:1")).unwrap();
        let recipient = Recipient::new("1");
        let delivery = messenger
            .send_image(
                Conversation::new(&recipient),
                Path::new("/nonexistent/receipt.jpg"),
                "Image",
            )
            .await;
        assert!(matches!(delivery, Delivery::Permanent(_)));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_transient() {
        let messenger = WebhookMessenger::new(settings("http://127.0.0.1:1")).unwrap();
        let recipient = Recipient::new("1");
        let delivery = messenger
            .send_text(Conversation::new(&recipient), "hello")
            .await;
        assert!(matches!(delivery, Delivery::Transient(_)));
    }
}
