//! ツール種別ごとのハンドラー
//!
//! 各ハンドラーは Action のペイロードを検証し、[`Messenger`] の対応する
//! 送信操作に変換します。検証に失敗したペイロードは送信せず
//! [`Delivery::Permanent`] を返します。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::ToolHandler;
use crate::config::action::{ActionPayload, ToolKind};
use crate::config::settings::MediaResolver;
use crate::messaging::media::{
    AUDIO_EXTENSIONS, IMAGE_EXTENSIONS, MAX_CAPTION_CHARS, MAX_MEDIA_BYTES, has_extension,
};
use crate::messaging::{Conversation, Delivery, Messenger};

fn mismatch(expected: ToolKind, payload: &ActionPayload) -> Delivery {
    Delivery::Permanent(format!(
        "{} ハンドラーに {} のペイロードが渡されました",
        expected,
        payload.tool()
    ))
}

/// テキストメッセージ
pub struct TextHandler {
    messenger: Arc<dyn Messenger>,
}

impl TextHandler {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl ToolHandler for TextHandler {
    fn kind(&self) -> ToolKind {
        ToolKind::Text
    }

    async fn send(&self, payload: &ActionPayload, to: Conversation<'_>) -> Delivery {
        let ActionPayload::Text { body } = payload else {
            return mismatch(self.kind(), payload);
        };
        if let Err(reason) = payload.validate() {
            return Delivery::Permanent(reason);
        }
        self.messenger.send_text(to, body).await
    }
}

/// 位置情報
pub struct LocationHandler {
    messenger: Arc<dyn Messenger>,
}

impl LocationHandler {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl ToolHandler for LocationHandler {
    fn kind(&self) -> ToolKind {
        ToolKind::Location
    }

    async fn send(&self, payload: &ActionPayload, to: Conversation<'_>) -> Delivery {
        let ActionPayload::Location {
            latitude,
            longitude,
        } = payload
        else {
            return mismatch(self.kind(), payload);
        };
        if let Err(reason) = payload.validate() {
            return Delivery::Permanent(reason);
        }
        self.messenger.send_location(to, *latitude, *longitude).await
    }
}

/// 画像
pub struct ImageHandler {
    messenger: Arc<dyn Messenger>,
    resolver: MediaResolver,
}

impl ImageHandler {
    pub fn new(messenger: Arc<dyn Messenger>, resolver: MediaResolver) -> Self {
        Self {
            messenger,
            resolver,
        }
    }
}

#[async_trait]
impl ToolHandler for ImageHandler {
    fn kind(&self) -> ToolKind {
        ToolKind::Image
    }

    async fn send(&self, payload: &ActionPayload, to: Conversation<'_>) -> Delivery {
        let ActionPayload::Image {
            image_path,
            caption,
        } = payload
        else {
            return mismatch(self.kind(), payload);
        };
        if let Err(reason) = payload.validate() {
            return Delivery::Permanent(reason);
        }
        if caption.chars().count() > MAX_CAPTION_CHARS {
            return Delivery::Permanent(format!(
                "キャプションは {} 文字以内である必要があります",
                MAX_CAPTION_CHARS
            ));
        }

        match resolve_media(&self.resolver, image_path, &IMAGE_EXTENSIONS).await {
            Ok(path) => self.messenger.send_image(to, &path, caption).await,
            Err(failure) => failure,
        }
    }
}

/// 音声メッセージ
pub struct VoiceHandler {
    messenger: Arc<dyn Messenger>,
    resolver: MediaResolver,
}

impl VoiceHandler {
    pub fn new(messenger: Arc<dyn Messenger>, resolver: MediaResolver) -> Self {
        Self {
            messenger,
            resolver,
        }
    }
}

#[async_trait]
impl ToolHandler for VoiceHandler {
    fn kind(&self) -> ToolKind {
        ToolKind::Voice
    }

    async fn send(&self, payload: &ActionPayload, to: Conversation<'_>) -> Delivery {
        let ActionPayload::Voice { voice_path } = payload else {
            return mismatch(self.kind(), payload);
        };
        if let Err(reason) = payload.validate() {
            return Delivery::Permanent(reason);
        }

        match resolve_media(&self.resolver, voice_path, &AUDIO_EXTENSIONS).await {
            Ok(path) => self.messenger.send_voice(to, &path).await,
            Err(failure) => failure,
        }
    }
}

/// メディアファイルを解決し、拡張子とサイズを確認する
async fn resolve_media(
    resolver: &MediaResolver,
    file: &str,
    extensions: &[&str],
) -> Result<PathBuf, Delivery> {
    let Some(path) = resolver.resolve(file) else {
        return Err(Delivery::Permanent(format!(
            "メディアファイルが見つかりません: {}",
            file
        )));
    };

    if !has_extension(&path, extensions) {
        return Err(Delivery::Permanent(format!(
            "対応していない形式です: {} (対応: {})",
            path.display(),
            extensions.join(", ")
        )));
    }

    let size = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len())
        .map_err(|e| Delivery::Permanent(format!("{}: {}", path.display(), e)))?;
    if size > MAX_MEDIA_BYTES {
        return Err(Delivery::Permanent(format!(
            "ファイルサイズが上限 (16MB) を超えています: {} ({} bytes)",
            path.display(),
            size
        )));
    }

    debug!(file, resolved = %path.display(), "メディアファイルを解決しました");
    Ok(path)
}
