//! ツール振り分け
//!
//! # 責務
//!
//! [`Action`] のツール種別に対応する [`ToolHandler`] を引き、1人の受信者へ
//! 送信します。送信結果は [`Delivery`] の三値で返し、再試行の判断は
//! 実行エンジンに任せます。
//!
//! # 使用例
//!
//! ```ignore
//! let dispatcher = ToolDispatcher::standard(messenger, settings.media_resolver(&flow));
//! let delivery = dispatcher.send(&action, Conversation::new(&recipient)).await?;
//! ```

pub mod handlers;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::action::{Action, ActionPayload, ToolKind};
use crate::config::settings::MediaResolver;
use crate::error::DispatchError;
use crate::messaging::{Conversation, Delivery, Messenger};

pub use handlers::{ImageHandler, LocationHandler, TextHandler, VoiceHandler};

/// ツールハンドラー
///
/// ペイロードをメッセージング連携の呼び出し形式に変換し、結果を
/// [`Delivery`] に分類します。
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// 担当するツール種別
    fn kind(&self) -> ToolKind;

    /// ペイロードを1人の受信者へ送る
    async fn send(&self, payload: &ActionPayload, to: Conversation<'_>) -> Delivery;
}

/// ツール種別をキーとするハンドラーの登録簿
#[derive(Clone, Default)]
pub struct ToolDispatcher {
    handlers: BTreeMap<ToolKind, Arc<dyn ToolHandler>>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 4種のツールをすべて登録した振り分け器
    pub fn standard(messenger: Arc<dyn Messenger>, resolver: MediaResolver) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Arc::new(TextHandler::new(messenger.clone())));
        dispatcher.register(Arc::new(LocationHandler::new(messenger.clone())));
        dispatcher.register(Arc::new(ImageHandler::new(messenger.clone(), resolver.clone())));
        dispatcher.register(Arc::new(VoiceHandler::new(messenger, resolver)));
        dispatcher
    }

    /// ハンドラーを登録する（同じ種別は置き換え）
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn supports(&self, kind: ToolKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Action を送信する
    ///
    /// # エラー
    ///
    /// - [`DispatchError::UnsupportedTool`] - 種別に対応するハンドラーが無い
    pub async fn send(
        &self,
        action: &Action,
        to: Conversation<'_>,
    ) -> Result<Delivery, DispatchError> {
        let handler = self
            .handlers
            .get(&action.tool())
            .ok_or(DispatchError::UnsupportedTool(action.tool()))?;
        Ok(handler.send(action.payload(), to).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::action::ActionSource;
    use crate::config::flow::FlowDefinition;
    use crate::config::settings::Settings;
    use crate::recipients::Recipient;
    use std::path::Path;
    use std::sync::Mutex;

    /// 呼び出しを記録するモック
    #[derive(Default)]
    struct RecordingMessenger {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingMessenger {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send_text(&self, to: Conversation<'_>, body: &str) -> Delivery {
            self.calls
                .lock()
                .unwrap()
                .push(format!("text:{}:{}", to.recipient.id, body));
            Delivery::succeeded()
        }

        async fn send_location(&self, _to: Conversation<'_>, lat: f64, lon: f64) -> Delivery {
            self.calls.lock().unwrap().push(format!("location:{},{}", lat, lon));
            Delivery::succeeded()
        }

        async fn send_image(&self, _to: Conversation<'_>, image: &Path, caption: &str) -> Delivery {
            let name = image.file_name().unwrap().to_string_lossy().into_owned();
            self.calls
                .lock()
                .unwrap()
                .push(format!("image:{}:{}", name, caption));
            Delivery::succeeded()
        }

        async fn send_voice(&self, _to: Conversation<'_>, voice: &Path) -> Delivery {
            let name = voice.file_name().unwrap().to_string_lossy().into_owned();
            self.calls.lock().unwrap().push(format!("voice:{}", name));
            Delivery::succeeded()
        }
    }

    fn resolver_for(base: &Path) -> MediaResolver {
        let toml = format!("[paths]\nbase_path = {:?}\n", base.display().to_string());
        let settings = Settings::from_toml_with_env(&toml, |_| None).unwrap();
        settings.media_resolver(&FlowDefinition::new("t", "", ["a"]).with_media_path("assets"))
    }

    fn action(payload: ActionPayload) -> Action {
        Action::new(1, payload, ActionSource::Rule)
    }

    #[tokio::test]
    async fn test_routes_by_tool_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets").join("odo.jpg"), b"jpg").unwrap();
        std::fs::write(dir.path().join("assets").join("note.ogg"), b"ogg").unwrap();

        let messenger = Arc::new(RecordingMessenger::default());
        let dispatcher = ToolDispatcher::standard(messenger.clone(), resolver_for(dir.path()));
        let recipient = Recipient::new("919700000001");
        let to = Conversation::new(&recipient);

        let actions = [
            action(ActionPayload::Text {
                body: "expense".to_string(),
            }),
            action(ActionPayload::Location {
                latitude: 12.9,
                longitude: 77.6,
            }),
            action(ActionPayload::Image {
                image_path: "odo.jpg".to_string(),
                caption: "Image".to_string(),
            }),
            action(ActionPayload::Voice {
                voice_path: "note.ogg".to_string(),
            }),
        ];
        for action in &actions {
            let delivery = dispatcher.send(action, to).await.unwrap();
            assert!(delivery.is_success());
        }

        assert_eq!(
            messenger.calls(),
            vec![
                "text:919700000001:expense",
                "location:12.9,77.6",
                "image:odo.jpg:Image",
                "voice:note.ogg",
            ]
        );
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_unsupported() {
        let messenger = Arc::new(RecordingMessenger::default());
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(Arc::new(TextHandler::new(messenger)));
        assert!(dispatcher.supports(ToolKind::Text));
        assert!(!dispatcher.supports(ToolKind::Voice));

        let recipient = Recipient::new("1");
        let result = dispatcher
            .send(
                &action(ActionPayload::Voice {
                    voice_path: "a.ogg".to_string(),
                }),
                Conversation::new(&recipient),
            )
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::UnsupportedTool(ToolKind::Voice))
        ));
    }

    #[tokio::test]
    async fn test_media_failures_are_permanent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets").join("notes.txt"), b"txt").unwrap();

        let messenger = Arc::new(RecordingMessenger::default());
        let dispatcher = ToolDispatcher::standard(messenger.clone(), resolver_for(dir.path()));
        let recipient = Recipient::new("1");
        let to = Conversation::new(&recipient);

        let missing = dispatcher
            .send(
                &action(ActionPayload::Image {
                    image_path: "missing.png".to_string(),
                    caption: "Image".to_string(),
                }),
                to,
            )
            .await
            .unwrap();
        assert!(matches!(missing, Delivery::Permanent(_)));

        let wrong_extension = dispatcher
            .send(
                &action(ActionPayload::Voice {
                    voice_path: "notes.txt".to_string(),
                }),
                to,
            )
            .await
            .unwrap();
        assert!(matches!(wrong_extension, Delivery::Permanent(_)));

        let long_caption = dispatcher
            .send(
                &action(ActionPayload::Image {
                    image_path: "notes.txt".to_string(),
                    caption: "x".repeat(1025),
                }),
                to,
            )
            .await
            .unwrap();
        assert!(matches!(long_caption, Delivery::Permanent(_)));

        assert!(messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_sent() {
        let messenger = Arc::new(RecordingMessenger::default());
        let dispatcher = ToolDispatcher::standard(messenger.clone(), resolver_for(Path::new(".")));
        let recipient = Recipient::new("1");

        let delivery = dispatcher
            .send(
                &action(ActionPayload::Location {
                    latitude: 91.0,
                    longitude: 0.0,
                }),
                Conversation::new(&recipient),
            )
            .await
            .unwrap();
        assert!(matches!(delivery, Delivery::Permanent(_)));
        assert!(messenger.calls().is_empty());
    }
}
