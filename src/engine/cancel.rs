//! 実行の中断
//!
//! [`RunHandle::cancel`] を呼ぶと、新しい受信者の実行は開始されなくなります。
//! 送信中の試行はそのまま終わりまで進みます。

use std::sync::Arc;

use tokio::sync::watch;

/// 中断の要求側
#[derive(Debug, Clone)]
pub struct RunHandle {
    sender: Arc<watch::Sender<bool>>,
}

/// 中断の監視側
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

/// 対になる要求側と監視側を生成
pub fn cancellation() -> (RunHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        RunHandle {
            sender: Arc::new(sender),
        },
        CancelSignal { receiver },
    )
}

impl RunHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl CancelSignal {
    /// 中断されることのない監視側
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// 中断されるまで待つ
    ///
    /// 要求側が破棄された場合は中断されないため、永久に待ちます。
    pub async fn cancelled(&mut self) {
        let closed = self.receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
