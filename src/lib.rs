//! メッセージングボット向けのシナリオテストハーネス
//!
//! 人が書いたフロー定義を読み込み、各ステップを送信アクションに解釈して
//! 複数の受信者に並行して送り、受信者ごとの結果をレポートにまとめます。
//!
//! # モジュール構成
//!
//! - [`config`][]: 設定・フロー定義・フローカタログ
//! - [`interpreter`][]: ステップテキスト → Action
//! - [`dispatch`][]: Action → ツールハンドラー
//! - [`messaging`][]: Webhook 経由の送信
//! - [`engine`][]: 受信者ごとの実行・再試行・中断
//! - [`report`][]: 実行レポートと保存先
//! - [`recipients`][]: 受信者データソース
//! - [`provider`][]: 言語モデル連携
//! - [`generate`][]: プロンプトからのフロー生成
//! - [`telemetry`][]: ログ出力の初期化

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod generate;
pub mod interpreter;
pub mod messaging;
pub mod provider;
pub mod recipients;
pub mod report;
pub mod telemetry;
