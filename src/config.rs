//! 設定とフロー定義
//!
//! # モジュール構成
//!
//! - [`settings`][]: アプリケーション設定と実行ポリシー
//! - [`flow`][]: フロー定義（ドメインモデル）
//! - [`dto`][]: フロー定義ファイルのデシリアライズ用 DTO
//! - [`step`][]: フローステップ
//! - [`action`][]: 解釈済みの送信アクション
//! - [`catalog`][]: フロー定義ファイルの探索・読み込み・保存

pub mod action;
pub mod catalog;
pub mod dto;
pub mod flow;
pub mod settings;
pub mod step;
