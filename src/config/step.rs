//! フローステップの定義
//!
//! # 責務
//!
//! Flowを構成するStepの定義体を提供するモジュール
//! アプリケーションに対して、[StepSpec] を提供する。

use serde::Serialize;

/// フローステップ（ドメインモデル）
///
/// 人が書いた1ステップ分の自由記述テキストと、フロー内での位置（1始まり）を保持します。
/// [`FlowDefinition`](super::flow::FlowDefinition) が所有し、変更されません。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSpec {
    ordinal: u32,
    text: String,
}

impl StepSpec {
    pub fn new(ordinal: u32, text: impl Into<String>) -> Self {
        Self {
            ordinal,
            text: text.into(),
        }
    }

    /// 1始まりの位置
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// 生のステップテキスト
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// ステップテキストの並びから連番付きの [`StepSpec`] を生成
pub(crate) fn number_steps<I, S>(texts: I) -> Vec<StepSpec>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| StepSpec::new(index as u32 + 1, text))
        .collect()
}
