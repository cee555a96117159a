//! 決定的ルールによるステップ解釈
//!
//! よく使われる言い回しを正規表現で照合し、言語モデルを呼ばずに
//! 検証済みの [`Action`] を生成します。照合順は位置情報 → 画像 → 音声 → テキストです。
//!
//! | ルール | 条件 |
//! |--------|------|
//! | 位置情報 | `latitude` と `longitude` の数値が両方ある |
//! | 画像 | 画像キーワード + 引用符付きの画像パス |
//! | 音声 | 音声キーワード + 引用符付きの音声パス |
//! | テキスト | 送信動詞または `message` + 引用符付きのリテラル |

use std::sync::LazyLock;

use regex::Regex;

use crate::config::action::{Action, ActionPayload, ActionSource};
use crate::config::flow::{AUDIO_KEYWORDS, AUDIO_PATH, IMAGE_KEYWORDS, IMAGE_PATH};
use crate::config::step::StepSpec;

static LATITUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)latitude[:\s=]+(-?\d+(?:\.\d+)?)").expect("valid latitude regex")
});

static LONGITUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)longitude[:\s=]+(-?\d+(?:\.\d+)?)").expect("valid longitude regex")
});

static SEND_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sends?|types?|repl(?:y|ies)|enters?|says?|message)\b")
        .expect("valid send verb regex")
});

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'([^']+)'|"([^"]+)""#).expect("valid quoted literal regex"));

/// 画像ステップでキャプションが読み取れない場合の値
const DEFAULT_CAPTION: &str = "Image";

/// ルールに一致すれば検証済みのアクションを返す
pub fn match_rule(step: &StepSpec) -> Option<Action> {
    let payload = location(step.text())
        .or_else(|| image(step.text()))
        .or_else(|| voice(step.text()))
        .or_else(|| text(step.text()))?;

    // ルールの出力もスキーマ検証を通す（範囲外の座標などはモデルに委ねる）
    payload.validate().ok()?;
    Some(Action::new(step.ordinal(), payload, ActionSource::Rule))
}

fn location(text: &str) -> Option<ActionPayload> {
    let latitude = LATITUDE.captures(text)?[1].parse().ok()?;
    let longitude = LONGITUDE.captures(text)?[1].parse().ok()?;
    Some(ActionPayload::Location {
        latitude,
        longitude,
    })
}

fn image(text: &str) -> Option<ActionPayload> {
    let lower = text.to_lowercase();
    if !IMAGE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return None;
    }
    let path = IMAGE_PATH.captures(text)?[1].to_string();
    Some(ActionPayload::Image {
        image_path: path,
        caption: DEFAULT_CAPTION.to_string(),
    })
}

fn voice(text: &str) -> Option<ActionPayload> {
    let lower = text.to_lowercase();
    if !AUDIO_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return None;
    }
    let path = AUDIO_PATH.captures(text)?[1].to_string();
    Some(ActionPayload::Voice { voice_path: path })
}

fn text(text: &str) -> Option<ActionPayload> {
    if !SEND_VERB.is_match(text) {
        return None;
    }
    let caps = QUOTED.captures(text)?;
    let body = caps.get(1).or_else(|| caps.get(2))?.as_str().to_string();
    Some(ActionPayload::Text { body })
}

/// ステップテキスト中の引用符付きメディアパス
///
/// 言語モデルの回答に含まれるパスより、ステップに書かれたパスを優先するために使います。
pub(crate) fn quoted_media_path(text: &str, image: bool) -> Option<String> {
    let pattern = if image { &IMAGE_PATH } else { &AUDIO_PATH };
    pattern.captures(text).map(|caps| caps[1].to_string())
}
