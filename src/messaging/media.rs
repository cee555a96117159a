//! 送信するメディアファイル
//!
//! ファイルを読み込み、MIME タイプと SHA-256 ダイジェストを求めます。

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::MessagingError;

/// WhatsApp のメディア上限
pub const MAX_MEDIA_BYTES: u64 = 16 * 1024 * 1024;

/// 画像キャプションの最大文字数
pub const MAX_CAPTION_CHARS: usize = 1024;

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];
pub const AUDIO_EXTENSIONS: [&str; 8] = ["wav", "mp3", "mp4", "ogg", "flac", "m4a", "aac", "opus"];

/// 拡張子から MIME タイプを求める
pub fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "mp4" | "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "opus" => "audio/opus",
        _ => "application/octet-stream",
    }
}

/// 拡張子が許可リストに含まれるか
pub fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 読み込み済みのメディアファイル
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: &'static str,
    pub sha256: String,
    pub bytes: Vec<u8>,
}

impl MediaFile {
    /// ファイルを読み込む
    ///
    /// # エラー
    ///
    /// - [`MessagingError::MediaNotFound`] - ファイルが存在しない
    /// - [`MessagingError::Io`] - 読み込みに失敗
    pub async fn load(path: &Path) -> Result<Self, MessagingError> {
        if !path.is_file() {
            return Err(MessagingError::MediaNotFound(path.display().to_string()));
        }
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(path, bytes))
    }

    pub fn from_bytes(path: &Path, bytes: Vec<u8>) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());
        Self {
            path: path.to_path_buf(),
            file_name,
            mime_type: mime_type(path),
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type(Path::new("a/B.JPG")), "image/jpeg");
        assert_eq!(mime_type(Path::new("v.m4a")), "audio/mp4");
        assert_eq!(mime_type(Path::new("notes")), "application/octet-stream");
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension(Path::new("x.PNG"), &IMAGE_EXTENSIONS));
        assert!(!has_extension(Path::new("x.wav"), &IMAGE_EXTENSIONS));
        assert!(!has_extension(Path::new("x"), &AUDIO_EXTENSIONS));
    }

    #[test]
    fn test_sha256_digest() {
        let media = MediaFile::from_bytes(Path::new("hello.txt"), b"hello".to_vec());
        assert_eq!(
            media.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(media.file_name, "hello.txt");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = MediaFile::load(Path::new("/nonexistent/file.png")).await;
        assert!(matches!(result, Err(MessagingError::MediaNotFound(_))));
    }
}
