//! 外部CLIコマンドによる言語モデルクライアント
//!
//! # 責務
//!
//! - 任意のCLIツール（`llm`, `ollama run <model>` など）を呼び出す
//! - [`LanguageModel`] トレイトを実装し、統一インターフェースを提供
//! - stderr から認証エラーやレート制限を検出
//!
//! # 呼び出し形式
//!
//! `LLM_COMMAND` を空白で分割し、最後の引数として
//! 「システムプロンプト + 空行 + プロンプト」を渡します。
//! 標準出力全体を生成テキストとして扱います。
//!
//! ```text
//! LLM_COMMAND="llm -m gpt-4o-mini"
//!   → llm -m gpt-4o-mini "<system>\n\n<prompt>"
//! ```

use async_trait::async_trait;
use tokio::process::Command;

use super::traits::LanguageModel;
use crate::error::ProviderError;

/// 外部CLIコマンドクライアント
pub struct CommandClient {
    program: String,
    args: Vec<String>,
}

impl CommandClient {
    /// コマンドライン文字列からクライアントを生成
    ///
    /// # エラー
    ///
    /// - [`ProviderError::CliExecutionError`] - コマンドが空
    pub fn from_command_line(command_line: &str) -> Result<Self, ProviderError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ProviderError::CliExecutionError("LLM_COMMAND が空です".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// CLIツールが利用可能かチェック
    ///
    /// Unix系では `which`、Windowsでは `where` を使用します。
    ///
    /// # エラー
    ///
    /// - [`ProviderError::CliNotFound`] - CLIツールが見つからない
    pub async fn check_available(&self) -> Result<(), ProviderError> {
        let check_command = if cfg!(target_os = "windows") {
            "where"
        } else {
            "which"
        };

        let found = Command::new(check_command)
            .arg(&self.program)
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false);

        if found {
            Ok(())
        } else {
            Err(ProviderError::CliNotFound(
                self.program.clone(),
                "LLM_COMMAND で指定したツール".to_string(),
            ))
        }
    }

    /// stderrから認証エラーやレート制限を検出
    fn detect_error_from_stderr(stderr: &str) -> Result<(), ProviderError> {
        let lower = stderr.to_lowercase();

        if lower.contains("authentication")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
        {
            return Err(ProviderError::AuthenticationError(stderr.to_string()));
        }

        if lower.contains("rate limit") || lower.contains("too many requests") {
            return Err(ProviderError::RateLimitExceeded);
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return Err(ProviderError::Timeout(stderr.to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl LanguageModel for CommandClient {
    async fn extract(&self, system_prompt: &str, prompt: &str) -> Result<String, ProviderError> {
        let combined_prompt = format!("{}\n\n{}", system_prompt, prompt);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&combined_prompt)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ProviderError::CliNotFound(
                    self.program.clone(),
                    "LLM_COMMAND で指定したツール".to_string(),
                ),
                _ => ProviderError::Io(e),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            Self::detect_error_from_stderr(&stderr)?;
            return Err(ProviderError::CliExecutionError(format!(
                "{} exited with code {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        let stdout = String::from_utf8(output.stdout)?;
        if stdout.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("No content in response".to_string()));
        }
        Ok(stdout.trim().to_string())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line() {
        let client = CommandClient::from_command_line("llm -m gpt-4o-mini").unwrap();
        assert_eq!(client.program, "llm");
        assert_eq!(client.args, vec!["-m", "gpt-4o-mini"]);
        assert_eq!(client.name(), "llm");
    }

    #[test]
    fn test_empty_command_line() {
        let result = CommandClient::from_command_line("   ");
        assert!(matches!(result, Err(ProviderError::CliExecutionError(_))));
    }

    #[test]
    fn test_detect_error_from_stderr() {
        assert!(matches!(
            CommandClient::detect_error_from_stderr("Error: Invalid API key"),
            Err(ProviderError::AuthenticationError(_))
        ));
        assert!(matches!(
            CommandClient::detect_error_from_stderr("Rate limit exceeded"),
            Err(ProviderError::RateLimitExceeded)
        ));
        assert!(matches!(
            CommandClient::detect_error_from_stderr("request timed out"),
            Err(ProviderError::Timeout(_))
        ));
        assert!(CommandClient::detect_error_from_stderr("").is_ok());
    }

    #[tokio::test]
    async fn test_check_not_available() {
        let client = CommandClient::from_command_line("nonexistent-command-xyz123").unwrap();
        match client.check_available().await {
            Err(ProviderError::CliNotFound(cmd, _)) => {
                assert_eq!(cmd, "nonexistent-command-xyz123");
            }
            other => panic!("Expected CliNotFound error, got {:?}", other.err()),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_returns_stdout() {
        let client = CommandClient::from_command_line("echo").unwrap();
        let answer = client.extract("system", "prompt").await.unwrap();
        assert_eq!(answer, "system\n\nprompt");
    }
}
