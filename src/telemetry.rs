//! ログ出力の初期化
//!
//! コンソールには人が読む形式、ログディレクトリには1行1イベントの JSON を
//! 日次ローテーションで書き出します。

use std::io;
use std::path::Path;
use std::str::FromStr;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "flow_execution.log";

/// グローバルなログ出力を設定する
///
/// # 引数
///
/// - `level`: `trace` / `debug` / `info` / `warn` / `error`（不正な値は `info`）
/// - `log_dir`: JSON ログの出力先（無ければ作成）
///
/// 戻り値のガードが破棄されると、ファイルへの書き出しが止まります。
/// `main` の終わりまで保持してください。
pub fn init(level: &str, log_dir: &Path) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let filter = LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO);
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(filter);
    let file = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(writer)
        .with_filter(filter);

    // テストなどで既に設定済みの場合はそのまま使う
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init();

    Ok(guard)
}
