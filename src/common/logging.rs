use env_logger::{Builder, Env};
use std::io::Write;

/// Initialize the logging system with timestamp, level, and message formatting.
///
/// Logs at INFO by default; `RUST_LOG` overrides the filter.
/// Format: `[YYYY-MM-DD HH:MM:SS] [LEVEL] [target] message`
pub fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
