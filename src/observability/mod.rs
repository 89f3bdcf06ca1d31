//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志输出到 stderr，默认 info，可通过 RUST_LOG 覆盖；stdout 留给进度事件
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
