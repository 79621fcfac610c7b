//! Tracing and logging setup shared by binaries and tests.

use tracing_subscriber::EnvFilter;

/// Initialize process-wide JSON logging with a filter directive such as
/// `warehouse_infra=debug`. Invalid directives fall back to `info`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_with_filter(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

fn install(filter: EnvFilter) {
    // JSON lines on stderr so stdout stays free for command output;
    // `try_init` ignores a second install.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_current_span(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init_with_filter("debug");
        init_with_filter("warehouse_infra=trace,info");
        init_with_filter("not a [valid filter");
    }
}
