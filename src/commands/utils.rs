use chrono::Duration;

/// Initialize logging
pub fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "quizlock=debug,info" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let rest = secs % 60;
        if rest == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}m {}s", secs / 60, rest)
        }
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
