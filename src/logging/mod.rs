use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` directives are honored; the
/// configured level applies to this crate.
pub fn init(level: &str) {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("pod_decorator={}", normalize_level(level)).parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Accept the syslog-style names used in existing pod specs.
fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}
