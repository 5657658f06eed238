use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive. Overrides
/// the verbosity flags when set.
pub const LOG_ENV: &str = "SHARDLINE_LOG";

fn filter(verbose: u8, quiet: bool) -> EnvFilter {
    if let Ok(env) = std::env::var(LOG_ENV) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    }
}

/// Install a stderr subscriber for the process. Does nothing if one is
/// already installed.
pub fn init_tracing(verbose: u8, quiet: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose, quiet))
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}
