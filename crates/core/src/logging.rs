use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber with `RUST_LOG` filtering (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init_tracing();
        super::init_tracing();
        tracing::info!("tracing initialised twice without panicking");
    }
}
