use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with stderr logging.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}

/// Same as [`setup_logging`] but tolerant of repeat initialization, for tests.
pub fn try_setup_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.try_init();
}
