use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
	fmt::writer::BoxMakeWriter, prelude::__tracing_subscriber_SubscriberExt,
	util::SubscriberInitExt,
};

/// Installs the global subscriber. Later calls are no-ops, so every test may
/// call this.
pub fn logging(level: LevelFilter) {
	/// Like [`tracing_subscriber::fmt::time::Uptime`] but with
	/// hour/minute/second formatting for better clarity.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct Uptime(std::time::Instant);

	impl Default for Uptime {
		fn default() -> Self {
			Self(std::time::Instant::now())
		}
	}

	impl tracing_subscriber::fmt::time::FormatTime for Uptime {
		fn format_time(
			&self,
			w: &mut tracing_subscriber::fmt::format::Writer<'_>,
		) -> std::fmt::Result {
			let elapsed = self.0.elapsed();
			let secs = elapsed.as_secs() % 60;
			let mins = (elapsed.as_secs() / 60) % 60;
			let hours = elapsed.as_secs() / 3600;
			write!(w, "{hours:02}:{mins:02}:{secs:02}")
		}
	}

	let timer = Uptime::default();
	let layer_stderr = tracing_subscriber::fmt::Layer::default()
		.with_timer(timer)
		.with_ansi(false)
		.with_thread_names(true)
		.with_writer(BoxMakeWriter::new(std::io::stderr));
	let collector = tracing_subscriber::registry()
		.with(layer_stderr)
		.with(level);
	let _ = collector.try_init();
}
