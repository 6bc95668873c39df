//! Subscriber construction.
//!
//! Filtering follows `RUST_LOG` (default `info`, with this workspace's crates
//! at `debug` when `EVENTVAULT_DEBUG` is set).

use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Json,
    Pretty,
}

impl Format {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("EVENTVAULT_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.eq_ignore_ascii_case("pretty") => Format::Pretty,
            _ => Format::Json,
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if std::env::var_os("EVENTVAULT_DEBUG").is_some() {
            EnvFilter::new("info,eventvault_core=debug,eventvault_infra=debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Install the global subscriber. Later calls are ignored; returns whether
/// this call installed it.
pub fn init(format: Format) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    // JSON logs carry span fields (tenant_id, aggregate_id) on every line.
    let installed = match format {
        Format::Json => builder
            .json()
            .with_current_span(true)
            .with_target(false)
            .try_init(),
        Format::Pretty => builder.with_target(true).try_init(),
    }
    .is_ok();

    if installed {
        ::tracing::debug!(?format, "tracing subscriber installed");
    }
    installed
}
