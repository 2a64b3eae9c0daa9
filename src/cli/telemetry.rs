use crate::cli::commands::logging::LogFormat;
use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

fn filter(verbosity_level: Option<Level>) -> Result<EnvFilter> {
    let verbosity_level = verbosity_level.unwrap_or(Level::ERROR);
    Ok(EnvFilter::builder()
        .with_default_directive(verbosity_level.into())
        .from_env_lossy()
        .add_directive("rustls=error".parse()?)
        .add_directive("tokio=error".parse()?))
}

/// Initialize logging.
///
/// `RUST_LOG` overrides the level derived from `-v`.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed
pub fn init(verbosity_level: Option<Level>, format: LogFormat) -> Result<()> {
    let filter = filter(verbosity_level)?;

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_current_span(false)
                .with_target(false);
            let subscriber = Registry::default().with(fmt_layer).with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Text => {
            let fmt_layer = fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_target(false);
            let subscriber = Registry::default().with(fmt_layer).with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_to_error() {
        temp_env::with_var_unset("RUST_LOG", || {
            let filter = filter(None);
            assert!(filter.is_ok());
            assert_eq!(
                filter.ok().and_then(|f| f.max_level_hint()),
                Some(tracing::level_filters::LevelFilter::ERROR)
            );
        });
    }

    #[test]
    fn filter_follows_verbosity() {
        temp_env::with_var_unset("RUST_LOG", || {
            let filter = filter(Some(Level::DEBUG));
            assert_eq!(
                filter.ok().and_then(|f| f.max_level_hint()),
                Some(tracing::level_filters::LevelFilter::DEBUG)
            );
        });
    }
}
