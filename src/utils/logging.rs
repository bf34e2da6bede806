use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    if let Err(err) = result {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

fn default_directive(level: &str) -> String {
    let level = match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => level.to_ascii_lowercase(),
        "silly" | "verbose" => "trace".to_string(),
        _ => "info".to_string(),
    };
    format!("ticket_core={level},serenity=warn,diesel=warn,salvo=info")
}

#[cfg(test)]
mod tests {
    use super::default_directive;

    #[test]
    fn known_levels_pass_through() {
        assert_eq!(
            default_directive("DEBUG"),
            "ticket_core=debug,serenity=warn,diesel=warn,salvo=info"
        );
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert!(default_directive("loud").starts_with("ticket_core=info"));
        assert!(default_directive("verbose").starts_with("ticket_core=trace"));
    }
}
