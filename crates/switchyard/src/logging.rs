//! Tracing setup shared by controllers and children.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset, from a `SWITCHYARD_LOG` level.
fn default_filter(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "switchyard={level},switchyard_echo_worker={level}",
        level = base_level
    )
}

/// Install a stderr subscriber. `LOG_FORMAT=json` switches to JSON lines.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("SWITCHYARD_LOG").ok();
        EnvFilter::new(default_filter(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(
            default_filter(Some("warning")),
            "switchyard=warn,switchyard_echo_worker=warn"
        );
        assert_eq!(
            default_filter(None),
            "switchyard=info,switchyard_echo_worker=info"
        );
        assert!(default_filter(Some("nonsense")).starts_with("switchyard=info"));
    }

    #[test]
    fn default_filter_parses() {
        for level in [None, Some("trace"), Some("debug"), Some("error")] {
            assert!(EnvFilter::try_new(default_filter(level)).is_ok());
        }
    }
}
