//! tracing-subscriber setup.

use tracing_subscriber::EnvFilter;

use pvdify_core::DaemonConfig;

/// Filter used when `RUST_LOG` is unset. `--dev` turns everything up to debug.
pub fn default_directives(config: &DaemonConfig) -> String {
    if config.dev {
        return "debug".to_string();
    }
    let level = match config.log.level.trim() {
        "" => "info",
        level => level,
    };
    format!("{level},pvdifyd=debug,pvdify=debug")
}

/// JSON unless the config asks for text or the daemon runs in dev mode.
pub fn wants_json(config: &DaemonConfig) -> bool {
    !config.dev && config.log.format.trim() != "text"
}

pub fn init(config: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if wants_json(config) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_follow_configured_level() {
        let mut config = DaemonConfig::default();
        assert_eq!(default_directives(&config), "info,pvdifyd=debug,pvdify=debug");
        config.log.level = "warn".into();
        assert_eq!(default_directives(&config), "warn,pvdifyd=debug,pvdify=debug");
        config.dev = true;
        assert_eq!(default_directives(&config), "debug");
    }

    #[test]
    fn dev_mode_forces_text() {
        let mut config = DaemonConfig::default();
        assert!(wants_json(&config));
        config.log.format = "text".into();
        assert!(!wants_json(&config));
        config.log.format = "json".into();
        config.dev = true;
        assert!(!wants_json(&config));
    }
}
