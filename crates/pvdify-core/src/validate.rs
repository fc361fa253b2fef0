//! Input validation for user-supplied identifiers.
//!
//! Anything that ends up in a generated unit file is checked here first, so
//! it can never carry a newline, quote or systemd specifier into the unit.

use std::sync::LazyLock;

use regex::Regex;

static APP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,62}$").expect("valid regex"));
static PROCESS_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,31}$").expect("valid regex"));
static HOST_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid regex"));
static MEMORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+[bkmgBKMG]?$").expect("valid regex"));
static CPU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("valid regex"));
static HEALTH_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9._~/:@+,=-]{0,255}$").expect("valid regex"));
static CONFIG_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid app name {0:?}: must match ^[a-z][a-z0-9-]{{0,62}}$")]
    AppName(String),

    #[error("invalid process type {0:?}: must match ^[a-z][a-z0-9_]{{0,31}}$")]
    ProcessType(String),

    #[error("invalid hostname {0:?}")]
    Hostname(String),

    #[error("invalid image reference {0:?}")]
    Image(String),

    #[error("invalid config key {0:?}")]
    ConfigKey(String),

    #[error("invalid memory limit {0:?}: expected a size such as 512M or 1G")]
    Memory(String),

    #[error("invalid cpu share {0:?}: expected a decimal such as 0.5 or 2")]
    Cpu(String),

    #[error("invalid health check path {0:?}: expected an absolute URL path")]
    HealthPath(String),

    #[error("invalid scale count {count} for process type {process_type}: must be >= 0")]
    NegativeCount { process_type: String, count: i64 },
}

pub fn app_name(name: &str) -> Result<(), ValidationError> {
    if APP_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::AppName(name.to_string()))
    }
}

pub fn process_type(name: &str) -> Result<(), ValidationError> {
    if PROCESS_TYPE.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::ProcessType(name.to_string()))
    }
}

/// Lowercase DNS name with at least two labels.
pub fn hostname(host: &str) -> Result<(), ValidationError> {
    let err = || ValidationError::Hostname(host.to_string());
    if host.is_empty() || host.len() > 253 {
        return Err(err());
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || !labels.iter().all(|l| HOST_LABEL.is_match(l)) {
        return Err(err());
    }
    Ok(())
}

/// Container image reference. Only shape is checked here; the runtime
/// decides whether it can actually be pulled.
pub fn image(reference: &str) -> Result<(), ValidationError> {
    let ok = !reference.is_empty()
        && reference.len() <= 512
        && !reference.starts_with(['-', ':', '@', '/'])
        && !reference.chars().any(|c| c.is_whitespace() || c.is_control());
    if ok {
        Ok(())
    } else {
        Err(ValidationError::Image(reference.to_string()))
    }
}

pub fn memory(limit: &str) -> Result<(), ValidationError> {
    if MEMORY.is_match(limit) {
        Ok(())
    } else {
        Err(ValidationError::Memory(limit.to_string()))
    }
}

pub fn cpu(share: &str) -> Result<(), ValidationError> {
    if CPU.is_match(share) {
        Ok(())
    } else {
        Err(ValidationError::Cpu(share.to_string()))
    }
}

/// Path probed over HTTP, e.g. `/up`. Query strings, quotes, whitespace and
/// `%` are rejected.
pub fn health_path(path: &str) -> Result<(), ValidationError> {
    if HEALTH_PATH.is_match(path) {
        Ok(())
    } else {
        Err(ValidationError::HealthPath(path.to_string()))
    }
}

pub fn config_key(key: &str) -> Result<(), ValidationError> {
    if CONFIG_KEY.is_match(key) {
        Ok(())
    } else {
        Err(ValidationError::ConfigKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_names() {
        assert!(app_name("a").is_ok());
        assert!(app_name("my-app-2").is_ok());
        assert!(app_name(&format!("a{}", "b".repeat(62))).is_ok());

        assert!(app_name("").is_err());
        assert!(app_name("2app").is_err());
        assert!(app_name("My-App").is_err());
        assert!(app_name("my_app").is_err());
        assert!(app_name(&format!("a{}", "b".repeat(63))).is_err());
    }

    #[test]
    fn hostnames() {
        assert!(hostname("app.example.com").is_ok());
        assert!(hostname("a-b.io").is_ok());

        assert!(hostname("localhost").is_err());
        assert!(hostname("-bad.example.com").is_err());
        assert!(hostname("bad..example.com").is_err());
        assert!(hostname("UPPER.example.com").is_err());
    }

    #[test]
    fn images() {
        assert!(image("ghcr.io/acme/shop:v1").is_ok());
        assert!(image("nginx").is_ok());
        assert!(image("registry:5000/x@sha256:abc").is_ok());

        assert!(image("").is_err());
        assert!(image("--rm").is_err());
        assert!(image("bad image").is_err());
    }

    #[test]
    fn process_types_and_keys() {
        assert!(process_type("web").is_ok());
        assert!(process_type("worker_2").is_ok());
        assert!(process_type("Web").is_err());
        // `shop` + `eu-web` would collide with `shop-eu` + `web`.
        assert!(process_type("eu-web").is_err());

        assert!(config_key("DATABASE_URL").is_ok());
        assert!(config_key("_x").is_ok());
        assert!(config_key("1X").is_err());
        assert!(config_key("A-B").is_err());
    }

    #[test]
    fn resource_limits() {
        for ok in ["512M", "1G", "1024", "64k", "2g"] {
            assert!(memory(ok).is_ok(), "{ok}");
        }
        for bad in ["", "512MB", "-1G", "1.5G", "512M\nExecStartPre=/bin/sh -c id"] {
            assert!(memory(bad).is_err(), "{bad:?}");
        }

        for ok in ["0.5", "2", "1.25"] {
            assert!(cpu(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".5", "1.", "half", "1\nUser=root"] {
            assert!(cpu(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn health_paths() {
        for ok in ["/", "/up", "/health/live", "/v1/ping.json", "/a_b-c~d"] {
            assert!(health_path(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "up",
            "/h\" ; touch /tmp/x ; \"",
            "/a b",
            "/a;b",
            "/%i",
            "/$HOME",
            "/a'b",
            "/a\nb",
            "/q?x=1",
        ] {
            assert!(health_path(bad).is_err(), "{bad:?}");
        }
    }
}
