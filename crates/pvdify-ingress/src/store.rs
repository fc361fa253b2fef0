//! Persistence of the tunnel rule file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{IngressError, IngressResult};
use crate::rules::TunnelConfig;

/// Whole-file load and save of the rule set.
pub trait IngressStore: Send + Sync {
    /// Current rules. A missing file yields a config with only the catch-all.
    fn load(&self) -> IngressResult<TunnelConfig>;

    /// Replace the stored rules. Readers see either the old or the new set.
    fn save(&self, config: &TunnelConfig) -> IngressResult<()>;
}

/// YAML file on disk, replaced by atomic rename.
#[derive(Debug, Clone)]
pub struct FileIngressStore {
    path: PathBuf,
    /// Written into the file when non-empty; otherwise the file's own value is kept.
    tunnel_id: String,
    credentials_file: String,
}

impl FileIngressStore {
    pub fn new(
        path: impl Into<PathBuf>,
        tunnel_id: impl Into<String>,
        credentials_file: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            tunnel_id: tunnel_id.into(),
            credentials_file: credentials_file.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> IngressError {
        IngressError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl IngressStore for FileIngressStore {
    fn load(&self) -> IngressResult<TunnelConfig> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TunnelConfig::new(&self.tunnel_id, &self.credentials_file));
            }
            Err(e) => return Err(self.io_err(e)),
        };
        if content.trim().is_empty() {
            return Ok(TunnelConfig::new(&self.tunnel_id, &self.credentials_file));
        }
        let mut config: TunnelConfig =
            serde_yaml::from_str(&content).map_err(|e| IngressError::Parse {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;
        config.normalize();
        Ok(config)
    }

    fn save(&self, config: &TunnelConfig) -> IngressResult<()> {
        let mut config = config.clone();
        if !self.tunnel_id.is_empty() {
            config.tunnel = self.tunnel_id.clone();
        }
        if !self.credentials_file.is_empty() {
            config.credentials_file = self.credentials_file.clone();
        }
        config.normalize();
        let yaml =
            serde_yaml::to_string(&config).map_err(|e| IngressError::Serialize(e.to_string()))?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;

        // Write a sibling temp file, flush it to disk, then rename over the target.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(yaml.as_bytes()).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;

        debug!(path = %self.path.display(), rules = config.ingress.len(), "ingress rules written");
        Ok(())
    }
}

/// In-memory store, used when the tunnel is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryIngressStore {
    config: Mutex<Option<TunnelConfig>>,
    fail_saves: Mutex<bool>,
}

impl MemoryIngressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `save` fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }
}

impl IngressStore for MemoryIngressStore {
    fn load(&self) -> IngressResult<TunnelConfig> {
        let guard = self.config.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.clone().unwrap_or_else(|| TunnelConfig::new("", "")))
    }

    fn save(&self, config: &TunnelConfig) -> IngressResult<()> {
        if *self.fail_saves.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(IngressError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("injected save failure"),
            });
        }
        let mut config = config.clone();
        config.normalize();
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = Some(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::IngressRule;

    #[test]
    fn missing_file_loads_catch_all_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIngressStore::new(dir.path().join("tunnels/apps.yml"), "tid", "/c.json");
        let cfg = store.load().unwrap();
        assert_eq!(cfg.tunnel, "tid");
        assert_eq!(cfg.ingress, vec![IngressRule::catch_all()]);
    }

    #[test]
    fn save_then_load_round_trips_and_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels/apps.yml");
        let store = FileIngressStore::new(&path, "", "");

        let mut cfg = TunnelConfig::new("existing", "/c.json");
        cfg.add_route("a.x.com", "http://localhost:3000");
        store.save(&cfg).unwrap();

        assert!(path.exists());
        assert_eq!(store.load().unwrap(), cfg);
        // No temp files left behind.
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn configured_tunnel_id_wins_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIngressStore::new(dir.path().join("a.yml"), "new-id", "");
        store.save(&TunnelConfig::new("old-id", "/c.json")).unwrap();
        let cfg = store.load().unwrap();
        assert_eq!(cfg.tunnel, "new-id");
        assert_eq!(cfg.credentials_file, "/c.json");
    }

    #[test]
    fn file_without_catch_all_is_repaired_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.yml");
        std::fs::write(
            &path,
            "tunnel: t\ncredentials-file: c\ningress:\n  - hostname: a.x.com\n    service: http://localhost:3000\n",
        )
        .unwrap();
        let cfg = FileIngressStore::new(&path, "", "").load().unwrap();
        assert_eq!(cfg.ingress.len(), 2);
        assert!(cfg.ingress[1].is_catch_all());
    }

    #[test]
    fn garbage_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.yml");
        std::fs::write(&path, "ingress: [[[").unwrap();
        let err = FileIngressStore::new(&path, "", "").load().unwrap_err();
        assert!(matches!(err, IngressError::Parse { .. }));
    }
}
