//! [`ProcessSupervisor`] backed by systemctl and unit files on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{ActuatorError, ActuatorResult};
use crate::exec;
use crate::traits::{ProcessSupervisor, UnitStatus};

const SYSTEMCTL: &str = "systemctl";

#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    unit_dir: PathBuf,
    /// Pass `--user` to every systemctl call.
    user_mode: bool,
}

impl SystemdSupervisor {
    pub fn new(unit_dir: impl Into<PathBuf>, user_mode: bool) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            user_mode,
        }
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }

    async fn systemctl(&self, args: &[&str]) -> ActuatorResult<String> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
        if self.user_mode {
            full.push("--user");
        }
        full.extend_from_slice(args);
        let output = exec::run_checked(SYSTEMCTL, &full).await?;
        Ok(output.stdout)
    }

    async fn instance_op(&self, verb: &str, unit: &str, index: u32) -> ActuatorResult<()> {
        let name = format!("{unit}@{index}");
        debug!(%verb, unit = %name, "systemctl");
        self.systemctl(&[verb, &name]).await?;
        Ok(())
    }
}

/// Parse `systemctl show --property=...` key=value output.
pub(crate) fn parse_show(output: &str) -> UnitStatus {
    let mut status = UnitStatus::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "ActiveState" => status.active = value.to_string(),
            "SubState" => status.sub_state = value.to_string(),
            "MainPID" => status.pid = value.parse().unwrap_or(0),
            "MemoryCurrent" => status.memory = format_bytes(value),
            "LoadState" => status.load_state = value.to_string(),
            _ => {}
        }
    }
    status
}

/// Instance indices from `systemctl list-units --no-legend --plain` output.
pub(crate) fn parse_list_units(output: &str, unit: &str) -> Vec<u32> {
    let prefix = format!("{unit}@");
    let mut indices: Vec<u32> = output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|name| name.strip_prefix(&prefix)?.strip_suffix(".service")?.parse().ok())
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Render a byte count as `1.5G`, `12.0M`, `3.0K` or `512B`. Non-numeric
/// input (e.g. `[not set]`) is returned unchanged.
pub fn format_bytes(raw: &str) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let Ok(n) = raw.parse::<u64>() else {
        return raw.to_string();
    };
    let f = n as f64;
    if f >= GB {
        format!("{:.1}G", f / GB)
    } else if f >= MB {
        format!("{:.1}M", f / MB)
    } else if f >= KB {
        format!("{:.1}K", f / KB)
    } else {
        format!("{n}B")
    }
}

#[async_trait]
impl ProcessSupervisor for SystemdSupervisor {
    async fn install_unit(&self, file_name: &str, contents: &str) -> ActuatorResult<()> {
        let path = self.unit_dir.join(file_name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| ActuatorError::Io {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "unit file written");
        Ok(())
    }

    async fn remove_unit(&self, file_name: &str) -> ActuatorResult<()> {
        let path = self.unit_dir.join(file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "unit file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ActuatorError::Io { path, source }),
        }
    }

    async fn daemon_reload(&self) -> ActuatorResult<()> {
        self.systemctl(&["daemon-reload"]).await?;
        Ok(())
    }

    async fn start(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        self.instance_op("start", unit, index).await
    }

    async fn stop(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        self.instance_op("stop", unit, index).await
    }

    async fn restart(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        self.instance_op("restart", unit, index).await
    }

    async fn enable(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        self.instance_op("enable", unit, index).await
    }

    async fn disable(&self, unit: &str, index: u32) -> ActuatorResult<()> {
        self.instance_op("disable", unit, index).await
    }

    async fn status(&self, unit: &str, index: u32) -> ActuatorResult<UnitStatus> {
        let name = format!("{unit}@{index}");
        let out = self
            .systemctl(&[
                "show",
                &name,
                "--property=ActiveState,SubState,MainPID,MemoryCurrent,LoadState",
            ])
            .await?;
        Ok(parse_show(&out))
    }

    async fn list_instances(&self, unit: &str) -> ActuatorResult<Vec<u32>> {
        let pattern = format!("{unit}@*.service");
        let out = self
            .systemctl(&["list-units", &pattern, "--all", "--no-legend", "--plain"])
            .await?;
        Ok(parse_list_units(&out, unit))
    }
}
