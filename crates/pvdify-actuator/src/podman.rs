//! [`ContainerRuntime`] backed by the podman CLI.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{ActuatorError, ActuatorResult};
use crate::exec::{self, CommandOutput};
use crate::traits::{ContainerRuntime, ContainerStats};

#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    program: String,
}

impl PodmanRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run podman, treating "no such container" as success.
    async fn run_tolerating_absent(&self, args: &[&str]) -> ActuatorResult<()> {
        let output = exec::run(&self.program, args).await?;
        if output.success() || is_absent(&output.stderr) {
            return Ok(());
        }
        Err(exec::failed(&self.program, args, output))
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

fn is_absent(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}

/// Parse `{{.CPUPerc}}\t{{.MemUsage}}`, e.g. `1.25%\t12.5MB / 512MB`.
pub(crate) fn parse_stats(line: &str) -> ActuatorResult<ContainerStats> {
    let parse_err = |detail: &str| ActuatorError::Parse {
        what: "podman stats".to_string(),
        detail: format!("{detail}: {line:?}"),
    };
    let (cpu, mem) = line.trim().split_once('\t').ok_or_else(|| parse_err("missing tab"))?;
    let cpu_percent = cpu
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|_| parse_err("bad cpu percentage"))?;
    let memory = mem
        .split('/')
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    Ok(ContainerStats {
        cpu_percent,
        memory,
    })
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn pull(&self, image: &str) -> ActuatorResult<()> {
        info!(%image, "pulling image");
        exec::run_checked(&self.program, &["pull", "--quiet", image]).await?;
        Ok(())
    }

    async fn exists(&self, image: &str) -> ActuatorResult<bool> {
        // `image exists` exits 1 for absent images.
        let output = exec::run(&self.program, &["image", "exists", image]).await?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(exec::failed(&self.program, &["image", "exists", image], output)),
        }
    }

    async fn stop(&self, name: &str, timeout: Duration) -> ActuatorResult<()> {
        let secs = timeout.as_secs().to_string();
        debug!(container = %name, timeout_secs = %secs, "stopping container");
        self.run_tolerating_absent(&["stop", "-t", &secs, name]).await
    }

    async fn remove(&self, name: &str, force: bool) -> ActuatorResult<()> {
        debug!(container = %name, force, "removing container");
        if force {
            self.run_tolerating_absent(&["rm", "-f", name]).await
        } else {
            self.run_tolerating_absent(&["rm", name]).await
        }
    }

    async fn stats(&self, name: &str) -> ActuatorResult<ContainerStats> {
        let output = exec::run_checked(
            &self.program,
            &[
                "stats",
                "--no-stream",
                "--format",
                "{{.CPUPerc}}\t{{.MemUsage}}",
                name,
            ],
        )
        .await?;
        let line = output.stdout.lines().next().unwrap_or_default();
        parse_stats(line)
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> ActuatorResult<CommandOutput> {
        let mut args: Vec<&str> = vec!["exec", name];
        args.extend(cmd.iter().map(String::as_str));
        exec::run(&self.program, &args).await
    }
}
