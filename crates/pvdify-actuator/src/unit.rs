//! Supervisor unit template generation.
//!
//! One templated unit per (app, process type). The instance specifier `%i`
//! is the replica index, so `pvdify-shop-web@2` runs container
//! `pvdify-shop-web-2`.

use std::fmt::Write as _;
use std::path::PathBuf;

use pvdify_core::UnitNaming;

/// Host-wide defaults applied when an app does not override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDefaults {
    pub container_port: u16,
    pub memory: String,
    pub cpu: String,
    pub user: String,
    /// Absolute podman path used in `Exec*` lines.
    pub podman: String,
    pub stop_timeout_secs: u32,
}

impl Default for UnitDefaults {
    fn default() -> Self {
        Self {
            container_port: 3000,
            memory: "512M".to_string(),
            cpu: "0.5".to_string(),
            user: "pvdify".to_string(),
            podman: "/usr/bin/podman".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

/// Container-level HTTP health probe. Zero values take the defaults
/// (30s interval, 5s timeout, 3 retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
}

/// Inputs for one rendered unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub app: String,
    pub process_type: String,
    pub image: String,
    /// Published host port. Only set for process types that serve traffic.
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub command: Option<String>,
    pub env_file: PathBuf,
    pub health: Option<HealthProbe>,
}

#[derive(Debug, Clone)]
pub struct UnitGenerator {
    naming: UnitNaming,
    defaults: UnitDefaults,
}

impl UnitGenerator {
    pub fn new(naming: UnitNaming, defaults: UnitDefaults) -> Self {
        Self { naming, defaults }
    }

    pub fn naming(&self) -> &UnitNaming {
        &self.naming
    }

    /// File name of the template unit for `spec`.
    pub fn file_name(&self, spec: &UnitSpec) -> String {
        self.naming.template_unit(&spec.app, &spec.process_type)
    }

    /// Render the unit file contents.
    pub fn render(&self, spec: &UnitSpec) -> String {
        let d = &self.defaults;
        let container_port = spec.container_port.filter(|p| *p != 0).unwrap_or(d.container_port);
        let memory = non_empty(spec.memory.as_deref()).unwrap_or(&d.memory);
        let cpu = non_empty(spec.cpu.as_deref()).unwrap_or(&d.cpu);
        let container = format!("{}-%i", self.naming.base(&spec.app, &spec.process_type));
        let podman = &d.podman;

        let mut run = format!(
            "ExecStart={podman} run --rm \\\n    --name {container} \\\n"
        );
        if let Some(host_port) = spec.host_port {
            let _ = writeln!(run, "    -p {host_port}:{container_port} \\");
        }
        let _ = writeln!(run, "    --memory={memory} \\");
        let _ = writeln!(run, "    --cpus={cpu} \\");
        let _ = writeln!(run, "    --env-file {} \\", spec.env_file.display());
        if let Some(probe) = &spec.health {
            let interval = if probe.interval_secs == 0 { 30 } else { probe.interval_secs };
            let timeout = if probe.timeout_secs == 0 { 5 } else { probe.timeout_secs };
            let retries = if probe.retries == 0 { 3 } else { probe.retries };
            let _ = writeln!(
                run,
                "    --health-cmd=\"curl -sf http://localhost:{container_port}{} || exit 1\" \\",
                probe.path
            );
            let _ = writeln!(run, "    --health-interval={interval}s \\");
            let _ = writeln!(run, "    --health-timeout={timeout}s \\");
            let _ = writeln!(run, "    --health-retries={retries} \\");
            let _ = writeln!(run, "    --health-start-period=10s \\");
        }
        match non_empty(spec.command.as_deref()) {
            Some(command) => {
                let _ = write!(run, "    {} \\\n    {command}", spec.image);
            }
            None => {
                let _ = write!(run, "    {}", spec.image);
            }
        }

        format!(
            "[Unit]
Description=Pvdify {app} {process} process %i
After=network.target
Wants=network.target

[Service]
Type=simple
User={user}
Restart=always
RestartSec=5
TimeoutStartSec=120
TimeoutStopSec=30

ExecStartPre={podman} pull {image}

{run}

ExecStop={podman} stop -t {stop_timeout} {container}
ExecStopPost=-{podman} rm -f {container}

Environment=PODMAN_USERNS=keep-id

[Install]
WantedBy=multi-user.target
",
            app = spec.app,
            process = spec.process_type,
            user = d.user,
            image = spec.image,
            stop_timeout = d.stop_timeout_secs,
        )
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UnitSpec {
        UnitSpec {
            app: "shop".to_string(),
            process_type: "web".to_string(),
            image: "ghcr.io/acme/shop:v2".to_string(),
            host_port: Some(3005),
            container_port: None,
            memory: None,
            cpu: None,
            command: None,
            env_file: PathBuf::from("/var/lib/pvdify/releases/shop/v2.env"),
            health: None,
        }
    }

    fn generator() -> UnitGenerator {
        UnitGenerator::new(UnitNaming::default(), UnitDefaults::default())
    }

    #[test]
    fn renders_defaults() {
        let unit = generator().render(&spec());
        assert!(unit.contains("Description=Pvdify shop web process %i"));
        assert!(unit.contains("User=pvdify"));
        assert!(unit.contains("ExecStartPre=/usr/bin/podman pull ghcr.io/acme/shop:v2"));
        assert!(unit.contains("--name pvdify-shop-web-%i"));
        assert!(unit.contains("-p 3005:3000"));
        assert!(unit.contains("--memory=512M"));
        assert!(unit.contains("--cpus=0.5"));
        assert!(unit.contains("--env-file /var/lib/pvdify/releases/shop/v2.env"));
        assert!(unit.contains("ExecStop=/usr/bin/podman stop -t 10 pvdify-shop-web-%i"));
        assert!(unit.contains("ExecStopPost=-/usr/bin/podman rm -f pvdify-shop-web-%i"));
        assert!(!unit.contains("--health-cmd"));
        assert!(unit.trim_end().ends_with("WantedBy=multi-user.target"));
    }

    #[test]
    fn the_image_line_ends_the_exec_start_command() {
        let unit = generator().render(&spec());
        let exec_start: Vec<&str> = unit
            .lines()
            .skip_while(|l| !l.starts_with("ExecStart="))
            .take_while(|l| !l.is_empty())
            .collect();
        assert_eq!(exec_start.last().map(|l| l.trim()), Some("ghcr.io/acme/shop:v2"));
        // Every line but the last continues the command.
        assert!(exec_start[..exec_start.len() - 1].iter().all(|l| l.ends_with('\\')));
    }

    #[test]
    fn overrides_command_resources_and_health() {
        let mut s = spec();
        s.memory = Some("1G".to_string());
        s.cpu = Some("2".to_string());
        s.container_port = Some(8080);
        s.command = Some("bin/worker --queue default".to_string());
        s.health = Some(HealthProbe {
            path: "/up".to_string(),
            interval_secs: 0,
            timeout_secs: 2,
            retries: 0,
        });
        let unit = generator().render(&s);
        assert!(unit.contains("-p 3005:8080"));
        assert!(unit.contains("--memory=1G"));
        assert!(unit.contains("--cpus=2"));
        assert!(unit.contains("curl -sf http://localhost:8080/up"));
        assert!(unit.contains("--health-interval=30s"));
        assert!(unit.contains("--health-timeout=2s"));
        assert!(unit.contains("--health-retries=3"));
        assert!(unit.contains("ghcr.io/acme/shop:v2 \\\n    bin/worker --queue default"));
    }

    #[test]
    fn unpublished_process_has_no_port_mapping() {
        let mut s = spec();
        s.process_type = "worker".to_string();
        s.host_port = None;
        let g = generator();
        assert_eq!(g.file_name(&s), "pvdify-shop-worker@.service");
        assert!(!g.render(&s).contains("-p "));
    }
}
