//! Read-side process operations that talk to the host directly: instance
//! listing, log streaming and one-off exec.

use tracing::debug;

use pvdify_actuator::{CommandOutput, LogQuery, LogStream};
use pvdify_core::validate;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{InstanceInfo, LogRequest, ProcessInfo};
use crate::orchestrator::Orchestrator;

pub const DEFAULT_LOG_LINES: u32 = 100;

impl Orchestrator {
    /// Process definitions with their instances 1..count as the supervisor
    /// sees them. Instances whose status cannot be read are reported as
    /// `unknown` rather than failing the call.
    pub async fn list_processes(&self, app: &str) -> OrchestratorResult<Vec<ProcessInfo>> {
        self.require_app(app)?;
        let supervisor = &self.actuators.supervisor;
        let runtime = &self.actuators.runtime;

        let mut processes = Vec::new();
        for definition in self.store.list_processes(app)? {
            let base = self.naming.base(app, &definition.process_type);
            let mut instances = Vec::with_capacity(definition.count as usize);
            for index in 1..=definition.count {
                let unit = self.naming.instance_unit(app, &definition.process_type, index);
                let container = self.naming.container(app, &definition.process_type, index);
                let status = match supervisor.status(&base, index).await {
                    Ok(status) => status,
                    Err(e) => {
                        debug!(%unit, error = %e, "instance status unavailable");
                        instances.push(InstanceInfo::unknown(index, unit, container));
                        continue;
                    }
                };
                let stats = if status.is_active() {
                    runtime.stats(&container).await.ok()
                } else {
                    None
                };
                instances.push(InstanceInfo {
                    index,
                    unit,
                    container,
                    state: status.active,
                    sub_state: status.sub_state,
                    pid: status.pid,
                    memory: status.memory,
                    cpu_percent: stats.as_ref().map(|s| s.cpu_percent),
                    container_memory: stats.map(|s| s.memory),
                });
            }
            processes.push(ProcessInfo {
                definition,
                instances,
            });
        }
        Ok(processes)
    }

    /// Journal lines for the app, or one process type of it. Dropping the
    /// stream stops the underlying follower.
    pub async fn stream_logs(&self, app: &str, request: &LogRequest) -> OrchestratorResult<LogStream> {
        self.require_app(app)?;
        let process = request.process.as_deref().filter(|p| !p.is_empty() && *p != "*");
        if let Some(process) = process {
            validate::process_type(process)?;
        }
        // One selector per process type keeps apps that share a name
        // prefix out of each other's logs.
        let selectors = match process {
            Some(process) => vec![self.naming.log_selector(app, process)],
            None => self
                .store
                .list_processes(app)?
                .iter()
                .map(|definition| self.naming.log_selector(app, &definition.process_type))
                .collect(),
        };
        let query = LogQuery {
            selectors,
            lines: request.lines.unwrap_or(DEFAULT_LOG_LINES),
            follow: request.follow,
        };
        debug!(%app, selectors = ?query.selectors, lines = query.lines, follow = query.follow, "opening log stream");
        Ok(self.actuators.logs.stream(&query).await?)
    }

    /// Run `command` inside the container of one instance.
    pub async fn exec(
        &self,
        app: &str,
        process_type: &str,
        index: u32,
        command: &[String],
    ) -> OrchestratorResult<CommandOutput> {
        validate::process_type(process_type)?;
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(OrchestratorError::BadRequest("command must not be empty".to_string()));
        }
        self.require_app(app)?;
        let definition = self
            .store
            .get_process(app, process_type)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("process type {app}/{process_type}")))?;
        if index == 0 || index > definition.count {
            return Err(OrchestratorError::NotFound(format!(
                "instance {process_type}.{index} of {app}"
            )));
        }

        let container = self.naming.container(app, process_type, index);
        debug!(%app, %container, ?command, "exec");
        Ok(self.actuators.runtime.exec(&container, command).await?)
    }
}
