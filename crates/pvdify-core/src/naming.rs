//! Names of supervisor units, containers, and log selectors.
//!
//! Every app process type gets one templated unit, `{ns}-{app}-{type}@.service`.
//! Replica `N` of that type runs as instance `{ns}-{app}-{type}@N`, inside a
//! container named `{ns}-{app}-{type}-N`.
//!
//! App names may contain `-` but process types may not, so the last `-`
//! separated segment of a base is always the process type and two
//! (app, type) pairs never share a unit or container name.

/// Naming scheme rooted at a namespace prefix (normally `pvdify`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNaming {
    namespace: String,
}

impl UnitNaming {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Instance template prefix, e.g. `pvdify-myapp-web`.
    pub fn base(&self, app: &str, process_type: &str) -> String {
        format!("{}-{}-{}", self.namespace, app, process_type)
    }

    /// Template unit file name, e.g. `pvdify-myapp-web@.service`.
    pub fn template_unit(&self, app: &str, process_type: &str) -> String {
        format!("{}@.service", self.base(app, process_type))
    }

    /// Instance unit name without suffix, e.g. `pvdify-myapp-web@2`.
    pub fn instance_unit(&self, app: &str, process_type: &str, index: u32) -> String {
        format!("{}@{}", self.base(app, process_type), index)
    }

    pub fn container(&self, app: &str, process_type: &str, index: u32) -> String {
        format!("{}-{}", self.base(app, process_type), index)
    }

    /// journalctl unit glob for every instance of one process type. A whole
    /// app takes one selector per process type, since `{ns}-{app}-*` would
    /// also match `{ns}-{app}-eu-web`.
    pub fn log_selector(&self, app: &str, process_type: &str) -> String {
        format!("{}@*", self.base(app, process_type))
    }
}

impl Default for UnitNaming {
    fn default() -> Self {
        Self::new("pvdify")
    }
}
