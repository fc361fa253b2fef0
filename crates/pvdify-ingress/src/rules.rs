//! Tunnel rule file model and the pure edits applied to it.

use serde::{Deserialize, Serialize};

/// Service of the mandatory final rule.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl IngressRule {
    pub fn route(hostname: &str, service: &str) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            service: service.to_string(),
        }
    }

    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: CATCH_ALL_SERVICE.to_string(),
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_none()
    }
}

/// Contents of the tunnel config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    #[serde(default)]
    pub tunnel: String,
    #[serde(rename = "credentials-file", default)]
    pub credentials_file: String,
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

impl TunnelConfig {
    /// Fresh config holding only the catch-all.
    pub fn new(tunnel: impl Into<String>, credentials_file: impl Into<String>) -> Self {
        Self {
            tunnel: tunnel.into(),
            credentials_file: credentials_file.into(),
            ingress: vec![IngressRule::catch_all()],
        }
    }

    /// Make the rule list well formed: exactly one catch-all, in last
    /// position. A hand-edited catch-all service is kept.
    pub fn normalize(&mut self) {
        let catch_all = self
            .ingress
            .iter()
            .rev()
            .find(|r| r.is_catch_all())
            .cloned()
            .unwrap_or_else(IngressRule::catch_all);
        self.ingress.retain(|r| !r.is_catch_all());
        self.ingress.push(catch_all);
    }

    /// Point `hostname` at `service`. An existing rule is updated in place;
    /// otherwise the rule goes just before the catch-all. Returns true if
    /// anything changed.
    pub fn add_route(&mut self, hostname: &str, service: &str) -> bool {
        self.normalize();
        if let Some(rule) = self
            .ingress
            .iter_mut()
            .find(|r| r.hostname.as_deref() == Some(hostname))
        {
            if rule.service == service {
                return false;
            }
            rule.service = service.to_string();
            return true;
        }
        let at = self.ingress.len() - 1;
        self.ingress.insert(at, IngressRule::route(hostname, service));
        true
    }

    /// Drop every rule for `hostname`. The catch-all is never removed.
    /// Returns true if a rule was removed.
    pub fn remove_route(&mut self, hostname: &str) -> bool {
        let before = self.ingress.len();
        self.ingress
            .retain(|r| r.hostname.as_deref() != Some(hostname));
        self.normalize();
        self.ingress.len() < before
    }

    /// Hostname rules, catch-all excluded, in file order.
    pub fn routes(&self) -> Vec<IngressRule> {
        self.ingress
            .iter()
            .filter(|r| !r.is_catch_all())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(cfg: &TunnelConfig) -> Vec<Option<&str>> {
        cfg.ingress.iter().map(|r| r.hostname.as_deref()).collect()
    }

    #[test]
    fn new_routes_go_before_catch_all() {
        let mut cfg = TunnelConfig::new("t", "/c.json");
        cfg.add_route("a.x.com", "http://localhost:3000");
        cfg.add_route("b.x.com", "http://localhost:3001");
        assert_eq!(hosts(&cfg), vec![Some("a.x.com"), Some("b.x.com"), None]);
    }

    #[test]
    fn add_existing_host_replaces_target_in_place() {
        let mut cfg = TunnelConfig::new("t", "");
        cfg.add_route("a.x.com", "t1");
        cfg.add_route("b.x.com", "t3");
        assert!(cfg.add_route("a.x.com", "t2"));
        assert!(!cfg.add_route("a.x.com", "t2"));

        let a: Vec<_> = cfg
            .ingress
            .iter()
            .filter(|r| r.hostname.as_deref() == Some("a.x.com"))
            .collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].service, "t2");
        assert_eq!(hosts(&cfg), vec![Some("a.x.com"), Some("b.x.com"), None]);
        assert!(cfg.ingress.last().unwrap().is_catch_all());
    }

    #[test]
    fn remove_deletes_all_matches_and_keeps_catch_all() {
        let mut cfg = TunnelConfig {
            tunnel: "t".to_string(),
            credentials_file: String::new(),
            ingress: vec![
                IngressRule::route("a.x.com", "t1"),
                IngressRule::route("a.x.com", "t2"),
                IngressRule::catch_all(),
            ],
        };
        assert!(cfg.remove_route("a.x.com"));
        assert_eq!(cfg.ingress, vec![IngressRule::catch_all()]);
        assert!(!cfg.remove_route("a.x.com"));
        assert_eq!(cfg.ingress.len(), 1);
    }

    #[test]
    fn normalize_repairs_missing_or_misplaced_catch_all() {
        let mut cfg = TunnelConfig {
            tunnel: String::new(),
            credentials_file: String::new(),
            ingress: vec![IngressRule::route("a.x.com", "t1")],
        };
        cfg.normalize();
        assert_eq!(hosts(&cfg), vec![Some("a.x.com"), None]);

        let custom = IngressRule {
            hostname: None,
            service: "http_status:503".to_string(),
        };
        let mut cfg = TunnelConfig {
            tunnel: String::new(),
            credentials_file: String::new(),
            ingress: vec![custom.clone(), IngressRule::route("a.x.com", "t1")],
        };
        cfg.normalize();
        assert_eq!(cfg.ingress, vec![IngressRule::route("a.x.com", "t1"), custom]);
    }

    #[test]
    fn yaml_shape_matches_tunnel_format() {
        let mut cfg = TunnelConfig::new("abc", "/etc/creds.json");
        cfg.add_route("a.x.com", "http://localhost:3000");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        assert!(yaml.contains("tunnel: abc"));
        assert!(yaml.contains("credentials-file: /etc/creds.json"));
        assert!(yaml.contains("hostname: a.x.com"));
        assert!(yaml.contains("http_status:404"));

        let parsed: TunnelConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, cfg);
    }
}
