//! Resource and application records, looked up by name.
//!
//! Snapshots never embed these records; a restored task handler stores the
//! names and re-attaches the live records through [`ConfigLookup`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::{AkrunError, Result};
use crate::remote::AccessTarget;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchSchedulerKind {
    Slurm,
    Pbs,
    Shell,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub remote_access_node: Option<String>,
    #[serde(default = "default_access_method")]
    pub remote_access_method: String,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_private_key_file: Option<String>,
    #[serde(default)]
    pub ssh_private_key_password: Option<String>,
    pub batch_scheduler: BatchSchedulerKind,
    #[serde(default)]
    pub batch_job_header_template: String,
    pub remote_work_dir: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ResourceConfig {
    /// Host the remote session connects to; falls back to the resource name.
    pub fn access_node(&self) -> &str {
        self.remote_access_node.as_deref().unwrap_or(&self.name)
    }

    pub fn access_target(&self) -> AccessTarget {
        AccessTarget {
            host: self.access_node().to_string(),
            method: self.remote_access_method.clone(),
            username: self.ssh_username.clone(),
            password: self.ssh_password.clone().map(Zeroizing::new),
            private_key_file: self.ssh_private_key_file.clone(),
            private_key_password: self.ssh_private_key_password.clone().map(Zeroizing::new),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    #[default]
    AppKernel,
    Bundle,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    #[serde(default)]
    pub kind: AppKind,
    /// Member applications of a bundle, run inside one allocation.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub run_script: String,
    #[serde(default = "default_walltime_limit")]
    pub walltime_limit: u32,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default = "default_parser")]
    pub parser: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Name-based lookup of configuration records.
pub trait ConfigLookup: Send + Sync {
    fn resource(&self, name: &str) -> Result<Arc<ResourceConfig>>;
    fn app(&self, name: &str) -> Result<Arc<AppConfig>>;
}

/// Validated set of resources and applications.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    resources: HashMap<String, Arc<ResourceConfig>>,
    apps: HashMap<String, Arc<AppConfig>>,
}

impl Registry {
    pub fn new(resources: Vec<ResourceConfig>, apps: Vec<AppConfig>) -> Result<Self> {
        let mut registry = Registry::default();
        for resource in resources {
            if !resource.remote_work_dir.starts_with('/') {
                return Err(AkrunError::Config(format!(
                    "resource {}: remote_work_dir must be absolute",
                    resource.name
                )));
            }
            let name = resource.name.clone();
            if registry
                .resources
                .insert(name.clone(), Arc::new(resource))
                .is_some()
            {
                return Err(AkrunError::Config(format!("duplicate resource {name}")));
            }
        }
        for app in apps {
            let name = app.name.clone();
            if registry.apps.insert(name.clone(), Arc::new(app)).is_some() {
                return Err(AkrunError::Config(format!("duplicate application {name}")));
            }
        }
        registry.validate_bundles()?;
        Ok(registry)
    }

    fn validate_bundles(&self) -> Result<()> {
        for app in self.apps.values() {
            match app.kind {
                AppKind::AppKernel if !app.members.is_empty() => {
                    return Err(AkrunError::Config(format!(
                        "application {} lists members but is not a bundle",
                        app.name
                    )));
                }
                AppKind::AppKernel => {}
                AppKind::Bundle => {
                    if app.members.is_empty() {
                        return Err(AkrunError::Config(format!(
                            "bundle {} has no members",
                            app.name
                        )));
                    }
                    for member in &app.members {
                        let found = self.apps.get(member).ok_or_else(|| {
                            AkrunError::Config(format!(
                                "bundle {} references unknown application {member}",
                                app.name
                            ))
                        })?;
                        if found.kind == AppKind::Bundle {
                            return Err(AkrunError::Config(format!(
                                "bundle {} cannot nest bundle {member}",
                                app.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ConfigLookup for Registry {
    fn resource(&self, name: &str) -> Result<Arc<ResourceConfig>> {
        self.resources
            .get(name)
            .cloned()
            .ok_or_else(|| AkrunError::UnknownResource(name.to_string()))
    }

    fn app(&self, name: &str) -> Result<Arc<AppConfig>> {
        self.apps
            .get(name)
            .cloned()
            .ok_or_else(|| AkrunError::UnknownApp(name.to_string()))
    }
}

/// Bounds on transient remote failures.
#[derive(Deserialize, Debug, Clone)]
pub struct RetryPolicy {
    #[serde(default = "default_max_transient_failures")]
    pub max_transient_failures: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_sleep_secs")]
    pub connect_sleep_secs: f64,
}

impl RetryPolicy {
    /// Delay before the next check after `failures` consecutive transient failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u64.saturating_pow(failures.saturating_sub(1).min(10));
        Duration::from_secs(self.backoff_secs.saturating_mul(factor))
    }

    pub fn connect_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.connect_sleep_secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_failures: default_max_transient_failures(),
            backoff_secs: default_backoff_secs(),
            connect_attempts: default_connect_attempts(),
            connect_sleep_secs: default_connect_sleep_secs(),
        }
    }
}

/// Timeouts of the blocking points of a remote session.
#[derive(Deserialize, Debug, Clone)]
pub struct SessionTimeouts {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: f64,
    #[serde(default = "default_command_secs")]
    pub command_secs: f64,
    /// How long to wait for another auth prompt before assuming the shell is ready.
    #[serde(default = "default_prompt_probe_secs")]
    pub prompt_probe_secs: f64,
}

impl SessionTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs_f64(self.connect_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs_f64(self.command_secs)
    }

    pub fn prompt_probe(&self) -> Duration {
        Duration::from_secs_f64(self.prompt_probe_secs)
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            command_secs: default_command_secs(),
            prompt_probe_secs: default_prompt_probe_secs(),
        }
    }
}

fn default_access_method() -> String {
    "ssh".to_string()
}

fn default_walltime_limit() -> u32 {
    10
}

fn default_nodes() -> u32 {
    1
}

fn default_parser() -> String {
    "exit_status".to_string()
}

fn default_max_transient_failures() -> u32 {
    5
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_sleep_secs() -> f64 {
    5.0
}

fn default_connect_secs() -> f64 {
    60.0
}

fn default_command_secs() -> f64 {
    60.0
}

fn default_prompt_probe_secs() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str) -> ResourceConfig {
        toml::from_str(&format!(
            r#"
name = "{name}"
batch_scheduler = "slurm"
remote_work_dir = "/scratch/akrun"
"#
        ))
        .unwrap()
    }

    fn app(raw: &str) -> AppConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let res = resource("cluster");
        assert_eq!(res.access_node(), "cluster");
        assert_eq!(res.remote_access_method, "ssh");

        let hpl = app("name = \"hpl\"\nrun_script = \"./xhpl\"");
        assert_eq!(hpl.kind, AppKind::AppKernel);
        assert_eq!(hpl.nodes, 1);
        assert_eq!(hpl.parser, "exit_status");
    }

    #[test]
    fn bundle_members_must_exist() {
        let bundle = app("name = \"suite\"\nkind = \"bundle\"\nmembers = [\"hpl\", \"ior\"]");
        let hpl = app("name = \"hpl\"");
        let err = Registry::new(vec![resource("c")], vec![bundle, hpl]).unwrap_err();
        assert!(err.to_string().contains("unknown application ior"));
    }

    #[test]
    fn relative_work_dir_is_rejected() {
        let mut res = resource("c");
        res.remote_work_dir = "scratch".into();
        assert!(Registry::new(vec![res], vec![]).is_err());
    }

    #[test]
    fn lookup_by_name() {
        let registry = Registry::new(vec![resource("c")], vec![app("name = \"hpl\"")]).unwrap();
        assert_eq!(registry.resource("c").unwrap().name, "c");
        assert!(matches!(
            registry.app("nope"),
            Err(AkrunError::UnknownApp(name)) if name == "nope"
        ));
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let policy = RetryPolicy {
            backoff_secs: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(4), Duration::from_secs(80));
    }
}
