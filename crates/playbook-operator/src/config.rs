//! Command line and environment configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;

use playbook_common::DEFAULT_STATUS_RETRIES;
use playbook_controller::runner::DEFAULT_PROGRAM;
use playbook_controller::{FieldSpec, ParameterSchema, Workflow};

/// Playbook operator - runs ansible playbooks when custom resources change
#[derive(Parser, Debug, Clone)]
#[command(name = "playbook-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the JSON schema of the status sub-document as YAML and exit
    #[arg(long)]
    pub print_status_schema: bool,

    /// API group of the watched resource (empty for the core group)
    #[arg(long, env = "PLAYBOOK_GROUP", required_unless_present = "print_status_schema")]
    pub group: Option<String>,

    /// API version of the watched resource
    #[arg(long, env = "PLAYBOOK_API_VERSION", default_value = "v1")]
    pub api_version: String,

    /// Kind of the watched resource
    #[arg(long, env = "PLAYBOOK_KIND", required_unless_present = "print_status_schema")]
    pub kind: Option<String>,

    /// Plural resource name (defaults to the lowercased kind plus "s")
    #[arg(long, env = "PLAYBOOK_PLURAL")]
    pub plural: Option<String>,

    /// Only watch this namespace (defaults to all namespaces)
    #[arg(long, env = "PLAYBOOK_NAMESPACE")]
    pub namespace: Option<String>,

    /// Directory holding provision.yml, update.yml and deprovision.yml
    #[arg(long, env = "PLAYBOOK_DIR", default_value = "/playbooks")]
    pub playbook_dir: PathBuf,

    /// Program used to run playbooks
    #[arg(long, env = "PLAYBOOK_ANSIBLE_PLAYBOOK", default_value = DEFAULT_PROGRAM)]
    pub ansible_playbook: PathBuf,

    /// Kill a workflow after this many seconds (0 disables the limit)
    #[arg(long, env = "PLAYBOOK_WORKFLOW_TIMEOUT_SECS", default_value_t = 0)]
    pub workflow_timeout_secs: u64,

    /// Attempts per status write before giving up on conflicts
    #[arg(long, env = "PLAYBOOK_STATUS_RETRIES", default_value_t = DEFAULT_STATUS_RETRIES)]
    pub status_retries: u32,

    /// Write status through the /status subresource
    #[arg(
        long,
        env = "PLAYBOOK_STATUS_SUBRESOURCE",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub status_subresource: bool,

    /// Spec field passed to workflows, as key:type with an optional
    /// trailing ? (repeatable; defaults to size:integer)
    #[arg(long = "field", env = "PLAYBOOK_FIELDS", value_delimiter = ',')]
    pub fields: Vec<FieldSpec>,

    /// Seconds to let running workflows finish after SIGTERM
    #[arg(long, env = "PLAYBOOK_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Service name used for telemetry and as the event reporter
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "playbook-operator")]
    pub service_name: String,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "PLAYBOOK_PLAIN_LOGS")]
    pub plain_logs: bool,
}

/// Configuration that cannot be used to start the operator
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent
    #[error("missing required setting --{0}")]
    Missing(&'static str),

    /// The playbook directory does not exist
    #[error("playbook directory {0} does not exist")]
    PlaybookDir(String),
}

impl Cli {
    /// Describe the watched resource type
    pub fn api_resource(&self) -> Result<ApiResource, ConfigError> {
        let group = self.group.as_deref().ok_or(ConfigError::Missing("group"))?;
        let kind = self.kind.as_deref().ok_or(ConfigError::Missing("kind"))?;
        let plural = self
            .plural
            .clone()
            .unwrap_or_else(|| format!("{}s", kind.to_ascii_lowercase()));
        let gvk = GroupVersionKind::gvk(group, &self.api_version, kind);
        Ok(ApiResource::from_gvk_with_plural(&gvk, &plural))
    }

    /// Parameter schema built from `--field` flags
    pub fn schema(&self) -> ParameterSchema {
        if self.fields.is_empty() {
            ParameterSchema::default()
        } else {
            ParameterSchema::new(self.fields.clone())
        }
    }

    /// Per-workflow time limit, if any
    pub fn workflow_timeout(&self) -> Option<Duration> {
        (self.workflow_timeout_secs > 0).then(|| Duration::from_secs(self.workflow_timeout_secs))
    }

    /// Time running workflows get to finish on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Fail if the playbook directory is missing; return the playbooks that
    /// are not present so they can be reported
    pub fn check_playbooks(&self) -> Result<Vec<PathBuf>, ConfigError> {
        check_playbooks(&self.playbook_dir)
    }
}

fn check_playbooks(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::PlaybookDir(dir.display().to_string()));
    }
    Ok([Workflow::Provision, Workflow::Update, Workflow::Deprovision]
        .into_iter()
        .map(|workflow| dir.join(format!("{}.yml", workflow.name())))
        .filter(|path| !path.is_file())
        .collect())
}
