//! Submits a program as one `LpJob` custom resource. Groups become roles,
//! each role a set of pods whose hostnames follow `{role}-{index}` under the
//! job's subdomain. The cluster owns the pods from then on.

use super::command::LaunchCommand;
use super::{ensure_not_empty, LaunchOutcome};
use crate::entry::artifact::EntryArtifact;
use crate::program::address::{AddressBuilder, KUBERNETES_PORT};
use crate::program::Program;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const LPJOB_GROUP: &str = "realai.cn";
pub const LPJOB_VERSION: &str = "v1alpha1";
pub const LPJOB_KIND: &str = "LpJob";
pub const LPJOB_PLURAL: &str = "lpjobs";

pub const DEFAULT_JOB_NAME: &str = "launchpad";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_IMAGE: &str = "tlaunch-worker:latest";
pub const DEFAULT_KUBECTL: &str = "kubectl";
/// Worker entry inside the default image. It finds its artifact through the
/// pod hostname, so it needs no arguments.
pub const DEFAULT_COMMAND: &[&str] = &["tlaunch-worker"];
const PORT_NAME: &str = "launchpad";
const MAX_NAME_LEN: usize = 63;

/// Lowercases `name`, maps `_` to `-` and strips whatever is still not a
/// valid DNS label character, warning when something had to be removed.
/// A missing or fully invalid name becomes [`DEFAULT_JOB_NAME`].
pub fn validate_name(name: Option<&str>) -> String {
    let Some(raw) = name else {
        return DEFAULT_JOB_NAME.to_string();
    };

    let lowered = raw.to_lowercase().replace('_', "-");
    let kept: String = lowered
        .chars()
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-' || *ch == '.')
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = kept
        .trim_matches(|ch: char| !ch.is_ascii_alphanumeric())
        .to_string();

    if cleaned != lowered {
        tracing::warn!(
            name = raw,
            sanitized = %cleaned,
            "name is not a valid DNS-1123 subdomain; invalid characters were removed"
        );
    }
    if cleaned.is_empty() {
        DEFAULT_JOB_NAME.to_string()
    } else {
        cleaned
    }
}

/// A resource quantity: a request, optionally capped by a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub request: String,
    #[serde(default)]
    pub limit: Option<String>,
}

impl ResourceRange {
    pub fn request(value: impl Into<String>) -> Self {
        Self {
            request: value.into(),
            limit: None,
        }
    }

    pub fn bounded(request: impl Into<String>, limit: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            limit: Some(limit.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: Option<ResourceRange>,
    #[serde(default)]
    pub memory: Option<ResourceRange>,
    #[serde(default)]
    pub gpu: Option<ResourceRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub requests: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub limits: BTreeMap<String, String>,
}

impl Resources {
    pub fn requirements(&self) -> ResourceRequirements {
        let mut requirements = ResourceRequirements::default();
        let named = [
            ("cpu", &self.cpu),
            ("memory", &self.memory),
            ("nvidia.com/gpu", &self.gpu),
        ];
        for (name, range) in named {
            let Some(range) = range else {
                continue;
            };
            requirements
                .requests
                .insert(name.to_string(), range.request.clone());
            if let Some(limit) = &range.limit {
                requirements.limits.insert(name.to_string(), limit.clone());
            }
        }
        requirements
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinioSource {
    pub endpoint: String,
    pub bucket: String,
    pub path: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Where the operator syncs user code from before pods start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Git(GitSource),
    Minio(MinioSource),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: Option<String>,
    /// Replaces the default command. `flags` only extend the default.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ContainerConfig {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn command(&self) -> Vec<String> {
        match &self.command {
            Some(command) => command.clone(),
            None => DEFAULT_COMMAND
                .iter()
                .map(|part| part.to_string())
                .chain(self.flags.iter().cloned())
                .collect(),
        }
    }
}

/// Pod template settings of one role. `pod` holds extra pod-spec fields
/// (node selectors, tolerations, ...) copied into the spec verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub pod: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub kube_config: Option<PathBuf>,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default)]
    pub source: Option<SyncSource>,
    /// Keyed by group label; groups without an entry use the defaults.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_kubectl() -> String {
    DEFAULT_KUBECTL.to_string()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kube_config: None,
            kubectl: default_kubectl(),
            source: None,
            groups: HashMap::new(),
        }
    }
}

impl KubernetesConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            bail!("namespace must not be empty");
        }
        if validate_name(Some(&self.namespace)) != self.namespace {
            bail!("namespace {} is not a valid DNS-1123 label", self.namespace);
        }
        if self.kubectl.is_empty() {
            bail!("kubectl must not be empty");
        }
        for (label, group) in &self.groups {
            if let Some(command) = &group.container.command {
                if command.is_empty() {
                    bail!("command of group {label} must not be empty");
                }
            }
        }
        Ok(())
    }

    pub fn group(&self, label: &str) -> GroupConfig {
        self.groups.get(label).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub metadata: TemplateMeta,
    pub spec: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub replicas: usize,
    pub template: PodTemplate,
    /// Base64 of the role's entry artifact.
    pub executable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpJobSpec {
    pub roles: BTreeMap<String, RoleSpec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<SyncSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LpJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: LpJobSpec,
}

impl LpJob {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ContainerPort {
    name: String,
    #[serde(rename = "containerPort")]
    container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Container {
    name: String,
    image: String,
    command: Vec<String>,
    ports: Vec<ContainerPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<ResourceRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<Vec<EnvVar>>,
}

/// The one call this backend makes against the cluster.
pub trait ClusterApi: Send + Sync {
    fn create_job<'a>(&'a self, namespace: &'a str, job: &'a LpJob) -> BoxFuture<'a, Result<()>>;
}

/// Creates the resource by piping its manifest to `kubectl create -f -`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    kube_config: Option<PathBuf>,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>, kube_config: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kube_config,
        }
    }

    pub fn create_args(&self, namespace: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.kube_config {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        args.extend(["create", "-n", namespace, "-f", "-"].map(String::from));
        args
    }
}

impl ClusterApi for Kubectl {
    fn create_job<'a>(&'a self, namespace: &'a str, job: &'a LpJob) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let manifest = serde_json::to_vec(job).context("failed to serialize LpJob manifest")?;
            let mut child = Command::new(&self.binary)
                .args(self.create_args(namespace))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to run {}", self.binary))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&manifest)
                    .await
                    .context("failed to write manifest to kubectl")?;
            }

            let output = child
                .wait_with_output()
                .await
                .with_context(|| format!("failed to wait for {}", self.binary))?;
            if !output.status.success() {
                bail!(
                    "{} create failed ({}): {}",
                    self.binary,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        })
    }
}

pub struct KubernetesLauncher {
    config: KubernetesConfig,
    api: Arc<dyn ClusterApi>,
}

impl KubernetesLauncher {
    pub fn new(config: KubernetesConfig) -> Result<Self> {
        let api = Arc::new(Kubectl::new(config.kubectl.clone(), config.kube_config.clone()));
        Self::with_api(config, api)
    }

    pub fn with_api(config: KubernetesConfig, api: Arc<dyn ClusterApi>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, api })
    }

    pub fn config(&self) -> &KubernetesConfig {
        &self.config
    }

    pub fn job_name(&self, program: &Program) -> String {
        validate_name(Some(program.name()))
    }

    /// Points every node at its pod's DNS name; every address uses the pod port.
    pub fn bind(&self, program: &mut Program) -> Result<()> {
        let job = self.job_name(program);
        for node in program.nodes_mut() {
            let Some(identity) = node.identity().cloned() else {
                bail!("node was not added to the program");
            };
            let role = validate_name(Some(&identity.label));
            node.set_host(pod_host(&job, &role, identity.index));
            for address in node.addresses() {
                address.bind(AddressBuilder::Kubernetes {
                    job: job.clone(),
                    group: role.clone(),
                    index: identity.index,
                    port: KUBERNETES_PORT,
                })?;
            }
        }
        Ok(())
    }

    /// The container command of each pod. Pods run no per-node arguments;
    /// the worker derives its task from the hostname.
    pub fn commands(&self, program: &Program) -> Result<Vec<LaunchCommand>> {
        let job = self.job_name(program);
        let mut commands = Vec::with_capacity(program.len());
        for group in program.groups() {
            let role = validate_name(Some(group.label()));
            let container = self.config.group(group.label()).container;
            for index in 0..group.len() {
                commands.push(LaunchCommand::new(
                    container.command(),
                    container.env.clone(),
                    format!("{}/{index}", group.label()),
                    pod_host(&job, &role, index),
                    None,
                ));
            }
        }
        Ok(commands)
    }

    /// Composes the custom resource for a bound program.
    pub fn manifest(&self, program: &Program) -> Result<LpJob> {
        let job = self.job_name(program);
        let mut roles = BTreeMap::new();

        for group in program.groups() {
            let role = validate_name(Some(group.label()));
            let artifact = EntryArtifact::from_group(group)?;
            let config = self.config.group(group.label());
            let spec = pod_spec(&job, &config)?;

            let role_spec = RoleSpec {
                replicas: group.len(),
                template: PodTemplate {
                    metadata: TemplateMeta {
                        labels: BTreeMap::from([("app".to_string(), job.clone())]),
                    },
                    spec,
                },
                executable: artifact.to_base64()?,
            };
            if roles.insert(role.clone(), role_spec).is_some() {
                bail!("groups {} map to the same role name {role}", group.label());
            }
        }

        Ok(LpJob {
            api_version: format!("{LPJOB_GROUP}/{LPJOB_VERSION}"),
            kind: LPJOB_KIND.to_string(),
            metadata: ObjectMeta { name: job },
            spec: LpJobSpec {
                roles,
                source: self.config.source.clone(),
            },
        })
    }

    pub async fn launch(&mut self, program: &mut Program) -> Result<LaunchOutcome> {
        ensure_not_empty(program)?;
        let job = self.manifest(program)?;
        let namespace = self.config.namespace.clone();

        self.api
            .create_job(&namespace, &job)
            .await
            .with_context(|| format!("failed to create lpjob {} in namespace {namespace}", job.name()))?;
        tracing::info!(
            job = job.name(),
            namespace = %namespace,
            roles = job.spec.roles.len(),
            "An lpjob named {} has been created in namespace {namespace}",
            job.name()
        );

        Ok(LaunchOutcome::Submitted {
            job: job.name().to_string(),
            namespace,
        })
    }
}

fn pod_host(job: &str, role: &str, index: usize) -> String {
    format!("{role}-{index}.{job}")
}

fn pod_spec(job: &str, config: &GroupConfig) -> Result<Map<String, Value>> {
    let container = &config.container;
    let env = (!container.env.is_empty()).then(|| {
        container
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    });
    let container = Container {
        name: job.to_string(),
        image: container.image().to_string(),
        command: container.command(),
        ports: vec![ContainerPort {
            name: PORT_NAME.to_string(),
            container_port: KUBERNETES_PORT,
        }],
        resources: container.resources.as_ref().map(Resources::requirements),
        env,
    };

    let mut spec = config.pod.clone();
    spec.insert(
        "containers".to_string(),
        Value::Array(vec![serde_json::to_value(container).context("failed to encode container")?]),
    );
    Ok(spec)
}
