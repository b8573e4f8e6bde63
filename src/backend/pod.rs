//! Orchestrator pod backend
//!
//! Drives `kubectl` through [`CommandExecutor`]: a generated pod manifest is
//! applied from stdin, `get pod -o json` is folded into a [`ResourceEvent`],
//! teardown is `delete --wait=false`, and the result is read back from the
//! marked line in the pod's log.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::context::{CONTEXT_ENV, CONTEXT_SALT_ENV, CONTEXT_SECRET_ENV};
use super::{
    BackendError, CommandExecutor, ExecutionBackend, ExecutorIdentifier, ExecutorKind, JobRecord, JobResult, Launch,
    WorkerPaths,
};
use crate::resource::ResourceEvent;

/// Container waiting reasons that will not resolve on their own.
const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "CrashLoopBackOff",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    pub kubectl: String,
    pub namespace: String,
    pub image: String,
    pub name_prefix: String,
    /// Worker command inside the image; `--context-env` is appended.
    pub worker_command: Vec<String>,
    pub termination_grace_secs: u64,
    /// Directory inside the container for the stop and result files.
    pub worker_dir: PathBuf,
    pub service_account: Option<String>,
    /// Kubernetes secret holding `secret` and `salt` keys for sealed contexts.
    pub context_key_secret: Option<String>,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            namespace: "default".to_string(),
            image: "opsflow-worker:latest".to_string(),
            name_prefix: "opsflow-job".to_string(),
            worker_command: vec!["opsflow".to_string(), "worker".to_string()],
            termination_grace_secs: 30,
            worker_dir: PathBuf::from("/var/run/opsflow"),
            service_account: None,
            context_key_secret: None,
        }
    }
}

pub struct PodBackend {
    config: PodConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl PodBackend {
    pub fn new(config: PodConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { config, executor }
    }

    fn pod_name(&self, job_id: &str) -> String {
        format!("{}-{}", self.config.name_prefix, job_id.to_lowercase())
    }

    fn parse_handle<'a>(&self, id: &'a ExecutorIdentifier) -> Result<(&'a str, &'a str), BackendError> {
        id.handle
            .split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
            .ok_or_else(|| BackendError::InvalidHandle(id.handle.clone()))
    }

    fn manifest(&self, job: &JobRecord, namespace: &str, launch: &Launch) -> Value {
        let image = job
            .properties
            .get("image")
            .cloned()
            .unwrap_or_else(|| self.config.image.clone());

        let mut command = self.config.worker_command.clone();
        command.push("--context-env".to_string());

        let mut env = vec![json!({ "name": CONTEXT_ENV, "value": launch.payload })];
        if let Some(secret) = &self.config.context_key_secret {
            for (name, key) in [(CONTEXT_SECRET_ENV, "secret"), (CONTEXT_SALT_ENV, "salt")] {
                env.push(json!({
                    "name": name,
                    "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
                }));
            }
        }

        let mut spec = json!({
            "restartPolicy": "Never",
            "terminationGracePeriodSeconds": self.config.termination_grace_secs,
            "containers": [{
                "name": "worker",
                "image": image,
                "command": command,
                "env": env,
                "volumeMounts": [{ "name": "opsflow-run", "mountPath": self.config.worker_dir }]
            }],
            "volumes": [{ "name": "opsflow-run", "emptyDir": {} }]
        });
        if let Some(account) = &self.config.service_account {
            spec["serviceAccountName"] = json!(account);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.pod_name(&job.id),
                "namespace": namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": "opsflow",
                    "opsflow/job-type": job.job_type,
                },
                "annotations": { "opsflow/job-id": job.id }
            },
            "spec": spec
        })
    }

    async fn kubectl(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, BackendError> {
        let output = self
            .executor
            .execute(&self.config.kubectl, &args, stdin)
            .await?;
        if !output.success() {
            return Err(BackendError::Rejected(format!(
                "kubectl {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Fold a `kubectl get pod -o json` document into a lifecycle event.
pub fn event_from_pod(pod: &Value) -> ResourceEvent {
    if pod["metadata"]["deletionTimestamp"].is_string() {
        return ResourceEvent::TerminationRequested;
    }

    let status = &pod["status"];
    match status["phase"].as_str().unwrap_or("") {
        "Pending" => {
            let waiting = status["containerStatuses"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|c| c["state"]["waiting"]["reason"].as_str())
                .find(|reason| FATAL_WAITING_REASONS.contains(reason));
            match waiting {
                Some(reason) => ResourceEvent::Failed {
                    reason: reason.to_string(),
                },
                None => ResourceEvent::Provisioning,
            }
        }
        "Running" => ResourceEvent::Started,
        "Succeeded" => ResourceEvent::Completed,
        "Failed" => {
            let reason = status["reason"]
                .as_str()
                .or_else(|| {
                    status["containerStatuses"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .find_map(|c| c["state"]["terminated"]["reason"].as_str())
                })
                .unwrap_or("pod failed");
            ResourceEvent::Failed {
                reason: reason.to_string(),
            }
        }
        other => ResourceEvent::CommunicationLost {
            reason: format!("pod phase '{other}'"),
        },
    }
}

#[async_trait]
impl ExecutionBackend for PodBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Pod
    }

    fn worker_paths(&self, job_id: &str) -> WorkerPaths {
        WorkerPaths {
            stop_path: self.config.worker_dir.join(format!("{job_id}.stop")),
            result_path: self.config.worker_dir.join(format!("{job_id}.result.json")),
        }
    }

    async fn dispatch(&self, job: &JobRecord, launch: &Launch) -> Result<ExecutorIdentifier, BackendError> {
        let namespace = job
            .properties
            .get("namespace")
            .cloned()
            .unwrap_or_else(|| self.config.namespace.clone());
        let manifest = serde_json::to_string(&self.manifest(job, &namespace, launch))?;

        self.kubectl(
            vec!["apply".into(), "-n".into(), namespace.clone(), "-f".into(), "-".into()],
            Some(manifest),
        )
        .await?;

        let handle = format!("{namespace}/{}", self.pod_name(&job.id));
        info!(job_id = %job.id, pod = %handle, "Created worker pod");
        Ok(ExecutorIdentifier::new(ExecutorKind::Pod, handle))
    }

    async fn probe(&self, id: &ExecutorIdentifier) -> Result<ResourceEvent, BackendError> {
        let (namespace, name) = self.parse_handle(id)?;
        let stdout = self
            .kubectl(
                vec![
                    "get".into(),
                    "pod".into(),
                    name.into(),
                    "-n".into(),
                    namespace.into(),
                    "-o".into(),
                    "json".into(),
                    "--ignore-not-found".into(),
                ],
                None,
            )
            .await?;

        if stdout.trim().is_empty() {
            return Ok(ResourceEvent::Gone);
        }
        let pod: Value = serde_json::from_str(&stdout)?;
        let event = event_from_pod(&pod);
        debug!(pod = %id.handle, event = ?event, "Probed pod");
        Ok(event)
    }

    async fn request_termination(&self, id: &ExecutorIdentifier) -> Result<(), BackendError> {
        let (namespace, name) = self.parse_handle(id)?;
        self.kubectl(
            vec![
                "delete".into(),
                "pod".into(),
                name.into(),
                "-n".into(),
                namespace.into(),
                "--wait=false".into(),
                "--ignore-not-found".into(),
                format!("--grace-period={}", self.config.termination_grace_secs),
            ],
            None,
        )
        .await?;
        info!(pod = %id.handle, "Requested pod deletion");
        Ok(())
    }

    async fn collect_result(&self, id: &ExecutorIdentifier) -> Result<Option<JobResult>, BackendError> {
        let (namespace, name) = self.parse_handle(id)?;
        let logs = self
            .kubectl(
                vec!["logs".into(), name.into(), "-n".into(), namespace.into(), "-c".into(), "worker".into()],
                None,
            )
            .await?;
        Ok(JobResult::from_log(&logs))
    }
}
