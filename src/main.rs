use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use opsflow::backend::{
    ContextCodec, ContextKey, ContextSource, ExecutionService, ExecutorKind, JobDefinition, LocalProcessBackend,
    PodBackend, ProcessCommandExecutor,
};
use opsflow::config::{OpsflowConfig, CONFIG_FILE};
use opsflow::monitor::{FanoutSink, MetricsSink, MonitoringSink, TracingSink};
use opsflow::store::{FileSystemStore, JobStore, WorkflowStore};
use opsflow::worker::{run_worker, JobHandlerRegistry};
use opsflow::{init_telemetry, JobScheduler, ShutdownCoordinator, WorkflowRunner};

#[derive(Parser)]
#[command(name = "opsflow")]
#[command(about = "Drive long-running operational jobs and workflows across local and pod executors")]
#[command(long_about = "opsflow runs a fixed-delay scheduler over a file-backed store. Jobs are dispatched \
                       to worker processes on this host or to pods, polled until their executor is gone, \
                       and their results recorded. Start with 'opsflow init-config', then 'opsflow run'.")]
struct Cli {
    /// Config file (default: ./opsflow.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Enqueue a job; the running scheduler dispatches it on its next scan
    Submit {
        job_type: String,
        /// Job parameters as JSON
        #[arg(long, default_value = "null")]
        params: String,
        /// Executor kind (local_process, pod); defaults to the job type's
        #[arg(long)]
        executor: Option<ExecutorKind>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Backend property, repeatable: --property image=worker:2
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },
    /// Request cancellation of a job
    Cancel { job_id: String },
    /// Run one job inside a worker process
    Worker {
        /// Read the job context from this file (deleted after reading)
        #[arg(long, conflicts_with = "context_env")]
        context_file: Option<PathBuf>,
        /// Read the job context from OPSFLOW_JOB_CONTEXT
        #[arg(long)]
        context_env: bool,
    },
    /// List workflow and job records
    Status {
        #[arg(long, help = "Print records as JSON")]
        json: bool,
    },
    /// Write a starter configuration file
    InitConfig {
        #[arg(long, default_value = CONFIG_FILE)]
        path: PathBuf,
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    OpsflowConfig::load_env_file()?;
    let config = OpsflowConfig::load(cli.config.as_deref())?;
    init_telemetry(&config.observability);

    match cli.command {
        Commands::Run => run_command(&config).await,
        Commands::Submit {
            job_type,
            params,
            executor,
            timeout_secs,
            properties,
        } => submit_command(&config, job_type, &params, executor, timeout_secs, properties).await,
        Commands::Cancel { job_id } => cancel_command(&config, &job_id).await,
        Commands::Worker {
            context_file,
            context_env,
        } => worker_command(context_file, context_env).await,
        Commands::Status { json } => status_command(&config, json).await,
        Commands::InitConfig { path, force } => init_config_command(&config, &path, force),
    }
}

struct Wiring {
    store: Arc<FileSystemStore>,
    execution: Arc<ExecutionService>,
    metrics: Arc<MetricsSink>,
}

async fn wire(config: &OpsflowConfig) -> Result<Wiring> {
    let store = Arc::new(
        FileSystemStore::open(&config.store.path)
            .await
            .with_context(|| format!("opening store at {}", config.store.path.display()))?,
    );

    let metrics = Arc::new(MetricsSink::new());
    let monitor: Arc<dyn MonitoringSink> = Arc::new(FanoutSink::new(vec![Arc::new(TracingSink), metrics.clone()]));

    let codec = if config.execution.encrypt_context {
        let key = ContextKey::from_env()
            .ok_or_else(|| anyhow!("encrypt_context is set but OPSFLOW_CONTEXT_SECRET is not"))?;
        ContextCodec::encrypted(key)
    } else {
        ContextCodec::plain()
    };

    let mut execution = ExecutionService::new(config.job_type_registry(), store.clone(), monitor)
        .with_backend(Arc::new(LocalProcessBackend::new(config.local.clone())))
        .with_codec(codec)
        .with_settings(config.execution.settings());
    if let Some(pod) = &config.pod {
        let kubectl = Arc::new(ProcessCommandExecutor::new(config.execution.command_timeout()));
        execution = execution.with_backend(Arc::new(PodBackend::new(pod.clone(), kubectl)));
    }

    Ok(Wiring {
        store,
        execution: Arc::new(execution),
        metrics,
    })
}

async fn run_command(config: &OpsflowConfig) -> Result<()> {
    let wiring = wire(config).await?;
    let runner = WorkflowRunner::new(wiring.store.clone(), wiring.execution.monitor().clone())
        .with_retry_delay(config.workflows.retry_delay());
    let scheduler = JobScheduler::new(Arc::new(runner), wiring.execution, config.scheduler);

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();
    scheduler.run(shutdown).await;

    wiring.metrics.log_stats();
    Ok(())
}

async fn submit_command(
    config: &OpsflowConfig,
    job_type: String,
    params: &str,
    executor: Option<ExecutorKind>,
    timeout_secs: Option<u64>,
    properties: Vec<(String, String)>,
) -> Result<()> {
    let parameters: serde_json::Value = serde_json::from_str(params).context("--params is not valid JSON")?;
    let definition = JobDefinition {
        id: None,
        job_type,
        parameters,
        executor,
        timeout_secs,
        properties: properties.into_iter().collect(),
    };

    let wiring = wire(config).await?;
    let job_id = wiring.execution.submit(definition).await?;
    println!("{job_id}");
    Ok(())
}

async fn cancel_command(config: &OpsflowConfig, job_id: &str) -> Result<()> {
    let wiring = wire(config).await?;
    let status = wiring.execution.cancel(job_id).await?;
    println!("{job_id}: {status:?}");
    Ok(())
}

async fn worker_command(context_file: Option<PathBuf>, context_env: bool) -> Result<()> {
    let source = match (context_file, context_env) {
        (Some(path), _) => ContextSource::File(path),
        (None, true) => ContextSource::Env,
        (None, false) => bail!("one of --context-file or --context-env is required"),
    };
    let codec = ContextKey::from_env()
        .map(ContextCodec::encrypted)
        .unwrap_or_else(ContextCodec::plain);

    let result = run_worker(&source, &codec, &JobHandlerRegistry::with_builtins()).await?;
    if !result.success {
        bail!(
            "job {} failed: {}",
            result.job_id,
            result.error.as_deref().unwrap_or("no error reported")
        );
    }
    Ok(())
}

async fn status_command(config: &OpsflowConfig, json: bool) -> Result<()> {
    let store = FileSystemStore::open(&config.store.path).await?;
    let workflows = store.list_workflows().await?;
    let jobs = store.list_jobs().await?;

    if json {
        let out = serde_json::json!({ "workflows": workflows, "jobs": jobs });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Workflows ({})", workflows.len());
    for wf in &workflows {
        println!(
            "  {}  {:<18} {:<10} step={:<14} v{}  {}",
            wf.id,
            wf.workflow_type,
            format!("{:?}", wf.status),
            wf.current_step().unwrap_or("-"),
            wf.version,
            wf.last_error.as_deref().unwrap_or("")
        );
    }

    println!("Jobs ({})", jobs.len());
    for job in &jobs {
        println!(
            "  {}  {:<12} {:<13} {:<10} {:<12} {}",
            job.id,
            job.job_type,
            job.executor.to_string(),
            format!("{:?}", job.status),
            job.resource_state.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            job.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn init_config_command(config: &OpsflowConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    config.save_to_file(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
