use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use condor_lite::client::{ApiClient, ClientError};
use condor_lite::config::{parse_worker_spec, AgentConfig, NodeConfig};
use condor_lite::descriptor::{parse_size, parse_submit_file};
use condor_lite::node::Node;
use condor_lite::scheduler::{JobStatus, WorkerAdvertisement, WorkerInfo};
use condor_lite::shutdown::install_shutdown_handler;
use condor_lite::worker::HeartbeatSender;

#[derive(Parser, Debug)]
#[command(name = "condor-lite")]
#[command(version)]
#[command(about = "A resource-aware batch scheduler for containerized jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler node
    Server(ServerArgs),

    /// Advertise a remote worker to a running server
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:9618")]
    listen: SocketAddr,

    /// Worker hosted by this node, e.g.
    /// "gpu-1,gpus=1,cpus=4,memory=128GB,disk=50GB,jobLength=short" (repeatable)
    #[arg(long = "local-worker")]
    local_workers: Vec<String>,

    /// Root directory of the artifact store
    #[arg(long, default_value = "artifacts")]
    storage_root: PathBuf,

    /// Timeout for a single artifact fetch or push, in milliseconds
    #[arg(long, default_value = "30000")]
    storage_timeout_ms: u64,

    /// Directory for per-attempt scratch space (defaults to the system temp dir)
    #[arg(long)]
    scratch_root: Option<PathBuf>,

    /// Container engine CLI
    #[arg(long, default_value = "docker")]
    docker_binary: String,

    /// Retries allowed after the first attempt
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Per-job GPU cap
    #[arg(long, default_value = "8")]
    max_gpus: u32,

    /// Per-job CPU cap
    #[arg(long, default_value = "128")]
    max_cpus: u32,

    /// Per-job memory cap (bare number = MiB)
    #[arg(long, default_value = "1TiB")]
    max_memory: String,

    /// Per-job disk cap (bare number = KiB)
    #[arg(long, default_value = "10TiB")]
    max_disk: String,

    /// Maximum number of non-terminal jobs
    #[arg(long, default_value = "10000")]
    max_active_jobs: usize,

    /// Workers silent for this long are considered lost, in milliseconds
    #[arg(long, default_value = "15000")]
    heartbeat_timeout_ms: u64,

    /// Period of the scheduling pass, in milliseconds
    #[arg(long, default_value = "500")]
    tick_interval_ms: u64,
}

// =============================================================================
// Worker Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9618")]
    addr: String,

    /// Worker description, e.g.
    /// "gpu-2,gpus=2,cpus=16,memory=256GB,disk=1TB,endpoint=tcp://10.0.0.2:2375"
    spec: String,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value = "5000")]
    heartbeat_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by job and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9618")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit the jobs described by a submit file
    Submit {
        /// Path to the submit description file
        file: PathBuf,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List all jobs
    List,
    /// Cancel a queued or staging job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// List live workers and their free capacity
    Workers,
}

// =============================================================================
// Errors and exit codes
// =============================================================================

/// Failure of a CLI command, split by exit code.
enum CliError {
    /// Bad input or a request the server rejected: exit 1.
    Invalid(String),
    /// Server or storage unreachable: exit 2.
    Unavailable(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Invalid(_) => ExitCode::from(1),
            CliError::Unavailable(_) => ExitCode::from(2),
        }
    }

    fn message(&self) -> &str {
        match self {
            CliError::Invalid(msg) | CliError::Unavailable(msg) => msg,
        }
    }
}

impl From<ClientError> for CliError {
    fn from(err: ClientError) -> Self {
        if err.is_validation() {
            CliError::Invalid(err.to_string())
        } else {
            CliError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Unavailable(err.to_string())
    }
}

type CliResult = Result<(), CliError>;

fn parse_job_id(text: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(text.trim()).map_err(|e| CliError::Invalid(format!("invalid job id {:?}: {}", text, e)))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Server and worker agent
// =============================================================================

fn build_node_config(args: ServerArgs) -> Result<NodeConfig, CliError> {
    let mut config = NodeConfig::new(args.listen);

    config.storage.root = args.storage_root;
    config.storage.timeout_ms = args.storage_timeout_ms;

    config.sandbox.docker_binary = args.docker_binary;
    if let Some(scratch_root) = args.scratch_root {
        config.sandbox.scratch_root = scratch_root;
    }

    let scheduler = &mut config.scheduler;
    scheduler.max_retries = args.max_retries;
    scheduler.max_active_jobs = args.max_active_jobs;
    scheduler.heartbeat_timeout_ms = args.heartbeat_timeout_ms;
    scheduler.tick_interval_ms = args.tick_interval_ms;
    scheduler.resource_caps.gpus = args.max_gpus;
    scheduler.resource_caps.cpus = args.max_cpus;
    scheduler.resource_caps.memory_bytes = parse_size(&args.max_memory, 1 << 20)
        .ok_or_else(|| CliError::Invalid(format!("invalid --max-memory {:?}", args.max_memory)))?;
    scheduler.resource_caps.disk_bytes = parse_size(&args.max_disk, 1 << 10)
        .ok_or_else(|| CliError::Invalid(format!("invalid --max-disk {:?}", args.max_disk)))?;

    for spec in &args.local_workers {
        let advertisement = parse_worker_spec(spec).map_err(CliError::Invalid)?;
        config = config.with_local_worker(advertisement);
    }

    Ok(config)
}

async fn run_server(args: ServerArgs) -> CliResult {
    let config = build_node_config(args)?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        storage_root = %config.storage.root.display(),
        scratch_root = %config.sandbox.scratch_root.display(),
        max_retries = config.scheduler.max_retries,
        local_workers = ?config.local_workers.iter().map(|w| w.worker_id.as_str()).collect::<Vec<_>>(),
        "Starting condor-lite node"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())
        .map_err(|e| CliError::Unavailable(format!("signal handlers: {}", e)))?;

    Node::with_docker(config)
        .run(shutdown)
        .await
        .map_err(|e| CliError::Unavailable(e.to_string()))
}

async fn run_worker(args: WorkerArgs) -> CliResult {
    let agent = AgentConfig {
        server_addr: args.addr,
        advertisement: parse_worker_spec(&args.spec).map_err(CliError::Invalid)?,
        heartbeat_interval_ms: args.heartbeat_interval_ms.max(1),
    };

    let client = ApiClient::new(&agent.server_addr);
    // Fail fast on a bad address or a rejected advertisement.
    client.heartbeat(&agent.advertisement).await?;

    tracing::info!(
        worker_id = %agent.advertisement.worker_id,
        server = %client.authority(),
        capacity = %agent.advertisement.capacity,
        "Worker registered"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())
        .map_err(|e| CliError::Unavailable(format!("signal handlers: {}", e)))?;

    let advertisement: WorkerAdvertisement = agent.advertisement.clone();
    HeartbeatSender::new(agent.heartbeat_interval())
        .run(shutdown, || {
            let client = client.clone();
            let advertisement = advertisement.clone();
            async move {
                // A missed beat is not fatal; the server expires us if it persists.
                if let Err(e) = client.heartbeat(&advertisement).await {
                    tracing::warn!(worker_id = %advertisement.worker_id, error = %e, "Heartbeat failed");
                }
                true
            }
        })
        .await;

    tracing::info!("Worker agent stopped");
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(client: &ApiClient, file: PathBuf, format: &OutputFormat) -> CliResult {
    let text = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| CliError::Invalid(format!("{}: {}", file.display(), e)))?;
    let specs = parse_submit_file(&text)
        .map_err(|e| CliError::Invalid(format!("{}: {}", file.display(), e)))?;

    let submission = client.submit(specs).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&submission)?),
        OutputFormat::Table => {
            println!(
                "{} job(s) submitted to cluster {}.",
                submission.job_ids.len(),
                submission.cluster_id
            );
            for (process, id) in submission.job_ids.iter().enumerate() {
                println!("  {}.{}  {}", submission.cluster_id, process, id);
            }
        }
    }
    Ok(())
}

fn print_job(job: &JobStatus) {
    println!("Job ID:          {}", job.id);
    println!("Batch:           {}.{}", job.cluster_id, job.process_id);
    println!("Image:           {}", job.image);
    if !job.command.is_empty() {
        println!("Command:         {}", job.command.join(" "));
    }
    println!("State:           {}", job.state);
    if let Some(ref worker) = job.assigned_worker {
        println!("Assigned Worker: {}", worker);
    }
    println!("Attempts:        {}", job.attempt);
    println!("Retries:         {}", job.retry_count);
    if let Some(code) = job.exit_code {
        println!("Exit Code:       {}", code);
    }
    if let Some(ref reason) = job.last_failure {
        println!("Last Failure:    {}", reason);
    }
    println!("Submitted:       {}", job.submitted_at.to_rfc3339());
    if let Some(finished) = job.finished_at {
        println!("Finished:        {}", finished.to_rfc3339());
    }
    if !job.outputs.is_empty() {
        println!("Outputs:");
        for output in &job.outputs {
            println!("  {}", output);
        }
    }
    println!("History:");
    for transition in &job.transitions {
        println!("  {}  {}", transition.at.to_rfc3339(), transition.state);
    }
}

async fn handle_job_status(client: &ApiClient, job_id: &str, format: &OutputFormat) -> CliResult {
    let job = client.status(parse_job_id(job_id)?).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => print_job(&job),
    }
    Ok(())
}

async fn handle_job_cancel(client: &ApiClient, job_id: &str, format: &OutputFormat) -> CliResult {
    let job = client.cancel(parse_job_id(job_id)?).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => println!("Job {} cancelled.", job.id),
    }
    Ok(())
}

async fn handle_job_list(client: &ApiClient, format: &OutputFormat) -> CliResult {
    let jobs = client.list().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<10} {:<12} {:<8} IMAGE",
                "JOB ID", "BATCH", "STATE", "WORKER", "RETRIES"
            );
            println!("{}", "-".repeat(96));
            for job in &jobs {
                println!(
                    "{:<38} {:<10} {:<10} {:<12} {:<8} {}",
                    job.id,
                    format!("{}.{}", job.cluster_id, job.process_id),
                    job.state,
                    job.assigned_worker.as_deref().unwrap_or("-"),
                    job.retry_count,
                    job.image
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

fn print_workers(workers: &[WorkerInfo]) {
    if workers.is_empty() {
        println!("No live workers.");
        return;
    }
    println!(
        "{:<16} {:>4} {:>5} {:>14} {:>14} {:>5}  LABELS",
        "WORKER", "GPUS", "CPUS", "MEMORY FREE", "DISK FREE", "JOBS"
    );
    println!("{}", "-".repeat(80));
    for worker in workers {
        let labels: Vec<String> = worker
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{:<16} {:>4} {:>5} {:>14} {:>14} {:>5}  {}",
            worker.worker_id,
            worker.free.gpus,
            worker.free.cpus,
            worker.free.memory_bytes,
            worker.free.disk_bytes,
            worker.assigned_jobs,
            labels.join(",")
        );
    }
}

async fn handle_cluster_workers(client: &ApiClient, format: &OutputFormat) -> CliResult {
    let workers = client.workers().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Table => print_workers(&workers),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let result = match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Worker(worker_args) => run_worker(worker_args).await,
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr);
            match command {
                JobCommands::Submit { file } => handle_job_submit(&api, file, &client.output).await,
                JobCommands::Status { job_id } => {
                    handle_job_status(&api, &job_id, &client.output).await
                }
                JobCommands::List => handle_job_list(&api, &client.output).await,
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&api, &job_id, &client.output).await
                }
            }
        }
        Commands::Cluster { client, command } => {
            let api = ApiClient::new(&client.addr);
            match command {
                ClusterCommands::Workers => handle_cluster_workers(&api, &client.output).await,
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.message());
            e.exit_code()
        }
    }
}
