use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fleet_dispatch::api::{DispatchClient, RegisterRequest};
use fleet_dispatch::config::{FleetConfig, RetryPolicy, ServerConfig};
use fleet_dispatch::node::Node;
use fleet_dispatch::scheduler::{SubmitRequest, WorkerCredentials};
use fleet_dispatch::shutdown::install_shutdown_handler;
use fleet_dispatch::worker::{AgentConfig, ShellExecutor, WorkerAgent};

#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch")]
#[command(version)]
#[command(about = "Lease-based job dispatch and autoscaling for elastic GPU worker fleets")]
#[command(propagate_version = true)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a dispatch server
    Server(ServerArgs),

    /// Register with a server and run leased jobs through the shell
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Fleet inspection and operator overrides
    Fleet {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: FleetCommands,
    },

    /// List registered workers
    Workers {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show the latest autoscaling metrics
    Metrics {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to serve the HTTP API on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// JSON file holding an array of fleet definitions
    #[arg(long)]
    fleets: Option<PathBuf>,

    /// Expected worker heartbeat interval in seconds
    #[arg(long, default_value = "10")]
    heartbeat_secs: u64,

    /// Attempts before a job fails permanently
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// First retry delay in seconds
    #[arg(long, default_value = "5")]
    retry_base_secs: u64,

    /// Upper bound on the retry delay in seconds
    #[arg(long, default_value = "300")]
    retry_max_secs: u64,

    /// Queued jobs older than this many seconds expire (0 disables)
    #[arg(long, default_value = "86400")]
    queue_ttl_secs: u64,

    /// Fast step controller interval in seconds
    #[arg(long, default_value = "10")]
    fast_interval_secs: u64,

    /// Scale-to-zero watchdog interval in seconds
    #[arg(long, default_value = "60")]
    watchdog_interval_secs: u64,

    /// Require an operator to approve new workers before they get leases
    #[arg(long)]
    require_approval: bool,

    /// Bearer token required on operator routes (drain, approve, desired)
    #[arg(long)]
    admin_token: Option<String>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Fleet to join
    #[arg(long)]
    fleet: String,

    /// Workflows this worker can run (repeatable)
    #[arg(long = "capability", required = true)]
    capabilities: Vec<String>,

    /// Leases held at once
    #[arg(long, default_value = "1")]
    max_concurrency: usize,

    /// Long-poll budget per claim in seconds
    #[arg(long, default_value = "20")]
    claim_wait_secs: u64,

    /// Hand leases back immediately on shutdown instead of finishing them
    #[arg(long)]
    abandon_on_shutdown: bool,

    /// Seconds in-flight work may keep running after shutdown
    #[arg(long, default_value = "300")]
    shutdown_grace_secs: u64,
}

// =============================================================================
// Client Arguments (shared by job, fleet, workers and metrics commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Bearer token for operator commands
    #[arg(long)]
    admin_token: Option<String>,
}

impl ClientArgs {
    fn client(&self) -> DispatchClient {
        let client = DispatchClient::new(&self.addr);
        match &self.admin_token {
            Some(token) => client.with_admin_token(token.clone()),
            None => client,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        workflow: String,

        /// Dedup key; a live job with the same key is returned instead
        #[arg(long)]
        idempotency_key: String,

        /// Job payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Lower runs first
        #[arg(long)]
        priority: Option<i32>,

        #[arg(long)]
        requested_tokens: Option<u64>,

        /// Stage fleet to route to when several serve the workflow
        #[arg(long)]
        fleet: Option<String>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Cancel a job that has not finished
    Cancel {
        /// The job ID (UUID)
        job_id: Uuid,
    },
}

// =============================================================================
// Fleet Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum FleetCommands {
    /// List all fleets
    List,
    /// Show one fleet with live metrics
    Status { slug: String },
    /// Override a fleet's desired capacity
    SetDesired {
        slug: String,
        desired: u32,
        #[arg(long, default_value = "operator override")]
        reason: String,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let fleets = match &args.fleets {
        Some(path) => FleetConfig::load_all(path)?,
        None => Vec::new(),
    };
    if fleets.is_empty() {
        tracing::warn!("No fleets configured; every worker registration will be rejected");
    }

    let mut config = ServerConfig::new(args.listen);
    config.fleets = fleets;
    config.dispatch = config
        .dispatch
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_secs))
        .with_max_attempts(args.max_attempts)
        .with_retry(RetryPolicy {
            base_delay: Duration::from_secs(args.retry_base_secs),
            max_delay: Duration::from_secs(args.retry_max_secs),
            ..RetryPolicy::default()
        });
    config.dispatch.queue_ttl = (args.queue_ttl_secs > 0).then(|| Duration::from_secs(args.queue_ttl_secs));
    config.dispatch.auto_approve_workers = !args.require_approval;
    config.autoscale.fast_interval = Duration::from_secs(args.fast_interval_secs);
    config.autoscale.watchdog_interval = Duration::from_secs(args.watchdog_interval_secs);
    if args.admin_token.is_none() {
        tracing::warn!("No admin token set; operator routes are open");
    }
    config.admin_token = args.admin_token;

    let shutdown = install_shutdown_handler();
    let node = Node::new(config)?;
    node.run(shutdown).await
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(DispatchClient::new(&args.addr));
    let registered = client
        .register(&RegisterRequest {
            fleet: args.fleet.clone(),
            capabilities: args.capabilities.clone(),
            max_concurrency: args.max_concurrency,
        })
        .await?;

    tracing::info!(
        worker_id = %registered.worker_id,
        fleet = %args.fleet,
        approved = registered.approved,
        heartbeat_interval_ms = registered.heartbeat_interval_ms,
        "Registered with dispatch server"
    );
    if !registered.approved {
        tracing::warn!("Worker is awaiting operator approval and will not receive leases yet");
    }

    let creds = WorkerCredentials::new(registered.worker_id, registered.token);
    let config = AgentConfig {
        capabilities: args.capabilities,
        ..AgentConfig::default()
    }
    .with_max_concurrency(args.max_concurrency)
    .with_claim_wait(Duration::from_secs(args.claim_wait_secs))
    .with_abandon_on_shutdown(args.abandon_on_shutdown)
    .with_shutdown_grace(Duration::from_secs(args.shutdown_grace_secs));

    let agent = WorkerAgent::new(client, Arc::new(ShellExecutor::new()), creds, config);
    agent.run(install_shutdown_handler()).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job(
    client: &DispatchClient,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = match command {
        JobCommands::Submit {
            tenant,
            workflow,
            idempotency_key,
            payload,
            priority,
            requested_tokens,
            fleet,
        } => {
            let mut req = SubmitRequest::new(tenant, workflow, idempotency_key, serde_json::from_str(&payload)?);
            req.priority = priority;
            req.requested_tokens = requested_tokens;
            req.fleet = fleet;

            let submission = client.submit(&req).await?;
            if matches!(output, OutputFormat::Table) {
                if submission.is_created() {
                    println!("Job submitted successfully!");
                } else {
                    println!("Job already exists for this idempotency key.");
                }
            }
            submission.into_job()
        }
        JobCommands::Status { job_id } => client.job(&job_id).await?,
        JobCommands::Cancel { job_id } => client.cancel(&job_id).await?,
    };

    match output {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job ID:    {}", job.id);
            println!("Tenant:    {}", job.tenant_id);
            println!("Workflow:  {}", job.workflow_id);
            println!("Status:    {}", job.status);
            println!("Attempts:  {}", job.attempt_count);
            println!("Created:   {}", job.created_at);
            if let Some(done) = job.completed_at {
                println!("Completed: {}", done);
            }
            if let Some(result) = &job.result {
                println!("Result:    {}", result);
            }
            if let Some(error) = &job.error_message {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_fleet(
    client: &DispatchClient,
    command: FleetCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        FleetCommands::List => {
            let fleets = client.fleets().await?;
            match output {
                OutputFormat::Json => print_json(&fleets)?,
                OutputFormat::Table => {
                    println!("{:<20} {:<20} {:>8} {:>8} LAST SCALED", "FLEET", "WORKFLOW", "DESIRED", "MAX");
                    println!("{}", "-".repeat(80));
                    for fleet in fleets {
                        println!(
                            "{:<20} {:<20} {:>8} {:>8} {}",
                            fleet.config.slug,
                            fleet.config.workflow_id,
                            fleet.desired_capacity,
                            fleet.config.max_size,
                            or_dash(fleet.last_scaled_at)
                        );
                    }
                }
            }
        }
        FleetCommands::Status { slug } => {
            let status = client.fleet(&slug).await?;
            match output {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => {
                    let fleet = &status.fleet;
                    println!("Fleet {}", fleet.config.slug);
                    println!("{}", "=".repeat(40));
                    println!("Workflow:       {}", fleet.config.workflow_id);
                    println!("Desired:        {}/{}", fleet.desired_capacity, fleet.config.max_size);
                    println!("Last scaled:    {}", or_dash(fleet.last_scaled_at));
                    println!("Last reason:    {}", or_dash(fleet.last_scale_reason.as_ref()));
                    if let Some(m) = &status.metrics {
                        println!("Queue depth:    {}", m.queue_depth);
                        println!("In flight:      {}", m.in_flight);
                        println!("Workers:        {}", m.running_workers);
                        println!("Backlog/worker: {:.2}", m.backlog_per_instance);
                        println!("p95 wait (ms):  {}", or_dash(m.p95_wait_ms));
                        if m.capacity_exhausted {
                            println!("[!] backlog exceeds max_size");
                        }
                    }
                }
            }
        }
        FleetCommands::SetDesired { slug, desired, reason } => {
            let fleet = client.set_desired(&slug, desired, &reason).await?;
            match output {
                OutputFormat::Json => print_json(&fleet)?,
                OutputFormat::Table => {
                    println!("Fleet {} desired capacity set to {}", fleet.config.slug, fleet.desired_capacity)
                }
            }
        }
    }
    Ok(())
}

async fn handle_workers(client: &DispatchClient, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let workers = client.workers().await?;
    match output {
        OutputFormat::Json => print_json(&workers)?,
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!("{:<38} {:<16} {:>6} {:<10} CAPABILITIES", "WORKER ID", "FLEET", "LOAD", "STATUS");
            println!("{}", "-".repeat(90));
            for view in workers {
                let w = &view.worker;
                let status = if !view.alive {
                    "[-] dead"
                } else if w.is_draining {
                    "[~] drain"
                } else if !w.is_approved {
                    "[?] pending"
                } else {
                    "[+] alive"
                };
                println!(
                    "{:<38} {:<16} {:>6} {:<10} {}",
                    w.id,
                    w.fleet,
                    format!("{}/{}", view.load, w.max_concurrency),
                    status,
                    w.capabilities.iter().cloned().collect::<Vec<_>>().join(",")
                );
            }
        }
    }
    Ok(())
}

async fn handle_metrics(client: &DispatchClient, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = client.metrics().await?;
    match output {
        OutputFormat::Json => print_json(&metrics)?,
        OutputFormat::Table => {
            println!(
                "{:<20} {:>7} {:>9} {:>8} {:>9} {:>10} {:>8}",
                "FLEET", "QUEUED", "IN FLIGHT", "WORKERS", "BACKLOG", "P95 (MS)", "DESIRED"
            );
            println!("{}", "-".repeat(80));
            for m in &metrics.fleets {
                println!(
                    "{:<20} {:>7} {:>9} {:>8} {:>9.2} {:>10} {:>8}",
                    m.fleet,
                    m.queue_depth,
                    m.in_flight,
                    m.running_workers,
                    m.backlog_per_instance,
                    or_dash(m.p95_wait_ms),
                    m.desired_capacity
                );
            }
            println!();
            println!(
                "Dispatch entries: {}  Live leases: {}  Workers: {}",
                metrics.dispatcher.dispatch_entries, metrics.dispatcher.live_leases, metrics.dispatcher.workers
            );
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_json);

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Job { client, command } => {
            handle_job(&client.client(), command, &client.output).await?
        }
        Commands::Fleet { client, command } => {
            handle_fleet(&client.client(), command, &client.output).await?
        }
        Commands::Workers { client } => handle_workers(&client.client(), &client.output).await?,
        Commands::Metrics { client } => handle_metrics(&client.client(), &client.output).await?,
    }

    Ok(())
}
