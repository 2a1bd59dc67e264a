use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use foreman::agent::HandlerRegistry;
use foreman::config::{AgentConfig, ManagerConfig};
use foreman::node::Node;
use foreman::scheduler::{JobHistory, JobSpec};
use foreman::server::ManagerServer;
use foreman::shutdown::cancel_on_signal;
use foreman::transport::HttpManagerClient;

#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version)]
#[command(about = "A distributed job manager with heartbeating worker nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the manager
    Manager(ManagerArgs),

    /// Run a worker node
    Node(NodeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// List the nodes known to the manager
    Nodes {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Process Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, default_value = "9000")]
    port: u16,

    /// Seconds without a heartbeat before a node is declared dead
    #[arg(long, default_value = "30")]
    dead_threshold_secs: u64,

    /// Seconds between liveness checks
    #[arg(long, default_value = "5")]
    liveness_interval_secs: u64,

    /// Seconds between periodic dispatch passes
    #[arg(long, default_value = "5")]
    dispatch_interval_secs: u64,

    /// Timeout for calls to nodes, in seconds
    #[arg(long, default_value = "10")]
    request_timeout_secs: u64,

    /// Maximum number of jobs waiting or running
    #[arg(long, default_value = "10000")]
    max_jobs: usize,
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, default_value = "9050")]
    port: u16,

    /// Manager base URL
    #[arg(long, env = "FOREMAN_MANAGER_URL", default_value = "http://127.0.0.1:9000/")]
    manager: String,

    /// URL the manager should use to reach this node (defaults to the bind address)
    #[arg(long)]
    public_url: Option<String>,

    /// Seconds between heartbeats
    #[arg(long, default_value = "5")]
    heartbeat_interval_secs: u64,

    /// Timeout for calls to the manager, in seconds
    #[arg(long, default_value = "10")]
    request_timeout_secs: u64,
}

// =============================================================================
// Client Arguments (shared by job and nodes commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Manager base URL
    #[arg(long, short = 'a', env = "FOREMAN_MANAGER_URL", default_value = "http://127.0.0.1:9000/")]
    addr: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

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
    /// Submit a new job
    Submit {
        /// Job payload, interpreted by the handler for --type
        payload: String,

        /// Job name
        #[arg(long, short = 'n', default_value = "job")]
        name: String,

        /// Payload type tag (echo, sleep, fail, shell)
        #[arg(long = "type", short = 't', default_value = "shell")]
        payload_type: String,

        /// Submitting user
        #[arg(long, short = 'u', env = "USER", default_value = "foreman")]
        user: String,
    },
    /// Show the history row of a job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Cancel a job
    Cancel {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Show the detail log of a job
    Details {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List every job the manager has seen
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: Uuid,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn client(args: &ClientArgs) -> Result<HttpManagerClient, Box<dyn std::error::Error>> {
    Ok(HttpManagerClient::new(
        &args.addr,
        Duration::from_secs(args.timeout_secs),
    )?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn job_state(job: &JobHistory) -> &str {
    match (&job.result, job.started) {
        (Some(result), _) => result,
        (None, Some(_)) => "Started",
        (None, None) => "Queued",
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max - 3).collect::<String>())
    } else {
        text.to_string()
    }
}

// =============================================================================
// Process Implementations
// =============================================================================

async fn run_manager(args: ManagerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = ManagerConfig::new(SocketAddr::new(args.bind, args.port))
        .with_dead_threshold(Duration::from_secs(args.dead_threshold_secs))
        .with_liveness_interval(Duration::from_secs(args.liveness_interval_secs))
        .with_dispatch_interval(Duration::from_secs(args.dispatch_interval_secs))
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_max_jobs(args.max_jobs);

    tracing::info!(
        listen_addr = %config.listen_addr,
        dead_threshold_secs = args.dead_threshold_secs,
        max_jobs = config.max_jobs,
        "Starting foreman manager"
    );

    let token = CancellationToken::new();
    cancel_on_signal(token.clone())?;
    ManagerServer::new(config, token)?.run().await?;
    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr = SocketAddr::new(args.bind, args.port);
    let public_url = match args.public_url {
        Some(url) => url,
        None if args.bind.is_unspecified() => format!("http://127.0.0.1:{}/", args.port),
        None => format!("http://{}/", listen_addr),
    };
    let config = AgentConfig::new(listen_addr, args.manager)
        .with_public_url(public_url)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval_secs))
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs));

    let handlers = HandlerRegistry::with_builtins();
    tracing::info!(
        listen_addr = %config.listen_addr,
        public_url = %config.public_url,
        manager = %config.manager_url,
        handlers = ?handlers.types(),
        "Starting foreman node"
    );

    let token = CancellationToken::new();
    cancel_on_signal(token.clone())?;
    Node::new(config, handlers, token)?.run().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &HttpManagerClient,
    spec: JobSpec,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.submit(&spec).await?;
    match output_format {
        OutputFormat::Json => print_json(&JobSubmitOutput {
            job_id: response.job_id,
        })?,
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &HttpManagerClient,
    job_id: Uuid,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(job) = client.history(job_id).await? else {
        return Err(format!("Job {} not found", job_id).into());
    };
    match output_format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job ID:     {}", job.id);
            println!("Name:       {}", job.name);
            println!("Created By: {}", job.created_by);
            println!("State:      {}", job_state(&job));
            println!("Created:    {}", job.created);
            if let Some(started) = job.started {
                println!("Started:    {}", started);
            }
            if let Some(ended) = job.ended {
                println!("Ended:      {}", ended);
            }
            if let Some(node) = &job.sent_to {
                println!("Sent To:    {}", node);
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &HttpManagerClient,
    job_id: Uuid,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.cancel(job_id).await?;
    match output_format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => println!("Job {}: {:?}", job_id, response.outcome),
    }
    Ok(())
}

async fn handle_job_details(
    client: &HttpManagerClient,
    job_id: Uuid,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let details = client.details(job_id).await?;
    match output_format {
        OutputFormat::Json => print_json(&details)?,
        OutputFormat::Table => {
            if details.is_empty() {
                println!("No details for job {}.", job_id);
            }
            for detail in details {
                println!("{}  {}", detail.created.format("%Y-%m-%d %H:%M:%S%.3f"), detail.text);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &HttpManagerClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = client.history_list().await?;
    match output_format {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<12} {:<20} NAME", "JOB ID", "STATE", "USER");
            println!("{}", "-".repeat(90));
            for job in &jobs {
                println!(
                    "{:<38} {:<12} {:<20} {}",
                    job.id,
                    truncate(job_state(job), 12),
                    truncate(&job.created_by, 20),
                    job.name
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_nodes(
    client: &HttpManagerClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = client.nodes().await?;
    match output_format {
        OutputFormat::Json => print_json(&nodes)?,
        OutputFormat::Table => {
            println!("{:<38} {:<30} {:<8} LAST HEARTBEAT", "ID", "URL", "STATUS");
            println!("{}", "-".repeat(100));
            for node in nodes {
                let status_icon = if node.alive { "[+]" } else { "[-]" };
                println!(
                    "{:<38} {:<30} {:<8} {}",
                    node.id,
                    node.url,
                    status_icon,
                    node.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Manager(manager_args) => {
            run_manager(manager_args).await?;
        }
        Commands::Node(node_args) => {
            run_node(node_args).await?;
        }
        Commands::Job { client: args, command } => {
            let client = client(&args)?;
            match command {
                JobCommands::Submit {
                    payload,
                    name,
                    payload_type,
                    user,
                } => {
                    let spec = JobSpec::new(name, payload, payload_type, user);
                    handle_job_submit(&client, spec, &args.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&client, job_id, &args.output).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&client, job_id, &args.output).await?;
                }
                JobCommands::Details { job_id } => {
                    handle_job_details(&client, job_id, &args.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&client, &args.output).await?;
                }
            }
        }
        Commands::Nodes { client: args } => {
            let client = client(&args)?;
            handle_nodes(&client, &args.output).await?;
        }
    }

    Ok(())
}
