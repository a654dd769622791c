use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use renderq::config::Config;
use renderq::service::Service;
use renderq::shutdown;
use renderq::store::{JobStatus, JobStore};
use renderq::{cache, Result};

#[derive(Parser, Debug)]
#[command(name = "renderq")]
#[command(version)]
#[command(about = "Bounded async job queue for media generation pipelines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the generation service until SIGTERM/SIGINT
    Serve(ServeArgs),

    /// Inspect jobs in the store
    Job {
        /// Path to the SQLite job database
        #[arg(long, default_value = "jobs.db")]
        db_path: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Manual maintenance, outside the reclaimer's schedule
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the SQLite job database
    #[arg(long, default_value = "jobs.db")]
    db_path: PathBuf,

    /// Maximum number of concurrently executing jobs
    #[arg(long, default_value = "2")]
    max_workers: usize,

    /// Per-client steady-state admission rate
    #[arg(long, default_value = "60")]
    requests_per_minute: u32,

    /// Per-client burst capacity (defaults to the per-minute rate)
    #[arg(long)]
    burst_size: Option<u32>,

    /// Directory for the durable cache tier
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Default cache TTL in seconds
    #[arg(long, default_value = "3600")]
    cache_ttl_secs: u64,

    /// Directory for temporary pipeline artifacts
    #[arg(long, default_value = "temp")]
    temp_dir: PathBuf,

    /// Directory for finished result videos
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,

    /// Seconds between reclaimer sweeps
    #[arg(long, default_value = "3600")]
    reclaim_interval_secs: u64,

    /// Days a finished or abandoned job is retained
    #[arg(long, default_value = "7")]
    job_retention_days: u64,

    /// Seconds to wait for active workers during shutdown
    #[arg(long, default_value = "30")]
    shutdown_timeout_secs: u64,

    /// Synthesis command template ({text}, {voice}, {speed}, {output})
    #[arg(long, default_value = "synthesize {text} {voice} {speed} {output}")]
    synthesize_command: String,

    /// Render command template ({audio}, {image}, {output})
    #[arg(long, default_value = "render {audio} {image} {output}")]
    render_command: String,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Show one job by id
    Status {
        job_id: String,
    },
    /// List jobs, most recent first
    List {
        /// Filter by status (pending, processing, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(long, default_value = "100")]
        limit: u32,
    },
}

#[derive(clap::Subcommand, Debug)]
enum AdminCommands {
    /// Delete jobs older than the given number of days
    PurgeJobs {
        #[arg(long, default_value = "jobs.db")]
        db_path: PathBuf,

        #[arg(long, default_value = "7")]
        days: u64,
    },
    /// Remove every durable cache entry
    ClearCache {
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = Config::default()
        .with_db_path(args.db_path)
        .with_max_workers(args.max_workers)
        .with_rate_limit(args.requests_per_minute, args.burst_size)
        .with_cache_dir(args.cache_dir)
        .with_temp_dir(args.temp_dir)
        .with_output_dir(args.output_dir);
    config.cache.default_ttl = Duration::from_secs(args.cache_ttl_secs);
    config.reclaimer.interval = Duration::from_secs(args.reclaim_interval_secs);
    config.reclaimer.job_retention = Duration::from_secs(args.job_retention_days * 24 * 3600);
    config.pipeline.synthesize_command = args.synthesize_command;
    config.pipeline.render_command = args.render_command;

    tracing::info!(
        max_workers = config.pool.max_workers,
        requests_per_minute = config.rate_limit.requests_per_minute,
        db_path = %config.store.db_path.display(),
        "Starting renderq"
    );

    let service = Service::new(config).await?;
    service.start();

    shutdown::wait_for_signal().await?;

    let cancelled = service
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await;
    if cancelled > 0 {
        tracing::info!(cancelled, "Queued jobs cancelled during shutdown");
    }
    Ok(())
}

fn print_job(job: &renderq::store::Job) {
    println!("Job ID:     {}", job.id);
    println!("Status:     {}", job.status);
    println!("Progress:   {:.0}%", job.progress * 100.0);
    println!("Created:    {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("Started:    {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("Completed:  {}", completed.to_rfc3339());
    }
    if let Some(ref path) = job.result_path {
        println!("Result:     {path}");
    }
    if let Some(ref error) = job.error_message {
        println!("Error:");
        for line in error.lines() {
            println!("  {line}");
        }
    }
}

async fn run_job_command(
    db_path: PathBuf,
    output: OutputFormat,
    command: JobCommands,
) -> Result<()> {
    let store = JobStore::new(&db_path).await?;
    match command {
        JobCommands::Status { job_id } => {
            let job = store.get(&job_id).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::List { status, limit } => {
            let status = match status {
                Some(s) => Some(s.parse::<JobStatus>()?),
                None => None,
            };
            let jobs = store.list(status, limit).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<38} {:<12} {:<9} CREATED", "JOB ID", "STATUS", "PROGRESS");
                        println!("{}", "-".repeat(86));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<12} {:<9} {}",
                                job.id,
                                job.status.to_string(),
                                format!("{:.0}%", job.progress * 100.0),
                                job.created_at.to_rfc3339()
                            );
                        }
                        println!();
                        println!("Showing {} jobs", jobs.len());
                    }
                }
            }
        }
    }
    Ok(())
}

async fn run_admin_command(command: AdminCommands) -> Result<()> {
    match command {
        AdminCommands::PurgeJobs { db_path, days } => {
            let store = JobStore::new(&db_path).await?;
            let deleted = store
                .delete_older_than(Duration::from_secs(days * 24 * 3600))
                .await?;
            println!("Deleted {deleted} jobs older than {days} days");
        }
        AdminCommands::ClearCache { cache_dir } => {
            let cache = cache::Cache::new(&renderq::config::CacheConfig {
                dir: cache_dir,
                default_ttl: Duration::from_secs(3600),
            })
            .await?;
            cache.clear().await;
            println!("Cache cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await,
        Commands::Job {
            db_path,
            output,
            command,
        } => run_job_command(db_path, output, command).await,
        Commands::Admin { command } => run_admin_command(command).await,
    }
}
