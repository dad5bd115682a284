//! cmdhost CLI - Command line interface for the command runner

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use cmdhost_core::protocol::{EncodedOutputFile, RunCommandRequest, WireInputFile};
use cmdhost_core::{ExecutionConfig, ExecutionRequest, PoolConfig, WorkerPool};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_URL: &str = "http://127.0.0.1:8000";

#[derive(Parser)]
#[command(name = "cmdhost")]
#[command(author, version, about = "Run commands in throwaway workspaces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a command through a running daemon
    Exec {
        /// Daemon URL (defaults to CMDHOST_URL env var or http://127.0.0.1:8000)
        #[arg(short, long)]
        url: Option<String>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Run a command directly (without daemon)
    Run {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Get daemon health
    Health {
        /// Daemon URL (defaults to CMDHOST_URL env var or http://127.0.0.1:8000)
        #[arg(short, long)]
        url: Option<String>,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Local file to upload; stored under the same relative path
    #[arg(short, long = "input")]
    inputs: Vec<PathBuf>,

    /// Relative path to bring back after the command finishes
    #[arg(short, long = "output")]
    outputs: Vec<String>,

    /// Timeout in seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Working directory inside the workspace
    #[arg(short, long)]
    workdir: Option<String>,

    /// Where returned output files are written
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    argv: Vec<String>,
}

impl JobArgs {
    fn read_inputs(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.inputs
            .iter()
            .map(|path| {
                let content =
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                let relative = path.to_string_lossy().trim_start_matches("./").to_string();
                Ok((relative, content))
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cmdhost=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Exec { url, job } => exec(&daemon_url(url), &job).await,
        Commands::Run { job } => run_local(&job).await,
        Commands::Health { url } => health(&daemon_url(url)).await,
    }
}

fn daemon_url(url: Option<String>) -> String {
    url.or_else(|| std::env::var("CMDHOST_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

async fn exec(url: &str, job: &JobArgs) -> Result<()> {
    let body = RunCommandRequest {
        command: job.argv.clone(),
        input_files: job
            .read_inputs()?
            .iter()
            .map(|(path, content)| WireInputFile::encode(path.clone(), content))
            .collect(),
        output_files: job.outputs.clone(),
        timeout_secs: job.timeout,
        working_directory: job.workdir.clone(),
    };

    tracing::debug!(url, command = %job.argv.join(" "), "submitting to daemon");
    let response = reqwest::Client::new()
        .post(format!("{url}/run-command"))
        .header(reqwest::header::ACCEPT, "application/json")
        .json(&body)
        .send()
        .await
        .with_context(|| format!("connecting to {url}"))?;

    let status = response.status();
    let mut document: serde_json::Value = response.json().await.context("decoding response")?;
    if !status.is_success() {
        bail!("daemon returned {status}: {document}");
    }

    let files: Vec<EncodedOutputFile> =
        serde_json::from_value(document["output_files"].take()).unwrap_or_default();
    for file in &files {
        write_output(&job.out_dir, &file.relative_path, &file.decode()?)?;
    }
    document["output_files"] = files.iter().map(|f| f.relative_path.clone()).collect();

    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

async fn run_local(job: &JobArgs) -> Result<()> {
    let mut request = ExecutionRequest::new(job.argv.clone());
    for (path, content) in job.read_inputs()? {
        request = request.input_file(path, content);
    }
    for path in &job.outputs {
        request = request.output_file(path.clone());
    }
    if let Some(secs) = job.timeout {
        request = request.timeout(Duration::try_from_secs_f64(secs)?);
    }
    if let Some(dir) = &job.workdir {
        request = request.working_subdirectory(dir.clone());
    }

    let pool = WorkerPool::new(
        PoolConfig {
            num_workers: 1,
            max_queue_depth: None,
        },
        ExecutionConfig::default(),
    );
    let execution = pool.submit(request).await?;
    tracing::debug!(status = %execution.result.status, "local run finished");

    for file in &execution.result.output_files {
        let content = std::fs::read(&file.path)
            .with_context(|| format!("reading output {}", file.relative_path))?;
        write_output(&job.out_dir, &file.relative_path, &content)?;
    }
    println!("{}", serde_json::to_string_pretty(&execution.result)?);

    Ok(())
}

async fn health(url: &str) -> Result<()> {
    let health: serde_json::Value = reqwest::get(format!("{url}/health"))
        .await
        .with_context(|| format!("connecting to {url}"))?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}

fn write_output(out_dir: &Path, relative_path: &str, content: &[u8]) -> Result<()> {
    let relative = cmdhost_core::workspace::normalize(relative_path)?;
    let target = out_dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, content).with_context(|| format!("writing {}", target.display()))?;
    eprintln!("wrote {}", target.display());
    Ok(())
}
