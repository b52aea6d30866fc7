/*!
 * Skyhaul CLI - Command Line Interface
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{anyhow, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use skyhaul::{
    config::{LogLevel, TransferConfig},
    error::{ProtocolError, TransferError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    recovery::{self, Operation},
    remote::{http::HttpRemote, StartLargeFile},
    DownloadOptions, TransferOrchestrator,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

#[derive(Parser)]
#[command(name = "skyhaul")]
#[command(version, about = "Parallel chunked transfers for cloud object storage", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stderr
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide the progress bar
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an object with parallel range requests
    Download {
        /// Bucket name
        #[arg(long)]
        bucket: String,

        /// Object name
        #[arg(long)]
        name: String,

        /// Output file (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Bytes per range request
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Parallel range requests
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Upload a file, in parts when it is larger than one part
    Upload {
        /// Bucket name
        #[arg(long)]
        bucket: String,

        /// Object name
        #[arg(long)]
        name: String,

        /// File to upload
        #[arg(short, long, value_name = "PATH")]
        input: PathBuf,

        /// Bytes per part
        #[arg(long)]
        part_size: Option<u64>,

        /// Parts uploaded at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Content type (b2/x-auto lets the service guess)
        #[arg(long)]
        content_type: Option<String>,

        /// Custom metadata as key=value (repeatable)
        #[arg(long = "info", value_name = "KEY=VALUE")]
        info: Vec<String>,
    },

    /// Show the recovery action for a failed call
    Classify {
        /// HTTP status returned by the service
        #[arg(long)]
        status: u16,

        /// Operation that failed (e.g. upload_part, authorize)
        #[arg(long)]
        operation: String,

        /// Retry-After seconds sent by the service
        #[arg(long, default_value = "0")]
        retry_after: u64,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TransferError>()
                .map(TransferError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Classify {
        status,
        operation,
        retry_after,
    } = &cli.command
    {
        return classify_command(*status, operation, *retry_after);
    }

    let mut config = match &cli.config {
        Some(path) => TransferConfig::from_file(path)?,
        None => TransferConfig::default(),
    };
    config.apply_env();
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    if cli.log.is_some() {
        config.log_file = cli.log.clone();
    }
    config.verbose |= cli.verbose;
    config.validate()?;

    logging::init_logging(&config)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        match cli.command {
            Commands::Download {
                bucket,
                name,
                output,
                chunk_size,
                concurrency,
            } => {
                if let Some(chunk_size) = chunk_size {
                    config.download.chunk_size = chunk_size;
                }
                if let Some(concurrency) = concurrency {
                    config.download.concurrency = concurrency;
                }
                download_command(&config, &bucket, &name, output, cli.quiet).await
            }
            Commands::Upload {
                bucket,
                name,
                input,
                part_size,
                concurrency,
                content_type,
                info,
            } => {
                if let Some(part_size) = part_size {
                    config.upload.part_size = part_size;
                }
                if let Some(concurrency) = concurrency {
                    config.upload.concurrency = concurrency;
                }
                if let Some(content_type) = content_type {
                    config.upload.content_type = content_type;
                }
                let info = parse_info(&info)?;
                upload_command(&config, &bucket, &name, &input, info, cli.quiet).await
            }
            Commands::Classify { .. } => Ok(()),
        }
    })
}

fn classify_command(status: u16, operation: &str, retry_after: u64) -> anyhow::Result<()> {
    let operation: Operation = operation.parse()?;
    let mut err = ProtocolError::new(operation, status, "classified from the command line");
    if retry_after > 0 {
        err = err.with_retry_after(Duration::from_secs(retry_after));
    }
    let err = TransferError::from(err);

    let action = recovery::classify(&err);
    println!("{}", action);
    let wait = recovery::backoff(&err);
    if !wait.is_zero() {
        println!("wait: {}s", wait.as_secs());
    }
    Ok(())
}

fn parse_info(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("--info expects KEY=VALUE, got {:?}", pair))
        })
        .collect()
}

fn progress_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

async fn download_command(
    config: &TransferConfig,
    bucket: &str,
    name: &str,
    output: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    let remote = Arc::new(HttpRemote::connect(config).await?);
    let object = remote.stat_object(bucket, name).await?;
    let orchestrator = TransferOrchestrator::from_config(config).with_reauthenticator(remote.clone());
    let options: DownloadOptions = config.download.options();

    let bar = progress_bar(object.size, quiet || output.is_none());
    let written = match output {
        Some(path) => {
            let file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?;
            let mut sink = ProgressWriter::new(file, bar.clone());
            orchestrator
                .download(remote.clone(), &object, options, &mut sink)
                .await?
        }
        None => {
            let mut sink = ProgressWriter::new(tokio::io::stdout(), bar.clone());
            orchestrator
                .download(remote.clone(), &object, options, &mut sink)
                .await?
        }
    };
    bar.finish_and_clear();
    tracing::info!(object = %object, bytes = written, "download complete");
    Ok(())
}

async fn upload_command(
    config: &TransferConfig,
    bucket: &str,
    name: &str,
    input: &Path,
    info: HashMap<String, String>,
    quiet: bool,
) -> anyhow::Result<()> {
    let size = tokio::fs::metadata(input)
        .await
        .with_context(|| format!("cannot read {}", input.display()))?
        .len();
    let remote = Arc::new(HttpRemote::connect(config).await?);
    let min_part_size = remote
        .auth_context()
        .map(|session| session.min_part_size)
        .unwrap_or(0);
    let part_size = config.upload.effective_part_size(min_part_size);
    let bucket_id = remote.bucket_id(bucket).await?;

    let bar = progress_bar(size, quiet);
    let file = if size <= part_size {
        // Small enough for one request, so hold it in memory
        let data = Bytes::from(
            tokio::fs::read(input)
                .await
                .with_context(|| format!("cannot read {}", input.display()))?,
        );
        let target = remote.get_upload_url(&bucket_id).await?;
        remote
            .upload_file(&target, name, &config.upload.content_type, &info, data)
            .await?
    } else {
        let orchestrator =
            TransferOrchestrator::from_config(config).with_reauthenticator(remote.clone());
        let params = StartLargeFile {
            bucket_id,
            name: name.to_string(),
            content_type: config.upload.content_type.clone(),
            info,
        };
        orchestrator
            .upload_file(remote.clone(), &params, input, part_size, config.upload.concurrency)
            .await?
    };
    bar.set_position(file.size);
    bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}

/// Counts bytes written into a progress bar
struct ProgressWriter<W> {
    inner: W,
    bar: ProgressBar,
}

impl<W> ProgressWriter<W> {
    fn new(inner: W, bar: ProgressBar) -> Self {
        Self { inner, bar }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.bar.inc(*n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
