//! gosp-dispatch
//!
//! Command-line front end to the page dispatcher. Configuration comes from
//! `--config` or the `GOSP_CONFIG` env var.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gosp_dispatch::backend::ProcessToolchain;
use gosp_dispatch::config::{Config, Timeouts};
use gosp_dispatch::dispatch::{self, Dispatcher, Handled, HostRequest};
use gosp_dispatch::lock::GlobalLock;

#[derive(Parser, Debug)]
#[command(name = "gosp-dispatch")]
#[command(about = "Serve pages through lazily compiled, lazily launched workers")]
struct Args {
    /// JSON configuration file (overrides GOSP_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the work directory and the global lock file
    Init,

    /// Serve one request for a page and write the body to stdout
    Request {
        /// Page source file
        page: PathBuf,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Query string, without the leading '?'
        #[arg(long, default_value = "")]
        query: String,

        /// Request header as NAME:VALUE (repeatable)
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// File holding the request body
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Print the status line and headers before the body
        #[arg(long)]
        include: bool,
    },

    /// Stop a page's worker and remove its plugin
    Kill {
        /// Page source file
        page: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Log to stderr; stdout carries the response body
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(work_dir = %config.server.work_dir.display(), "Loaded configuration");

    match args.command {
        Command::Init => {
            dispatch::initialize(&config.server)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Request {
            page,
            method,
            query,
            headers,
            body_file,
            include,
        } => {
            let body = match body_file {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => Vec::new(),
            };
            let req = host_request(&page, method, query, &headers, body)?;
            let dispatcher = dispatcher(config)?;

            match dispatcher.handle(&req).await {
                Handled::Declined => {
                    info!("Request declined");
                    Ok(ExitCode::SUCCESS)
                }
                Handled::Served(outcome) => {
                    let mut stdout = std::io::stdout().lock();
                    if include {
                        writeln!(stdout, "Status: {}", outcome.status)?;
                        if let Some(content_type) = &outcome.content_type {
                            writeln!(stdout, "Content-Type: {content_type}")?;
                        }
                        for (name, value) in &outcome.headers {
                            writeln!(stdout, "{name}: {value}")?;
                        }
                        writeln!(stdout)?;
                    }
                    stdout.write_all(&outcome.body)?;
                    stdout.flush()?;

                    Ok(if outcome.is_success() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }
            }
        }
        Command::Kill { page } => {
            let page = canonical(&page)?;
            dispatcher(config)?.kill(&page).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn dispatcher(config: Config) -> Result<Dispatcher<ProcessToolchain>> {
    let lock_path = config.server.lock_path()?;
    let lock = GlobalLock::reconnect(&lock_path)
        .context("Global lock is missing; run `gosp-dispatch init` first")?;
    let toolchain = ProcessToolchain::new(config.server.clone());
    Ok(Dispatcher::new(config, toolchain, lock, Timeouts::default()))
}

fn canonical(page: &Path) -> Result<PathBuf> {
    page.canonicalize()
        .with_context(|| format!("Failed to resolve page {}", page.display()))
}

fn host_request(
    page: &Path,
    method: String,
    query: String,
    headers: &[String],
    body: Vec<u8>,
) -> Result<HostRequest> {
    let headers = headers
        .iter()
        .map(|h| match h.split_once(':') {
            Some((name, value)) => Ok((name.trim().to_string(), value.trim().to_string())),
            None => bail!("Header {h:?} is not NAME:VALUE"),
        })
        .collect::<Result<Vec<_>>>()?;

    // A page that does not exist is passed through as given so the
    // dispatcher can answer 404.
    let filename = page.canonicalize().unwrap_or_else(|_| page.to_path_buf());
    let uri = format!("/{}", filename.file_name().unwrap_or_default().to_string_lossy());
    let url = if query.is_empty() {
        uri.clone()
    } else {
        format!("{uri}?{query}")
    };

    Ok(HostRequest {
        scheme: "http".into(),
        local_hostname: "localhost".into(),
        port: 80,
        request_line: format!("{method} {url} HTTP/1.1"),
        header_only: method.eq_ignore_ascii_case("HEAD"),
        uri,
        url,
        method,
        query_args: query,
        request_time: dispatch::now_millis(),
        remote_hostname: "localhost".into(),
        remote_ip: "127.0.0.1".into(),
        filename,
        headers,
        environment: std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect(),
        body,
        ..HostRequest::default()
    })
}
