mod cache;
mod config;
mod event;
mod host;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStorage, MemoryStorage, Request, SqliteStorage};
use event::{Event, EventOutcome};
use host::{Host, WorkerState};
use net::HttpNetwork;
use worker::{ActivateReport, InstallReport, OfflineWorker};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline caching layer for web app shells, data files and CDN assets")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Path to the cache database (default: $XDG_DATA_HOME/shellcache/cache.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Keep stores in memory only
  #[arg(long, global = true, conflicts_with = "db")]
  ephemeral: bool,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Also write logs to this file
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the current version: seed the app shell, then activate
  Install,
  /// Activate the current version: delete stores of other versions
  Activate,
  /// Handle one request the way the worker would
  Fetch {
    /// Absolute URL to request
    url: String,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Extra request header, `Name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Print response headers
    #[arg(short, long)]
    include: bool,
  },
  /// List stores with entry counts
  Stores,
  /// Show which strategy would handle a URL
  Classify {
    url: String,
  },
}

/// Initialize the tracing subscriber. Returns the file writer guard, if any,
/// which must live until exit.
fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  // RUST_LOG wins over -v
  let default_level = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.verbose, args.log_file.as_deref())?;

  let config = config::Config::load(args.config.as_deref())?;

  if args.ephemeral {
    run(args.command, &config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = match &args.db {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    run(args.command, &config, Arc::new(storage)).await
  }
}

async fn run<S: CacheStorage + 'static>(
  command: Command,
  config: &config::Config,
  storage: Arc<S>,
) -> Result<()> {
  let network = Arc::new(HttpNetwork::new(config.timeout())?);
  let worker = OfflineWorker::new(Arc::clone(&storage), network, config.worker_settings()?);

  match command {
    Command::Install => {
      let mut host = Host::register(worker);
      host.dispatch(Event::Install).await?;
      println!("installed ({:?})", host.state());
      if let Some(report) = host.worker().take_install_report() {
        print_install_report(&report);
      }
      if let Some(report) = host.worker().take_activate_report() {
        print_activate_report(&report);
      }
    }
    Command::Activate => {
      let mut host = Host::resume(worker, WorkerState::Installed);
      host.dispatch(Event::Activate).await?;
      println!(
        "activated ({:?}, clients claimed: {})",
        host.state(),
        host.clients().is_claimed()
      );
      if let Some(report) = host.worker().take_activate_report() {
        print_activate_report(&report);
      }
    }
    Command::Fetch {
      url,
      method,
      headers,
      include,
    } => {
      let mut request = Request::parse(&method, &url)?;
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      let installed = worker.is_installed()?;
      let mut host = Host::attach(worker, installed).await?;
      if let Some(report) = host.worker().take_install_report() {
        eprintln!(
          "installed {}: {} cached, {} failed",
          host.worker().names().static_store,
          report.cached.len(),
          report.failed.len()
        );
      }
      let outcome = host.dispatch(Event::Fetch(request)).await;
      host.worker().settle().await;

      let result = match outcome? {
        EventOutcome::Response(result) => result,
        EventOutcome::State(state) => return Err(eyre!("Unexpected worker state {:?}", state)),
      };

      let response = &result.data;
      match result.cached_at {
        Some(cached_at) => eprintln!(
          "{} {} ({}, stored {})",
          response.status,
          response.status_text,
          result.source,
          cached_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => eprintln!(
          "{} {} ({})",
          response.status, response.status_text, result.source
        ),
      }
      let mut stdout = std::io::stdout().lock();
      if include {
        for (name, value) in &response.headers {
          writeln!(stdout, "{}: {}", name, value)?;
        }
        writeln!(stdout)?;
      }
      stdout.write_all(&response.body)?;
      stdout.flush()?;
    }
    Command::Stores => print_stores(storage.as_ref())?,
    Command::Classify { url } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let names = worker.names();
      let class = worker.classify(&url);
      let store = match class {
        worker::RequestClass::DynamicData => &names.data_store,
        _ => &names.static_store,
      };
      println!("{} -> {} (store {})", url, class, store);
    }
  }

  Ok(())
}

fn print_install_report(report: &InstallReport) {
  println!(
    "app shell: {} cached, {} failed",
    report.cached.len(),
    report.failed.len()
  );
  for (url, error) in &report.failed {
    println!("  failed {}: {}", url, error);
  }
}

fn print_activate_report(report: &ActivateReport) {
  if report.removed.is_empty() && report.failed.is_empty() {
    println!("no old stores to remove");
  }
  for name in &report.removed {
    println!("removed {}", name);
  }
  for (name, error) in &report.failed {
    println!("failed to remove {}: {}", name, error);
  }
}

fn print_stores(storage: &dyn CacheStorage) -> Result<()> {
  let summaries = storage.summaries()?;
  if summaries.is_empty() {
    println!("no stores");
  }
  for summary in summaries {
    println!(
      "{:<32} {:>6} entries  created {}",
      summary.name,
      summary.entries,
      summary.created_at.format("%Y-%m-%d %H:%M:%S")
    );
  }
  Ok(())
}
