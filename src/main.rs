use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use casecache::clock::SystemClock;
use casecache::config::Config;
use casecache::http::RequestOptions;
use casecache::{
  CacheEntryStore, ConsistencyCoordinator, CrossContextNotifier, MutationIntent,
  RevalidationClient,
};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "casecache")]
#[command(about = "Inspect and drive the local case data cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/casecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to this file
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch paths through the cache, concurrently
  Fetch {
    #[arg(required = true)]
    paths: Vec<String>,
    /// Ask the server even when the cached copy is fresh
    #[arg(long)]
    revalidate: bool,
  },
  /// Print the cached entry for a key
  Show { key: String },
  /// Summarize both cache tiers
  Stats,
  /// Remove one cached entry
  Delete { key: String },
  /// Remove every cached entry in the namespace
  Clear,
  /// Show the cache version and peer update flag
  Status,
  /// Apply a record change to a cached collection and notify peers
  Apply {
    key: String,
    /// add, update, delete, or anything else to invalidate everything
    operation: String,
    /// JSON object, e.g. '{"uniqueKey": "A", "patch": {"status": "closed"}}'
    #[arg(default_value = "{}")]
    details: String,
  },
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). The returned guard flushes
/// the log file and must live until exit.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let durable = config.open_storage()?;
  let store = Arc::new(config.build_store(durable.clone(), Arc::new(SystemClock)));
  let notifier = Arc::new(config.build_notifier(&store));
  info!(backend = durable.name(), namespace = store.namespace(), "Cache opened");

  match args.command {
    Command::Fetch { paths, revalidate } => fetch(&config, store, notifier, &paths, revalidate).await,
    Command::Show { key } => show(&store, &key),
    Command::Stats => {
      stats(&store);
      Ok(())
    }
    Command::Delete { key } => {
      store.delete(&key);
      println!("Deleted {}", key);
      Ok(())
    }
    Command::Clear => {
      store.clear();
      println!("Cleared namespace {}", store.namespace());
      Ok(())
    }
    Command::Status => {
      status(&store, &notifier);
      Ok(())
    }
    Command::Apply {
      key,
      operation,
      details,
    } => apply(&config, store, notifier, &key, &operation, &details).await,
  }
}

async fn fetch(
  config: &Config,
  store: Arc<CacheEntryStore>,
  notifier: Arc<CrossContextNotifier>,
  paths: &[String],
  revalidate: bool,
) -> Result<()> {
  let client = RevalidationClient::new(config.transport()?, store)
    .with_routes(config.key_routes())
    .with_compressed_field(config.cache.compressed_field.clone())
    .with_notifier(notifier);

  let results = join_all(paths.iter().map(|path| {
    let client = &client;
    async move {
      let result = if revalidate {
        client.request(path, RequestOptions::get()).await
      } else {
        client.fetch(path, RequestOptions::get()).await
      };
      (path, result)
    }
  }))
  .await;

  let mut failures = 0;
  for (path, result) in results {
    let key = client.cache_key(path);
    match result {
      Ok(r) => {
        let source = if r.from_cache { "cache" } else { "network" };
        print!("{} -> {} [{}]", path, key, source);
        if let Some(token) = &r.freshness_token {
          print!(" etag={}", token);
        }
        if let Some(message) = &r.error_message {
          print!(" (offline: {})", message);
        }
        println!();
      }
      Err(e) => {
        failures += 1;
        eprintln!("{} -> {} failed: {}", path, key, e);
      }
    }
  }

  if failures > 0 {
    return Err(eyre!("{} of {} requests failed", failures, paths.len()));
  }
  Ok(())
}

fn show(store: &CacheEntryStore, key: &str) -> Result<()> {
  let entry = store
    .entry(key)
    .ok_or_else(|| eyre!("No cached entry for {}", key))?;
  let state = if store.is_fresh(key) { "fresh" } else { "stale" };
  println!("# {} ({}, version {})", key, state, entry.version);
  println!("{}", serde_json::to_string_pretty(&entry.data)?);
  Ok(())
}

fn stats(store: &CacheEntryStore) {
  let stats = store.stats();
  println!("namespace:       {}", store.namespace());
  println!("memory entries:  {}", stats.memory_entries);
  println!(
    "durable entries: {} ({} bytes)",
    stats.durable_entries, stats.total_bytes
  );
  if stats.entries.is_empty() {
    return;
  }

  println!();
  println!("{:<20} {:<16} {:>8}  FLAGS", "KEY", "VERSION", "AGE");
  for entry in &stats.entries {
    let mut flags = Vec::new();
    if entry.stale {
      flags.push("stale");
    }
    if entry.compressed {
      flags.push("compressed");
    }
    println!(
      "{:<20} {:<16} {:>7}s  {}",
      entry.key,
      entry.version,
      entry.age.num_seconds(),
      flags.join(",")
    );
  }
}

fn status(store: &CacheEntryStore, notifier: &CrossContextNotifier) {
  match store.cache_version() {
    Some(version) => println!("cache version: {}", version),
    None => println!("cache version: none"),
  }
  match notifier.peer_update() {
    Some(at) => println!("peer update:   {}", at.to_rfc3339()),
    None => println!("peer update:   none"),
  }
  println!("recent change: {}", notifier.is_recently_notified());
}

async fn apply(
  config: &Config,
  store: Arc<CacheEntryStore>,
  notifier: Arc<CrossContextNotifier>,
  key: &str,
  operation: &str,
  details: &str,
) -> Result<()> {
  let details: Map<String, Value> = serde_json::from_str(details)
    .map_err(|e| eyre!("Details must be a JSON object: {}", e))?;
  let intent = MutationIntent::from_notification(operation, &details);

  let coordinator =
    ConsistencyCoordinator::new(store, notifier.clone()).with_schema(config.records.clone());
  if coordinator.apply_intent(key, &intent) {
    println!("Applied {} to {}", intent.operation(), key);
    info!(ttl_secs = notifier.flag_ttl().as_secs(), "Holding update flag for peers");
    notifier.notify_and_wait(&intent).await;
  } else {
    println!("Not applied to {}, full reload required", key);
  }
  Ok(())
}
