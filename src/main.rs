use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use storefront_offline::cache::CacheStorage;
use storefront_offline::event::{Event, EventHandler};
use storefront_offline::worker::EventOutcome;
use storefront_offline::{logging, Config, ServiceWorker, WorkerEvent};

#[derive(Parser, Debug)]
#[command(name = "storefront-offline")]
#[command(about = "Offline asset and data cache for the storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database path (overrides the config file)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the versioned store from the manifest and take over
  Install {
    /// Stop after populating; don't purge old stores
    #[arg(long)]
    no_activate: bool,
  },
  /// Purge stores from other versions
  Activate,
  /// Serve one request through the cache
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List stores and their entry counts
  Stores,
  /// Deferred order queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay queued orders
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Render the notification for a push payload
  Push { payload: String },
  /// Refresh every data file in the manifest
  Refresh,
  /// Refresh data and replay orders on a timer until Ctrl-C
  Watch {
    /// Seconds between ticks (default: the periodic sync interval)
    #[arg(long)]
    interval: Option<u64>,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue a JSON order read from a file, or stdin with `-`
  Add { file: PathBuf },
  /// Show queued orders
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(db) = args.db {
    Config {
      database: Some(db),
      ..config
    }
  } else {
    config
  };

  let log_dir = if args.log_stderr {
    None
  } else {
    config.database_path()?.parent().map(|p| p.join("logs"))
  };
  let _guard = logging::init(log_dir.as_deref())?;

  let mut worker = ServiceWorker::open(config)?;
  run(&mut worker, args.command).await
}

async fn run(worker: &mut ServiceWorker, command: Command) -> Result<()> {
  match command {
    Command::Install { no_activate } => {
      worker.handle(WorkerEvent::Install).await?;
      println!("installed {}", worker.store_name());
      if !no_activate {
        activate(worker).await?;
      }
    }
    Command::Activate => {
      if !worker.restore()? {
        return Err(eyre!(
          "{} is not installed. Run `install` first.",
          worker.store_name()
        ));
      }
      activate(worker).await?;
    }
    Command::Fetch {
      url,
      method,
      output,
    } => {
      resume(worker).await?;
      let request = worker.request(&method, &url)?;
      match worker.handle(WorkerEvent::Fetch(request)).await? {
        EventOutcome::Response(Some(result)) => {
          eprintln!(
            "{} {:?} ({} bytes)",
            result.data.status,
            result.source,
            result.data.body.len()
          );
          match output {
            Some(path) => std::fs::write(&path, &result.data.body)
              .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
            None => println!("{}", result.data.text()),
          }
        }
        _ => return Err(eyre!("{} is unavailable offline", url)),
      }
    }
    Command::Stores => {
      let storage = worker.storage();
      for name in storage.store_names()? {
        let marker = if name == worker.store_name() { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.keys(&name)?.len());
      }
    }
    Command::Queue(QueueCommand::Add { file }) => {
      let contents = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
          .read_to_string(&mut buf)
          .map_err(|e| eyre!("Failed to read stdin: {}", e))?;
        buf
      } else {
        std::fs::read_to_string(&file)
          .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?
      };
      let payload: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| eyre!("Order is not valid JSON: {}", e))?;
      let key = worker.queue().enqueue(&payload)?;
      println!("queued {}", key);
    }
    Command::Queue(QueueCommand::List) => {
      for order in worker.queue().pending()? {
        println!(
          "{}\t{}\t{} attempts\t{} bytes",
          order.id,
          order.queued_at.to_rfc3339(),
          order.attempts,
          order.body.len()
        );
      }
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| worker.config().delivery.sync_tag.clone());
      if let EventOutcome::Synced(report) = worker.handle(WorkerEvent::Sync(tag)).await? {
        print_json(&report)?;
      }
    }
    Command::Push { payload } => {
      if let EventOutcome::Notification(notification) = worker
        .handle(WorkerEvent::Push(payload.into_bytes()))
        .await?
      {
        print_json(&notification)?;
      }
    }
    Command::Refresh => {
      // Explicit request: runs whether or not periodic sync is registered
      if !resume(worker).await? {
        return Err(eyre!(
          "{} is not installed. Run `install` first.",
          worker.store_name()
        ));
      }
      let tag = worker.config().periodic_sync.tag.clone();
      print_json(&worker.handle_periodic_sync(&tag).await?)?;
    }
    Command::Watch { interval } => watch(worker, interval).await?,
  }

  Ok(())
}

async fn activate(worker: &mut ServiceWorker) -> Result<()> {
  if let EventOutcome::Activated { deleted } = worker.handle(WorkerEvent::Activate).await? {
    for name in deleted {
      println!("deleted {}", name);
    }
  }
  println!("activated {}", worker.store_name());
  Ok(())
}

/// Activate a version installed by an earlier run, so responses are written back.
///
/// Returns false when the current version was never installed.
async fn resume(worker: &mut ServiceWorker) -> Result<bool> {
  if !worker.restore()? {
    return Ok(false);
  }
  worker.handle(WorkerEvent::Activate).await?;
  Ok(true)
}

async fn watch(worker: &mut ServiceWorker, interval: Option<u64>) -> Result<()> {
  if !resume(worker).await? {
    warn!(store = worker.store_name(), "not installed; responses won't be stored");
  }

  let tick_rate = match (interval, worker.periodic_registration()) {
    (Some(secs), _) => Duration::from_secs(secs),
    (None, Some(registration)) => registration.min_interval,
    (None, None) => {
      return Err(eyre!(
        "Periodic sync is not available; pass --interval to refresh on a timer"
      ))
    }
  };

  let data_tag = worker.config().periodic_sync.tag.clone();
  let sync_tag = worker.config().delivery.sync_tag.clone();
  info!(?tick_rate, "watching");

  let mut events = EventHandler::new(tick_rate);
  while let Some(event) = events.next().await {
    match event {
      Event::Tick => {
        // The timer stands in for the platform scheduler, so refresh directly
        worker.handle_periodic_sync(&data_tag).await?;
        worker.handle(WorkerEvent::Sync(sync_tag.clone())).await?;
      }
      Event::Shutdown => break,
    }
  }

  info!("stopped watching");
  Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", json);
  Ok(())
}
