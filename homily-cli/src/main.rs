mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Commands};
use homily_core::{
    Connectivity, DownloadManager, DownloadQueue, DownloaderConfig, FileStore, ItemStatus, ManualConnectivity,
    NetworkMonitor, QueueConfig, QueueEvent, QueueHandle, QueueStore, SermonMessage,
    SharedSettings, UserSettings, format_bytes,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const QUEUE_CONFIG_FILE: &str = "queue.json";

/// 数据目录下的各个位置
struct Paths {
    state: PathBuf,
    downloads: PathBuf,
    queue_config: PathBuf,
}

impl Paths {
    fn new(data_dir: Option<PathBuf>) -> Self {
        let root = data_dir.unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("homily")
        });
        Self {
            state: root.join("state"),
            downloads: root.join("downloads"),
            queue_config: root.join(QUEUE_CONFIG_FILE),
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let paths = Paths::new(args.data_dir);
    debug!(state = %paths.state.display(), downloads = %paths.downloads.display(), "data directories");
    let store = Arc::new(FileStore::open(&paths.state).await?);

    match args.command {
        Commands::Fetch {
            manifest,
            messages,
            network,
            wifi_only,
            storage_limit,
        } => {
            let mut settings = UserSettings::load(&*store).await?;
            if let Some(wifi_only) = wifi_only {
                settings.wifi_only = wifi_only;
            }
            if let Some(limit) = storage_limit {
                settings.storage_limit = Some(limit.to_bytes());
            }
            let sermons = collect_messages(manifest.as_deref(), messages).await?;
            fetch(&paths, store, settings, network.into(), sermons).await
        }
        Commands::List { search } => list(&paths, store, search.as_deref()).await,
        Commands::Remove { id } => {
            let manager = new_manager(&paths, store)?;
            if manager.is_downloaded(&id).await? {
                manager.delete_download(&id).await?;
                println!("Removed {id}");
            } else {
                println!("{id} is not downloaded");
            }
            Ok(())
        }
        Commands::Usage => {
            let settings = UserSettings::load(&*store).await?;
            let manager = new_manager(&paths, store)?;
            let total = manager.get_total_downloads_size().await?;
            match settings.storage_limit {
                Some(limit) => println!("{} of {} used", format_bytes(total), format_bytes(limit)),
                None => println!("{} used", format_bytes(total)),
            }
            Ok(())
        }
        Commands::Free { target } => {
            let manager = new_manager(&paths, store)?;
            let deleted = manager.free_up_space(target.to_bytes()).await?;
            let total = manager.get_total_downloads_size().await?;
            println!("Deleted {deleted} download(s), {} now used", format_bytes(total));
            Ok(())
        }
        Commands::Settings {
            wifi_only,
            storage_limit,
            no_storage_limit,
        } => {
            let mut settings = UserSettings::load(&*store).await?;
            let changed = wifi_only.is_some() || storage_limit.is_some() || no_storage_limit;
            if let Some(wifi_only) = wifi_only {
                settings.wifi_only = wifi_only;
            }
            if let Some(limit) = storage_limit {
                settings.storage_limit = Some(limit.to_bytes());
            }
            if no_storage_limit {
                settings.storage_limit = None;
            }
            if changed {
                settings.save(&*store).await?;
            }
            println!("wifi_only: {}", settings.wifi_only);
            match settings.storage_limit {
                Some(limit) => println!("storage_limit: {}", format_bytes(limit)),
                None => println!("storage_limit: none"),
            }
            Ok(())
        }
    }
}

fn new_manager(paths: &Paths, store: Arc<FileStore>) -> Result<DownloadManager> {
    let config = DownloaderConfig::new(&paths.downloads);
    config.validate()?;
    Ok(DownloadManager::new(config, store)?)
}

/// 数据目录中的 `queue.json` 可覆盖队列参数
async fn load_queue_config(path: &Path) -> Result<QueueConfig> {
    if !path.exists() {
        return Ok(QueueConfig::default());
    }
    let content = fs_err::tokio::read_to_string(path).await?;
    let config: QueueConfig = serde_json::from_str(&content)
        .with_context(|| format!("invalid queue config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn collect_messages(
    manifest: Option<&Path>,
    pairs: Vec<(String, String)>,
) -> Result<Vec<SermonMessage>> {
    let mut messages = Vec::new();
    if let Some(path) = manifest {
        let content = fs_err::tokio::read_to_string(path).await?;
        let parsed: Vec<SermonMessage> = serde_json::from_str(&content)
            .with_context(|| format!("invalid manifest {}", path.display()))?;
        messages.extend(parsed);
    }
    messages.extend(
        pairs
            .into_iter()
            .map(|(id, url)| SermonMessage::new(id.clone(), id, url)),
    );
    Ok(messages)
}

async fn fetch(
    paths: &Paths,
    store: Arc<FileStore>,
    settings: UserSettings,
    connectivity: Connectivity,
    messages: Vec<SermonMessage>,
) -> Result<()> {
    let manager = new_manager(paths, store.clone())?;
    let queue_config = load_queue_config(&paths.queue_config).await?;

    let settings = SharedSettings::new(settings);
    let connectivity = Arc::new(ManualConnectivity::new(connectivity));
    let monitor = Arc::new(NetworkMonitor::new(connectivity, Arc::new(settings.clone())));
    monitor.start().await;

    let permission = monitor.can_download_now().await;

    let queue = DownloadQueue::new(Arc::new(manager), monitor.clone(), Arc::new(settings), store)
        .with_config(queue_config)
        .spawn()
        .await?;
    let mut events = queue.subscribe();

    for message in messages {
        let id = message.id.clone();
        let outcome = queue.enqueue(message).await?;
        debug!(id, ?outcome, "enqueue");
    }

    // 本次运行的网络状态不会变化，被拒绝时只入队不等待
    let result = match permission.reason {
        Some(reason) => {
            warn!(%reason, "downloads are not allowed on this network");
            println!("Queued for later: {reason}");
            Ok(())
        }
        None => watch_queue(&queue, &mut events).await,
    };
    queue.shutdown().await;
    monitor.stop();
    result
}

/// 打印队列事件，直到所有项结束或收到 Ctrl-C
async fn watch_queue(
    queue: &QueueHandle,
    events: &mut tokio::sync::broadcast::Receiver<QueueEvent>,
) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_percent: HashMap<String, u64> = HashMap::new();

    while !all_settled(queue).await? {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, saving queue");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, &mut last_percent),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }

    let items = queue.items().await?;
    let failed = items
        .iter()
        .filter(|item| item.status == ItemStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} download(s) failed");
    }
    Ok(())
}

async fn all_settled(queue: &QueueHandle) -> Result<bool> {
    Ok(queue.items().await?.iter().all(|item| item.is_terminal()))
}

fn print_event(event: &QueueEvent, last_percent: &mut HashMap<String, u64>) {
    match event {
        QueueEvent::Added { id } => println!("{id}: queued"),
        QueueEvent::Started { id } => println!("{id}: downloading"),
        QueueEvent::Progress {
            id,
            progress,
            bytes_written,
            bytes_expected,
        } => {
            // 每 10% 打印一次
            let step = (*progress as u64) / 10 * 10;
            if last_percent.insert(id.clone(), step) != Some(step) && *bytes_expected > 0 {
                println!(
                    "{id}: {step}% ({} / {})",
                    format_bytes(*bytes_written),
                    format_bytes(*bytes_expected)
                );
            }
        }
        QueueEvent::Completed { id, local_path } => {
            println!("{id}: saved to {}", local_path.display())
        }
        QueueEvent::Retrying { id, attempt, error } => {
            println!("{id}: retry {attempt} after error: {error}")
        }
        QueueEvent::Failed { id, error } => println!("{id}: failed: {error}"),
        QueueEvent::Paused { id } => println!("{id}: paused"),
        QueueEvent::Resumed { id } => println!("{id}: resumed"),
        QueueEvent::Removed { .. } => {}
    }
}

async fn list(paths: &Paths, store: Arc<FileStore>, search: Option<&str>) -> Result<()> {
    let queue = QueueStore::load(&*store).await?;
    let manager = new_manager(paths, store)?;

    let downloads = match search {
        Some(query) => manager.records().search(query).await?,
        None => manager.list_downloads().await?,
    };
    if downloads.is_empty() {
        println!("No downloads");
    }
    for record in &downloads {
        println!(
            "{:<16} {:>10}  {}  {}",
            record.message.id,
            format_bytes(record.file_size),
            record.downloaded_at.format("%Y-%m-%d %H:%M"),
            record.message.title
        );
    }

    let pending: Vec<_> = queue
        .items()
        .iter()
        .filter(|item| item.status != ItemStatus::Completed)
        .collect();
    if !pending.is_empty() {
        println!();
        println!("Queue:");
        for item in pending {
            let detail = item.error.as_deref().unwrap_or("");
            println!("{:<16} {:<11} {}", item.id(), item.status.as_str(), detail);
        }
    }
    Ok(())
}
