use anyhow::Result;
use homily_core::{
    Connectivity, DownloadManager, DownloadQueue, DownloaderConfig, FileStore, ManualConnectivity,
    NetworkMonitor, QueueEvent, SermonMessage, SharedSettings, UserSettings, format_bytes,
};
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    println!("🎧 离线下载队列示例\n");

    let root = std::env::temp_dir().join("homily-example");
    let store = Arc::new(FileStore::open(root.join("state")).await?);
    let manager = DownloadManager::new(DownloaderConfig::new(root.join("downloads")), store.clone())?;

    // 先模拟离线，入队后再切换到 WiFi
    let connectivity = Arc::new(ManualConnectivity::new(Connectivity::OFFLINE));
    let settings = SharedSettings::new(UserSettings::default());
    let monitor = Arc::new(NetworkMonitor::new(
        connectivity.clone(),
        Arc::new(settings.clone()),
    ));
    monitor.start().await;

    let queue = DownloadQueue::new(
        Arc::new(manager.clone()),
        monitor.clone(),
        Arc::new(settings),
        store,
    )
    .spawn()
    .await?;
    let mut events = queue.subscribe();

    for (id, url) in [
        ("bytes-256k", "https://httpbin.org/bytes/262144"),
        ("bytes-1m", "https://httpbin.org/bytes/1048576"),
    ] {
        queue
            .enqueue(SermonMessage::new(id, format!("示例 {id}"), url))
            .await?;
        println!("📥 已加入队列: {id}");
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("📡 切换到 WiFi");
    connectivity.set(Connectivity::WIFI);

    let mut remaining = 2;
    while remaining > 0 {
        match events.recv().await? {
            QueueEvent::Started { id } => println!("⬇️  开始下载: {id}"),
            QueueEvent::Completed { id, local_path } => {
                println!("✅ {id} 完成: {}", local_path.display());
                remaining -= 1;
            }
            QueueEvent::Retrying { id, attempt, error } => {
                println!("🔁 {id} 第 {attempt} 次重试: {error}")
            }
            QueueEvent::Failed { id, error } => {
                eprintln!("❌ {id} 下载失败: {error}");
                remaining -= 1;
            }
            _ => {}
        }
    }

    queue.shutdown().await;
    println!(
        "\n📦 已下载总大小: {}",
        format_bytes(manager.get_total_downloads_size().await?)
    );

    // 清理
    let _ = std::fs::remove_dir_all(&root);
    println!("🧹 清理完成");

    Ok(())
}
