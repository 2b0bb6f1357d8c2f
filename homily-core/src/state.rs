use crate::{
    error::Result,
    types::{EnqueueOutcome, ItemStatus, QueueItem, ResumeDescriptor, SermonMessage, TransferProgress},
};
use async_trait::async_trait;
use fs_err::tokio as fs;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};
use tokio::sync::RwLock;

/// 队列状态的存储键
pub const QUEUE_KEY: &str = "download_queue";

/// 键值存储
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// 读取并反序列化一个键
pub async fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(content) => Ok(Some(serde_json::from_str(&content)?)),
        None => Ok(None),
    }
}

/// 序列化并写入一个键
pub async fn save_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_string(value)?;
    store.set(key, &data).await
}

/// 将任意标识符转换为可用作文件名的字符串（单射）
pub(crate) fn escape_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("~{byte:02X}"));
        }
    }
    out
}

/// 基于文件的键值存储，每个键一个 JSON 文件
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", escape_name(key)))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path).await?))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// 内存键值存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// 下载队列状态
///
/// 按入队顺序保存队列项，所有修改都经过这里的方法。
/// 同一时刻最多只有一个队列项处于 `Downloading`。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStore {
    items: Vec<QueueItem>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从持久化数据恢复队列
    ///
    /// 上次退出时仍在下载的项被视为中断，恢复为 `Queued`；重复的标识符只保留第一个。
    pub fn from_items(items: Vec<QueueItem>) -> Self {
        let mut seen = HashSet::new();
        let items = items
            .into_iter()
            .filter(|item| seen.insert(item.message.id.clone()))
            .map(|mut item| {
                if item.status == ItemStatus::Downloading {
                    item.status = ItemStatus::Queued;
                }
                item
            })
            .collect();
        Self { items }
    }

    /// 从存储加载队列
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        let items: Vec<QueueItem> = load_json(store, QUEUE_KEY).await?.unwrap_or_default();
        Ok(Self::from_items(items))
    }

    /// 保存队列到存储
    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, QUEUE_KEY, &self.items).await
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.message.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.message.id == id)
    }

    fn get_with_status(&mut self, id: &str, allowed: &[ItemStatus]) -> Option<&mut QueueItem> {
        self.get_mut(id)
            .filter(|item| allowed.contains(&item.status))
    }

    /// 加入队列
    ///
    /// 已存在且未失败的项保持不变；失败的项重置后重新排队。
    pub fn enqueue(&mut self, message: SermonMessage) -> EnqueueOutcome {
        match self.get_mut(&message.id) {
            Some(item) if item.status == ItemStatus::Failed => {
                reset_for_retry(item);
                EnqueueOutcome::Requeued
            }
            Some(_) => EnqueueOutcome::AlreadyPresent,
            None => {
                self.items.push(QueueItem::new(message));
                EnqueueOutcome::Added
            }
        }
    }

    /// 最早入队的等待项
    pub fn next_queued(&self) -> Option<&QueueItem> {
        self.items
            .iter()
            .find(|item| item.status == ItemStatus::Queued)
    }

    pub fn downloading(&self) -> Option<&QueueItem> {
        self.items
            .iter()
            .find(|item| item.status == ItemStatus::Downloading)
    }

    /// 开始下载，已有其他项在下载时拒绝
    pub fn start(&mut self, id: &str) -> bool {
        if self.downloading().is_some() {
            return false;
        }
        match self.get_with_status(id, &[ItemStatus::Queued]) {
            Some(item) => {
                item.status = ItemStatus::Downloading;
                true
            }
            None => false,
        }
    }

    /// 更新进度，返回整数百分比是否发生变化
    pub fn update_progress(&mut self, id: &str, progress: TransferProgress) -> bool {
        let Some(item) = self.get_with_status(id, &[ItemStatus::Downloading]) else {
            return false;
        };
        let before = item.progress.floor();
        item.bytes_written = progress.bytes_written;
        if let Some(total) = progress.bytes_expected {
            item.bytes_expected = total;
        }
        if let Some(fraction) = progress.fraction() {
            item.progress = fraction * 100.0;
        }
        item.progress.floor() != before
    }

    pub fn complete(&mut self, id: &str, file_size: u64) -> bool {
        match self.get_with_status(id, &[ItemStatus::Downloading, ItemStatus::Paused]) {
            Some(item) => {
                item.status = ItemStatus::Completed;
                item.progress = 100.0;
                item.bytes_written = file_size;
                item.bytes_expected = file_size;
                item.error = None;
                item.resume = None;
                true
            }
            None => false,
        }
    }

    /// 可重试失败后重新排队，返回新的重试次数
    ///
    /// 局部文件已被丢弃，进度和续传状态一并清零。
    pub fn requeue_after_error(&mut self, id: &str, error: String) -> Option<u32> {
        let item = self.get_with_status(id, &[ItemStatus::Downloading])?;
        item.status = ItemStatus::Queued;
        item.retry_count += 1;
        item.error = Some(error);
        item.resume = None;
        item.progress = 0.0;
        item.bytes_written = 0;
        Some(item.retry_count)
    }

    pub fn fail(&mut self, id: &str, error: String) -> bool {
        match self.get_mut(id) {
            Some(item) if item.status != ItemStatus::Completed => {
                item.status = ItemStatus::Failed;
                item.error = Some(error);
                item.resume = None;
                true
            }
            _ => false,
        }
    }

    /// 暂停等待中或下载中的项
    pub fn pause(&mut self, id: &str) -> bool {
        match self.get_with_status(id, &[ItemStatus::Queued, ItemStatus::Downloading]) {
            Some(item) => {
                item.status = ItemStatus::Paused;
                true
            }
            None => false,
        }
    }

    /// 下载被中断（如程序退出），重新排队并保留续传状态
    pub fn interrupt(&mut self, id: &str) -> bool {
        match self.get_with_status(id, &[ItemStatus::Downloading]) {
            Some(item) => {
                item.status = ItemStatus::Queued;
                true
            }
            None => false,
        }
    }

    /// 记录续传状态
    pub fn set_resume(&mut self, id: &str, resume: ResumeDescriptor) -> bool {
        match self.get_mut(id) {
            Some(item) => {
                item.bytes_written = resume.offset;
                item.resume = Some(resume);
                true
            }
            None => false,
        }
    }

    /// 恢复暂停的项，保留续传状态
    pub fn resume(&mut self, id: &str) -> bool {
        match self.get_with_status(id, &[ItemStatus::Paused]) {
            Some(item) => {
                item.status = ItemStatus::Queued;
                true
            }
            None => false,
        }
    }

    /// 手动重试失败的项，重置重试计数
    pub fn retry(&mut self, id: &str) -> bool {
        match self.get_with_status(id, &[ItemStatus::Failed]) {
            Some(item) => {
                reset_for_retry(item);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let pos = self.items.iter().position(|item| item.message.id == id)?;
        Some(self.items.remove(pos))
    }

    /// 暂停全部等待中和下载中的项，返回受影响的标识符
    pub fn pause_all(&mut self) -> Vec<String> {
        self.transition_all(&[ItemStatus::Queued, ItemStatus::Downloading], ItemStatus::Paused)
    }

    /// 恢复全部暂停的项，返回受影响的标识符
    pub fn resume_all(&mut self) -> Vec<String> {
        self.transition_all(&[ItemStatus::Paused], ItemStatus::Queued)
    }

    fn transition_all(&mut self, from: &[ItemStatus], to: ItemStatus) -> Vec<String> {
        self.items
            .iter_mut()
            .filter(|item| from.contains(&item.status))
            .map(|item| {
                item.status = to;
                item.message.id.clone()
            })
            .collect()
    }
}

fn reset_for_retry(item: &mut QueueItem) {
    item.status = ItemStatus::Queued;
    item.retry_count = 0;
    item.error = None;
    item.resume = None;
    item.progress = 0.0;
    item.bytes_written = 0;
}
