use crate::{
    error::Result,
    state::{KeyValueStore, load_json, save_json},
    types::DownloadedMessage,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// 已下载标识符索引的存储键
pub const INDEX_KEY: &str = "downloaded_messages";

fn record_key(id: &str) -> String {
    format!("downloaded_message_{id}")
}

/// 已下载讲道的记录
///
/// 每条记录单独保存，另有一个索引按完成顺序列出所有标识符。
#[derive(Clone)]
pub struct DownloadRecords {
    store: Arc<dyn KeyValueStore>,
    index_lock: Arc<Mutex<()>>,
}

impl DownloadRecords {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            index_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn index(&self) -> Result<Vec<String>> {
        Ok(load_json(&*self.store, INDEX_KEY).await?.unwrap_or_default())
    }

    /// 保存一条记录
    pub async fn save(&self, record: &DownloadedMessage) -> Result<()> {
        let id = &record.message.id;
        save_json(&*self.store, &record_key(id), record).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.index().await?;
        if !index.iter().any(|existing| existing == id) {
            index.push(id.clone());
            save_json(&*self.store, INDEX_KEY, &index).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DownloadedMessage>> {
        load_json(&*self.store, &record_key(id)).await
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.index().await?.iter().any(|existing| existing == id))
    }

    /// 删除指定记录，返回记录是否存在
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.remove(&record_key(id)).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.index().await?;
        let before = index.len();
        index.retain(|existing| existing != id);
        if index.len() == before {
            return Ok(false);
        }
        save_json(&*self.store, INDEX_KEY, &index).await?;
        Ok(true)
    }

    /// 获取所有记录（按完成顺序），缺失的记录会被跳过
    pub async fn list(&self) -> Result<Vec<DownloadedMessage>> {
        let mut records = Vec::new();
        for id in self.index().await? {
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// 按下载时间从旧到新排列的记录
    pub async fn oldest_first(&self) -> Result<Vec<DownloadedMessage>> {
        let mut records = self.list().await?;
        records.sort_by_key(|record| record.downloaded_at);
        Ok(records)
    }

    /// 搜索标题、讲员或系列
    pub async fn search(&self, query: &str) -> Result<Vec<DownloadedMessage>> {
        let query_lower = query.to_lowercase();
        let matches = |field: Option<&str>| {
            field.is_some_and(|value| value.to_lowercase().contains(&query_lower))
        };
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| {
                let message = &record.message;
                matches(Some(&message.title))
                    || matches(message.speaker.as_deref())
                    || matches(message.series_title.as_deref())
            })
            .collect())
    }
}
