use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, HeaderMap, HeaderValue, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 队列项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// 等待下载
    Queued,
    /// 正在下载
    Downloading,
    /// 已暂停（网络不可用或用户暂停）
    Paused,
    /// 已完成
    Completed,
    /// 失败，等待用户重试
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Downloading => "downloading",
            ItemStatus::Paused => "paused",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 讲道信息（下载所需的最小元数据）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SermonMessage {
    /// 讲道唯一标识符
    pub id: String,
    /// 标题
    pub title: String,
    /// 音频地址
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub series_title: Option<String>,
    /// 系列封面地址
    #[serde(default)]
    pub series_art: Option<String>,
}

impl SermonMessage {
    pub fn new(id: impl Into<String>, title: impl Into<String>, audio_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            audio_url: Some(audio_url.into()),
            speaker: None,
            series_id: None,
            series_title: None,
            series_art: None,
        }
    }
}

/// 断点续传校验值，对应响应中的 `ETag` 或 `Last-Modified`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Validator {
    ETag(String),
    LastModified(String),
}

impl Validator {
    /// 从响应头中提取校验值，优先使用强 ETag
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let text = |value: &HeaderValue| value.to_str().ok().map(str::to_string);

        if let Some(etag) = headers.get(ETAG).and_then(text)
            && !etag.starts_with("W/")
        {
            return Some(Validator::ETag(etag));
        }
        headers
            .get(LAST_MODIFIED)
            .and_then(text)
            .map(Validator::LastModified)
    }

    /// `If-Range` 请求头的值
    pub fn header_value(&self) -> &str {
        match self {
            Validator::ETag(v) | Validator::LastModified(v) => v,
        }
    }
}

/// 续传描述：已写入的字节偏移量和服务器资源校验值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDescriptor {
    pub offset: u64,
    pub validator: Option<Validator>,
}

/// 下载队列项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub message: SermonMessage,
    /// 当前状态
    pub status: ItemStatus,
    /// 完成百分比（0-100）
    pub progress: f64,
    /// 已写入字节数
    pub bytes_written: u64,
    /// 预期总字节数，未知时为 0
    pub bytes_expected: u64,
    /// 自动重试次数
    pub retry_count: u32,
    /// 最近一次错误信息
    pub error: Option<String>,
    /// 暂停时保存的续传状态
    pub resume: Option<ResumeDescriptor>,
    /// 入队时间
    pub added_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(message: SermonMessage) -> Self {
        Self {
            message,
            status: ItemStatus::Queued,
            progress: 0.0,
            bytes_written: 0,
            bytes_expected: 0,
            retry_count: 0,
            error: None,
            resume: None,
            added_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// 是否处于终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// 已下载到本地的讲道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedMessage {
    pub message: SermonMessage,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 下载完成时间
    pub downloaded_at: DateTime<Utc>,
    /// 文件大小（字节）
    pub file_size: u64,
}

/// 单次传输进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
}

impl TransferProgress {
    /// 完成比例（0.0-1.0），总大小未知时返回 None
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_written as f64 / total as f64).min(1.0)),
        }
    }
}

/// 单次传输的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// 下载完成
    Completed(DownloadedMessage),
    /// 被取消，保留续传状态
    Paused(ResumeDescriptor),
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 新加入队列
    Added,
    /// 失败项被重新排队
    Requeued,
    /// 已在队列中，未做任何修改
    AlreadyPresent,
}

/// 队列事件
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// 已加入队列
    Added { id: String },
    /// 开始下载
    Started { id: String },
    /// 进度更新
    Progress {
        id: String,
        progress: f64,
        bytes_written: u64,
        bytes_expected: u64,
    },
    /// 下载完成
    Completed { id: String, local_path: PathBuf },
    /// 可重试错误，已重新排队
    Retrying {
        id: String,
        attempt: u32,
        error: String,
    },
    /// 下载失败
    Failed { id: String, error: String },
    /// 已暂停
    Paused { id: String },
    /// 已恢复排队
    Resumed { id: String },
    /// 已移出队列
    Removed { id: String },
}

impl QueueEvent {
    pub fn id(&self) -> &str {
        match self {
            QueueEvent::Added { id }
            | QueueEvent::Started { id }
            | QueueEvent::Progress { id, .. }
            | QueueEvent::Completed { id, .. }
            | QueueEvent::Retrying { id, .. }
            | QueueEvent::Failed { id, .. }
            | QueueEvent::Paused { id }
            | QueueEvent::Resumed { id }
            | QueueEvent::Removed { id } => id,
        }
    }
}
