//! 讲道音频的离线下载队列
//!
//! 队列按入队顺序逐个下载，根据网络状态和用户设置决定何时开始，
//! 对瞬时网络错误自动重试，并把状态持久化以便重启后继续。

pub mod analytics;
pub mod config;
pub mod downloader;
pub mod error;
pub mod nbyte;
pub mod network;
pub mod queue;
pub mod records;
pub mod settings;
pub mod state;
pub mod types;

pub use analytics::{AnalyticsEvent, AnalyticsEventKind, AnalyticsSink, TracingSink};
pub use config::{DownloaderConfig, QueueConfig};
pub use downloader::{DownloadManager, ProgressCallback, SermonDownloader};
pub use error::{Error, Result, RetryClass};
pub use nbyte::{ByteSize, format_bytes};
pub use network::{
    ConnectionType, Connectivity, ConnectivityProvider, DownloadPermission, ManualConnectivity,
    NetworkMonitor, NetworkStatus,
};
pub use queue::{DownloadQueue, QueueHandle};
pub use records::DownloadRecords;
pub use settings::{SettingsProvider, SharedSettings, UserSettings};
pub use state::{FileStore, KeyValueStore, MemoryStore, QueueStore};
pub use types::{
    DownloadedMessage, EnqueueOutcome, ItemStatus, QueueEvent, QueueItem, ResumeDescriptor,
    SermonMessage, TransferOutcome, TransferProgress, Validator,
};
