use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// 队列处理器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 最大自动重试次数
    pub max_retries: u32,
    /// 普通网络错误的重试等待（毫秒）
    pub network_retry_delay_ms: u64,
    /// TLS 错误的重试等待（毫秒）
    pub tls_retry_delay_ms: u64,
    /// 完成后在队列中保留的时间（毫秒）
    pub completion_grace_ms: u64,
    /// 大小未知时的预估大小（字节），用于存储配额检查
    pub estimated_item_size: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_retries: 5,
            network_retry_delay_ms: 3000,
            tls_retry_delay_ms: 5000,
            completion_grace_ms: 3000,
            estimated_item_size: 50 * 1024 * 1024, // 50MB
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn network_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network_retry_delay_ms)
    }

    pub fn tls_retry_delay(&self) -> Duration {
        Duration::from_millis(self.tls_retry_delay_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }
        if self.estimated_item_size == 0 {
            anyhow::bail!("estimated_item_size must be greater than 0");
        }
        Ok(())
    }
}

/// 下载器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// 下载目录
    pub download_dir: PathBuf,
    /// 请求超时（秒），0 表示不限制
    pub timeout_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 用户代理
    pub user_agent: Option<String>,
    /// 音频文件扩展名
    pub file_extension: String,
}

impl DownloaderConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            timeout_secs: 0,
            connect_timeout_secs: 30,
            user_agent: Some(concat!("homily/", env!("CARGO_PKG_VERSION")).to_string()),
            file_extension: "mp3".to_string(),
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than 0");
        }
        if self.file_extension.is_empty() || self.file_extension.contains(['/', '\\', '.']) {
            anyhow::bail!("file_extension must be a bare extension like `mp3`");
        }
        Ok(())
    }
}
