use crate::network::ConnectionType;
use anyhow::Result;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsEventKind {
    QueueAdd,
    DownloadComplete,
    DownloadFailed,
}

impl AnalyticsEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsEventKind::QueueAdd => "download_queue_add",
            AnalyticsEventKind::DownloadComplete => "download_complete",
            AnalyticsEventKind::DownloadFailed => "download_failed",
        }
    }
}

/// 下载相关的统计事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsEvent {
    pub kind: AnalyticsEventKind,
    pub message_id: String,
    pub series_id: Option<String>,
    pub network_type: ConnectionType,
    pub wifi_only: bool,
    pub file_size: Option<u64>,
}

/// 统计事件接收端
///
/// 发送失败只会被记录，不影响队列。
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: &AnalyticsEvent) -> Result<()>;
}

/// 将统计事件写入日志
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn record(&self, event: &AnalyticsEvent) -> Result<()> {
        info!(
            target: "analytics",
            event = event.kind.name(),
            message_id = %event.message_id,
            series_id = event.series_id.as_deref().unwrap_or(""),
            network_type = event.network_type.as_str(),
            wifi_only = event.wifi_only,
            file_size = event.file_size,
            "analytics event"
        );
        Ok(())
    }
}
