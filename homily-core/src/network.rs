//! 网络状态监控
//!
//! 将平台的连接变化事件转换为“当前是否允许下载”的判断，并在判断相关的字段变化时通知订阅者。

use crate::settings::SettingsProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

/// 连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Ethernet,
    Cellular,
    Other,
    None,
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Other => "other",
            ConnectionType::None => "none",
            ConnectionType::Unknown => "unknown",
        }
    }
}

/// 平台上报的原始连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    pub connected: bool,
    pub kind: ConnectionType,
}

impl Connectivity {
    pub const OFFLINE: Connectivity = Connectivity {
        connected: false,
        kind: ConnectionType::None,
    };
    pub const WIFI: Connectivity = Connectivity {
        connected: true,
        kind: ConnectionType::Wifi,
    };
    pub const CELLULAR: Connectivity = Connectivity {
        connected: true,
        kind: ConnectionType::Cellular,
    };
}

/// 网络状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_connected: bool,
    /// WiFi 或有线连接
    pub is_wifi: bool,
    pub is_cellular: bool,
    pub connection_type: ConnectionType,
    /// 综合用户设置后的下载许可
    pub can_download: bool,
}

impl NetworkStatus {
    /// 按规则计算：已连接，且未开启仅 WiFi 或当前为 WiFi
    pub fn compute(connectivity: Connectivity, wifi_only: bool) -> Self {
        let is_wifi = matches!(
            connectivity.kind,
            ConnectionType::Wifi | ConnectionType::Ethernet
        );
        let is_connected = connectivity.connected;
        Self {
            is_connected,
            is_wifi,
            is_cellular: connectivity.kind == ConnectionType::Cellular,
            connection_type: connectivity.kind,
            can_download: is_connected && (!wifi_only || is_wifi),
        }
    }

    /// 未启动监控前的初始状态
    pub fn unknown() -> Self {
        Self {
            is_connected: false,
            is_wifi: false,
            is_cellular: false,
            connection_type: ConnectionType::Unknown,
            can_download: false,
        }
    }

    fn decision_fields(&self) -> (bool, bool, bool) {
        (self.is_connected, self.is_wifi, self.can_download)
    }
}

/// 拒绝下载的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// 没有网络连接
    NoConnection,
    /// 开启了仅 WiFi 下载，但当前不是 WiFi
    WifiOnly,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NoConnection => f.write_str("No internet connection"),
            DenyReason::WifiOnly => f.write_str("Downloads are restricted to WiFi"),
        }
    }
}

/// 下载许可
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPermission {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
}

impl DownloadPermission {
    pub fn evaluate(connectivity: Connectivity, wifi_only: bool) -> Self {
        let status = NetworkStatus::compute(connectivity, wifi_only);
        let reason = if !status.is_connected {
            Some(DenyReason::NoConnection)
        } else if !status.can_download {
            Some(DenyReason::WifiOnly)
        } else {
            None
        };
        Self {
            allowed: status.can_download,
            reason,
        }
    }
}

/// 平台连接状态来源
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    /// 立即查询一次当前连接状态
    async fn fetch(&self) -> Connectivity;

    /// 连接变化事件流
    fn changes(&self) -> watch::Receiver<Connectivity>;
}

/// 由调用方手动设置的连接状态，用于命令行和测试
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, connectivity: Connectivity) {
        self.tx.send_replace(connectivity);
    }
}

#[async_trait]
impl ConnectivityProvider for ManualConnectivity {
    async fn fetch(&self) -> Connectivity {
        *self.tx.borrow()
    }

    fn changes(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

struct MonitorInner {
    provider: Arc<dyn ConnectivityProvider>,
    settings: Arc<dyn SettingsProvider>,
    status: watch::Sender<NetworkStatus>,
}

impl MonitorInner {
    async fn compute(&self, connectivity: Connectivity) -> NetworkStatus {
        let wifi_only = self.settings.current().await.wifi_only;
        NetworkStatus::compute(connectivity, wifi_only)
    }

    /// 更新缓存，仅在判断相关字段变化时通知
    async fn apply(&self, connectivity: Connectivity) -> NetworkStatus {
        let next = self.compute(connectivity).await;
        let notified = self.status.send_if_modified(|current| {
            let changed = current.decision_fields() != next.decision_fields();
            *current = next;
            changed
        });
        if notified {
            info!(
                connected = next.is_connected,
                kind = next.connection_type.as_str(),
                can_download = next.can_download,
                "network status changed"
            );
        }
        next
    }
}

/// 网络监控器
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(provider: Arc<dyn ConnectivityProvider>, settings: Arc<dyn SettingsProvider>) -> Self {
        let (status, _) = watch::channel(NetworkStatus::unknown());
        Self {
            inner: Arc::new(MonitorInner {
                provider,
                settings,
                status,
            }),
            listener: Mutex::new(None),
        }
    }

    /// 开始监听连接变化，并立即获取一次快照
    pub async fn start(&self) {
        let mut changes = self.inner.provider.changes();
        changes.borrow_and_update();
        let snapshot = self.inner.provider.fetch().await;
        self.inner.apply(snapshot).await;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let connectivity = *changes.borrow_and_update();
                debug!(?connectivity, "connectivity event");
                inner.apply(connectivity).await;
            }
        });

        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// 停止监听，可重复调用
    pub fn stop(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// 订阅状态变化，接收器中已包含当前状态，丢弃即取消订阅
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status.subscribe()
    }

    /// 以回调方式订阅：立即以当前状态调用一次，之后每次变化调用
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        callback(*rx.borrow_and_update());
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                callback(status);
            }
        });
        Subscription { handle }
    }

    /// 最近一次计算的状态，未启动时可能已过期
    pub fn cached_status(&self) -> NetworkStatus {
        *self.inner.status.borrow()
    }

    /// 重新查询并无条件通知所有订阅者
    pub async fn refresh(&self) -> NetworkStatus {
        let connectivity = self.inner.provider.fetch().await;
        let next = self.inner.compute(connectivity).await;
        self.inner.status.send_modify(|current| *current = next);
        next
    }

    /// 查询最新连接状态和用户设置，判断现在能否下载
    pub async fn can_download_now(&self) -> DownloadPermission {
        let connectivity = self.inner.provider.fetch().await;
        let wifi_only = self.inner.settings.current().await.wifi_only;
        DownloadPermission::evaluate(connectivity, wifi_only)
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 回调订阅，调用 `unsubscribe` 或丢弃即取消
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{SharedSettings, UserSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn monitor(initial: Connectivity, wifi_only: bool) -> (NetworkMonitor, Arc<ManualConnectivity>, SharedSettings) {
        let provider = Arc::new(ManualConnectivity::new(initial));
        let settings = SharedSettings::new(UserSettings {
            wifi_only,
            storage_limit: None,
        });
        let monitor = NetworkMonitor::new(provider.clone(), Arc::new(settings.clone()));
        (monitor, provider, settings)
    }

    #[test]
    fn test_decision_rule() {
        let cases = [
            (Connectivity::OFFLINE, false, false, Some(DenyReason::NoConnection)),
            (Connectivity::OFFLINE, true, false, Some(DenyReason::NoConnection)),
            (Connectivity::WIFI, true, true, None),
            (Connectivity::CELLULAR, false, true, None),
            (Connectivity::CELLULAR, true, false, Some(DenyReason::WifiOnly)),
        ];
        for (connectivity, wifi_only, allowed, reason) in cases {
            let permission = DownloadPermission::evaluate(connectivity, wifi_only);
            assert_eq!(permission.allowed, allowed, "{connectivity:?} wifi_only={wifi_only}");
            assert_eq!(permission.reason, reason);
        }
    }

    #[tokio::test]
    async fn test_start_takes_snapshot() {
        let (monitor, _, _) = monitor(Connectivity::WIFI, true);
        assert!(!monitor.cached_status().can_download);
        monitor.start().await;
        let status = monitor.cached_status();
        assert!(status.can_download);
        assert!(status.is_wifi);
        monitor.stop();
        monitor.stop();
    }

    #[tokio::test]
    async fn test_notifies_only_on_relevant_change() {
        let (monitor, provider, _) = monitor(Connectivity::WIFI, false);
        monitor.start().await;
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        // 类型变化但判断不变
        provider.set(Connectivity {
            connected: true,
            kind: ConnectionType::Ethernet,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(monitor.cached_status().connection_type, ConnectionType::Ethernet);

        provider.set(Connectivity::OFFLINE);
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!rx.borrow_and_update().can_download);
    }

    #[tokio::test]
    async fn test_refresh_always_notifies() {
        let (monitor, _, settings) = monitor(Connectivity::CELLULAR, false);
        monitor.start().await;
        assert!(monitor.cached_status().can_download);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.refresh().await;
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        settings.update(|s| s.wifi_only = true).await;
        let status = monitor.refresh().await;
        assert!(!status.can_download);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_can_download_now_reads_fresh_state() {
        let (monitor, provider, _) = monitor(Connectivity::OFFLINE, true);
        let permission = monitor.can_download_now().await;
        assert_eq!(permission.reason, Some(DenyReason::NoConnection));

        provider.set(Connectivity::CELLULAR);
        assert_eq!(monitor.can_download_now().await.reason, Some(DenyReason::WifiOnly));

        provider.set(Connectivity::WIFI);
        assert!(monitor.can_download_now().await.allowed);
    }

    #[tokio::test]
    async fn test_stop_reaches_listener_after_poisoned_lock() {
        let (monitor, provider, _) = monitor(Connectivity::WIFI, true);
        let monitor = Arc::new(monitor);
        let holder = Arc::clone(&monitor);
        let _ = std::thread::spawn(move || {
            let _slot = holder.listener.lock().unwrap();
            panic!("panic while holding the listener slot");
        })
        .join();
        assert!(monitor.listener.is_poisoned());

        monitor.start().await;
        monitor.stop();
        provider.set(Connectivity::OFFLINE);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.cached_status().can_download);
    }

    #[tokio::test]
    async fn test_on_change_invokes_immediately() {
        let (monitor, provider, _) = monitor(Connectivity::WIFI, true);
        monitor.start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscription = monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        provider.set(Connectivity::OFFLINE);
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        subscription.unsubscribe();
        provider.set(Connectivity::WIFI);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
