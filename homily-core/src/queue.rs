use crate::{
    analytics::{AnalyticsEvent, AnalyticsEventKind, AnalyticsSink, TracingSink},
    config::QueueConfig,
    downloader::{ProgressCallback, SermonDownloader},
    error::{Error, Result, RetryClass},
    network::NetworkMonitor,
    settings::SettingsProvider,
    state::{KeyValueStore, QueueStore},
    types::{
        DownloadedMessage, EnqueueOutcome, ItemStatus, QueueEvent, QueueItem, SermonMessage,
        TransferOutcome, TransferProgress,
    },
};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 关闭时等待当前传输保存续传状态的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

enum Command {
    Enqueue(SermonMessage, oneshot::Sender<EnqueueOutcome>),
    PauseCurrent(oneshot::Sender<Option<String>>),
    Resume(String, oneshot::Sender<bool>),
    Retry(String, oneshot::Sender<bool>),
    Remove(String, oneshot::Sender<bool>),
    SetPaused(bool, oneshot::Sender<()>),
    Items(oneshot::Sender<Vec<QueueItem>>),
}

/// 传输任务发回处理器的消息
enum Internal {
    Progress {
        id: String,
        progress: TransferProgress,
    },
    Finished {
        id: String,
        result: Result<TransferOutcome>,
    },
    Expire {
        id: String,
    },
}

struct ActiveTransfer {
    id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 下载队列
///
/// 按入队顺序逐个下载。处理器在独立任务中运行并独占队列状态，
/// 界面操作、网络变化和传输结果都以消息形式送达，按到达顺序依次处理。
pub struct DownloadQueue {
    downloader: Arc<dyn SermonDownloader>,
    monitor: Arc<NetworkMonitor>,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn KeyValueStore>,
    analytics: Arc<dyn AnalyticsSink>,
    config: QueueConfig,
}

impl DownloadQueue {
    /// 创建下载队列
    ///
    /// # 参数
    /// * `downloader` - 执行单个传输的下载器
    /// * `monitor` - 网络监控器，需要调用过 `start` 才能响应网络变化
    /// * `settings` - 用户设置（仅 WiFi、存储上限）
    /// * `store` - 队列状态的持久化存储
    pub fn new(
        downloader: Arc<dyn SermonDownloader>,
        monitor: Arc<NetworkMonitor>,
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            downloader,
            monitor,
            settings,
            store,
            analytics: Arc::new(TracingSink),
            config: QueueConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    /// 加载持久化的队列并启动处理器
    pub async fn spawn(self) -> Result<QueueHandle> {
        let queue = QueueStore::load(&*self.store).await?;
        info!(items = queue.len(), "download queue loaded");

        let (command_tx, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let shutdown = CancellationToken::new();

        let processor = Processor {
            queue,
            downloader: self.downloader,
            monitor: self.monitor,
            settings: self.settings,
            store: self.store,
            analytics: self.analytics,
            config: self.config,
            events: events.clone(),
            internal_tx,
            active: None,
            paused: false,
            backoff_until: None,
            can_download: false,
        };
        let task = tokio::spawn(processor.run(command_rx, internal_rx, shutdown.clone()));

        Ok(QueueHandle {
            commands: command_tx,
            events,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// 下载队列的操作句柄，可在多处克隆使用
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl QueueHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::QueueClosed)?;
        rx.await.map_err(|_| Error::QueueClosed)
    }

    /// 加入队列；已存在的项保持不变，失败的项重新排队
    pub async fn enqueue(&self, message: SermonMessage) -> Result<EnqueueOutcome> {
        self.request(|tx| Command::Enqueue(message, tx)).await
    }

    /// 暂停当前下载，返回被暂停的标识符
    pub async fn pause_current(&self) -> Result<Option<String>> {
        self.request(Command::PauseCurrent).await
    }

    /// 恢复暂停的项
    pub async fn resume(&self, id: &str) -> Result<bool> {
        self.request(|tx| Command::Resume(id.to_string(), tx)).await
    }

    /// 重试失败的项，重试计数清零
    pub async fn retry(&self, id: &str) -> Result<bool> {
        self.request(|tx| Command::Retry(id.to_string(), tx)).await
    }

    /// 移出队列，正在下载时会取消传输并丢弃局部文件
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.request(|tx| Command::Remove(id.to_string(), tx)).await
    }

    /// 暂停或恢复整个队列
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.request(|tx| Command::SetPaused(paused, tx)).await
    }

    /// 获取所有队列项（按入队顺序）
    pub async fn items(&self) -> Result<Vec<QueueItem>> {
        self.request(Command::Items).await
    }

    /// 获取单个队列项
    pub async fn item(&self, id: &str) -> Result<Option<QueueItem>> {
        Ok(self.items().await?.into_iter().find(|item| item.id() == id))
    }

    /// 订阅队列事件
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// 停止处理器；正在进行的传输会保存续传状态，下次启动时继续
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "download queue task ended abnormally");
        }
    }
}

struct Processor {
    queue: QueueStore,
    downloader: Arc<dyn SermonDownloader>,
    monitor: Arc<NetworkMonitor>,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn KeyValueStore>,
    analytics: Arc<dyn AnalyticsSink>,
    config: QueueConfig,
    events: broadcast::Sender<QueueEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    active: Option<ActiveTransfer>,
    /// 整个队列是否被暂停
    paused: bool,
    /// 可重试错误后的等待截止时间
    backoff_until: Option<Instant>,
    /// 最近一次网络状态中的下载许可
    can_download: bool,
}

impl Processor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        shutdown: CancellationToken,
    ) {
        let mut network = self.monitor.subscribe();
        let initial = network.borrow_and_update().can_download;
        let mut network_open = true;

        // 启动时按当前网络状态处理一次，恢复上次因断网暂停的项
        self.can_download = false;
        self.on_network_change(initial).await;

        // 上次退出前已完成、尚未移出的项
        let completed: Vec<String> = self
            .queue
            .items()
            .iter()
            .filter(|item| item.status == ItemStatus::Completed)
            .map(|item| item.id().to_string())
            .collect();
        for id in completed {
            self.schedule_expiry(id);
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let backoff = self.backoff_until;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
                changed = network.changed(), if network_open => match changed {
                    Ok(()) => {
                        let status = *network.borrow_and_update();
                        self.on_network_change(status.can_download).await;
                    }
                    Err(_) => network_open = false,
                },
                _ = tokio::time::sleep_until(backoff.unwrap_or_else(Instant::now)), if backoff.is_some() => {}
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        self.stop(&mut internal).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(message, reply) => {
                let outcome = self.enqueue(message).await;
                let _ = reply.send(outcome);
            }
            Command::PauseCurrent(reply) => {
                let paused = self.pause_current().await;
                let _ = reply.send(paused);
            }
            Command::Resume(id, reply) => {
                let resumed = self.queue.resume(&id);
                if resumed {
                    self.persist().await;
                    self.emit(QueueEvent::Resumed { id });
                }
                let _ = reply.send(resumed);
            }
            Command::Retry(id, reply) => {
                let retried = self.queue.retry(&id);
                if retried {
                    info!(id, "manual retry");
                    self.persist().await;
                    self.emit(QueueEvent::Resumed { id });
                }
                let _ = reply.send(retried);
            }
            Command::Remove(id, reply) => {
                let removed = self.remove(&id).await;
                let _ = reply.send(removed);
            }
            Command::SetPaused(paused, reply) => {
                if self.paused != paused {
                    info!(paused, "download queue pause toggled");
                }
                self.paused = paused;
                let _ = reply.send(());
            }
            Command::Items(reply) => {
                let _ = reply.send(self.queue.items().to_vec());
            }
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Progress { id, progress } => {
                let changed = self.queue.update_progress(&id, progress);
                if let Some(item) = self
                    .queue
                    .get(&id)
                    .filter(|item| item.status == ItemStatus::Downloading)
                {
                    let event = QueueEvent::Progress {
                        id,
                        progress: item.progress,
                        bytes_written: item.bytes_written,
                        bytes_expected: item.bytes_expected,
                    };
                    self.emit(event);
                }
                if changed {
                    self.persist().await;
                }
            }
            Internal::Finished { id, result } => self.finish(id, result).await,
            Internal::Expire { id } => {
                if self
                    .queue
                    .get(&id)
                    .is_some_and(|item| item.status == ItemStatus::Completed)
                {
                    self.queue.remove(&id);
                    self.persist().await;
                    self.emit(QueueEvent::Removed { id });
                }
            }
        }
    }

    /// 处理一次唤醒：空闲时取出最早的等待项，检查网络和存储后开始下载
    async fn tick(&mut self) {
        if self.active.is_some() || self.paused {
            return;
        }
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return;
            }
            self.backoff_until = None;
        }

        let Some(item) = self.queue.next_queued().cloned() else {
            return;
        };

        let permission = self.monitor.can_download_now().await;
        if !permission.allowed {
            debug!(reason = ?permission.reason, "downloads deferred");
            return;
        }

        if let Some(limit) = self.settings.current().await.storage_limit {
            match self.downloader.total_downloads_size().await {
                Ok(usage) => {
                    let estimated = if item.bytes_expected > 0 {
                        item.bytes_expected.saturating_sub(item.bytes_written)
                    } else {
                        self.config.estimated_item_size
                    };
                    if usage.saturating_add(estimated) > limit {
                        warn!(id = item.id(), usage, estimated, limit, "storage limit reached");
                        self.mark_failed(item.id().to_string(), Error::StorageLimit.to_string())
                            .await;
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "could not measure download usage"),
            }
        }

        self.start_transfer(item).await;
    }

    async fn start_transfer(&mut self, item: QueueItem) {
        let id = item.id().to_string();
        if !self.queue.start(&id) {
            return;
        }
        info!(
            id,
            title = %item.message.title,
            attempt = item.retry_count + 1,
            resume_from = item.resume.as_ref().map(|r| r.offset),
            "starting download"
        );
        self.persist().await;
        self.emit(QueueEvent::Started { id: id.clone() });

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let downloader = Arc::clone(&self.downloader);
        let finished_tx = self.internal_tx.clone();
        let progress_tx = self.internal_tx.clone();
        let progress_id = id.clone();
        let task_id = id.clone();

        let progress: ProgressCallback = Box::new(move |progress| {
            let _ = progress_tx.send(Internal::Progress {
                id: progress_id.clone(),
                progress,
            });
        });

        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(downloader.download(&item, progress, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::transfer("download task panicked")));
            let _ = finished_tx.send(Internal::Finished {
                id: task_id,
                result,
            });
        });

        self.active = Some(ActiveTransfer { id, cancel, handle });
    }

    async fn finish(&mut self, id: String, result: Result<TransferOutcome>) {
        let cancelled = match self.active.take() {
            Some(active) if active.id == id => active.cancel.is_cancelled(),
            other => {
                self.active = other;
                warn!(id, "ignoring result of an unknown transfer");
                return;
            }
        };

        let status = self.queue.get(&id).map(|item| item.status);
        match (status, result) {
            // 下载中被移出队列
            (None, Ok(TransferOutcome::Completed(record))) => {
                info!(id, path = %record.local_path.display(), "removed item finished downloading");
            }
            (None, _) => self.discard_partial(&id).await,
            (Some(_), Ok(TransferOutcome::Completed(record))) => self.complete(id, record).await,
            (Some(status), Ok(TransferOutcome::Paused(resume))) => {
                debug!(id, offset = resume.offset, "transfer stopped, resume state saved");
                self.queue.set_resume(&id, resume);
                if status == ItemStatus::Downloading {
                    self.queue.interrupt(&id);
                }
                self.persist().await;
            }
            (Some(status), Err(e)) if cancelled || matches!(e, Error::Cancelled) => {
                debug!(id, error = %e, "transfer ended after cancellation");
                if status == ItemStatus::Downloading {
                    self.queue.interrupt(&id);
                    self.persist().await;
                }
            }
            (Some(_), Err(e)) => self.fail_transfer(id, e).await,
        }
    }

    async fn complete(&mut self, id: String, record: DownloadedMessage) {
        if !self.queue.complete(&id, record.file_size) {
            debug!(id, "download finished for an item that was requeued");
            return;
        }
        info!(id, size = record.file_size, "download completed");
        self.persist().await;
        self.emit(QueueEvent::Completed {
            id: id.clone(),
            local_path: record.local_path.clone(),
        });
        self.track(
            AnalyticsEventKind::DownloadComplete,
            &record.message,
            Some(record.file_size),
        )
        .await;

        self.schedule_expiry(id);
    }

    /// 完成的项在宽限期后移出队列
    fn schedule_expiry(&self, id: String) {
        let tx = self.internal_tx.clone();
        let grace = self.config.completion_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Internal::Expire { id });
        });
    }

    /// 传输失败：可重试错误在上限内重新排队，其余标记为失败
    async fn fail_transfer(&mut self, id: String, err: Error) {
        let message = err.detailed_message();
        let retry_count = self.queue.get(&id).map_or(0, |item| item.retry_count);
        let max_retries = self.config.max_retries;

        // 不做跨错误的断点续传，下次从头开始
        self.discard_partial(&id).await;

        match err.retry_class() {
            Some(class) if retry_count < max_retries => {
                let delay = match class {
                    RetryClass::Tls => self.config.tls_retry_delay(),
                    RetryClass::Network => self.config.network_retry_delay(),
                };
                let attempt = self
                    .queue
                    .requeue_after_error(&id, message.clone())
                    .unwrap_or(retry_count + 1);
                self.backoff_until = Some(Instant::now() + delay);
                warn!(
                    id,
                    attempt,
                    max_retries,
                    ?class,
                    ?delay,
                    error = %message,
                    "transient download error, retrying"
                );
                self.persist().await;
                self.emit(QueueEvent::Retrying {
                    id,
                    attempt,
                    error: message,
                });
            }
            Some(_) => {
                let reason = format!("{message} (gave up after {max_retries} retries)");
                self.mark_failed(id, reason).await;
            }
            None => self.mark_failed(id, message).await,
        }
    }

    async fn mark_failed(&mut self, id: String, reason: String) {
        if !self.queue.fail(&id, reason.clone()) {
            return;
        }
        error!(id, error = %reason, "download failed");
        self.persist().await;
        if let Some(message) = self.queue.get(&id).map(|item| item.message.clone()) {
            self.track(AnalyticsEventKind::DownloadFailed, &message, None)
                .await;
        }
        self.emit(QueueEvent::Failed { id, error: reason });
    }

    async fn enqueue(&mut self, message: SermonMessage) -> EnqueueOutcome {
        let id = message.id.clone();
        let outcome = self.queue.enqueue(message.clone());
        match outcome {
            EnqueueOutcome::Added => {
                info!(id, title = %message.title, "added to download queue");
                self.persist().await;
                self.emit(QueueEvent::Added { id });
                self.track(AnalyticsEventKind::QueueAdd, &message, None)
                    .await;
            }
            EnqueueOutcome::Requeued => {
                info!(id, "failed download requeued");
                self.persist().await;
                self.emit(QueueEvent::Resumed { id });
            }
            EnqueueOutcome::AlreadyPresent => debug!(id, "already in download queue"),
        }
        outcome
    }

    async fn pause_current(&mut self) -> Option<String> {
        let active = self.active.as_ref()?;
        let id = active.id.clone();
        active.cancel.cancel();
        if self.queue.pause(&id) {
            info!(id, "download paused");
            self.persist().await;
            self.emit(QueueEvent::Paused { id: id.clone() });
        }
        Some(id)
    }

    /// 正在下载的项被移除时，取消传输，局部文件在传输结束后删除
    async fn remove(&mut self, id: &str) -> bool {
        let Some(item) = self.queue.remove(id) else {
            return false;
        };
        match &self.active {
            Some(active) if active.id == id => active.cancel.cancel(),
            _ if item.status != ItemStatus::Completed => self.discard_partial(id).await,
            _ => {}
        }
        info!(id, "removed from download queue");
        self.persist().await;
        self.emit(QueueEvent::Removed { id: id.to_string() });
        true
    }

    async fn on_network_change(&mut self, can_download: bool) {
        if can_download == self.can_download {
            return;
        }
        self.can_download = can_download;

        if can_download {
            let resumed = self.queue.resume_all();
            if !resumed.is_empty() {
                info!(count = resumed.len(), "network available, resuming downloads");
                self.persist().await;
            }
            for id in resumed {
                self.emit(QueueEvent::Resumed { id });
            }
        } else {
            if let Some(active) = &self.active {
                active.cancel.cancel();
            }
            let paused = self.queue.pause_all();
            if !paused.is_empty() {
                info!(count = paused.len(), "network unavailable, pausing downloads");
                self.persist().await;
            }
            for id in paused {
                self.emit(QueueEvent::Paused { id });
            }
        }
    }

    async fn stop(&mut self, internal: &mut mpsc::UnboundedReceiver<Internal>) {
        if let Some(active) = self.active.as_mut() {
            active.cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut active.handle)
                .await
                .is_err()
            {
                warn!(id = %active.id, "transfer did not stop in time");
                active.handle.abort();
            }
        }
        while let Ok(message) = internal.try_recv() {
            self.handle_internal(message).await;
        }
        self.persist().await;
        info!("download queue stopped");
    }

    async fn track(&self, kind: AnalyticsEventKind, message: &SermonMessage, file_size: Option<u64>) {
        let event = AnalyticsEvent {
            kind,
            message_id: message.id.clone(),
            series_id: message.series_id.clone(),
            network_type: self.monitor.cached_status().connection_type,
            wifi_only: self.settings.current().await.wifi_only,
            file_size,
        };
        if let Err(e) = self.analytics.record(&event) {
            warn!(error = %e, event = kind.name(), "analytics sink failed");
        }
    }

    async fn discard_partial(&self, id: &str) {
        if let Err(e) = self.downloader.discard_partial(id).await {
            warn!(id, error = %e, "failed to discard partial download");
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.queue.save(&*self.store).await {
            error!(error = %e, "failed to persist download queue");
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}
