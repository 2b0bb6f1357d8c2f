use crate::{
    config::DownloaderConfig,
    error::{Error, Result},
    records::DownloadRecords,
    state::{KeyValueStore, escape_name},
    types::{
        DownloadedMessage, QueueItem, ResumeDescriptor, SermonMessage, TransferOutcome,
        TransferProgress, Validator,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use fs_err::tokio as fs;
use futures::StreamExt;
use reqwest::{
    Client, StatusCode,
    header::{CONTENT_RANGE, HeaderMap, IF_RANGE, RANGE},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 进度回调
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// 队列处理器使用的下载接口
#[async_trait]
pub trait SermonDownloader: Send + Sync {
    /// 下载一个队列项；取消时返回 `TransferOutcome::Paused`
    async fn download(
        &self,
        item: &QueueItem,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome>;

    /// 删除未完成的局部文件
    async fn discard_partial(&self, message_id: &str) -> Result<()>;

    /// 已占用的存储空间（字节）
    async fn total_downloads_size(&self) -> Result<u64>;
}

/// 讲道音频下载管理器
///
/// 独占下载目录，每个讲道对应一个由标识符决定的文件名。
/// 传输过程写入 `.part` 文件，完成后重命名，因此目标文件存在即表示下载完整。
#[derive(Clone)]
pub struct DownloadManager {
    client: Client,
    config: DownloaderConfig,
    records: DownloadRecords,
}

impl DownloadManager {
    /// 创建下载管理器
    ///
    /// # 参数
    /// * `config` - 下载器配置
    /// * `store` - 保存下载记录的键值存储
    pub fn new(config: DownloaderConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut builder = Client::builder()
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            config,
            records: DownloadRecords::new(store),
        })
    }

    pub fn records(&self) -> &DownloadRecords {
        &self.records
    }

    pub fn download_dir(&self) -> &Path {
        &self.config.download_dir
    }

    /// 讲道音频的本地路径
    pub fn file_path(&self, message_id: &str) -> PathBuf {
        self.config.download_dir.join(format!(
            "{}.{}",
            escape_name(message_id),
            self.config.file_extension
        ))
    }

    fn partial_path(&self, message_id: &str) -> PathBuf {
        self.config.download_dir.join(format!(
            "{}.{}.part",
            escape_name(message_id),
            self.config.file_extension
        ))
    }

    /// 确保下载目录存在
    pub async fn ensure_download_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.config.download_dir).await?;
        Ok(())
    }

    /// 下载讲道音频
    ///
    /// 本地已有文件时直接返回；否则流式写入磁盘，每收到一块数据调用一次 `progress`。
    /// 带有续传状态时从上次的偏移量继续，服务器不支持时从头开始。
    #[instrument(skip_all, fields(id = %item.message.id))]
    pub async fn download_sermon(
        &self,
        item: &QueueItem,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        let message = &item.message;
        let url = message
            .audio_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::MissingUrl(message.id.clone()))?;

        self.ensure_download_directory().await?;

        let dest = self.file_path(&message.id);
        if dest.exists() {
            debug!("already on disk, skipping transfer");
            let record = self.record_completed(message, dest).await?;
            progress(TransferProgress {
                bytes_written: record.file_size,
                bytes_expected: Some(record.file_size),
            });
            return Ok(TransferOutcome::Completed(record));
        }

        // 没有校验值时无法确认服务器文件未变，只能从头下载
        let partial = self.partial_path(&message.id);
        let mut resume = match &item.resume {
            Some(resume) if resume.offset > 0 && resume.validator.is_some() => match fs::metadata(&partial).await {
                Ok(meta) if meta.len() >= resume.offset => Some(resume.clone()),
                _ => None,
            },
            _ => None,
        };

        let response = loop {
            let mut request = self.client.get(url);
            if let Some(resume) = &resume {
                request = request.header(RANGE, format!("bytes={}-", resume.offset));
                if let Some(validator) = &resume.validator {
                    request = request.header(IF_RANGE, validator.header_value());
                }
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(TransferOutcome::Paused(resume.unwrap_or(ResumeDescriptor {
                        offset: 0,
                        validator: None,
                    })));
                }
                response = request.send() => response?,
            };

            // 续传偏移量已失效，从头下载
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && resume.is_some() {
                warn!("server rejected resume range, restarting");
                resume = None;
                continue;
            }
            if response.status() == StatusCode::PARTIAL_CONTENT
                && let Some(requested) = &resume
                && content_range_start(response.headers()) != Some(requested.offset)
            {
                warn!(offset = requested.offset, "partial response does not start at resume offset, restarting");
                resume = None;
                continue;
            }
            break response;
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let (offset, previous_validator) = match resume {
            Some(resume) if status == StatusCode::PARTIAL_CONTENT => (resume.offset, resume.validator),
            _ => (0, None),
        };
        let validator = Validator::from_headers(response.headers()).or(previous_validator);
        let expected = response.content_length().map(|len| len + offset);
        if offset > 0 {
            info!(offset, "resuming transfer");
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial)
            .await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written = offset;
        progress(TransferProgress {
            bytes_written: written,
            bytes_expected: expected,
        });

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    info!(offset = written, "transfer paused");
                    return Ok(TransferOutcome::Paused(ResumeDescriptor {
                        offset: written,
                        validator,
                    }));
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;

            written += chunk.len() as u64;
            progress(TransferProgress {
                bytes_written: written,
                bytes_expected: expected,
            });
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = expected
            && written < expected
        {
            return Err(Error::Truncated {
                expected,
                received: written,
            });
        }

        fs::rename(&partial, &dest).await?;
        let record = self.record_completed(message, dest).await?;
        info!(size = record.file_size, "download finished");
        Ok(TransferOutcome::Completed(record))
    }

    async fn record_completed(&self, message: &SermonMessage, path: PathBuf) -> Result<DownloadedMessage> {
        let file_size = fs::metadata(&path).await?.len();
        let downloaded_at = match self.records.get(&message.id).await? {
            Some(existing) if existing.local_path == path => existing.downloaded_at,
            _ => Utc::now(),
        };
        let record = DownloadedMessage {
            message: message.clone(),
            local_path: path,
            downloaded_at,
            file_size,
        };
        self.records.save(&record).await?;
        Ok(record)
    }

    /// 删除下载文件和记录，文件不存在时不报错
    pub async fn delete_download(&self, message_id: &str) -> Result<()> {
        remove_if_exists(&self.file_path(message_id)).await?;
        remove_if_exists(&self.partial_path(message_id)).await?;
        self.records.remove(message_id).await?;
        Ok(())
    }

    /// 删除局部文件
    pub async fn discard_partial(&self, message_id: &str) -> Result<()> {
        if remove_if_exists(&self.partial_path(message_id)).await? {
            debug!(id = message_id, "discarded partial file");
        }
        Ok(())
    }

    /// 单个下载的文件大小，未下载时返回 None
    pub async fn get_download_size(&self, message_id: &str) -> Result<Option<u64>> {
        match fs::metadata(self.file_path(message_id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 下载目录中所有文件的总大小
    pub async fn get_total_downloads_size(&self) -> Result<u64> {
        if !self.config.download_dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        let mut entries = fs::read_dir(&self.config.download_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// 从最早的下载开始删除，直到总大小不超过 `target_size`，返回删除数量
    pub async fn free_up_space(&self, target_size: u64) -> Result<usize> {
        let mut total = self.get_total_downloads_size().await?;
        let mut deleted = 0;
        for record in self.records.oldest_first().await? {
            if total <= target_size {
                break;
            }
            let id = &record.message.id;
            let size = self
                .get_download_size(id)
                .await?
                .unwrap_or(record.file_size);
            self.delete_download(id).await?;
            total = total.saturating_sub(size);
            deleted += 1;
            info!(id = %id, size, "evicted download");
        }
        Ok(deleted)
    }

    /// 是否已下载到本地
    pub async fn is_downloaded(&self, message_id: &str) -> Result<bool> {
        Ok(self.records.contains(message_id).await? && self.file_path(message_id).exists())
    }

    /// 所有已下载的讲道
    pub async fn list_downloads(&self) -> Result<Vec<DownloadedMessage>> {
        self.records.list().await
    }
}

/// 解析 `Content-Range: bytes <start>-<end>/<total>` 的起始位置
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SermonDownloader for DownloadManager {
    async fn download(
        &self,
        item: &QueueItem,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        self.download_sermon(item, progress, cancel).await
    }

    async fn discard_partial(&self, message_id: &str) -> Result<()> {
        DownloadManager::discard_partial(self, message_id).await
    }

    async fn total_downloads_size(&self) -> Result<u64> {
        self.get_total_downloads_size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn serve(dir: &Path) -> String {
        let app = axum::Router::new().fallback_service(tower_http::services::ServeDir::new(dir));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    struct Fixture {
        _files: TempDir,
        downloads: TempDir,
        base_url: String,
        manager: DownloadManager,
    }

    async fn fixture(files: &[(&str, &[u8])]) -> Fixture {
        let served = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(served.path().join(name), content).await.unwrap();
        }
        let base_url = serve(served.path()).await;
        let downloads = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(
            DownloaderConfig::new(downloads.path().join("sermons")),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        Fixture {
            _files: served,
            downloads,
            base_url,
            manager,
        }
    }

    fn item(id: &str, url: &str) -> QueueItem {
        QueueItem::new(SermonMessage::new(id, "Grace Abounds", url))
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<TransferProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            Box::new(move |p: TransferProgress| sink.lock().unwrap().push(p)),
            seen,
        )
    }

    #[tokio::test]
    async fn test_download_writes_file_and_record() -> Result<()> {
        let content = body(300 * 1024);
        let fx = fixture(&[("a.mp3", content.as_slice())]).await;
        let (progress, seen) = recorder();

        let outcome = fx
            .manager
            .download_sermon(
                &item("msg-1", &format!("{}/a.mp3", fx.base_url)),
                progress,
                CancellationToken::new(),
            )
            .await?;

        let TransferOutcome::Completed(record) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(record.file_size, content.len() as u64);
        assert_eq!(record.local_path, fx.manager.file_path("msg-1"));
        assert_eq!(fs::read(&record.local_path).await?, content);
        assert!(!fx.manager.partial_path("msg-1").exists());
        assert!(fx.manager.is_downloaded("msg-1").await?);

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.fraction(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0].bytes_written <= w[1].bytes_written));
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits() -> Result<()> {
        let fx = fixture(&[]).await;
        fx.manager.ensure_download_directory().await?;
        fs::write(fx.manager.file_path("msg-2"), b"cached").await?;
        let (progress, _) = recorder();

        // 端口 9 上没有服务，若发起请求会失败
        let outcome = fx
            .manager
            .download_sermon(&item("msg-2", "http://127.0.0.1:9/a.mp3"), progress, CancellationToken::new())
            .await?;
        match outcome {
            TransferOutcome::Completed(record) => assert_eq!(record.file_size, 6),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_permanent_errors() {
        let fx = fixture(&[]).await;
        let mut no_url = item("msg-3", "");
        no_url.message.audio_url = None;
        let (progress, _) = recorder();
        let err = fx
            .manager
            .download_sermon(&no_url, progress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingUrl(_)));

        let (progress, _) = recorder();
        let err = fx
            .manager
            .download_sermon(
                &item("msg-3", &format!("{}/missing.mp3", fx.base_url)),
                progress,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status, .. } if status == StatusCode::NOT_FOUND));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_resume_from_partial() -> Result<()> {
        let content = body(64 * 1024);
        let fx = fixture(&[("b.mp3", content.as_slice())]).await;
        fx.manager.ensure_download_directory().await?;
        fs::write(fx.manager.partial_path("msg-4"), &content[..1000]).await?;

        let url = format!("{}/b.mp3", fx.base_url);
        let validator = Validator::from_headers(reqwest::get(&url).await?.headers());
        assert!(validator.is_some());
        let mut queued = item("msg-4", &url);
        queued.resume = Some(ResumeDescriptor {
            offset: 1000,
            validator,
        });
        let (progress, seen) = recorder();
        let outcome = fx
            .manager
            .download_sermon(&queued, progress, CancellationToken::new())
            .await?;

        assert!(matches!(outcome, TransferOutcome::Completed(_)));
        assert_eq!(fs::read(fx.manager.file_path("msg-4")).await?, content);
        assert_eq!(seen.lock().unwrap()[0].bytes_written, 1000);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_without_validator_restarts() -> Result<()> {
        let content = body(64 * 1024);
        let fx = fixture(&[("b.mp3", content.as_slice())]).await;
        fx.manager.ensure_download_directory().await?;
        // 旧的部分文件内容与服务器不同
        fs::write(fx.manager.partial_path("msg-6"), vec![0xAA; 1000]).await?;

        let mut queued = item("msg-6", &format!("{}/b.mp3", fx.base_url));
        queued.resume = Some(ResumeDescriptor {
            offset: 1000,
            validator: None,
        });
        let (progress, seen) = recorder();
        let outcome = fx
            .manager
            .download_sermon(&queued, progress, CancellationToken::new())
            .await?;

        assert!(matches!(outcome, TransferOutcome::Completed(_)));
        assert_eq!(fs::read(fx.manager.file_path("msg-6")).await?, content);
        assert_eq!(seen.lock().unwrap()[0].bytes_written, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_misaligned_partial_response_restarts() -> Result<()> {
        use axum::http::{
            HeaderMap as RequestHeaders, StatusCode as Status,
            header::{CONTENT_RANGE, ETAG, RANGE},
        };

        let content = body(32 * 1024);
        let served = content.clone();
        // 无视请求的偏移量，206 响应总是从 0 开始
        let app = axum::Router::new().route(
            "/d.mp3",
            axum::routing::get(move |headers: RequestHeaders| {
                let content = served.clone();
                async move {
                    let len = content.len();
                    if headers.contains_key(RANGE) {
                        (
                            Status::PARTIAL_CONTENT,
                            [(CONTENT_RANGE, format!("bytes 0-{}/{len}", len - 1))],
                            content,
                        )
                    } else {
                        (Status::OK, [(ETAG, "\"v1\"".to_string())], content)
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let fx = fixture(&[]).await;
        fx.manager.ensure_download_directory().await?;
        fs::write(fx.manager.partial_path("msg-7"), &content[..1000]).await?;

        let mut queued = item("msg-7", &format!("http://{addr}/d.mp3"));
        queued.resume = Some(ResumeDescriptor {
            offset: 1000,
            validator: Some(Validator::ETag("\"v1\"".to_string())),
        });
        let (progress, seen) = recorder();
        let outcome = fx
            .manager
            .download_sermon(&queued, progress, CancellationToken::new())
            .await?;

        let TransferOutcome::Completed(record) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(record.file_size, content.len() as u64);
        assert_eq!(fs::read(fx.manager.file_path("msg-7")).await?, content);
        assert_eq!(seen.lock().unwrap()[0].bytes_written, 0);
        Ok(())
    }

    #[test]
    fn test_content_range_start() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_start(&headers), None);
        headers.insert(CONTENT_RANGE, "bytes 512-1023/2048".parse().unwrap());
        assert_eq!(content_range_start(&headers), Some(512));
        headers.insert(CONTENT_RANGE, "bytes */2048".parse().unwrap());
        assert_eq!(content_range_start(&headers), None);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_for_resume() -> Result<()> {
        let content = body(2 * 1024 * 1024);
        let fx = fixture(&[("c.mp3", content.as_slice())]).await;
        let url = format!("{}/c.mp3", fx.base_url);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let outcome = fx
            .manager
            .download_sermon(
                &item("msg-5", &url),
                Box::new(move |p: TransferProgress| {
                    if p.bytes_written > 0 {
                        trigger.cancel();
                    }
                }),
                cancel,
            )
            .await?;
        let TransferOutcome::Paused(resume) = outcome else {
            panic!("expected pause, got {outcome:?}");
        };
        assert!(resume.offset > 0);
        assert_eq!(
            fs::metadata(fx.manager.partial_path("msg-5")).await?.len(),
            resume.offset
        );
        assert!(!fx.manager.file_path("msg-5").exists());

        let mut paused = item("msg-5", &url);
        paused.resume = Some(resume);
        let (progress, _) = recorder();
        let outcome = fx
            .manager
            .download_sermon(&paused, progress, CancellationToken::new())
            .await?;
        assert!(matches!(outcome, TransferOutcome::Completed(_)));
        assert_eq!(fs::read(fx.manager.file_path("msg-5")).await?, content);
        Ok(())
    }

    #[tokio::test]
    async fn test_sizes_delete_and_free_up_space() -> Result<()> {
        let fx = fixture(&[]).await;
        fx.manager.ensure_download_directory().await?;
        for (age, id) in [(3, "old"), (2, "mid"), (1, "new")] {
            let path = fx.manager.file_path(id);
            fs::write(&path, vec![0u8; 100]).await?;
            fx.manager
                .records()
                .save(&DownloadedMessage {
                    message: SermonMessage::new(id, id, "https://cdn.example.org/x.mp3"),
                    local_path: path,
                    downloaded_at: Utc::now() - chrono::Duration::days(age),
                    file_size: 100,
                })
                .await?;
        }
        assert_eq!(fx.manager.get_total_downloads_size().await?, 300);
        assert_eq!(fx.manager.get_download_size("mid").await?, Some(100));
        assert_eq!(fx.manager.get_download_size("none").await?, None);

        assert_eq!(fx.manager.free_up_space(150).await?, 2);
        let left: Vec<_> = fx
            .manager
            .list_downloads()
            .await?
            .into_iter()
            .map(|r| r.message.id)
            .collect();
        assert_eq!(left, ["new"]);
        assert_eq!(fx.manager.free_up_space(1000).await?, 0);

        fx.manager.delete_download("new").await?;
        fx.manager.delete_download("new").await?;
        assert_eq!(fx.manager.get_total_downloads_size().await?, 0);
        assert!(fx.downloads.path().join("sermons").exists());
        Ok(())
    }
}
