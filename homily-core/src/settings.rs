use crate::{
    error::Result,
    state::{KeyValueStore, load_json, save_json},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 用户设置的存储键
pub const SETTINGS_KEY: &str = "user_settings";

/// 用户下载设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// 仅在 WiFi 下下载
    pub wifi_only: bool,
    /// 存储上限（字节），None 表示不限制
    pub storage_limit: Option<u64>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            wifi_only: true,
            storage_limit: None,
        }
    }
}

impl UserSettings {
    /// 读取保存的设置，从未保存过时使用默认值
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        Ok(load_json(store, SETTINGS_KEY).await?.unwrap_or_default())
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, SETTINGS_KEY, self).await
    }
}

/// 设置来源
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn current(&self) -> UserSettings;
}

/// 内存中共享的设置
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<UserSettings>>,
}

impl SharedSettings {
    pub fn new(settings: UserSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// 修改设置。修改 `wifi_only` 后应调用 `NetworkMonitor::refresh` 重新计算下载许可
    pub async fn update(&self, f: impl FnOnce(&mut UserSettings)) -> UserSettings {
        let mut settings = self.inner.write().await;
        f(&mut settings);
        settings.clone()
    }
}

#[async_trait]
impl SettingsProvider for SharedSettings {
    async fn current(&self) -> UserSettings {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FileStore, MemoryStore};

    #[tokio::test]
    async fn test_load_missing_returns_default() -> Result<()> {
        let settings = UserSettings::load(&MemoryStore::new()).await?;
        assert_eq!(settings, UserSettings::default());
        assert!(settings.wifi_only);
        Ok(())
    }

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = UserSettings {
            wifi_only: false,
            storage_limit: Some(1024),
        };
        settings.save(&FileStore::open(dir.path()).await?).await?;

        let reopened = FileStore::open(dir.path()).await?;
        assert_eq!(UserSettings::load(&reopened).await?, settings);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_settings_fill_defaults() -> Result<()> {
        let store = MemoryStore::new();
        store.set(SETTINGS_KEY, r#"{"storage_limit": 2048}"#).await?;
        let settings = UserSettings::load(&store).await?;
        assert!(settings.wifi_only);
        assert_eq!(settings.storage_limit, Some(2048));
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_update() {
        let shared = SharedSettings::default();
        shared.update(|s| s.storage_limit = Some(10)).await;
        assert_eq!(shared.current().await.storage_limit, Some(10));
    }
}
