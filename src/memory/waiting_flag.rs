//! 等待标志持久化
//!
//! 「长时间搜索进行中」是唯一需要跨重载保存的状态：按会话 ID 命名空间存成一个小的 JSON 键值文件，
//! 组件挂载时读取以恢复 AwaitingCallback。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

/// 持久化键：`waiting_for_callback:<session_id>`
pub fn waiting_flag_key(session_id: &str) -> String {
    format!("waiting_for_callback:{}", session_id)
}

/// 等待标志存储接口
#[async_trait]
pub trait WaitingFlagStore: Send + Sync {
    async fn get(&self, session_id: &str) -> anyhow::Result<bool>;
    async fn set(&self, session_id: &str, waiting: bool) -> anyhow::Result<()>;
}

/// 文件持久化：单文件 JSON 对象，只保存为 true 的键
#[derive(Debug)]
pub struct FileWaitingFlags {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWaitingFlags {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// 文件不存在时返回空表
    async fn load(&self) -> anyhow::Result<BTreeMap<String, bool>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("Malformed waiting flags file {:?}", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", self.path)),
        }
    }

    async fn save(&self, flags: &BTreeMap<String, bool>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(flags)?)
            .await
            .with_context(|| format!("Failed to write {:?}", self.path))
    }
}

#[async_trait]
impl WaitingFlagStore for FileWaitingFlags {
    async fn get(&self, session_id: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let flags = self.load().await?;
        Ok(flags
            .get(&waiting_flag_key(session_id))
            .copied()
            .unwrap_or(false))
    }

    async fn set(&self, session_id: &str, waiting: bool) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut flags = self.load().await?;
        let key = waiting_flag_key(session_id);
        if waiting {
            flags.insert(key, true);
        } else if flags.remove(&key).is_none() {
            return Ok(());
        }
        self.save(&flags).await
    }
}

/// 内存版（测试用，不跨进程）
#[derive(Debug, Default)]
pub struct MemoryWaitingFlags {
    flags: RwLock<HashMap<String, bool>>,
}

impl MemoryWaitingFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitingFlagStore for MemoryWaitingFlags {
    async fn get(&self, session_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .flags
            .read()
            .await
            .get(&waiting_flag_key(session_id))
            .copied()
            .unwrap_or(false))
    }

    async fn set(&self, session_id: &str, waiting: bool) -> anyhow::Result<()> {
        let mut flags = self.flags.write().await;
        if waiting {
            flags.insert(waiting_flag_key(session_id), true);
        } else {
            flags.remove(&waiting_flag_key(session_id));
        }
        Ok(())
    }
}
