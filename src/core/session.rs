//! 会话上下文与会话身份
//!
//! 会话 id、来源地址、语言等不再是全局变量，而是一个显式的值对象交给编排器；
//! 会话 id 在一段不活跃时间内保持稳定，超过窗口后轮换为新 id。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 编排器所需的会话上下文
#[derive(Clone, Debug, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    /// 来源网络地址；为空或 unknown 时不做跨会话聚合
    pub client_address: Option<String>,
    /// 客户端描述（UA 等）
    pub client_descriptor: Option<String>,
    pub language: String,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            client_address: None,
            client_descriptor: None,
            language: "spanish".to_string(),
        }
    }

    pub fn with_client(mut self, address: Option<String>, descriptor: Option<String>) -> Self {
        self.client_address = address;
        self.client_descriptor = descriptor;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

/// 会话身份：id + 最近活动时间
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub last_active: DateTime<Utc>,
}

impl SessionIdentity {
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self {
            session_id: format!("session_{}", uuid::Uuid::new_v4()),
            last_active: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, inactivity: Duration) -> bool {
        match chrono::Duration::from_std(inactivity) {
            Ok(window) => now - self.last_active > window,
            Err(_) => false,
        }
    }

    /// 未过期则续期并沿用，否则换新 id
    pub fn rotate_if_expired(self, now: DateTime<Utc>, inactivity: Duration) -> Self {
        if self.is_expired(now, inactivity) {
            tracing::info!("Session {} expired, rotating", self.session_id);
            Self::generate(now)
        } else {
            Self {
                last_active: now,
                ..self
            }
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active = now;
    }
}

/// 会话身份文件（JSON）
#[derive(Debug)]
pub struct IdentityFile {
    path: PathBuf,
}

impl IdentityFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<SessionIdentity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let identity = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(identity))
    }

    pub fn save(&self, identity: &SessionIdentity) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(identity)?)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// 读取（损坏则丢弃）→ 过期轮换 → 写回
    pub fn resume(&self, now: DateTime<Utc>, inactivity: Duration) -> anyhow::Result<SessionIdentity> {
        let existing = self.load().unwrap_or_else(|e| {
            tracing::warn!("Discarding unreadable session identity: {:#}", e);
            None
        });
        let identity = match existing {
            Some(identity) => identity.rotate_if_expired(now, inactivity),
            None => SessionIdentity::generate(now),
        };
        self.save(&identity)?;
        Ok(identity)
    }

    /// 记录一次活动并写回，不活跃窗口从这里重新计时
    pub fn touch(&self, identity: &mut SessionIdentity, now: DateTime<Utc>) -> anyhow::Result<()> {
        identity.touch(now);
        self.save(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_secs(30 * 60);

    #[test]
    fn test_rotation_after_inactivity() {
        let t0 = Utc::now();
        let identity = SessionIdentity::generate(t0);
        assert!(identity.session_id.starts_with("session_"));

        let kept = identity.clone().rotate_if_expired(t0 + chrono::Duration::minutes(10), WINDOW);
        assert_eq!(kept.session_id, identity.session_id);
        assert_eq!(kept.last_active, t0 + chrono::Duration::minutes(10));

        let rotated = kept.clone().rotate_if_expired(t0 + chrono::Duration::minutes(45), WINDOW);
        assert_ne!(rotated.session_id, identity.session_id);
    }

    #[test]
    fn test_identity_file_resume() {
        let dir = TempDir::new().unwrap();
        let file = IdentityFile::new(dir.path().join("nested").join("session.json"));
        let now = Utc::now();

        let first = file.resume(now, WINDOW).unwrap();
        let second = file.resume(now + chrono::Duration::minutes(1), WINDOW).unwrap();
        assert_eq!(first.session_id, second.session_id);

        std::fs::write(dir.path().join("nested").join("session.json"), "not json").unwrap();
        let third = file.resume(now, WINDOW).unwrap();
        assert_ne!(third.session_id, first.session_id);
    }

    #[test]
    fn test_activity_extends_identity() {
        let dir = TempDir::new().unwrap();
        let file = IdentityFile::new(dir.path().join("session.json"));
        let t0 = Utc::now();

        let mut identity = file.resume(t0, WINDOW).unwrap();
        file.touch(&mut identity, t0 + chrono::Duration::minutes(25)).unwrap();

        // 距启动 40 分钟，但距最后一次活动只有 15 分钟
        let resumed = file.resume(t0 + chrono::Duration::minutes(40), WINDOW).unwrap();
        assert_eq!(resumed.session_id, identity.session_id);

        let idle = file.resume(t0 + chrono::Duration::minutes(80), WINDOW).unwrap();
        assert_ne!(idle.session_id, identity.session_id);
    }
}
