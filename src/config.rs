//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HOGAR__*` 覆盖（双下划线表示嵌套，如 `HOGAR__WORKER__ENDPOINT=http://...`）。
//! 所有段都有默认值，`AppConfig::default()` 不依赖任何文件。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub worker: WorkerSection,
    pub delivery: DeliverySection,
    pub store: StoreSection,
    pub persistence: PersistenceSection,
}

/// [app] 段：对话语言、会话不活跃轮换窗口、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 随每次请求发送的语言标识
    pub language: String,
    /// 超过该时长无活动则换新会话 id
    pub session_inactivity_secs: u64,
    /// 会话身份文件、等待标志文件所在目录
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            language: "spanish".to_string(),
            session_inactivity_secs: 60 * 60,
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// [worker] 段：外发请求端点与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// 为空时使用本地 Mock worker
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            request_timeout_secs: 60,
        }
    }
}

/// [delivery] 段：轮询、结果补全、去重
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub poll_interval_secs: u64,
    pub results_page_size: usize,
    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,
    /// 实时推送服务地址（需 realtime feature）；未设置则仅轮询
    pub realtime_url: Option<String>,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            results_page_size: 20,
            dedup_capacity: 512,
            dedup_ttl_secs: 600,
            realtime_url: None,
        }
    }
}

/// [store] 段：SQLite 路径；未设置时使用内存存储
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub database_path: Option<PathBuf>,
}

/// [persistence] 段：消息回写去抖
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub debounce_ms: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

/// 加载配置：config/default.toml（可选）→ 指定文件（可选）→ HOGAR__* 环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HOGAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
