//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RUNNER__MAX_CONCURRENCY=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub admission: AdmissionSection,
    pub runner: RunnerSection,
    pub memory: MemorySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [admission] 段：去重窗口与历史上限
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    /// 已完成结果可被复用的时间窗口（毫秒）
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// 敏感动作近似重复需要确认的窗口（毫秒）
    #[serde(default = "default_confirm_window_ms")]
    pub confirm_window_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_window_ms() -> u64 {
    5_000
}

fn default_confirm_window_ms() -> u64 {
    30_000
}

fn default_max_entries() -> usize {
    1024
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            confirm_window_ms: default_confirm_window_ms(),
            max_entries: default_max_entries(),
        }
    }
}

/// [runner] 段：并发槽位、空闲 lane 回收、默认重试
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// lane 空闲多少秒后回收
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_lane_idle_secs() -> u64 {
    60
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            lane_idle_secs: default_lane_idle_secs(),
            retry: RetrySection::default(),
        }
    }
}

/// [runner.retry] 段：动作未声明重试策略时使用
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// [memory] 段：上下文实例 LRU 容量与持久化目录
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// 未设置时使用进程内存储（重启即丢失）
    pub store_dir: Option<PathBuf>,
}

fn default_cache_capacity() -> usize {
    256
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            store_dir: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
