//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ARCHI__*` 覆盖（双下划线表示嵌套，如 `ARCHI__SECURITY__HIGH_THRESHOLD=0.8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub learning: LearningSection,
    #[serde(default)]
    pub api: ApiSection,
}

/// [app] 段：实例名、数据目录、规划超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 审计日志等持久化文件的根目录，未设置时用 ./data
    pub data_root: Option<PathBuf>,
    /// 等待 Memory 上下文的超时（毫秒），超时后以空上下文降级继续
    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,
}

fn default_context_timeout_ms() -> u64 {
    2_000
}

/// [security] 段：风险阈值与确认令牌时限
///
/// 阈值刻意做成可调参数而非硬编码不变量。
#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySection {
    /// 低于该值自动放行
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// 达到该值直接拒绝
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    /// 确认令牌有效期（秒），过期后任务以 ConfirmationTimeout 失败
    #[serde(default = "default_confirmation_ttl_secs")]
    pub confirmation_ttl_secs: u64,
}

fn default_low_threshold() -> f64 {
    0.3
}

fn default_high_threshold() -> f64 {
    0.75
}

fn default_confirmation_ttl_secs() -> u64 {
    120
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
            confirmation_ttl_secs: default_confirmation_ttl_secs(),
        }
    }
}

/// [execution] 段：重试、回退、并发与租约
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    /// 默认单步最大尝试次数（Step 未指定 retryPolicy 时）
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// 指数退避基数（毫秒）：第 n 次重试前等待 base * 2^(n-1)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 单个任务内并行安全 Step 的并发上限
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// 任务租约 TTL（毫秒），非终态期间定期续约
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// 单步执行超时（毫秒），超时记为 TIMEOUT 结果
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// 每个任务允许的最大 Plan 版本数（1 = 不自动重规划）
    #[serde(default = "default_max_plan_versions")]
    pub max_plan_versions: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_max_plan_versions() -> u32 {
    2
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_parallel_steps: default_max_parallel_steps(),
            lease_ttl_ms: default_lease_ttl_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            max_plan_versions: default_max_plan_versions(),
        }
    }
}

/// [memory] 段：检索排序权重与时间衰减
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 时间衰减半衰期（秒）：elapsed = half_life 时新鲜度降为 0.5
    #[serde(default = "default_recency_half_life_secs")]
    pub recency_half_life_secs: u64,
    /// 词项匹配权重
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
    /// 新鲜度权重
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    /// 图中心性权重
    #[serde(default = "default_centrality_weight")]
    pub centrality_weight: f64,
}

fn default_recency_half_life_secs() -> u64 {
    86_400
}

fn default_relevance_weight() -> f64 {
    1.0
}

fn default_recency_weight() -> f64 {
    0.5
}

fn default_centrality_weight() -> f64 {
    0.3
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            recency_half_life_secs: default_recency_half_life_secs(),
            relevance_weight: default_relevance_weight(),
            recency_weight: default_recency_weight(),
            centrality_weight: default_centrality_weight(),
        }
    }
}

/// [learning] 段：EMA 平滑与修订窗口
#[derive(Debug, Clone, Deserialize)]
pub struct LearningSection {
    /// EMA 平滑系数 alpha（新观测占比）
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// 同一类别两次权重修订的最小间隔（毫秒），防单点异常震荡
    #[serde(default = "default_revision_window_ms")]
    pub revision_window_ms: u64,
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_revision_window_ms() -> u64 {
    60_000
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            revision_window_ms: default_revision_window_ms(),
        }
    }
}

/// [api] 段：HTTP 监听地址与健康探针
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// 最近处理活动超过该时限（毫秒）未更新时，/health 上报 degraded
    #[serde(default = "default_health_stale_after_ms")]
    pub health_stale_after_ms: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8600".to_string()
}

fn default_health_stale_after_ms() -> u64 {
    60_000
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            health_stale_after_ms: default_health_stale_after_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            security: SecuritySection::default(),
            execution: ExecutionSection::default(),
            memory: MemorySection::default(),
            learning: LearningSection::default(),
            api: ApiSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ARCHI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ARCHI__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("ARCHI")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds_ordered() {
        let cfg = AppConfig::default();
        assert!(cfg.security.low_threshold < cfg.security.high_threshold);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("ARCHI__SECURITY__HIGH_THRESHOLD", "0.9");
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.security.high_threshold, 0.9);
        std::env::remove_var("ARCHI__SECURITY__HIGH_THRESHOLD");
    }
}
