use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Default, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub styles: StylesConfig,
    #[serde(default)]
    pub favicon: FaviconConfig,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_source")]
    pub source: PathBuf,
    #[serde(default = "default_build_root")]
    pub build_root: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct BuildConfig {
    /// 单个阶段的最长执行时间，未设置时不限制
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StylesConfig {
    #[serde(default = "default_include_paths")]
    pub include_paths: Vec<PathBuf>,
    /// 小于等于该字节数的本地资源会被内联为 data URI
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: u64,
    #[serde(default)]
    pub targets: BrowserTargets,
}

/// 前缀补全的浏览器最低版本（主版本号）
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserTargets {
    #[serde(default = "default_chrome")]
    pub chrome: u32,
    #[serde(default = "default_firefox")]
    pub firefox: u32,
    #[serde(default = "default_safari")]
    pub safari: u32,
    #[serde(default = "default_edge")]
    pub edge: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaviconConfig {
    #[serde(default = "default_favicon_sizes")]
    pub sizes: Vec<u32>,
}

impl SiteConfig {
    /// 读取项目根目录下的 kiln.toml，文件不存在时使用默认配置
    pub fn load(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("读取 {CONFIG_FILE} 失败：{}", e))?;
        let config: SiteConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("解析 {CONFIG_FILE} 失败：{}", e))?;
        Ok(config)
    }

    pub fn source_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.source)
    }

    pub fn build_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.build_root)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.build.stage_timeout_secs.map(Duration::from_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }
}

// 默认值函数
fn default_source() -> PathBuf { "src".into() }
fn default_build_root() -> PathBuf { "build".into() }
fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3000 }
fn default_log_level() -> String { "info".into() }
fn default_debounce_ms() -> u64 { 200 }
fn default_include_paths() -> Vec<PathBuf> { vec!["node_modules".into()] }
fn default_inline_max_bytes() -> u64 { 100 * 1024 }
fn default_chrome() -> u32 { 87 }
fn default_firefox() -> u32 { 78 }
fn default_safari() -> u32 { 14 }
fn default_edge() -> u32 { 88 }
fn default_favicon_sizes() -> Vec<u32> { vec![16, 24, 32, 48, 64] }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            build_root: default_build_root(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for StylesConfig {
    fn default() -> Self {
        Self {
            include_paths: default_include_paths(),
            inline_max_bytes: default_inline_max_bytes(),
            targets: BrowserTargets::default(),
        }
    }
}

impl Default for BrowserTargets {
    fn default() -> Self {
        Self {
            chrome: default_chrome(),
            firefox: default_firefox(),
            safari: default_safari(),
            edge: default_edge(),
        }
    }
}

impl Default for FaviconConfig {
    fn default() -> Self {
        Self {
            sizes: default_favicon_sizes(),
        }
    }
}
