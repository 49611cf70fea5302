pub mod copy;
pub mod favicon;
pub mod images;
pub mod scripts;
pub mod styles;
pub mod templates;

use crate::config::{FaviconConfig, StylesConfig};
use crate::profile::ProfileName;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 六个互相独立的转换阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Copy,
    Templates,
    Styles,
    Scripts,
    Favicon,
    Images,
}

impl StageId {
    pub const ALL: [StageId; 6] = [
        Self::Copy,
        Self::Templates,
        Self::Styles,
        Self::Scripts,
        Self::Favicon,
        Self::Images,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Templates => "templates",
            Self::Styles => "styles",
            Self::Scripts => "scripts",
            Self::Favicon => "favicon",
            Self::Images => "images",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段运行时所需的全部输入，构建期间只读
#[derive(Debug, Clone)]
pub struct StageContext {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub profile: ProfileName,
    pub debug: bool,
    pub started_at: DateTime<Local>,
    pub styles: StylesConfig,
    pub favicon: FaviconConfig,
    pub cancel: CancelFlag,
}

/// 阶段取消标记；阶段在处理每个文件前检查，被取消后不再写入输出目录
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("阶段已取消");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    /// 写入输出目录的文件数
    pub artifacts: usize,
}

/// 执行单个阶段（阻塞调用，由调用方放到 blocking 线程池）
pub fn run_stage(stage: StageId, ctx: &StageContext) -> Result<StageReport> {
    match stage {
        StageId::Copy => copy::run(ctx),
        StageId::Templates => templates::run(ctx),
        StageId::Styles => styles::run(ctx),
        StageId::Scripts => scripts::run(ctx),
        StageId::Favicon => favicon::run(ctx),
        StageId::Images => images::run(ctx),
    }
}

/// 按 glob 收集 `base` 下的源文件，结果去重排序；`base` 不存在时返回空列表
pub(crate) fn collect_sources(base: &Path, patterns: &[&str]) -> Result<Vec<PathBuf>> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }
    let root = glob::Pattern::escape(&base.to_string_lossy());
    let mut files = Vec::new();
    for pattern in patterns {
        let full = format!("{root}/{pattern}");
        for entry in glob::glob(&full).with_context(|| format!("无效的匹配模式：{full}"))? {
            let path = entry?;
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// 源文件相对于匹配根目录的路径，用于保持输出目录结构
pub(crate) fn relative_to<'a>(base: &Path, path: &'a Path) -> Result<&'a Path> {
    path.strip_prefix(base)
        .with_context(|| format!("{} 不在 {} 下", path.display(), base.display()))
}

/// 把 `name.ext` 改写为 `name<suffix>.<new_ext>`
pub(crate) fn rename(rel: &Path, suffix: &str, ext: &str) -> PathBuf {
    let stem = rel
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    rel.with_file_name(format!("{stem}{suffix}.{ext}"))
}

pub(crate) fn write_output(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("创建目录 {} 失败", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("写入 {} 失败", path.display()))?;
    tracing::debug!("已写入：{}", path.display());
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::SiteConfig;

    pub fn context(root: &Path, profile: ProfileName) -> StageContext {
        let config = SiteConfig::default();
        StageContext {
            source: root.join("src"),
            destination: root.join("build").join(profile.as_str()),
            profile,
            debug: profile.debug(),
            started_at: Local::now(),
            styles: config.styles,
            favicon: config.favicon,
            cancel: CancelFlag::default(),
        }
    }

    pub fn write(root: &Path, rel: &str, contents: impl AsRef<[u8]>) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128, 255])
        });
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn collects_matching_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "js/app.js", "");
        fixtures::write(dir.path(), "js/lib/util.js", "");
        fixtures::write(dir.path(), "js/readme.md", "");

        let base = dir.path().join("js");
        let files = collect_sources(&base, &["**/*.js"]).unwrap();
        let rel: Vec<_> = files.iter().map(|f| relative_to(&base, f).unwrap().to_path_buf()).collect();
        assert_eq!(rel, vec![PathBuf::from("app.js"), PathBuf::from("lib/util.js")]);
    }

    #[test]
    fn missing_base_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_sources(&dir.path().join("nope"), &["**/*"]).unwrap().is_empty());
    }

    #[test]
    fn rename_adds_suffix_and_extension() {
        assert_eq!(rename(Path::new("lib/app.js"), ".min", "js"), PathBuf::from("lib/app.min.js"));
        assert_eq!(rename(Path::new("main.scss"), ".min", "css"), PathBuf::from("main.min.css"));
        assert_eq!(rename(Path::new("page/about.ejs"), "", "html"), PathBuf::from("page/about.html"));
    }
}
