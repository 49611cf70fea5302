use crate::build::stages::{CancelFlag, StageContext, StageReport};
use anyhow::{Context, Result};
use std::path::Path;

/// 原样复制 copy/ 目录到输出根目录
pub fn run(ctx: &StageContext) -> Result<StageReport> {
    let src = ctx.source.join("copy");
    if !src.is_dir() {
        tracing::debug!("无 copy 目录，跳过");
        return Ok(StageReport::default());
    }
    let copied = copy_dir_recursive(&src, &ctx.destination, &ctx.cancel)?;
    tracing::info!("已复制 {copied} 个文件");
    Ok(StageReport { artifacts: copied })
}

fn copy_dir_recursive(src: &Path, dest: &Path, cancel: &CancelFlag) -> Result<usize> {
    std::fs::create_dir_all(dest).with_context(|| format!("创建目录 {} 失败", dest.display()))?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        cancel.check()?;
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if src_path.is_dir() {
            copied += copy_dir_recursive(&src_path, &dest_path, cancel)?;
        } else {
            std::fs::copy(&src_path, &dest_path)
                .with_context(|| format!("复制 {} 失败", src_path.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
