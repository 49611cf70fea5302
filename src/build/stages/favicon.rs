use crate::build::stages::{StageContext, StageReport, write_output};
use anyhow::{Context, Result, bail};
use image::codecs::ico::{IcoEncoder, IcoFrame};
use image::imageops::FilterType;
use image::ExtendedColorType;

/// 由 favicon.png 生成包含多种尺寸的 favicon.ico
pub fn run(ctx: &StageContext) -> Result<StageReport> {
    let source = ctx.source.join("favicon.png");
    if !source.is_file() {
        bail!("找不到 {}", source.display());
    }
    if ctx.favicon.sizes.is_empty() {
        bail!("favicon 尺寸列表为空");
    }

    let img = image::open(&source).with_context(|| format!("无法解码 {}", source.display()))?;

    let mut frames = Vec::with_capacity(ctx.favicon.sizes.len());
    for &size in &ctx.favicon.sizes {
        ctx.cancel.check()?;
        // ICO 单帧最大 256x256
        if size == 0 || size > 256 {
            bail!("不支持的 favicon 尺寸：{size}");
        }
        let resized = img.resize_exact(size, size, FilterType::Lanczos3).to_rgba8();
        let frame = IcoFrame::as_png(resized.as_raw(), size, size, ExtendedColorType::Rgba8)
            .with_context(|| format!("编码 {size}x{size} 帧失败"))?;
        frames.push(frame);
    }

    ctx.cancel.check()?;
    let mut buf = Vec::new();
    IcoEncoder::new(&mut buf)
        .encode_images(&frames)
        .context("ICO 编码失败")?;
    write_output(&ctx.destination.join("favicon.ico"), buf)?;

    tracing::info!("已生成 favicon.ico（{} 种尺寸）", frames.len());
    Ok(StageReport { artifacts: 1 })
}
