use crate::build::stages::{StageContext, StageReport, collect_sources, relative_to, write_output};
use anyhow::{Context, Result, bail};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use rayon::prelude::*;
use regex::Regex;
use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;

static SVG_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static SVG_GAP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").unwrap());

const PATTERNS: &[&str] = &["**/*.png", "**/*.svg", "**/*.gif", "**/*.jpg", "**/*.jpeg"];

pub fn run(ctx: &StageContext) -> Result<StageReport> {
    let base = ctx.source.join("img");
    let out_dir = ctx.destination.join("img");
    let files = collect_sources(&base, PATTERNS)?;

    let results: Vec<(String, Result<u64>)> = files
        .par_iter()
        .map(|file| {
            let name = file.display().to_string();
            let result = ctx
                .cancel
                .check()
                .and_then(|()| relative_to(&base, file).map(Path::to_path_buf))
                .and_then(|rel| optimize_image(file, &out_dir.join(rel)));
            (name, result)
        })
        .collect();

    let mut saved = 0u64;
    let mut failures = Vec::new();
    for (name, result) in results {
        match result {
            Ok(bytes) => saved += bytes,
            Err(e) => {
                tracing::error!("优化图片 {name} 失败：{e:#}");
                failures.push(name);
            }
        }
    }

    if !failures.is_empty() {
        bail!("{} 张图片处理失败：{}", failures.len(), failures.join(", "));
    }
    tracing::info!("已处理 {} 张图片，节省 {} 字节", files.len(), saved);
    Ok(StageReport {
        artifacts: files.len(),
    })
}

/// 无损优化单张图片，返回节省的字节数
fn optimize_image(source: &Path, dest: &Path) -> Result<u64> {
    let input = std::fs::read(source).with_context(|| format!("读取 {} 失败", source.display()))?;
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let output = match ext.as_str() {
        "png" => recompress_png(&input)?,
        "svg" => minify_svg(&String::from_utf8_lossy(&input)).into_bytes(),
        // JPEG/GIF 重新编码会有损，原样复制
        _ => input.clone(),
    };

    let output = if output.len() < input.len() { output } else { input.clone() };
    let saved = (input.len() - output.len()) as u64;
    write_output(dest, output)?;
    Ok(saved)
}

fn recompress_png(input: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(input).context("无法解码 PNG")?;
    let mut buf = Cursor::new(Vec::new());
    let encoder = PngEncoder::new_with_quality(&mut buf, CompressionType::Best, FilterType::Adaptive);
    img.write_with_encoder(encoder).context("PNG 编码失败")?;
    Ok(buf.into_inner())
}

pub fn minify_svg(svg: &str) -> String {
    let without_comments = SVG_COMMENT_RE.replace_all(svg, "");
    SVG_GAP_RE
        .replace_all(&without_comments, "><")
        .trim()
        .to_string()
}
