use crate::build::sourcemap;
use crate::build::stages::{StageContext, StageReport, collect_sources, relative_to, rename, write_output};
use crate::config::BrowserTargets;
use anyhow::{Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use parcel_sourcemap::SourceMap;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap());

pub fn run(ctx: &StageContext) -> Result<StageReport> {
    let base = ctx.source.join("sass");
    let out_dir = ctx.destination.join("css");
    let files = collect_sources(&base, &["**/*.sass", "**/*.scss"])?;

    let mut report = StageReport::default();
    let mut failures = Vec::new();
    let mut compiled = 0;
    // 以下划线开头的是 partial，只能被 @use/@import 引用
    for file in files.iter().filter(|f| !is_partial(f)) {
        ctx.cancel.check()?;
        let rel = relative_to(&base, file)?;
        match compile_style(file, rel, &out_dir, ctx) {
            Ok(written) => {
                report.artifacts += written;
                compiled += 1;
            }
            Err(e) => {
                tracing::error!("编译样式 {} 失败：{e:#}", rel.display());
                failures.push(rel.display().to_string());
            }
        }
    }

    if !failures.is_empty() {
        bail!("{} 个样式文件编译失败：{}", failures.len(), failures.join(", "));
    }
    tracing::info!("已编译 {compiled} 个样式文件");
    Ok(report)
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('_'))
}

fn compile_style(file: &Path, rel: &Path, out_dir: &Path, ctx: &StageContext) -> Result<usize> {
    let mut options = grass::Options::default();
    if let Some(dir) = file.parent() {
        options = options.load_path(dir);
    }
    for path in &ctx.styles.include_paths {
        options = options.load_path(path);
    }
    let css = grass::from_path(file, &options).map_err(|e| anyhow!("SCSS 编译失败: {e}"))?;

    let base_dir = file.parent().unwrap_or(Path::new("."));
    let css = inline_resources(&css, base_dir, ctx.styles.inline_max_bytes);
    let out_rel = rename(rel, ".min", "css");
    let out_path = out_dir.join(&out_rel);
    if !ctx.debug {
        write_output(&out_path, minify_css(&css, &ctx.styles.targets)?)?;
        return Ok(1);
    }

    let file_name = out_rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let map_name = format!("{file_name}.map");
    // 映射指向编译后的 CSS（SCSS 编译器不输出位置信息）
    let compiled_name = file_name.replace(".min.css", ".css");
    let (code, map) = print_css(&css, &ctx.styles.targets, Some(&compiled_name))?;

    write_output(&out_path, code + &sourcemap::css_comment(&map_name))?;
    write_output(&out_path.with_file_name(&map_name), map.unwrap_or_default())?;
    Ok(2)
}

/// 把本地小文件引用替换为 base64 data URI
pub fn inline_resources(css: &str, base_dir: &Path, max_bytes: u64) -> String {
    URL_RE
        .replace_all(css, |caps: &regex::Captures| {
            match data_uri(base_dir, caps[1].trim(), max_bytes) {
                Some(uri) => format!("url(\"{uri}\")"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn data_uri(base_dir: &Path, target: &str, max_bytes: u64) -> Option<String> {
    if target.starts_with("data:")
        || target.starts_with('/')
        || target.starts_with('#')
        || target.contains("://")
    {
        return None;
    }
    let path = base_dir.join(target.split(['?', '#']).next()?);
    let mime = mime_for(&path)?;
    let meta = std::fs::metadata(&path).ok()?;
    if !meta.is_file() || meta.len() > max_bytes {
        return None;
    }
    let bytes = std::fs::read(&path).ok()?;
    tracing::debug!("已内联资源：{}", path.display());
    Some(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        _ => return None,
    };
    Some(mime)
}

fn targets(t: &BrowserTargets) -> Targets {
    Targets::from(Browsers {
        chrome: Some(t.chrome << 16),
        firefox: Some(t.firefox << 16),
        safari: Some(t.safari << 16),
        edge: Some(t.edge << 16),
        ..Browsers::default()
    })
}

/// 补全浏览器前缀并压缩
pub fn minify_css(css: &str, browsers: &BrowserTargets) -> Result<String> {
    print_css(css, browsers, None).map(|(code, _)| code)
}

/// 压缩 CSS；给出 `source_name` 时同时生成指向输入的 source map
fn print_css(css: &str, browsers: &BrowserTargets, source_name: Option<&str>) -> Result<(String, Option<String>)> {
    let mut source_map = match source_name {
        Some(name) => {
            let mut map = SourceMap::new("/");
            let index = map.add_source(name);
            map.set_source_content(index as usize, css)
                .map_err(|e| anyhow!("生成 source map 失败：{e:?}"))?;
            Some(map)
        }
        None => None,
    };

    let mut sheet = StyleSheet::parse(css, ParserOptions::default())
        .map_err(|e| anyhow!("解析 CSS 失败：{e}"))?;
    sheet
        .minify(MinifyOptions {
            targets: targets(browsers),
            ..MinifyOptions::default()
        })
        .map_err(|e| anyhow!("压缩 CSS 失败：{e}"))?;
    let out = sheet
        .to_css(PrinterOptions {
            minify: true,
            targets: targets(browsers),
            source_map: source_map.as_mut(),
            ..PrinterOptions::default()
        })
        .map_err(|e| anyhow!("输出 CSS 失败：{e}"))?;

    let map = match source_map.as_mut() {
        Some(map) => Some(
            map.to_json(None)
                .map_err(|e| anyhow!("输出 source map 失败：{e:?}"))?,
        ),
        None => None,
    };
    Ok((out.code, map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stages::fixtures;
    use crate::profile::ProfileName;
    use pretty_assertions::assert_eq;

    #[test]
    fn inlines_small_local_resources_only() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "dot.png", [1u8, 2, 3]);
        fixtures::write(dir.path(), "big.png", vec![0u8; 64]);

        let css = ".a{background:url('dot.png')}.b{background:url(big.png)}.c{background:url(http://x/y.png)}";
        let out = inline_resources(css, dir.path(), 16);

        assert!(out.contains("url(\"data:image/png;base64,AQID\")"));
        assert!(out.contains("url(big.png)"));
        assert!(out.contains("url(http://x/y.png)"));
    }

    #[test]
    fn minifies_and_prefixes() {
        let css = ".a {\n  color: #ff0000;\n  user-select: none;\n}\n";
        let out = minify_css(css, &BrowserTargets::default()).unwrap();
        assert!(out.starts_with(".a{"));
        assert!(out.contains("-webkit-user-select:none"));
        assert!(!out.contains('\n'));
    }

    #[test]
    fn compiles_entry_files_and_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "src/sass/_vars.scss", "$main: #333;\n");
        fixtures::write(
            dir.path(),
            "src/sass/main.scss",
            "@use 'vars';\n.page { color: vars.$main; .title { margin: 0; } }\n",
        );

        let ctx = fixtures::context(dir.path(), ProfileName::Beta);
        let report = run(&ctx).unwrap();
        assert_eq!(report.artifacts, 2);

        let css = std::fs::read_to_string(ctx.destination.join("css/main.min.css")).unwrap();
        assert!(css.contains(".page .title{margin:0}"));
        assert!(css.contains("/*# sourceMappingURL=main.min.css.map */"));
        assert!(ctx.destination.join("css/main.min.css.map").exists());
        assert!(!ctx.destination.join("css/_vars.min.css").exists());
    }

    #[test]
    fn debug_map_tracks_each_rule() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "src/sass/main.scss", ".a { color: red; }\n.b { color: blue; }\n");

        let ctx = fixtures::context(dir.path(), ProfileName::Alpha);
        run(&ctx).unwrap();

        let raw = std::fs::read_to_string(ctx.destination.join("css/main.min.css.map")).unwrap();
        let map: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(map["sources"][0].as_str().unwrap().ends_with("main.css"));
        assert!(map["mappings"].as_str().unwrap().contains(','));
        assert!(map["sourcesContent"][0].as_str().unwrap().contains(".b"));
    }

    #[test]
    fn compile_error_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "src/sass/broken.scss", ".a { color: ; ");

        let ctx = fixtures::context(dir.path(), ProfileName::Stable);
        assert!(run(&ctx).is_err());
    }
}
