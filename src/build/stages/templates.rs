use crate::build::stages::scripts::minify_js;
use crate::build::stages::styles::minify_css;
use crate::build::stages::{StageContext, StageReport, collect_sources, relative_to, rename, write_output};
use crate::config::BrowserTargets;
use anyhow::{Context, Result, bail};
use minijinja::{AutoEscape, Environment};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static RAW_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<pre\b[^>]*>.*?</pre\s*>|<textarea\b[^>]*>.*?</textarea\s*>",
    )
    .unwrap()
});
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<[^>"']*(?:(?:"[^"]*"|'[^']*')[^>"']*)*>"#).unwrap());
static ATTR_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap());
static BLOCK_GAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*(</?(?:html|head|body|title|meta|link|base|div|p|ul|ol|li|dl|dt|dd|nav|header|footer|main|section|article|aside|h[1-6]|hr|table|thead|tbody|tfoot|tr|td|th|form|fieldset|figure|figcaption|noscript|!doctype)\b[^>]*>)\s*",
    )
    .unwrap()
});
static TYPE_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\btype\s*=\s*["']?([^"'\s>]+)"#).unwrap());

/// 渲染 ejs/page/ 下的所有页面为压缩后的 .html
pub fn run(ctx: &StageContext) -> Result<StageReport> {
    let template_root = ctx.source.join("ejs");
    let page_root = template_root.join("page");
    let pages = collect_sources(&page_root, &["**/*.ejs"])?;
    if pages.is_empty() {
        tracing::debug!("无页面模板，跳过");
        return Ok(StageReport::default());
    }

    let context = build_context(load_dict(&template_root.join("dict.json"))?, ctx);

    let mut env = Environment::new();
    env.set_loader(minijinja::path_loader(&template_root));
    env.set_auto_escape_callback(|_| AutoEscape::Html);

    let mut report = StageReport::default();
    let mut failures = Vec::new();
    for page in &pages {
        ctx.cancel.check()?;
        let rel = relative_to(&page_root, page)?;
        match render_page(&env, rel, &context, ctx) {
            Ok(()) => report.artifacts += 1,
            Err(e) => {
                tracing::error!("渲染页面 {} 失败：{e:#}", rel.display());
                failures.push(rel.display().to_string());
            }
        }
    }

    if !failures.is_empty() {
        bail!("{} 个页面渲染失败：{}", failures.len(), failures.join(", "));
    }
    tracing::info!("渲染完成，共 {} 个页面", report.artifacts);
    Ok(report)
}

fn render_page(
    env: &Environment<'_>,
    rel: &Path,
    context: &minijinja::Value,
    ctx: &StageContext,
) -> Result<()> {
    // loader 中的模板名统一使用 `/` 分隔
    let name = format!(
        "page/{}",
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    );
    let tmpl = env
        .get_template(&name)
        .with_context(|| format!("加载模板 {name} 失败"))?;
    let html = tmpl
        .render(context)
        .with_context(|| format!("渲染模板 {name} 失败"))?;

    let out_path = ctx.destination.join(rename(rel, "", "html"));
    write_output(&out_path, minify_html(&html, &ctx.styles.targets))
}

/// dict.json 不存在时使用空字典，格式错误时本阶段失败
fn load_dict(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
    if !path.exists() {
        tracing::debug!("{} 不存在，使用空字典", path.display());
        return Ok(serde_json::Map::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取 {} 失败", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("解析 {} 失败", path.display()))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("{} 顶层必须是对象", path.display()),
    }
}

fn build_context(
    mut dict: serde_json::Map<String, serde_json::Value>,
    ctx: &StageContext,
) -> minijinja::Value {
    let started = ctx.started_at;
    dict.entry("build").or_insert_with(|| {
        serde_json::json!({
            "profile": ctx.profile.as_str(),
            "debug": ctx.debug,
            "date": {
                "short": started.format("%Y-%m-%d").to_string(),
                "signature": started.format("%Y-%m-%d-%H-%M-%S").to_string(),
                "full": started.format("%Y-%m-%d %H:%M:%S").to_string(),
            },
        })
    });
    minijinja::Value::from_serialize(&dict)
}

/// 删除注释、折叠空白，并压缩内联的 `<style>` 与 `<script>`；
/// `pre`、`textarea` 内容保持不变
pub fn minify_html(html: &str, targets: &BrowserTargets) -> String {
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    let mut prev_is_block = false;

    for m in RAW_BLOCK_RE.find_iter(html) {
        let block = m.as_str();
        let is_block = is_script_or_style(block);

        let text = collapse(&html[last..m.start()]);
        let text = if prev_is_block { text.trim_start() } else { &text };
        let text = if is_block { text.trim_end() } else { text };
        out.push_str(text);
        out.push_str(&minify_raw_block(block, targets));

        last = m.end();
        prev_is_block = is_block;
    }

    let tail = collapse(&html[last..]);
    out.push_str(if prev_is_block { tail.trim_start() } else { &tail });
    out.trim().to_string()
}

fn collapse(text: &str) -> String {
    let text = COMMENT_RE.replace_all(text, "");
    let text = collapse_outside(&text, &TAG_RE, |tag| collapse_outside(tag, &ATTR_VALUE_RE, str::to_string));
    BLOCK_GAP_RE.replace_all(&text, "$1").into_owned()
}

/// 折叠 `keep` 匹配区域之外的空白，匹配区域交给 `inner` 处理
fn collapse_outside(text: &str, keep: &Regex, inner: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in keep.find_iter(text) {
        out.push_str(&WHITESPACE_RE.replace_all(&text[last..m.start()], " "));
        out.push_str(&inner(m.as_str()));
        last = m.end();
    }
    out.push_str(&WHITESPACE_RE.replace_all(&text[last..], " "));
    out
}

fn is_script_or_style(block: &str) -> bool {
    let head = block.get(..7).unwrap_or(block).to_ascii_lowercase();
    head.starts_with("<script") || head.starts_with("<style")
}

fn minify_raw_block(block: &str, targets: &BrowserTargets) -> String {
    let Some(open_end) = block.find('>') else {
        return block.to_string();
    };
    let (open, rest) = block.split_at(open_end + 1);
    let Some(close_start) = rest.rfind("</") else {
        return block.to_string();
    };
    let (body, close) = rest.split_at(close_start);
    if body.trim().is_empty() {
        return format!("{open}{close}");
    }

    let lower = open.to_ascii_lowercase();
    let minified = if lower.starts_with("<script") {
        if !is_javascript(open) {
            return block.to_string();
        }
        minify_js(body).map(|m| m.code)
    } else if lower.starts_with("<style") {
        minify_css(body, targets)
    } else {
        return block.to_string();
    };

    match minified {
        Ok(body) => format!("{open}{body}{close}"),
        Err(e) => {
            tracing::debug!("内联资源压缩失败，保留原内容：{e:#}");
            block.to_string()
        }
    }
}

fn is_javascript(open_tag: &str) -> bool {
    match TYPE_ATTR_RE.captures(open_tag) {
        None => true,
        Some(caps) => matches!(
            caps[1].to_ascii_lowercase().as_str(),
            "text/javascript" | "application/javascript" | "module"
        ),
    }
}
