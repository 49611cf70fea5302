use crate::build::sourcemap::{self, Mapping, SourceMapBuilder};
use crate::build::stages::{StageContext, StageReport, collect_sources, relative_to, rename, write_output};
use anyhow::{Result, bail};
use std::path::Path;

/// 这些关键字之后的 `/` 是正则字面量而不是除号
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "do", "else", "in", "instanceof", "new", "delete", "void",
    "throw", "yield", "await",
];

/// 换行出现在这些字符之后时不可能触发自动分号插入，可以安全删除
const NO_ASI_AFTER: &str = ";{,([";

pub fn run(ctx: &StageContext) -> Result<StageReport> {
    let base = ctx.source.join("js");
    let out_dir = ctx.destination.join("js");
    let files = collect_sources(&base, &["**/*.js"])?;

    let mut report = StageReport::default();
    let mut failures = Vec::new();
    for file in &files {
        ctx.cancel.check()?;
        let rel = relative_to(&base, file)?;
        match compile_script(file, rel, &out_dir, ctx.debug) {
            Ok(written) => report.artifacts += written,
            Err(e) => {
                tracing::error!("压缩脚本 {} 失败：{e:#}", rel.display());
                failures.push(rel.display().to_string());
            }
        }
    }

    if !failures.is_empty() {
        bail!("{} 个脚本处理失败：{}", failures.len(), failures.join(", "));
    }
    tracing::info!("已压缩 {} 个脚本", files.len());
    Ok(report)
}

fn compile_script(file: &Path, rel: &Path, out_dir: &Path, debug: bool) -> Result<usize> {
    let source = std::fs::read_to_string(file)?;
    let minified = minify_js(&source)?;
    let out_rel = rename(rel, ".min", "js");
    let out_path = out_dir.join(&out_rel);

    if !debug {
        write_output(&out_path, minified.code)?;
        return Ok(1);
    }

    let file_name = out_rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let map_name = format!("{file_name}.map");
    let source_name = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let map = minified.map.to_json(&file_name, &source_name, &source)?;

    write_output(&out_path, minified.code + &sourcemap::js_comment(&map_name))?;
    write_output(&out_path.with_file_name(&map_name), map)?;
    Ok(2)
}

#[derive(Debug)]
pub struct MinifiedScript {
    pub code: String,
    pub map: SourceMapBuilder,
}

#[derive(Debug, Clone, PartialEq)]
enum Prev {
    Start,
    Word(String),
    Punct(char),
    Literal,
}

impl Prev {
    fn allows_regex(&self) -> bool {
        match self {
            Prev::Start => true,
            Prev::Punct(c) => "(,=:[!&|?{};+-*%<>~^".contains(*c),
            Prev::Word(w) => REGEX_PREFIX_KEYWORDS.contains(&w.as_str()),
            Prev::Literal => false,
        }
    }

    /// 纯数字的整数字面量，后面紧跟 `.` 会被当成小数点
    fn is_integer(&self) -> bool {
        matches!(self, Prev::Word(w) if w.chars().all(|c| c.is_ascii_digit()))
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: &str) -> anyhow::Error {
        anyhow::anyhow!("{}:{}：{message}", self.line + 1, self.col + 1)
    }

    /// 跳过注释，返回注释内是否包含换行
    fn skip_comment(&mut self) -> Result<bool> {
        self.bump();
        if self.bump() == Some('/') {
            while let Some(c) = self.peek() {
                if c == '\n' {
                    break;
                }
                self.bump();
            }
            return Ok(false);
        }
        let mut newline = false;
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    return Ok(newline);
                }
                Some('\n') => newline = true,
                Some(_) => {}
                None => return Err(self.error("块注释未闭合")),
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<String> {
        let mut text = String::new();
        text.extend(self.bump());
        loop {
            match self.bump() {
                Some('\\') => {
                    text.push('\\');
                    text.extend(self.bump());
                }
                Some(c) if c == quote => {
                    text.push(c);
                    return Ok(text);
                }
                Some('\n') | None => return Err(self.error("字符串未闭合")),
                Some(c) => text.push(c),
            }
        }
    }

    /// 模板字符串原样保留
    fn read_template(&mut self) -> Result<String> {
        let mut text = String::new();
        text.extend(self.bump());
        loop {
            match self.bump() {
                Some('\\') => {
                    text.push('\\');
                    text.extend(self.bump());
                }
                Some('`') => {
                    text.push('`');
                    return Ok(text);
                }
                Some('$') if self.peek() == Some('{') => {
                    text.push('$');
                    text.extend(self.bump());
                    self.read_substitution(&mut text)?;
                }
                Some(c) => text.push(c),
                None => return Err(self.error("模板字符串未闭合")),
            }
        }
    }

    /// 读取 `${` 之后直到配对的 `}`；其中的字符串、嵌套模板整体读取，括号不参与配对
    fn read_substitution(&mut self, text: &mut String) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => return Err(self.error("模板字符串未闭合")),
                Some(quote @ ('"' | '\'')) => text.push_str(&self.read_string(quote)?),
                Some('`') => text.push_str(&self.read_template()?),
                Some('/') if matches!(self.peek_next(), Some('/' | '*')) => {
                    self.skip_comment()?;
                    text.push(' ');
                }
                Some(c) => {
                    self.bump();
                    text.push(c);
                    match c {
                        '{' => depth += 1,
                        '}' if depth == 0 => return Ok(()),
                        '}' => depth -= 1,
                        _ => {}
                    }
                }
            }
        }
    }

    fn read_regex(&mut self) -> Result<String> {
        let mut text = String::new();
        text.extend(self.bump());
        let mut in_class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    text.push('\\');
                    text.extend(self.bump());
                }
                Some('[') => {
                    in_class = true;
                    text.push('[');
                }
                Some(']') => {
                    in_class = false;
                    text.push(']');
                }
                Some('/') if !in_class => {
                    text.push('/');
                    break;
                }
                Some('\n') | None => return Err(self.error("正则表达式未闭合")),
                Some(c) => text.push(c),
            }
        }
        while let Some(c) = self.peek().filter(|c| c.is_ascii_alphabetic()) {
            text.push(c);
            self.bump();
        }
        Ok(text)
    }

    fn read_word(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek().filter(|c| is_word_char(*c)) {
            text.push(c);
            self.bump();
        }
        text
    }
}

struct Emitter {
    code: String,
    line: u32,
    col: u32,
    map: SourceMapBuilder,
}

impl Emitter {
    fn push_str(&mut self, text: &str) {
        for c in text.chars() {
            self.code.push(c);
            if c == '\n' {
                self.line += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
    }

    fn last_char(&self) -> Option<char> {
        self.code.chars().next_back()
    }

    fn token(&mut self, text: &str, source_line: u32, source_column: u32) {
        self.map.add(Mapping {
            generated_line: self.line,
            generated_column: self.col,
            source_line,
            source_column,
        });
        self.push_str(text);
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

fn needs_space(prev: char, next: char) -> bool {
    (is_word_char(prev) && is_word_char(next))
        || (prev == '+' && next == '+')
        || (prev == '-' && next == '-')
        || (prev == '/' && next == '/')
}

/// 删除注释和多余空白，同时记录每个 token 的原始位置
pub fn minify_js(source: &str) -> Result<MinifiedScript> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 0,
        col: 0,
    };
    let mut out = Emitter {
        code: String::with_capacity(source.len()),
        line: 0,
        col: 0,
        map: SourceMapBuilder::new(),
    };
    let mut prev = Prev::Start;
    let mut gap_newline = false;
    let mut gap_space = false;

    while let Some(c) = lexer.peek() {
        if c == '\n' {
            gap_newline = true;
            lexer.bump();
            continue;
        }
        if c.is_whitespace() {
            gap_space = true;
            lexer.bump();
            continue;
        }
        if c == '/' && matches!(lexer.peek_next(), Some('/' | '*')) {
            if lexer.skip_comment()? {
                gap_newline = true;
            } else {
                gap_space = true;
            }
            continue;
        }

        let (line, col) = (lexer.line, lexer.col);
        let (text, next_prev) = match c {
            '"' | '\'' => (lexer.read_string(c)?, Prev::Literal),
            '`' => (lexer.read_template()?, Prev::Literal),
            '/' if prev.allows_regex() => (lexer.read_regex()?, Prev::Literal),
            c if is_word_char(c) => {
                let word = lexer.read_word();
                (word.clone(), Prev::Word(word))
            }
            c => {
                lexer.bump();
                (c.to_string(), Prev::Punct(c))
            }
        };

        if let (Some(last), Some(first)) = (out.last_char(), text.chars().next()) {
            if gap_newline && !NO_ASI_AFTER.contains(last) {
                out.push_str("\n");
            } else if (gap_newline || gap_space)
                && (needs_space(last, first) || (first == '.' && prev.is_integer()))
            {
                out.push_str(" ");
            }
        }
        gap_newline = false;
        gap_space = false;

        out.token(&text, line, col);
        prev = next_prev;
    }

    Ok(MinifiedScript {
        code: out.code,
        map: out.map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stages::fixtures;
    use crate::profile::ProfileName;
    use pretty_assertions::assert_eq;

    fn min(source: &str) -> String {
        minify_js(source).unwrap().code
    }

    #[test]
    fn strips_comments_and_whitespace() {
        let source = "// header\nfunction add(a, b) {\n  /* sum */\n  return a + b;\n}\n";
        assert_eq!(min(source), "function add(a,b){return a+b;}");
    }

    #[test]
    fn keeps_newlines_that_may_end_statements() {
        assert_eq!(min("let a = 1\nlet b = 2\n"), "let a=1\nlet b=2");
        assert_eq!(min("a\n++b"), "a\n++b");
    }

    #[test]
    fn preserves_literals() {
        assert_eq!(min("var s = 'a  // b';"), "var s='a  // b';");
        assert_eq!(min("var t = `x ${ {a: 1}.a }  y`;"), "var t=`x ${ {a: 1}.a }  y`;");
        assert_eq!(min("var r = /a\\/ [/]b/g.test(x);"), "var r=/a\\/ [/]b/g.test(x);");
        assert_eq!(min("x = a / b / c;"), "x=a/b/c;");
    }

    #[test]
    fn template_substitutions_may_contain_braces_in_strings() {
        assert_eq!(
            min("var s = `${parts.join('{')}`;\nvar t = `a${ `b${c}` }d`;"),
            "var s=`${parts.join('{')}`;var t=`a${ `b${c}` }d`;"
        );
        assert_eq!(min("var u = `${ \"}\" + x }`;"), "var u=`${ \"}\" + x }`;");
    }

    #[test]
    fn keeps_space_between_integer_and_member_access() {
        assert_eq!(min("var s = 1 .toString();"), "var s=1 .toString();");
        assert_eq!(min("var t = a .b;"), "var t=a.b;");
    }

    #[test]
    fn separates_ambiguous_operators() {
        assert_eq!(min("a + +b; c - -d;"), "a+ +b;c- -d;");
        assert_eq!(min("return typeof x"), "return typeof x");
    }

    #[test]
    fn reports_unterminated_string() {
        let err = minify_js("var s = 'oops\n';").unwrap_err();
        assert!(err.to_string().starts_with("2:1"));
        assert!(err.to_string().contains("字符串未闭合"));
    }

    #[test]
    fn maps_tokens_to_original_positions() {
        let minified = minify_js("a;\n  b;").unwrap();
        // a ; b ; 四个 token，b 位于原始第 2 行第 3 列
        assert_eq!(minified.code, "a;b;");
        assert_eq!(minified.map.encode_mappings(), "AAAA,CAAC,CACC,CAAC");
    }

    #[test]
    fn debug_profile_emits_source_map() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "src/js/app.js", "var answer = 42; // comment\n");

        let ctx = fixtures::context(dir.path(), ProfileName::Test);
        let report = run(&ctx).unwrap();
        assert_eq!(report.artifacts, 2);

        let js = std::fs::read_to_string(ctx.destination.join("js/app.min.js")).unwrap();
        assert!(js.starts_with("var answer=42;"));
        assert!(js.contains("//# sourceMappingURL=app.min.js.map"));

        let map: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(ctx.destination.join("js/app.min.js.map")).unwrap(),
        )
        .unwrap();
        assert_eq!(map["sources"][0], "app.js");
    }

    #[test]
    fn stable_profile_has_no_source_map() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "src/js/app.js", "var answer = 42;\n");

        let ctx = fixtures::context(dir.path(), ProfileName::Stable);
        run(&ctx).unwrap();

        let js = std::fs::read_to_string(ctx.destination.join("js/app.min.js")).unwrap();
        assert_eq!(js, "var answer=42;");
        assert!(!ctx.destination.join("js/app.min.js.map").exists());
    }
}
