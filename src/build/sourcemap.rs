//! v3 source map 生成
//!
//! 只支持单一源文件，映射按生成位置顺序追加。

use serde::Serialize;

const BASE64_CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub generated_line: u32,
    pub generated_column: u32,
    pub source_line: u32,
    pub source_column: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceMapJson<'a> {
    version: u8,
    file: &'a str,
    sources: [&'a str; 1],
    sources_content: [&'a str; 1],
    names: [&'a str; 0],
    mappings: String,
}

#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    mappings: Vec<Mapping>,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mapping: Mapping) {
        self.mappings.push(mapping);
    }

    /// 编码 mappings 字段：行之间用 `;`，段之间用 `,`
    pub fn encode_mappings(&self) -> String {
        let mut out = String::new();
        let mut line = 0;
        let mut prev_gen_col: i64 = 0;
        let mut prev_src_line: i64 = 0;
        let mut prev_src_col: i64 = 0;
        let mut first_in_line = true;

        for m in &self.mappings {
            while line < m.generated_line {
                out.push(';');
                line += 1;
                prev_gen_col = 0;
                first_in_line = true;
            }
            if !first_in_line {
                out.push(',');
            }
            first_in_line = false;

            encode_vlq(&mut out, i64::from(m.generated_column) - prev_gen_col);
            // 只有一个源文件，索引差值恒为 0
            encode_vlq(&mut out, 0);
            encode_vlq(&mut out, i64::from(m.source_line) - prev_src_line);
            encode_vlq(&mut out, i64::from(m.source_column) - prev_src_col);

            prev_gen_col = i64::from(m.generated_column);
            prev_src_line = i64::from(m.source_line);
            prev_src_col = i64::from(m.source_column);
        }
        out
    }

    pub fn to_json(&self, file: &str, source: &str, source_content: &str) -> serde_json::Result<String> {
        serde_json::to_string(&SourceMapJson {
            version: 3,
            file,
            sources: [source],
            sources_content: [source_content],
            names: [],
            mappings: self.encode_mappings(),
        })
    }
}

pub fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 { ((-value) << 1) | 1 } else { value << 1 };
    loop {
        let mut digit = (vlq & 0b1_1111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b10_0000;
        }
        out.push(BASE64_CHARS[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

/// 追加到产物末尾的 sourceMappingURL 注释
pub fn js_comment(map_file: &str) -> String {
    format!("\n//# sourceMappingURL={map_file}\n")
}

pub fn css_comment(map_file: &str) -> String {
    format!("\n/*# sourceMappingURL={map_file} */\n")
}
