//! Turns file bytes into index fields and, optionally, an HTML xref.
//!
//! Field names:
//! - `full`: distinct identifier-like tokens of the content;
//! - `path`: components of the source-relative path;
//! - `defs`: symbols reported by ctags.

use crate::ctags::Definition;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::OnceLock;

pub const FULL_FIELD: &str = "full";
pub const PATH_FIELD: &str = "path";
pub const DEFS_FIELD: &str = "defs";

/// Bytes inspected when guessing whether content is binary.
const SNIFF_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisOutput {
    pub fields: BTreeMap<String, Vec<String>>,
    pub xref: Option<String>,
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bumped whenever the produced fields or xref change shape; documents
    /// indexed by another version are re-analyzed.
    fn version(&self) -> u32 {
        1
    }

    /// Whether this analyzer consumes ctags definitions.
    fn wants_definitions(&self) -> bool {
        false
    }

    /// Whether `analyze` renders an xref when asked to.
    fn writes_xref(&self) -> bool {
        false
    }

    fn analyze(
        &self,
        path: &str,
        content: &[u8],
        definitions: &[Definition],
        want_xref: bool,
    ) -> AnalysisOutput;
}

/// Picks the analyzer for a file.
#[derive(Debug, Default)]
pub struct AnalyzerGuru {
    plain: PlainTextAnalyzer,
    binary: BinaryAnalyzer,
}

impl AnalyzerGuru {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn select(&self, content: &[u8]) -> &dyn Analyzer {
        if is_binary(content) {
            &self.binary
        } else {
            &self.plain
        }
    }

    /// The analyzer a stored document names, if it still exists.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&dyn Analyzer> {
        [&self.plain as &dyn Analyzer, &self.binary]
            .into_iter()
            .find(|analyzer| analyzer.name() == name)
    }
}

#[must_use]
pub fn is_binary(content: &[u8]) -> bool {
    content[..content.len().min(SNIFF_LEN)].contains(&0)
}

fn path_terms(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Indexes only the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryAnalyzer;

impl Analyzer for BinaryAnalyzer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn analyze(
        &self,
        path: &str,
        _content: &[u8],
        _definitions: &[Definition],
        _want_xref: bool,
    ) -> AnalysisOutput {
        let mut fields = BTreeMap::new();
        fields.insert(PATH_FIELD.to_string(), path_terms(path));
        AnalysisOutput { fields, xref: None }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextAnalyzer;

impl Analyzer for PlainTextAnalyzer {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn wants_definitions(&self) -> bool {
        true
    }

    fn writes_xref(&self) -> bool {
        true
    }

    fn analyze(
        &self,
        path: &str,
        content: &[u8],
        definitions: &[Definition],
        want_xref: bool,
    ) -> AnalysisOutput {
        let text = String::from_utf8_lossy(content);

        let tokens: BTreeSet<&str> = identifier().find_iter(&text).map(|m| m.as_str()).collect();
        let defs: BTreeSet<&str> = definitions.iter().map(|d| d.symbol.as_str()).collect();

        let mut fields = BTreeMap::new();
        fields.insert(
            FULL_FIELD.to_string(),
            tokens.into_iter().map(str::to_string).collect(),
        );
        fields.insert(PATH_FIELD.to_string(), path_terms(path));
        if !defs.is_empty() {
            fields.insert(
                DEFS_FIELD.to_string(),
                defs.into_iter().map(str::to_string).collect(),
            );
        }

        let xref = want_xref.then(|| render_xref(&text, definitions));
        AnalysisOutput { fields, xref }
    }
}

fn identifier() -> &'static Regex {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER.get_or_init(|| {
        Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier pattern compiles")
    })
}

/// One numbered anchor per line; lines holding a definition also get an
/// anchor named after the symbol.
fn render_xref(text: &str, definitions: &[Definition]) -> String {
    let mut by_line: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for def in definitions {
        by_line.entry(def.line).or_default().push(def.symbol.as_str());
    }

    let mut out = String::with_capacity(text.len() + text.len() / 2);
    out.push_str("<pre>\n");
    for (idx, line) in text.lines().enumerate() {
        let n = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        let _ = write!(out, r##"<a class="l" name="{n}" href="#{n}">{n}</a>"##);
        if let Some(symbols) = by_line.get(&n) {
            for symbol in symbols {
                let _ = write!(out, r#"<a class="d" name="{}"></a>"#, escape_html(symbol));
            }
        }
        out.push_str(&escape_html(line));
        out.push('\n');
    }
    out.push_str("</pre>\n");
    out
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
