//! File and chunk navigation over rendered difftastic output
//!
//! difftastic starts every chunk with a header line such as
//!
//! ```text
//! src/main.rs --- 2/3 --- Rust
//! ```
//!
//! The trailing clause is a language name or one of the fallback notices
//! difftastic prints when it gave up parsing, so the grammar is built from
//! the language catalog. A chunk header starts a new file when it has no
//! `k/N` ordinal or its ordinal is 1.

use crate::languages::LanguageCatalog;
use anyhow::{Context, Result};
use regex::Regex;

/// What a boundary line starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// First chunk of a newly compared file (also a chunk boundary)
    File,
    Chunk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationBoundary {
    /// Byte offset of the start of the header line
    pub offset: usize,
    pub kind: BoundaryKind,
    pub file: String,
    /// `(k, N)` from a `k/N` annotation
    pub ordinal: Option<(u32, u32)>,
    pub clause: String,
}

impl NavigationBoundary {
    pub fn is_file(&self) -> bool {
        self.kind == BoundaryKind::File
    }
}

/// Header-line matcher derived from one catalog
#[derive(Debug)]
pub struct BoundaryGrammar {
    header: Regex,
}

impl BoundaryGrammar {
    pub fn new(catalog: &LanguageCatalog) -> Result<Self> {
        let mut languages: Vec<&str> = catalog.languages().collect();
        languages.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let alternation = languages
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|");

        let mut clauses = Vec::new();
        if !alternation.is_empty() {
            clauses.push(format!("(?:{})", alternation));
            clauses.push(format!(
                r"Text \(\d+ (?:{}) parse errors?, exceeded DFT_PARSE_ERROR_LIMIT\)",
                alternation
            ));
        }
        clauses.push(r"Text \(exceeded DFT_(?:GRAPH|BYTE)_LIMIT\)".to_string());

        let pattern = format!(
            r"^ ?(?P<file>\S.*?)(?: --- (?P<k>\d+)/(?P<n>\d+))? --- (?P<clause>{})\s*$",
            clauses.join("|")
        );
        let header = Regex::new(&pattern).context("Failed to build chunk header grammar")?;
        tracing::debug!(target: "navigate", languages = languages.len(), "grammar_built");
        Ok(Self { header })
    }

    /// Classify a single line (without its newline)
    pub fn classify(&self, line: &str, offset: usize) -> Option<NavigationBoundary> {
        let caps = self.header.captures(line)?;
        let ordinal = match (caps.name("k"), caps.name("n")) {
            (Some(k), Some(n)) => Some((k.as_str().parse().ok()?, n.as_str().parse().ok()?)),
            _ => None,
        };
        let kind = match ordinal {
            None | Some((1, _)) => BoundaryKind::File,
            Some(_) => BoundaryKind::Chunk,
        };
        Some(NavigationBoundary {
            offset,
            kind,
            file: caps["file"].to_string(),
            ordinal,
            clause: caps["clause"].to_string(),
        })
    }

    fn accepts(&self, line: &str, offset: usize, file_only: bool) -> bool {
        self.classify(line, offset)
            .is_some_and(|boundary| !file_only || boundary.is_file())
    }

    /// First boundary after the line containing `from`
    pub fn next_boundary(&self, text: &str, from: usize, file_only: bool) -> Option<usize> {
        let from = from.min(text.len());
        let line_end = text.as_bytes()[from..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| from + p)?;

        let mut offset = line_end + 1;
        for line in text[offset..].split('\n') {
            if self.accepts(line, offset, file_only) {
                return Some(offset);
            }
            offset += line.len() + 1;
        }
        None
    }

    /// Last boundary before the line containing `from`
    pub fn previous_boundary(&self, text: &str, from: usize, file_only: bool) -> Option<usize> {
        let from = from.min(text.len());
        let line_start = text.as_bytes()[..from]
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|p| p + 1)?;

        let head = &text[..line_start - 1];
        let mut stop = head.len();
        for line in head.rsplit('\n') {
            let start = stop - line.len();
            if self.accepts(line, start, file_only) {
                return Some(start);
            }
            stop = start.saturating_sub(1);
        }
        None
    }

}
