//! Languages known to difftastic
//!
//! Fetched with `difft --list-languages`. The list feeds both the language
//! override and the chunk header grammar.

use crate::ansi::plain_text;
use crate::process::{self, CommandSpec};
use anyhow::{bail, Result};
use std::sync::Arc;

/// Synthetic entry for "no language"; always first in the catalog.
pub const TEXT_LANGUAGE: &str = "Text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageCatalog {
    names: Vec<String>,
}

impl LanguageCatalog {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![TEXT_LANGUAGE.to_string()];
        for name in names {
            let name = name.into();
            if !all.contains(&name) {
                all.push(name);
            }
        }
        Self { names: all }
    }

    /// Parse `--list-languages` output: one name per line, skipping the
    /// indented `*.ext` lines that follow each name.
    pub fn parse(output: &[u8]) -> Self {
        let text = plain_text(output);
        let names = text
            .lines()
            .filter(|line| !is_comment_line(line))
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        Self::from_names(names)
    }

    pub fn fetch(difftastic: &str) -> Result<Self> {
        let spec = CommandSpec::new(difftastic).arg("--list-languages");
        let mut output = Vec::new();
        let exit = process::run(
            &spec,
            Vec::new(),
            |bytes| output.extend_from_slice(bytes),
            |exit| exit,
        )?;
        if !exit.success {
            bail!(
                "{} --list-languages failed: {}",
                difftastic,
                exit.stderr.trim()
            );
        }
        let catalog = Self::parse(&output);
        tracing::info!(target: "languages", count = catalog.names.len(), "catalog_fetched");
        Ok(catalog)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Every name except the synthetic `Text` entry
    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .map(String::as_str)
            .filter(|name| *name != TEXT_LANGUAGE)
    }

    /// Canonical spelling of `name`, matched case-insensitively
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .find(|known| known.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.starts_with(char::is_whitespace) && line.trim_start().starts_with('*')
}

/// Session-wide catalog, fetched on first use and only refreshed on request
#[derive(Debug)]
pub struct CatalogCache {
    difftastic: String,
    catalog: Option<Arc<LanguageCatalog>>,
}

impl CatalogCache {
    pub fn new(difftastic: impl Into<String>) -> Self {
        Self {
            difftastic: difftastic.into(),
            catalog: None,
        }
    }

    #[cfg(test)]
    pub fn with_catalog(difftastic: impl Into<String>, catalog: LanguageCatalog) -> Self {
        Self {
            difftastic: difftastic.into(),
            catalog: Some(Arc::new(catalog)),
        }
    }

    pub fn get(&mut self) -> Result<Arc<LanguageCatalog>> {
        if let Some(catalog) = &self.catalog {
            return Ok(catalog.clone());
        }
        self.refresh()
    }

    /// Query the tool again, replacing the cached catalog
    pub fn refresh(&mut self) -> Result<Arc<LanguageCatalog>> {
        let catalog = Arc::new(LanguageCatalog::fetch(&self.difftastic)?);
        self.catalog = Some(catalog.clone());
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &[u8] = b"\x1b[1mAda\x1b[0m\n *.ada, *.adb, *.ads\n\x1b[1mC++\x1b[0m\n *.cpp, *.hpp\n\nPython\n *.py\n   * SConstruct\n";

    #[test]
    fn test_parse_skips_extension_lines() {
        let catalog = LanguageCatalog::parse(LISTING);
        assert_eq!(catalog.names(), &["Text", "Ada", "C++", "Python"]);
    }

    #[test]
    fn test_text_is_first_and_not_duplicated() {
        let catalog = LanguageCatalog::from_names(["Rust", "Text", "Go"]);
        assert_eq!(catalog.names(), &["Text", "Rust", "Go"]);
        assert_eq!(catalog.languages().collect::<Vec<_>>(), vec!["Rust", "Go"]);
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let catalog = LanguageCatalog::from_names(["Python", "TypeScript TSX"]);
        assert_eq!(catalog.resolve("python"), Some("Python"));
        assert_eq!(catalog.resolve("text"), Some("Text"));
        assert_eq!(catalog.resolve("Cobol"), None);
    }

    #[test]
    fn test_cache_returns_seeded_catalog() {
        let mut cache = CatalogCache::with_catalog(
            "/nonexistent/difft",
            LanguageCatalog::from_names(["Rust"]),
        );
        assert_eq!(cache.get().unwrap().names(), &["Text", "Rust"]);
        assert!(cache.refresh().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_fetch_runs_the_tool() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("difft");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh\nprintf 'Rust\\n *.rs\\nGo\\n *.go\\n'").unwrap();
        drop(file);
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cache = CatalogCache::new(script.to_string_lossy());
        assert_eq!(cache.get().unwrap().names(), &["Text", "Rust", "Go"]);
    }
}
