//! Diff engine driving difftastic
//!
//! Builds the difftastic (or git, for porcelain modes) command line for a
//! request, starts it against the request's surface and hands finished
//! surfaces to a display policy. Input resolution happens before anything is
//! spawned, so a bad revision or unreadable buffer never creates a surface.

use crate::args::translate;
use crate::config::Config;
use crate::error::ViewError;
use crate::languages::CatalogCache;
use crate::palette::{Background, ColorFaceTable};
use crate::process::{self, CommandSpec};
use crate::surface::{Completion, Surface, SurfaceRegistry};
use anyhow::{bail, Context, Result};
use git2::Repository;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;

/// Content to compare that may not exist on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSource {
    pub label: String,
    pub content: Vec<u8>,
    /// File the content came from, if any; its extension is kept on the temp copy
    pub path: Option<PathBuf>,
}

impl BufferSource {
    pub fn from_bytes(label: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
            path: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self {
            label: path.display().to_string(),
            content,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_stdin() -> Result<Self> {
        let mut content = Vec::new();
        std::io::stdin()
            .read_to_end(&mut content)
            .context("Failed to read stdin")?;
        Ok(Self::from_bytes("stdin", content))
    }

    fn materialize(&self, dir: &Path) -> Result<TempPath, ViewError> {
        let suffix = self
            .path
            .as_deref()
            .and_then(Path::extension)
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("difftview-")
            .suffix(&suffix)
            .tempfile_in(dir)
            .map_err(ViewError::TempFile)?;
        // On error `file` is dropped here and removes itself.
        file.write_all(&self.content).map_err(ViewError::TempFile)?;
        file.flush().map_err(ViewError::TempFile)?;
        Ok(file.into_temp_path())
    }
}

/// Write both sides to `dirs`. When the second fails the first is removed
/// before the error is returned.
fn materialize_pair(
    old: &BufferSource,
    new: &BufferSource,
    dirs: [&Path; 2],
) -> Result<(TempPath, TempPath), ViewError> {
    let old_file = old.materialize(dirs[0])?;
    let new_file = new.materialize(dirs[1])?;
    Ok((old_file, new_file))
}

/// What to compare
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Two files on disk
    Files { old: PathBuf, new: PathBuf },
    /// Two in-memory contents, materialized as temp files
    Buffers {
        old: BufferSource,
        new: BufferSource,
        language: Option<String>,
    },
    /// A single revision's change-set (`git show`); HEAD when unset
    Show { rev: Option<String> },
    /// `git diff` with porcelain arguments
    Diff { args: Vec<String> },
}

/// Receives a finished, non-empty surface and the width it asks for
pub trait DisplayPolicy {
    fn display(&mut self, surface: &Surface, requested_width: usize) -> Result<()>;
}

/// Writes the rendered text to a stream instead of opening the viewer
pub struct PrintPolicy<W: Write> {
    out: W,
}

impl<W: Write> PrintPolicy<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> DisplayPolicy for PrintPolicy<W> {
    fn display(&mut self, surface: &Surface, _requested_width: usize) -> Result<()> {
        self.out
            .write_all(surface.text().as_bytes())
            .context("Failed to write output")?;
        self.out.flush().context("Failed to flush output")
    }
}

/// A request turned into a concrete command, ready to spawn
pub struct Prepared {
    pub name: String,
    pub spec: CommandSpec,
    keep_alive: Vec<TempPath>,
}

pub struct DiffEngine {
    difftastic: String,
    git: String,
    background: Background,
    extra_args: Vec<String>,
    cwd: PathBuf,
    table: Arc<ColorFaceTable>,
    catalog: CatalogCache,
}

impl DiffEngine {
    pub fn new(config: &Config, cwd: PathBuf) -> Self {
        Self {
            difftastic: config.difftastic.clone(),
            git: config.git.clone(),
            background: config.background,
            extra_args: config.extra_args.clone(),
            cwd,
            table: config.face_table(),
            catalog: CatalogCache::new(config.difftastic.clone()),
        }
    }

    #[cfg(test)]
    pub fn with_catalog(mut self, catalog: CatalogCache) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn table(&self) -> &Arc<ColorFaceTable> {
        &self.table
    }

    pub fn catalog(&mut self) -> &mut CatalogCache {
        &mut self.catalog
    }

    /// Flags for every difftastic invocation
    pub fn tool_args(&self, width: u16, language: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--color".to_string(),
            "always".to_string(),
            "--width".to_string(),
            width.to_string(),
            "--background".to_string(),
            self.background.as_str().to_string(),
        ];
        if let Some(language) = language {
            args.push("--override".to_string());
            args.push(format!("*:{}", language));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// `GIT_EXTERNAL_DIFF` value: git runs it through the shell
    fn external_diff(&self, width: u16, tool_flags: &[String]) -> String {
        let mut parts = vec![shell_quote(&self.difftastic)];
        parts.extend(self.tool_args(width, None).iter().map(|arg| shell_quote(arg)));
        parts.extend(tool_flags.iter().cloned());
        parts.join(" ")
    }

    fn git_command(&self, dir: &Path, width: u16, tool_flags: &[String]) -> CommandSpec {
        CommandSpec::new(&self.git)
            .arg("--no-pager")
            .env("GIT_EXTERNAL_DIFF", self.external_diff(width, tool_flags))
            .current_dir(dir)
    }

    fn resolve_revision(&self, rev: &str) -> Result<(PathBuf, String), ViewError> {
        let no_revision = || ViewError::NoRevision(rev.to_string());
        let repo = Repository::discover(&self.cwd).map_err(|_| no_revision())?;
        let object = repo.revparse_single(rev).map_err(|_| no_revision())?;
        let dir = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cwd.clone());
        Ok((dir, object.id().to_string()))
    }

    /// Resolve inputs and build the command. Nothing is spawned here.
    pub fn prepare(&mut self, request: &Request, width: u16) -> Result<Prepared> {
        let prepared = match request {
            Request::Files { old, new } => {
                for path in [old, new] {
                    if !path.exists() {
                        bail!("File not found: {}", path.display());
                    }
                }
                Prepared {
                    name: format!("difftastic files {} {}", old.display(), new.display()),
                    spec: CommandSpec::new(&self.difftastic)
                        .args(self.tool_args(width, None))
                        .arg(old.display().to_string())
                        .arg(new.display().to_string())
                        .current_dir(&self.cwd),
                    keep_alive: Vec::new(),
                }
            }
            Request::Buffers { old, new, language } => {
                let language = match language {
                    Some(name) => {
                        let catalog = self.catalog.get()?;
                        let canonical = catalog
                            .resolve(name)
                            .ok_or_else(|| ViewError::UnknownLanguage(name.clone()))?;
                        Some(canonical.to_string())
                    }
                    None => {
                        if old.path.is_none() && new.path.is_none() {
                            tracing::debug!(target: "invoke", "buffers_without_files_or_language");
                        }
                        None
                    }
                };

                let temp_dir = std::env::temp_dir();
                let (old_file, new_file) = materialize_pair(old, new, [&temp_dir, &temp_dir])?;
                Prepared {
                    name: format!("difftastic buffers {} {}", old.label, new.label),
                    spec: CommandSpec::new(&self.difftastic)
                        .args(self.tool_args(width, language.as_deref()))
                        .arg(old_file.display().to_string())
                        .arg(new_file.display().to_string())
                        .current_dir(&self.cwd),
                    keep_alive: vec![old_file, new_file],
                }
            }
            Request::Show { rev } => {
                let rev = rev.as_deref().unwrap_or("HEAD");
                let (dir, id) = self.resolve_revision(rev)?;
                Prepared {
                    name: format!("difftastic show {}", &id[..12.min(id.len())]),
                    spec: self
                        .git_command(&dir, width, &[])
                        .args(["show", "--ext-diff", "--color=always", id.as_str()]),
                    keep_alive: Vec::new(),
                }
            }
            Request::Diff { args } => {
                let translated = translate(args);
                let dir = find_repo_root(&self.cwd).unwrap_or_else(|_| self.cwd.clone());
                let mut name = "difftastic diff".to_string();
                for arg in args {
                    name.push(' ');
                    name.push_str(arg);
                }
                Prepared {
                    name,
                    spec: self
                        .git_command(&dir, width, &translated.tool)
                        .args(["diff", "--ext-diff", "--color=always"])
                        .args(translated.git),
                    keep_alive: Vec::new(),
                }
            }
        };

        tracing::debug!(target: "invoke", surface = %prepared.name, command = %prepared.spec, "prepared");
        Ok(prepared)
    }

    /// Start `request`, replacing whatever its surface showed. Returns the surface name.
    pub fn start(
        &mut self,
        registry: &mut SurfaceRegistry,
        request: &Request,
        width: u16,
    ) -> Result<String> {
        let prepared = self.prepare(request, width)?;
        if let Some(surface) = registry.get_mut(&prepared.name) {
            surface.clear();
        }

        let invocation = process::spawn(&prepared.spec, prepared.keep_alive)?;
        registry
            .get_or_create(&prepared.name, &self.table)
            .attach(invocation);
        Ok(prepared.name)
    }

    /// Start `request` and wait for it; a non-empty result goes to `policy`.
    pub fn run(
        &mut self,
        registry: &mut SurfaceRegistry,
        request: &Request,
        width: u16,
        policy: &mut dyn DisplayPolicy,
    ) -> Result<Completion> {
        let name = self.start(registry, request, width)?;
        let surface = registry
            .get_mut(&name)
            .context("Surface disappeared while starting")?;
        let completion = surface
            .wait()
            .context("No invocation attached to surface")?;
        present(surface, &completion, policy)?;
        Ok(completion)
    }
}

/// Hand a completed surface to the display policy unless it is empty
pub fn present(
    surface: &Surface,
    completion: &Completion,
    policy: &mut dyn DisplayPolicy,
) -> Result<()> {
    if completion.had_output() {
        policy.display(surface, surface.requested_width())
    } else {
        Ok(())
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Find the git repository root from a path
pub fn find_repo_root(start: &Path) -> Result<PathBuf> {
    let repo = Repository::discover(start)
        .context("Not in a git repository")?;

    repo.workdir()
        .map(PathBuf::from)
        .context("Repository has no working directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageCatalog;
    use tempfile::tempdir;

    fn engine(cwd: &Path) -> DiffEngine {
        DiffEngine::new(&Config::default(), cwd.to_path_buf()).with_catalog(
            CatalogCache::with_catalog("difft", LanguageCatalog::from_names(["Python", "Rust"])),
        )
    }

    #[derive(Default)]
    struct Recorder {
        shown: Vec<(String, usize)>,
    }

    impl DisplayPolicy for Recorder {
        fn display(&mut self, surface: &Surface, requested_width: usize) -> Result<()> {
            self.shown.push((surface.name().to_string(), requested_width));
            Ok(())
        }
    }

    #[test]
    fn test_tool_args() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.background = Background::Light;
        config.extra_args = vec!["--display".to_string(), "inline".to_string()];
        let engine = DiffEngine::new(&config, dir.path().to_path_buf());
        assert_eq!(
            engine.tool_args(100, Some("Python")),
            vec![
                "--color", "always", "--width", "100", "--background", "light", "--override",
                "*:Python", "--display", "inline"
            ]
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("difft"), "difft");
        assert_eq!(shell_quote("/opt/my tools/difft"), "'/opt/my tools/difft'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_files_request() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("a.py");
        let new = dir.path().join("b.py");
        std::fs::write(&old, "x = 1\n").unwrap();
        std::fs::write(&new, "x = 2\n").unwrap();

        let prepared = engine(dir.path())
            .prepare(&Request::Files { old: old.clone(), new: new.clone() }, 80)
            .unwrap();
        assert_eq!(
            prepared.name,
            format!("difftastic files {} {}", old.display(), new.display())
        );
        assert_eq!(prepared.spec.program, "difft");
        assert_eq!(prepared.spec.args.last().unwrap(), &new.display().to_string());
    }

    #[test]
    fn test_missing_file_fails_before_spawn() {
        let dir = tempdir().unwrap();
        let mut registry = SurfaceRegistry::default();
        let request = Request::Files {
            old: dir.path().join("nope"),
            new: dir.path().join("nope2"),
        };
        assert!(engine(dir.path()).start(&mut registry, &request, 80).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_buffers_materialize_and_clean_up() {
        let dir = tempdir().unwrap();
        let request = Request::Buffers {
            old: BufferSource {
                label: "old.rs".to_string(),
                content: b"fn a() {}".to_vec(),
                path: Some(PathBuf::from("src/old.rs")),
            },
            new: BufferSource::from_bytes("scratch", "fn b() {}"),
            language: Some("rust".to_string()),
        };

        let prepared = engine(dir.path()).prepare(&request, 80).unwrap();
        assert_eq!(prepared.name, "difftastic buffers old.rs scratch");
        assert!(prepared.spec.args.contains(&"*:Rust".to_string()));

        let paths: Vec<PathBuf> = prepared.keep_alive.iter().map(|p| p.to_path_buf()).collect();
        assert!(paths[0].to_string_lossy().ends_with(".rs"));
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"fn a() {}");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"fn b() {}");

        drop(prepared);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_failed_second_buffer_removes_first() {
        let good = tempdir().unwrap();
        let missing = good.path().join("missing");
        let old = BufferSource::from_bytes("a", "1");
        let new = BufferSource::from_bytes("b", "2");

        let err = materialize_pair(&old, &new, [good.path(), &missing]).unwrap_err();
        assert!(matches!(err, ViewError::TempFile(_)));
        assert_eq!(std::fs::read_dir(good.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_language_rejected() {
        let dir = tempdir().unwrap();
        let request = Request::Buffers {
            old: BufferSource::from_bytes("a", "1"),
            new: BufferSource::from_bytes("b", "2"),
            language: Some("Klingon".to_string()),
        };
        let err = engine(dir.path()).prepare(&request, 80).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ViewError>(),
            Some(ViewError::UnknownLanguage(_))
        ));
    }

    #[test]
    fn test_show_outside_repository_is_no_revision() {
        let dir = tempdir().unwrap();
        let mut registry = SurfaceRegistry::default();
        let err = engine(dir.path())
            .start(&mut registry, &Request::Show { rev: Some("HEAD".to_string()) }, 80)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ViewError>(),
            Some(ViewError::NoRevision(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_show_resolves_revision() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();

        let prepared = engine(dir.path())
            .prepare(&Request::Show { rev: None }, 90)
            .unwrap();
        let id = oid.to_string();
        assert_eq!(prepared.name, format!("difftastic show {}", &id[..12]));
        assert_eq!(prepared.spec.program, "git");
        assert!(prepared.spec.args.contains(&id));
        let (key, value) = &prepared.spec.env[0];
        assert_eq!(key, "GIT_EXTERNAL_DIFF");
        assert_eq!(value, "difft --color always --width 90 --background dark");
    }

    #[test]
    fn test_diff_request_translates_arguments() {
        let dir = tempdir().unwrap();
        let args: Vec<String> = ["-U5", "--stat", "main..HEAD"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let prepared = engine(dir.path())
            .prepare(&Request::Diff { args }, 80)
            .unwrap();
        assert_eq!(prepared.name, "difftastic diff -U5 --stat main..HEAD");
        assert_eq!(
            prepared.spec.args,
            vec!["--no-pager", "diff", "--ext-diff", "--color=always", "main..HEAD"]
        );
        assert!(prepared.spec.env[0].1.ends_with("--background dark --context 5"));
    }

    #[cfg(unix)]
    fn fake_difft(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-difft");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    fn files_request(dir: &Path) -> Request {
        let old = dir.join("a.py");
        let new = dir.join("b.py");
        std::fs::write(&old, "x = 1\n").unwrap();
        std::fs::write(&new, "x = 2\n").unwrap();
        Request::Files { old, new }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_differences_displays_surface() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.difftastic = fake_difft(
            dir.path(),
            "printf 'b.py --- Python\\n1 x = \\033[32;1m2\\033[0m\\n'; exit 1",
        );
        let mut engine = DiffEngine::new(&config, dir.path().to_path_buf());
        let mut registry = SurfaceRegistry::default();
        let mut recorder = Recorder::default();

        let completion = engine
            .run(&mut registry, &files_request(dir.path()), 80, &mut recorder)
            .unwrap();
        assert!(completion.had_output());
        assert_eq!(completion.exit().code, Some(1));
        assert_eq!(recorder.shown.len(), 1);
        assert_eq!(recorder.shown[0].1, "b.py --- Python".len());

        let surface = registry.get(&recorder.shown[0].0).unwrap();
        assert!(surface.is_read_only());
        assert_eq!(surface.line(1), "1 x = 2");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_without_output_displays_nothing() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.difftastic = fake_difft(dir.path(), "exit 0");
        let mut engine = DiffEngine::new(&config, dir.path().to_path_buf());
        let mut registry = SurfaceRegistry::default();
        let mut recorder = Recorder::default();

        let completion = engine
            .run(&mut registry, &files_request(dir.path()), 80, &mut recorder)
            .unwrap();
        assert!(!completion.had_output());
        assert!(recorder.shown.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_rerun_replaces_surface_content() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.difftastic = fake_difft(dir.path(), "echo \"width $4\"");
        let mut engine = DiffEngine::new(&config, dir.path().to_path_buf());
        let mut registry = SurfaceRegistry::default();
        let mut printed = Vec::new();
        let mut printer = PrintPolicy::new(&mut printed);
        let request = files_request(dir.path());

        engine.run(&mut registry, &request, 80, &mut printer).unwrap();
        engine.run(&mut registry, &request, 120, &mut printer).unwrap();
        assert_eq!(registry.len(), 1);
        drop(printer);
        assert_eq!(
            String::from_utf8(printed).unwrap(),
            "width 80\nwidth 120\n"
        );
    }

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("a");
        std::fs::write(&old, "1").unwrap();
        let mut config = Config::default();
        config.difftastic = "/nonexistent/difft".to_string();
        let mut engine = DiffEngine::new(&config, dir.path().to_path_buf());
        let mut registry = SurfaceRegistry::default();

        let err = engine
            .start(&mut registry, &Request::Files { old: old.clone(), new: old }, 80)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ViewError>(),
            Some(ViewError::Spawn { .. })
        ));
        assert!(registry.is_empty());
    }
}
