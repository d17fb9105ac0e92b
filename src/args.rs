//! Translate `git diff` flags for a difftastic-backed diff
//!
//! Flags that only shape git's own textual diff are meaningless once
//! difftastic does the diffing, so they are dropped; unified context flags
//! become difftastic's `--context`.

/// Flags split between the git command line and the external diff tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedArgs {
    pub git: Vec<String>,
    pub tool: Vec<String>,
}

const DROPPED: &[&str] = &[
    "--stat",
    "--numstat",
    "--shortstat",
    "--dirstat",
    "--compact-summary",
    "--no-ext-diff",
    "-R",
    "--show-signature",
    "-w",
    "-b",
    "--ignore-all-space",
    "--ignore-space-change",
    "--ignore-space-at-eol",
    "--ignore-blank-lines",
    "--ignore-cr-at-eol",
    "--find-copies-harder",
];

const DROPPED_PREFIXES: &[&str] = &[
    "--stat=",
    "--dirstat=",
    "--find-renames",
    "--find-copies",
    "-M",
    "-C",
    "--ignore-matching-lines=",
];

fn is_dropped(arg: &str) -> bool {
    DROPPED.contains(&arg) || DROPPED_PREFIXES.iter().any(|prefix| arg.starts_with(prefix))
}

/// Split porcelain arguments. Arguments after `--` are paths and always go to git.
pub fn translate(args: &[String]) -> TranslatedArgs {
    let mut translated = TranslatedArgs::default();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        if arg == "--" {
            translated.git.push(arg.clone());
            translated.git.extend(iter.by_ref().cloned());
            break;
        }

        let context = if arg == "-U" || arg == "--unified" {
            iter.next_if(|next| next.parse::<u32>().is_ok()).cloned()
        } else {
            arg.strip_prefix("--unified=")
                .or_else(|| arg.strip_prefix("-U"))
                .filter(|n| !n.is_empty())
                .map(str::to_string)
        };

        if let Some(lines) = context {
            if lines.parse::<u32>().is_ok() {
                translated.tool.push(format!("--context {}", lines));
                continue;
            }
        }

        if is_dropped(arg) {
            tracing::debug!(target: "invoke", %arg, "diff_arg_dropped");
            continue;
        }

        translated.git.push(arg.clone());
    }

    translated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_context_stat_and_renames() {
        let translated = translate(&strings(&["-U5", "--stat", "--find-renames=50%"]));
        assert!(translated.git.is_empty());
        assert_eq!(translated.tool, vec!["--context 5"]);
    }

    #[test]
    fn test_unified_spellings() {
        let translated = translate(&strings(&["--unified=2", "-U", "7", "--unified", "1"]));
        assert_eq!(
            translated.tool,
            vec!["--context 2", "--context 7", "--context 1"]
        );
        assert!(translated.git.is_empty());
    }

    #[test]
    fn test_dropped_flags() {
        let translated = translate(&strings(&[
            "-R",
            "-M",
            "-C30%",
            "--find-copies",
            "--show-signature",
            "-w",
            "--ignore-space-change",
            "--no-ext-diff",
            "--stat=80",
        ]));
        assert_eq!(translated, TranslatedArgs::default());
    }

    #[test]
    fn test_stat_family_dropped() {
        let translated = translate(&strings(&[
            "--numstat",
            "--shortstat",
            "--dirstat",
            "--dirstat=files,10",
            "--compact-summary",
            "HEAD~2",
        ]));
        assert_eq!(translated.git, vec!["HEAD~2"]);
        assert!(translated.tool.is_empty());
    }

    #[test]
    fn test_revisions_and_paths_kept() {
        let translated = translate(&strings(&[
            "--cached",
            "main..feature",
            "--",
            "-U3",
            "src/lib.rs",
        ]));
        assert_eq!(
            translated.git,
            vec!["--cached", "main..feature", "--", "-U3", "src/lib.rs"]
        );
        assert!(translated.tool.is_empty());
    }

    #[test]
    fn test_bare_unified_without_number_is_kept() {
        let translated = translate(&strings(&["-U", "HEAD~1"]));
        assert_eq!(translated.git, vec!["-U", "HEAD~1"]);
    }
}
