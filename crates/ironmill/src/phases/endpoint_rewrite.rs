use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use ironmill_macros::Phase;
use regex::Regex;
use walkdir::WalkDir;

use crate::config::{ProjectConfig, RewriteRule};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// One-time regex rewrites inside vendored build scripts, applied after
/// configuration so the toolchain scripts fetch from reachable endpoints.
#[Phase(
    id = "endpoint-rewrite",
    label = "Rewrite vendored endpoints",
    after = ["configure"]
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointRewrite;

impl EndpointRewrite {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let src = ctx.workspace.source_dir.clone();
        let mut total = 0usize;
        for rule in &cfg.endpoint_rewrite.rules {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                Error::Project(format!("invalid rewrite pattern '{}': {e}", rule.pattern))
            })?;
            for target in rule_targets(&src, rule)? {
                if !target.exists() {
                    tracing::warn!(path = %target.display(), "rewrite target missing");
                    ctx.log(&format!("WARN: rewrite target {} not found", target.display()));
                    continue;
                }
                for file in files_under(&target)? {
                    let n = rewrite_file(&file, &re, &rule.replacement)?;
                    if n > 0 {
                        ctx.log(&format!("rewrote {n} occurrence(s) in {}", file.display()));
                        total += n;
                    }
                }
            }
        }
        tracing::info!(replacements = total, "endpoint rewrite finished");
        Ok(())
    }
}

fn rule_targets(src: &Path, rule: &RewriteRule) -> Result<Vec<PathBuf>> {
    rule.files
        .iter()
        .map(|f| {
            let rel = Path::new(f.trim());
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(Error::Project(format!(
                    "rewrite target '{f}' must be relative to the source tree"
                )));
            }
            Ok(src.join(rel))
        })
        .collect()
}

fn files_under(target: &Path) -> Result<Vec<PathBuf>> {
    if target.is_file() {
        return Ok(vec![target.to_path_buf()]);
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(target).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::msg(format!("failed to walk {}: {e}", target.display()))
        })?;
        if entry.file_type().is_file() {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

/// Returns the number of replacements. Non-UTF-8 files are left alone.
fn rewrite_file(path: &Path, re: &Regex, replacement: &str) -> Result<usize> {
    let bytes =
        fs::read(path).map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let Ok(text) = String::from_utf8(bytes) else {
        tracing::debug!(path = %path.display(), "skipping non-utf8 file");
        return Ok(0);
    };
    let count = re.find_iter(&text).count();
    if count == 0 {
        return Ok(0);
    }
    let rewritten = re.replace_all(&text, replacement);

    let perms = fs::metadata(path)
        .map_err(|e| Error::io(format!("failed to stat {}", path.display()), e))?
        .permissions();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to stage {}", path.display()), e))?;
    tmp.write_all(rewritten.as_bytes())
        .and_then(|_| tmp.as_file().set_permissions(perms))
        .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("failed to replace {}", path.display()), e.error))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_matches_and_keeps_mode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = tmp.path().join("update.py");
        fs::write(
            &script,
            "URL = 'https://commondatastorage.9oo91eapis.qjz9zk/x'\nOTHER = 1\n",
        )
        .expect("write");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        }

        let re = Regex::new(r"commondatastorage\.9oo91eapis\.qjz9zk").expect("re");
        let n = rewrite_file(&script, &re, "commondatastorage.googleapis.com").expect("rewrite");
        assert_eq!(n, 1);
        let body = fs::read_to_string(&script).expect("read");
        assert!(body.contains("https://commondatastorage.googleapis.com/x"));
        assert!(body.contains("OTHER = 1"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        assert_eq!(rewrite_file(&script, &re, "x").expect("second"), 0);
    }

    #[test]
    fn directory_targets_are_walked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("a/b")).expect("dirs");
        fs::write(tmp.path().join("a/one.json"), "{}").expect("write");
        fs::write(tmp.path().join("a/b/two.json"), "{}").expect("write");

        let files = files_under(&tmp.path().join("a")).expect("walk");
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn targets_must_stay_in_the_tree() {
        let rule = RewriteRule {
            pattern: "x".into(),
            replacement: "y".into(),
            files: vec!["../etc/hosts".into()],
        };
        assert!(rule_targets(Path::new("/w/src"), &rule).is_err());
    }
}
