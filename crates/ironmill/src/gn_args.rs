//! GN build arguments: a small `key = value` format with `#` comments.
//!
//! Values are kept as raw GN expressions; merging is key-wise with the last
//! writer winning, and the first occurrence fixing a key's position.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const GENERATED_HEADER: &str = "# Generated by ironmill. Edit the project flags files instead.\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GnArgs {
    entries: Vec<(String, String)>,
}

impl GnArgs {
    pub fn parse(text: &str) -> Result<Self> {
        let mut out = Self::default();
        let mut pending: Option<(usize, String, String)> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim();

            if let Some((start, key, mut value)) = pending.take() {
                value.push(' ');
                value.push_str(line);
                if bracket_depth(&value) > 0 {
                    pending = Some((start, key, value));
                } else {
                    out.set(&key, value.trim());
                }
                continue;
            }

            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Configuration(format!(
                    "line {line_no}: expected `key = value`, got '{line}'"
                )));
            };
            let key = key.trim();
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::Configuration(format!(
                    "line {line_no}: invalid argument name '{key}'"
                )));
            }
            let value = value.trim();
            if value.is_empty() {
                return Err(Error::Configuration(format!(
                    "line {line_no}: missing value for '{key}'"
                )));
            }
            if bracket_depth(value) > 0 {
                pending = Some((line_no, key.to_string(), value.to_string()));
            } else {
                out.set(key, value);
            }
        }

        if let Some((start, key, _)) = pending {
            return Err(Error::Configuration(format!(
                "line {start}: unterminated list for '{key}'"
            )));
        }
        Ok(out)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn merge(&mut self, overlay: &GnArgs) {
        for (k, v) in &overlay.entries {
            self.set(k, v);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push_str(" = ");
            out.push_str(v);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Materialized {
    pub path: PathBuf,
    pub digest: String,
    /// False when the previous digest matched.
    pub changed: bool,
    pub args: GnArgs,
}

pub fn digest_path(args_file: &Path) -> PathBuf {
    let mut name = args_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".sha256");
    args_file.with_file_name(name)
}

/// Merge `base` and the optional `override_file` into `dest`, then read the
/// result back. The base file must exist; a missing override counts as empty.
pub fn materialize(base: &Path, override_file: Option<&Path>, dest: &Path) -> Result<Materialized> {
    let base_text = fs::read_to_string(base).map_err(|e| {
        Error::Configuration(format!("cannot read base args {}: {e}", base.display()))
    })?;
    let mut merged = GnArgs::parse(&base_text).map_err(|e| in_file(base, e))?;

    if let Some(path) = override_file.filter(|p| p.is_file()) {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read override args {}: {e}", path.display()))
        })?;
        let overlay = GnArgs::parse(&text).map_err(|e| in_file(path, e))?;
        merged.merge(&overlay);
    }

    let body = format!("{GENERATED_HEADER}{}", merged.render());
    write_atomic(dest, body.as_bytes())?;

    let written = fs::read_to_string(dest).map_err(|e| {
        Error::Configuration(format!("cannot read back {}: {e}", dest.display()))
    })?;
    let args = GnArgs::parse(&written).map_err(|e| in_file(dest, e))?;

    let digest = hex::encode(Sha256::digest(written.as_bytes()));
    let digest_file = digest_path(dest);
    let previous = fs::read_to_string(&digest_file).ok();
    let changed = previous.as_deref().map(str::trim) != Some(digest.as_str());
    if changed {
        write_atomic(&digest_file, format!("{digest}\n").as_bytes())?;
    }

    Ok(Materialized {
        path: dest.to_path_buf(),
        digest,
        changed,
        args,
    })
}

fn in_file(path: &Path, err: Error) -> Error {
    match err {
        Error::Configuration(m) => Error::Configuration(format!("{}: {m}", path.display())),
        other => other,
    }
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to stage {}", dest.display()), e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("failed to write {}", dest.display()), e))?;
    tmp.persist(dest)
        .map_err(|e| Error::io(format!("failed to replace {}", dest.display()), e.error))?;
    Ok(())
}

fn strip_comment(line: &str) -> &str {
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if in_str => escaped = !escaped,
            '"' if !escaped => in_str = !in_str,
            '#' if !in_str => return &line[..i],
            _ => {}
        }
        if c != '\\' {
            escaped = false;
        }
    }
    line
}

fn bracket_depth(value: &str) -> i32 {
    let mut depth = 0;
    let mut in_str = false;
    let mut escaped = false;
    for c in value.chars() {
        match c {
            '\\' if in_str => {
                escaped = !escaped;
                continue;
            }
            '"' if !escaped => in_str = !in_str,
            '[' if !in_str => depth += 1,
            ']' if !in_str => depth -= 1,
            _ => {}
        }
        escaped = false;
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_strings_and_lists() {
        let args = GnArgs::parse(
            "# header\nis_debug = false  # release\ntarget_cpu = \"x64\"\n\
             extra = \"a#b\"\nlist = [\n  \"one\",\n  \"two\",\n]\nuse_sysroot = true\n",
        )
        .expect("parse");
        assert_eq!(args.get_bool("is_debug"), Some(false));
        assert_eq!(args.get("target_cpu"), Some("\"x64\""));
        assert_eq!(args.get("extra"), Some("\"a#b\""));
        assert_eq!(args.get("list"), Some("[ \"one\", \"two\", ]"));
        assert_eq!(args.get_bool("use_sysroot"), Some(true));
        assert_eq!(args.len(), 5);
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let err = GnArgs::parse("a = 1\nnonsense\n").unwrap_err().to_string();
        assert!(err.contains("line 2"), "unexpected err: {err}");
        assert!(GnArgs::parse("list = [ 1,\n").is_err());
    }

    #[test]
    fn override_wins_and_keeps_base_order() {
        let mut base = GnArgs::parse("a = 1\nb = 2\n").expect("base");
        base.merge(&GnArgs::parse("b = 3\nc = 4\n").expect("overlay"));
        assert_eq!(base.render(), "a = 1\nb = 3\nc = 4\n");
    }

    #[test]
    fn materialize_writes_reads_back_and_tracks_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("flags.gn");
        let local = tmp.path().join("flags.local.gn");
        fs::write(&base, "is_official_build = true\nuse_sysroot = false\n").expect("base");
        fs::write(&local, "use_sysroot = true\n").expect("override");
        let dest = tmp.path().join("out/Default/args.gn");

        let first = materialize(&base, Some(&local), &dest).expect("first");
        assert!(first.changed);
        assert_eq!(first.args.get_bool("use_sysroot"), Some(true));
        assert!(fs::read_to_string(&dest).expect("read").starts_with("# Generated"));
        assert_eq!(
            fs::read_to_string(digest_path(&dest)).expect("digest").trim(),
            first.digest
        );

        let second = materialize(&base, Some(&local), &dest).expect("second");
        assert!(!second.changed);
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn missing_override_is_empty_but_missing_base_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("flags.gn");
        fs::write(&base, "a = 1\n").expect("base");
        let dest = tmp.path().join("args.gn");

        let out = materialize(&base, Some(&tmp.path().join("absent.gn")), &dest).expect("ok");
        assert_eq!(out.args.len(), 1);

        let err = materialize(&tmp.path().join("nope.gn"), None, &dest).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "unexpected err: {err}");
    }
}
