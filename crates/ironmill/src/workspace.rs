use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::markers::MarkerStore;

const LOCK_FILE: &str = ".ironmill.lock";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    // The remaining paths are relative to the workspace root.
    pub source_dir: String,
    pub out_dir: String,
    pub marker_dir: String,
    pub download_cache: String,
    pub compiler_cache: String,
    pub domsub_cache: String,
    pub shim_dir: String,
    pub log_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: "build".into(),
            source_dir: "src".into(),
            out_dir: "src/out/Default".into(),
            marker_dir: "markers".into(),
            download_cache: "download_cache".into(),
            compiler_cache: "ccache".into(),
            domsub_cache: "domsubcache.tar.gz".into(),
            shim_dir: "shims".into(),
            log_dir: "logs".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOptions {
    pub preserve_download_cache: bool,
    pub preserve_compiler_cache: bool,
}

impl Default for ResetOptions {
    fn default() -> Self {
        Self {
            preserve_download_cache: true,
            preserve_compiler_cache: true,
        }
    }
}

impl ResetOptions {
    pub fn purge_all() -> Self {
        Self {
            preserve_download_cache: false,
            preserve_compiler_cache: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub removed: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub source_dir: PathBuf,
    pub out_dir: PathBuf,
    pub marker_dir: PathBuf,
    pub download_cache: PathBuf,
    pub compiler_cache: PathBuf,
    pub domsub_cache: PathBuf,
    pub shim_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_file: PathBuf,
    validity_file: String,
    validity_dir: String,
}

impl Workspace {
    pub fn from_config(cfg: &ProjectConfig) -> Result<Self> {
        let ws = &cfg.workspace;
        let root = resolve_user_path(&cfg.project_dir, &ws.root_dir)?;
        Ok(Self {
            source_dir: resolve_inside(&root, &ws.source_dir)?,
            out_dir: resolve_inside(&root, &ws.out_dir)?,
            marker_dir: resolve_inside(&root, &ws.marker_dir)?,
            domsub_cache: resolve_inside(&root, &ws.domsub_cache)?,
            shim_dir: resolve_inside(&root, &ws.shim_dir)?,
            log_dir: resolve_inside(&root, &ws.log_dir)?,
            // Caches may live outside the workspace so several projects can share them.
            download_cache: resolve_user_path(&root, &ws.download_cache)?,
            compiler_cache: resolve_user_path(&root, &ws.compiler_cache)?,
            lock_file: root.join(LOCK_FILE),
            validity_file: non_empty(&cfg.source.validity_file, "source.validity_file")?,
            validity_dir: non_empty(&cfg.source.validity_dir, "source.validity_dir")?,
            root,
        })
    }

    pub fn markers(&self) -> MarkerStore {
        MarkerStore::new(&self.marker_dir)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        if let Some(parent) = self.source_dir.parent() {
            create_dir(parent, "source parent")?;
        }
        create_dir(&self.download_cache, "download cache")?;
        create_dir(&self.compiler_cache, "compiler cache")?;
        create_dir(&self.marker_dir, "marker dir")?;
        create_dir(&self.out_dir, "output dir")?;
        Ok(())
    }

    /// The build descriptor and the key subdirectory both exist.
    pub fn is_source_valid(&self) -> bool {
        self.source_dir.join(&self.validity_file).is_file()
            && self.source_dir.join(&self.validity_dir).is_dir()
    }

    pub fn validity_requirement(&self) -> String {
        format!(
            "{} with {} and {}/",
            self.source_dir.display(),
            self.validity_file,
            self.validity_dir
        )
    }

    /// Nothing under the source dir but the empty output dir and its parents.
    pub fn source_holds_only_layout(&self) -> bool {
        WalkDir::new(&self.source_dir)
            .min_depth(1)
            .into_iter()
            .all(|entry| match entry {
                Ok(e) => e.file_type().is_dir() && self.out_dir.starts_with(e.path()),
                Err(_) => false,
            })
    }

    pub fn remove_source_tree(&self) -> Result<bool> {
        safe_remove_path(&self.root, &self.source_dir)
    }

    pub fn reset(&self, opts: ResetOptions) -> Result<ResetReport> {
        let mut report = ResetReport::default();
        let mut remove = |p: &Path| -> Result<()> {
            if safe_remove_path(&self.root, p)? {
                report.removed.push(p.to_path_buf());
            }
            Ok(())
        };

        remove(&self.source_dir)?;
        remove(&self.domsub_cache)?;
        remove(&self.shim_dir)?;
        if !opts.preserve_download_cache {
            remove(&self.download_cache)?;
        }
        if !opts.preserve_compiler_cache {
            remove(&self.compiler_cache)?;
        }
        self.markers().clear_all()?;
        Ok(report)
    }
}

#[derive(Debug)]
pub struct WorkspaceLock {
    _file: fs::File,
}

impl WorkspaceLock {
    pub fn acquire(ws: &Workspace) -> Result<Self> {
        create_dir(&ws.root, "workspace root")?;
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&ws.lock_file)
            .map_err(|e| Error::io(format!("failed to open {}", ws.lock_file.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // Released by the kernel when the descriptor closes, including on crash.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(Error::Locked(ws.lock_file.clone()));
                }
                return Err(Error::io(
                    format!("failed to lock {}", ws.lock_file.display()),
                    err,
                ));
            }
        }

        Ok(Self { _file: file })
    }
}

fn non_empty(raw: &str, key: &str) -> Result<String> {
    let v = raw.trim();
    if v.is_empty() {
        return Err(Error::Project(format!("{key} must not be empty")));
    }
    Ok(v.to_string())
}

fn create_dir(p: &Path, what: &str) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create {what} {}", p.display()), e))
}

fn reject_parent_dir(p: &str) -> Result<()> {
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Project(format!(
            "invalid workspace path '{}' (contains '..')",
            p
        )));
    }
    Ok(())
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::Project("empty workspace path".into()));
    }
    reject_parent_dir(p)?;
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn resolve_inside(root: &Path, p: &str) -> Result<PathBuf> {
    let out = resolve_user_path(root, p)?;
    if !out.starts_with(root) || out == root {
        return Err(Error::Project(format!(
            "workspace path '{}' must be inside the workspace root {}",
            p,
            root.display()
        )));
    }
    Ok(out)
}

// Removes a file or directory, refusing anything that resolves outside `root`.
fn safe_remove_path(root: &Path, target: &Path) -> Result<bool> {
    let Ok(meta) = fs::symlink_metadata(target) else {
        return Ok(false);
    };
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let parent_can = target
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| target.to_path_buf());
    if !parent_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            target.display(),
            root_can.display()
        )));
    }

    let res = if meta.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    };
    res.map_err(|e| Error::io(format!("failed to remove {}", target.display()), e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_in(dir: &Path) -> Workspace {
        Workspace::from_config(&ProjectConfig::defaults_in(dir)).expect("workspace")
    }

    #[test]
    fn default_layout_is_rooted_under_build() {
        let root = PathBuf::from("/tmp/ironmill-project");
        let ws = workspace_in(&root);
        assert_eq!(ws.root, root.join("build"));
        assert_eq!(ws.source_dir, root.join("build/src"));
        assert_eq!(ws.out_dir, root.join("build/src/out/Default"));
        assert_eq!(ws.marker_dir, root.join("build/markers"));
        assert_eq!(ws.domsub_cache, root.join("build/domsubcache.tar.gz"));
    }

    #[test]
    fn parent_dir_components_are_rejected() {
        let mut cfg = ProjectConfig::defaults_in(Path::new("/tmp/p"));
        cfg.workspace.source_dir = "../escape".into();
        let err = Workspace::from_config(&cfg).unwrap_err().to_string();
        assert!(err.contains(".."), "unexpected err: {err}");
    }

    #[test]
    fn source_tree_must_stay_inside_root() {
        let mut cfg = ProjectConfig::defaults_in(Path::new("/tmp/p"));
        cfg.workspace.source_dir = "/elsewhere/src".into();
        assert!(Workspace::from_config(&cfg).is_err());
    }

    #[test]
    fn ensure_layout_is_repeatable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = workspace_in(tmp.path());
        ws.ensure_layout().expect("first");
        ws.ensure_layout().expect("second");
        assert!(ws.download_cache.is_dir());
        assert!(ws.compiler_cache.is_dir());
        assert!(ws.marker_dir.is_dir());
        assert!(ws.out_dir.is_dir());
        assert!(ws.source_holds_only_layout());

        fs::write(ws.out_dir.join("args.gn"), "").expect("stale args");
        assert!(!ws.source_holds_only_layout());
    }

    #[test]
    fn validity_needs_descriptor_and_key_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = workspace_in(tmp.path());
        ws.ensure_layout().expect("layout");
        assert!(!ws.is_source_valid(), "out dir alone is not a source tree");

        fs::write(ws.source_dir.join("BUILD.gn"), "").expect("descriptor");
        assert!(!ws.is_source_valid());
        assert!(!ws.source_holds_only_layout());
        fs::create_dir_all(ws.source_dir.join("chrome")).expect("key dir");
        assert!(ws.is_source_valid());
    }

    #[test]
    fn reset_preserves_caches_byte_identical() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = workspace_in(tmp.path());
        ws.ensure_layout().expect("layout");

        let archive = ws.download_cache.join("chromium-130.0.tar.xz");
        let object = ws.compiler_cache.join("a/b/obj.o");
        fs::write(&archive, b"archive-bytes\x00\x01").expect("archive");
        fs::create_dir_all(object.parent().unwrap()).expect("ccache subdir");
        fs::write(&object, b"object-bytes").expect("object");
        fs::write(&ws.domsub_cache, b"tar").expect("domsub");
        fs::write(ws.source_dir.join("BUILD.gn"), "").expect("tree");
        ws.markers().set("fetch").expect("marker");

        let report = ws.reset(ResetOptions::default()).expect("reset");
        assert!(report.removed.contains(&ws.source_dir));
        assert!(report.removed.contains(&ws.domsub_cache));
        assert!(!ws.source_dir.exists());
        assert!(!ws.domsub_cache.exists());
        assert!(!ws.markers().has("fetch"));
        assert_eq!(fs::read(&archive).expect("read"), b"archive-bytes\x00\x01");
        assert_eq!(fs::read(&object).expect("read"), b"object-bytes");
    }

    #[test]
    fn reset_can_purge_caches() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = workspace_in(tmp.path());
        ws.ensure_layout().expect("layout");
        fs::write(ws.download_cache.join("a.tar.xz"), b"x").expect("archive");

        ws.reset(ResetOptions::purge_all()).expect("reset");
        assert!(!ws.download_cache.exists());
        assert!(!ws.compiler_cache.exists());
    }

    #[test]
    fn reset_leaves_external_caches_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let shared = tempfile::tempdir().expect("shared");
        let mut cfg = ProjectConfig::defaults_in(tmp.path());
        cfg.workspace.compiler_cache = shared.path().display().to_string();
        let ws = Workspace::from_config(&cfg).expect("workspace");
        ws.ensure_layout().expect("layout");

        let err = ws.reset(ResetOptions::purge_all()).unwrap_err().to_string();
        assert!(err.contains("refusing"), "unexpected err: {err}");
        assert!(shared.path().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn second_lock_is_refused_until_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = workspace_in(tmp.path());

        let held = WorkspaceLock::acquire(&ws).expect("first lock");
        let err = WorkspaceLock::acquire(&ws).unwrap_err();
        assert!(matches!(err, Error::Locked(_)), "unexpected err: {err}");

        drop(held);
        WorkspaceLock::acquire(&ws).expect("lock after release");
    }
}
