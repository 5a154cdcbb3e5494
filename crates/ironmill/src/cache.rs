//! Compiler object cache wiring.
//!
//! The configuration is recomputed on every invocation and never persisted.
//! Anything that prevents caching degrades to a disabled config with a warning.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{CacheSettings, ProjectConfig};
use crate::error::{Error, Result};
use crate::template::TemplateVars;
use crate::workspace::Workspace;

const SHIMS: [&str; 2] = ["cc", "cxx"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub tool: Option<PathBuf>,
    pub dir: PathBuf,
    pub max_size: String,
    pub compress: bool,
    pub shims: Vec<PathBuf>,
    /// Environment handed to every build command.
    pub env: BTreeMap<String, String>,
}

pub struct CacheCoordinator<'a> {
    ws: &'a Workspace,
    settings: &'a CacheSettings,
    cc: String,
    cxx: String,
    search_path: Option<OsString>,
}

impl<'a> CacheCoordinator<'a> {
    pub fn new(cfg: &'a ProjectConfig, ws: &'a Workspace) -> Result<Self> {
        let vars = TemplateVars::for_project(cfg, ws)?;
        Ok(Self {
            ws,
            settings: &cfg.cache,
            cc: vars.expand(&cfg.cache.cc)?,
            cxx: vars.expand(&cfg.cache.cxx)?,
            search_path: None,
        })
    }

    /// Look the tool up in `path` instead of `$PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn configure(&self) -> CacheConfig {
        if !self.settings.enabled {
            tracing::info!("compiler cache disabled by configuration");
            return self.disabled();
        }
        let Some(tool) = self.locate_tool() else {
            tracing::warn!(tool = %self.settings.tool, "compiler cache tool not found, building without cache");
            return self.disabled();
        };
        match self.enable(&tool) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prepare compiler cache, building without cache");
                self.disabled()
            }
        }
    }

    fn locate_tool(&self) -> Option<PathBuf> {
        let tool = self.settings.tool.trim();
        if tool.is_empty() {
            return None;
        }
        if tool.contains('/') {
            let p = PathBuf::from(tool);
            return is_executable(&p).then_some(p);
        }
        let path = self
            .search_path
            .clone()
            .or_else(|| env::var_os("PATH"))
            .unwrap_or_default();
        find_executable(tool, &path)
    }

    fn enable(&self, tool: &Path) -> Result<CacheConfig> {
        let dir = self.ws.compiler_cache.clone();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
        fs::create_dir_all(&self.ws.shim_dir).map_err(|e| {
            Error::io(format!("failed to create {}", self.ws.shim_dir.display()), e)
        })?;

        let mut shims = Vec::new();
        for (name, compiler) in SHIMS.iter().zip([&self.cc, &self.cxx]) {
            let path = self.ws.shim_dir.join(name);
            write_shim(&path, tool, compiler)?;
            shims.push(path);
        }

        let mut env = BTreeMap::new();
        env.insert("CC".into(), shims[0].display().to_string());
        env.insert("CXX".into(), shims[1].display().to_string());
        env.insert("CCACHE_DIR".into(), dir.display().to_string());
        env.insert("CCACHE_MAXSIZE".into(), self.settings.max_size.clone());
        if self.settings.compress {
            env.insert("CCACHE_COMPRESS".into(), "1".into());
        } else {
            env.insert("CCACHE_NOCOMPRESS".into(), "1".into());
        }
        env.insert(
            "CCACHE_BASEDIR".into(),
            self.ws.source_dir.display().to_string(),
        );

        tracing::info!(tool = %tool.display(), dir = %dir.display(), "compiler cache enabled");
        Ok(CacheConfig {
            enabled: true,
            tool: Some(tool.to_path_buf()),
            dir,
            max_size: self.settings.max_size.clone(),
            compress: self.settings.compress,
            shims,
            env,
        })
    }

    fn disabled(&self) -> CacheConfig {
        // Shims from an earlier run would point at a tool that is gone.
        if self.ws.shim_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.ws.shim_dir) {
                tracing::warn!(path = %self.ws.shim_dir.display(), error = %e, "failed to remove stale shims");
            }
        }
        let mut env = BTreeMap::new();
        env.insert("CC".into(), self.cc.clone());
        env.insert("CXX".into(), self.cxx.clone());
        CacheConfig {
            enabled: false,
            tool: None,
            dir: self.ws.compiler_cache.clone(),
            max_size: self.settings.max_size.clone(),
            compress: self.settings.compress,
            shims: Vec::new(),
            env,
        }
    }
}

pub fn find_executable(name: &str, search_path: &OsString) -> Option<PathBuf> {
    env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = fs::metadata(p) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn write_shim(path: &Path, tool: &Path, compiler: &str) -> Result<()> {
    let body = format!(
        "#!/bin/sh\nexec {} {} \"$@\"\n",
        shell_quote(&tool.display().to_string()),
        shell_quote(compiler)
    );
    fs::write(path, body).map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::io(format!("failed to chmod {}", path.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(dir: &Path) -> (ProjectConfig, Workspace) {
        let cfg = ProjectConfig::defaults_in(dir);
        let ws = Workspace::from_config(&cfg).expect("workspace");
        (cfg, ws)
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join(name);
        fs::write(&p, "#!/bin/sh\nexit 0\n").expect("tool");
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).expect("chmod");
        p
    }

    #[test]
    fn absent_tool_disables_cache_without_shims() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let empty = tempfile::tempdir().expect("empty path");
        let (cfg, ws) = project(tmp.path());

        let cache = CacheCoordinator::new(&cfg, &ws)
            .expect("coordinator")
            .with_search_path(empty.path())
            .configure();

        assert!(!cache.enabled);
        assert!(cache.shims.is_empty());
        assert!(!ws.shim_dir.exists());
        let src = ws.source_dir.display().to_string();
        assert_eq!(
            cache.env.get("CC").map(String::as_str),
            Some(format!("{src}/third_party/llvm-build/Release+Asserts/bin/clang").as_str())
        );
        assert!(cache.env.get("CXX").is_some_and(|v| v.ends_with("clang++")));
        assert!(!cache.env.contains_key("CCACHE_DIR"));
    }

    #[cfg(unix)]
    #[test]
    fn present_tool_writes_executable_shims() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let bin = tempfile::tempdir().expect("bin");
        let tool = fake_tool(bin.path(), "ccache");
        let (cfg, ws) = project(tmp.path());

        let cache = CacheCoordinator::new(&cfg, &ws)
            .expect("coordinator")
            .with_search_path(bin.path())
            .configure();

        assert!(cache.enabled);
        assert_eq!(cache.tool.as_deref(), Some(tool.as_path()));
        assert!(ws.compiler_cache.is_dir());
        assert_eq!(cache.shims, vec![ws.shim_dir.join("cc"), ws.shim_dir.join("cxx")]);
        for shim in &cache.shims {
            let mode = fs::metadata(shim).expect("shim").permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            let body = fs::read_to_string(shim).expect("read");
            assert!(body.starts_with("#!/bin/sh\nexec "));
            assert!(body.contains(&tool.display().to_string()));
        }
        assert_eq!(
            cache.env.get("CC").map(String::as_str),
            Some(ws.shim_dir.join("cc").display().to_string().as_str())
        );
        assert_eq!(cache.env.get("CCACHE_MAXSIZE").map(String::as_str), Some("30G"));
        assert_eq!(cache.env.get("CCACHE_COMPRESS").map(String::as_str), Some("1"));
        assert_eq!(
            cache.env.get("CCACHE_DIR").map(String::as_str),
            Some(ws.compiler_cache.display().to_string().as_str())
        );
    }

    #[cfg(unix)]
    #[test]
    fn disabled_by_config_removes_stale_shims() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bin = tempfile::tempdir().expect("bin");
        fake_tool(bin.path(), "ccache");
        let (mut cfg, ws) = project(tmp.path());

        let first = CacheCoordinator::new(&cfg, &ws)
            .expect("coordinator")
            .with_search_path(bin.path())
            .configure();
        assert!(first.enabled);

        cfg.cache.enabled = false;
        let second = CacheCoordinator::new(&cfg, &ws)
            .expect("coordinator")
            .with_search_path(bin.path())
            .configure();
        assert!(!second.enabled);
        assert!(!ws.shim_dir.exists());
    }

    #[test]
    fn shell_quoting_survives_quotes() {
        assert_eq!(shell_quote("/opt/it's/ccache"), r"'/opt/it'\''s/ccache'");
    }
}
