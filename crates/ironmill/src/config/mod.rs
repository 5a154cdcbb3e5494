use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};
use crate::workspace::WorkspaceConfig;

pub const DEFAULT_PROJECT_FILE: &str = "ironmill.toml";

fn default_true() -> bool {
    true
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    #[default]
    Retrieve,
    Checkout,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Retrieve => "retrieve",
            SourceMode::Checkout => "checkout",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub mode: SourceMode,
    pub sysroot_arch: String,
    /// Top-level build descriptor that must exist in a usable tree.
    pub validity_file: String,
    /// Subdirectory that must exist in a usable tree.
    pub validity_dir: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Retrieve,
            sysroot_arch: "amd64".into(),
            validity_file: "BUILD.gn".into(),
            validity_dir: "chrome".into(),
        }
    }
}

// Project inputs, relative to the project directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputsConfig {
    pub manifest: String,
    pub prune_list: String,
    pub patch_dir: String,
    pub regex_list: String,
    pub substitution_list: String,
    pub local_patch_dir: String,
    pub base_args: String,
    pub override_args: String,
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            manifest: "downloads.ini".into(),
            prune_list: "pruning.list".into(),
            patch_dir: "patches".into(),
            regex_list: "domain_regex.list".into(),
            substitution_list: "domain_substitution.list".into(),
            local_patch_dir: "local-patches".into(),
            base_args: "flags.gn".into(),
            override_args: "flags.local.gn".into(),
        }
    }
}

/// Argv templates for the external collaborators. An empty template disables
/// optional steps (toolchain updates); required steps reject it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub retrieve: Vec<String>,
    pub unpack: Vec<String>,
    pub checkout: Vec<String>,
    pub prune: Vec<String>,
    pub patch: Vec<String>,
    pub domain_substitution: Vec<String>,
    pub update_compiler: Vec<String>,
    pub update_runtime_toolchain: Vec<String>,
    pub install_sysroot: Vec<String>,
    pub gn_bootstrap: Vec<String>,
    pub gn_gen: Vec<String>,
    pub ninja: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            retrieve: argv(&[
                "python3",
                "utils/downloads.py",
                "retrieve",
                "-i",
                "{manifest}",
                "-c",
                "{download_cache}",
            ]),
            unpack: argv(&[
                "python3",
                "utils/downloads.py",
                "unpack",
                "-i",
                "{manifest}",
                "-c",
                "{download_cache}",
                "{src_dir}",
            ]),
            checkout: argv(&[
                "python3",
                "utils/clone.py",
                "--sysroot",
                "{sysroot_arch}",
                "-o",
                "{src_dir}",
            ]),
            prune: argv(&[
                "python3",
                "utils/prune_binaries.py",
                "{src_dir}",
                "{prune_list}",
            ]),
            patch: argv(&[
                "python3",
                "utils/patches.py",
                "apply",
                "{src_dir}",
                "{patch_dir}",
            ]),
            domain_substitution: argv(&[
                "python3",
                "utils/domain_substitution.py",
                "apply",
                "-r",
                "{regex_list}",
                "-f",
                "{substitution_list}",
                "-c",
                "{domsub_cache}",
                "{src_dir}",
            ]),
            update_compiler: argv(&["python3", "{src_dir}/tools/clang/scripts/update.py"]),
            update_runtime_toolchain: argv(&["python3", "{src_dir}/tools/rust/update_rust.py"]),
            install_sysroot: argv(&[
                "python3",
                "{src_dir}/build/linux/sysroot_scripts/install-sysroot.py",
                "--arch={sysroot_arch}",
            ]),
            gn_bootstrap: argv(&[
                "python3",
                "{src_dir}/tools/gn/bootstrap/bootstrap.py",
                "-o",
                "{gn}",
                "--skip-generate-buildfiles",
            ]),
            gn_gen: argv(&["{gn}", "gen", "{out_dir}", "--fail-on-unused-args"]),
            ninja: argv(&["ninja", "-C", "{out_dir}", "-j", "{jobs}"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replacement: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointRewriteConfig {
    pub rules: Vec<RewriteRule>,
}

impl Default for EndpointRewriteConfig {
    fn default() -> Self {
        // Domain substitution also rewrites the storage host the toolchain
        // scripts download from; point those scripts back at the real host.
        Self {
            rules: vec![RewriteRule {
                pattern: r"commondatastorage\.9oo91eapis\.qjz9zk".into(),
                replacement: "commondatastorage.googleapis.com".into(),
                files: vec![
                    "tools/clang/scripts/update.py".into(),
                    "tools/rust/update_rust.py".into(),
                    "build/linux/sysroot_scripts/sysroots.json".into(),
                ],
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolchainLink {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// GN arg in the materialized args that requests a sysroot install.
    pub sysroot_flag: String,
    pub links: Vec<ToolchainLink>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            sysroot_flag: "use_sysroot".into(),
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub tool: String,
    pub max_size: String,
    #[serde(default = "default_true")]
    pub compress: bool,
    pub cc: String,
    pub cxx: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tool: "ccache".into(),
            max_size: "30G".into(),
            compress: true,
            cc: "{src_dir}/third_party/llvm-build/Release+Asserts/bin/clang".into(),
            cxx: "{src_dir}/third_party/llvm-build/Release+Asserts/bin/clang++".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildSettings {
    pub targets: Vec<String>,
    /// Worker count; unset or 0 means the host CPU count.
    pub jobs: Option<usize>,
    pub gn_binary: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            targets: vec!["chrome".into(), "chromedriver".into(), "chrome_sandbox".into()],
            jobs: None,
            gn_binary: "{out_dir}/gn".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectConfig {
    #[serde(skip)]
    pub project_dir: PathBuf,
    pub workspace: WorkspaceConfig,
    pub source: SourceConfig,
    pub inputs: InputsConfig,
    pub tools: ToolsConfig,
    pub endpoint_rewrite: EndpointRewriteConfig,
    pub toolchain: ToolchainConfig,
    pub cache: CacheSettings,
    pub build: BuildSettings,
}

impl ProjectConfig {
    pub fn from_doc(doc: &ProjectDoc) -> Result<Self> {
        let mut cfg: ProjectConfig = doc
            .value
            .clone()
            .try_into()
            .map_err(|e| Error::Project(format!("{}: {e}", doc.path.display())))?;
        cfg.project_dir = doc.project_dir();
        Ok(cfg)
    }

    pub fn defaults_in(dir: &Path) -> Self {
        Self {
            project_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn project_path(&self, raw: &str) -> PathBuf {
        let p = PathBuf::from(raw.trim());
        if p.is_absolute() {
            p
        } else {
            self.project_dir.join(p)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ProjectDoc {
    pub fn project_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                if let Some(existing) = base_tbl.get_mut(&k) {
                    merge(existing, v);
                } else {
                    base_tbl.insert(k, v);
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        return p;
    }
    file.parent().unwrap_or_else(|| Path::new(".")).join(p)
}

fn string_list(path: &Path, key: &str, v: Option<Value>) -> Result<Vec<String>> {
    match v {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(Error::Project(format!(
                    "'{key}' in {} must contain strings",
                    path.display()
                ))),
            })
            .collect(),
        Some(_) => Err(Error::Project(format!(
            "'{key}' in {} must be a string or an array of strings",
            path.display()
        ))),
    }
}

// `extends` layers are applied first, then `imports`, then the file itself.
fn load_layered(path: &Path, visiting: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visiting.insert(key.clone()) {
        return Err(Error::Project(format!(
            "project config include cycle at {}",
            key.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read project config {}", path.display()), e))?;
    let mut value: Value = toml::from_str(&raw)
        .map_err(|e| Error::Project(format!("TOML parse error in {}: {e}", path.display())))?;

    let (extends, imports) = match value.as_table_mut() {
        Some(tbl) => (tbl.remove("extends"), tbl.remove("imports")),
        None => (None, None),
    };

    let mut out = Value::Table(Default::default());
    for parent in string_list(path, "extends", extends)? {
        merge(&mut out, load_layered(&relative_to(path, &parent), visiting)?);
    }
    for import in string_list(path, "imports", imports)? {
        merge(&mut out, load_layered(&relative_to(path, &import), visiting)?);
    }
    merge(&mut out, value);

    visiting.remove(&key);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ProjectDoc> {
    let value = load_layered(path, &mut HashSet::new())?;
    Ok(ProjectDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Load the project file at `path`, or defaults rooted at the current directory
/// when no path is given and `ironmill.toml` does not exist.
pub fn load_project(path: Option<&Path>) -> Result<ProjectConfig> {
    match path {
        Some(p) => ProjectConfig::from_doc(&load(p)?),
        None => {
            let cwd = std::env::current_dir()
                .map_err(|e| Error::io("failed to resolve current directory", e))?;
            let candidate = cwd.join(DEFAULT_PROJECT_FILE);
            if candidate.is_file() {
                ProjectConfig::from_doc(&load(&candidate)?)
            } else {
                tracing::debug!(dir = %cwd.display(), "no project file, using defaults");
                Ok(ProjectConfig::defaults_in(&cwd))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("ironmill.toml");
        fs::write(&path, "").expect("write");

        let cfg = ProjectConfig::from_doc(&load(&path).expect("load")).expect("cfg");
        assert_eq!(cfg.project_dir, tmp.path());
        assert_eq!(cfg.source.mode, SourceMode::Retrieve);
        assert_eq!(cfg.source.validity_file, "BUILD.gn");
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.tools.ninja[0], "ninja");
    }

    #[test]
    fn extends_and_imports_layer_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[source]\nmode = \"checkout\"\nsysroot_arch = \"arm64\"\n[build]\njobs = 4\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("cache.toml"),
            "[cache]\nmax_size = \"80G\"\n",
        )
        .expect("write import");
        let path = tmp.path().join("ironmill.toml");
        fs::write(
            &path,
            "extends = \"base.toml\"\nimports = [\"cache.toml\"]\n[build]\njobs = 16\n",
        )
        .expect("write child");

        let cfg = ProjectConfig::from_doc(&load(&path).expect("load")).expect("cfg");
        assert_eq!(cfg.source.mode, SourceMode::Checkout);
        assert_eq!(cfg.source.sysroot_arch, "arm64");
        assert_eq!(cfg.cache.max_size, "80G");
        assert_eq!(cfg.build.jobs, Some(16));
    }

    #[test]
    fn include_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&tmp.path().join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn unknown_source_mode_is_a_project_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("ironmill.toml");
        fs::write(&path, "[source]\nmode = \"rsync\"\n").expect("write");

        let err = ProjectConfig::from_doc(&load(&path).expect("load")).unwrap_err();
        assert!(matches!(err, Error::Project(_)), "unexpected err: {err}");
    }
}
