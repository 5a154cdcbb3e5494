use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::workspace::Workspace;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder regex"));

/// Placeholder values for collaborator argv templates (`{src_dir}`, `{manifest}`, ...).
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
}

impl TemplateVars {
    /// Workspace locations and project inputs. `{jobs}` is added by the build adapter.
    pub fn for_project(cfg: &ProjectConfig, ws: &Workspace) -> Result<Self> {
        let mut vars = Self::default();
        vars.set_path("project", &cfg.project_dir);
        vars.set_path("workspace", &ws.root);
        vars.set_path("src_dir", &ws.source_dir);
        vars.set_path("out_dir", &ws.out_dir);
        vars.set_path("download_cache", &ws.download_cache);
        vars.set_path("domsub_cache", &ws.domsub_cache);

        let inputs = &cfg.inputs;
        vars.set_path("manifest", &cfg.project_path(&inputs.manifest));
        vars.set_path("prune_list", &cfg.project_path(&inputs.prune_list));
        vars.set_path("patch_dir", &cfg.project_path(&inputs.patch_dir));
        vars.set_path("local_patch_dir", &cfg.project_path(&inputs.local_patch_dir));
        vars.set_path("regex_list", &cfg.project_path(&inputs.regex_list));
        vars.set_path("substitution_list", &cfg.project_path(&inputs.substitution_list));
        vars.set("sysroot_arch", cfg.source.sysroot_arch.trim());

        let gn = vars.expand(&cfg.build.gn_binary)?;
        vars.set("gn", gn);
        Ok(vars)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }

    pub fn set_path(&mut self, key: &str, value: &Path) {
        self.set(key, value.display().to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn expand(&self, raw: &str) -> Result<String> {
        let mut out = String::with_capacity(raw.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(raw) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Some(value) = self.vars.get(name.as_str()) else {
                let known = self.vars.keys().cloned().collect::<Vec<_>>().join(", ");
                return Err(Error::Project(format!(
                    "unknown placeholder '{{{}}}' in '{}' (known: {})",
                    name.as_str(),
                    raw,
                    known
                )));
            };
            out.push_str(&raw[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&raw[last..]);
        Ok(out)
    }

    pub fn expand_argv(&self, argv: &[String]) -> Result<Vec<String>> {
        argv.iter().map(|a| self.expand(a)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_placeholders() {
        let mut vars = TemplateVars::default();
        vars.set("src_dir", "/w/src");
        vars.set("sysroot_arch", "arm64");

        assert_eq!(
            vars.expand("--arch={sysroot_arch}").expect("expand"),
            "--arch=arm64"
        );
        assert_eq!(
            vars.expand("{src_dir}/tools/{src_dir}").expect("expand"),
            "/w/src/tools//w/src"
        );
        assert_eq!(vars.expand("plain").expect("expand"), "plain");
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let vars = TemplateVars::default();
        let err = vars.expand("{nope}/x").unwrap_err().to_string();
        assert!(err.contains("{nope}"), "unexpected err: {err}");
    }

    #[test]
    fn project_vars_resolve_gn_binary_against_out_dir() {
        let cfg = ProjectConfig::defaults_in(Path::new("/p"));
        let ws = Workspace::from_config(&cfg).expect("workspace");
        let vars = TemplateVars::for_project(&cfg, &ws).expect("vars");

        assert_eq!(vars.get("gn"), Some("/p/build/src/out/Default/gn"));
        assert_eq!(vars.get("manifest"), Some("/p/downloads.ini"));
        let argv = vars.expand_argv(&cfg.tools.unpack).expect("argv");
        assert_eq!(argv.last().map(String::as_str), Some("/p/build/src"));
    }
}
