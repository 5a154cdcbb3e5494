use std::fs;

use ironmill_macros::Phase;

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::phases::tool_command;
use crate::template::TemplateVars;

/// Project-specific patches applied on top of the upstream series, through the
/// same patch tool with `{patch_dir}` pointed at the local directory.
#[Phase(
    id = "local-patches",
    label = "Apply local patches",
    after = ["prune-patch", "domain-substitution"]
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPatches;

impl LocalPatches {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let dir = cfg.project_path(&cfg.inputs.local_patch_dir);
        if !dir.is_dir() {
            ctx.log(&format!("no local patches at {}", dir.display()));
            return Ok(());
        }
        let has_entries = fs::read_dir(&dir)
            .map_err(|e| Error::io(format!("failed to read {}", dir.display()), e))?
            .next()
            .is_some();
        if !has_entries {
            ctx.log(&format!("local patch directory {} is empty", dir.display()));
            return Ok(());
        }

        let mut vars = TemplateVars::for_project(cfg, &ctx.workspace)?;
        vars.set_path("patch_dir", &dir);
        ctx.run(tool_command(cfg, &vars, &cfg.tools.patch, "patch")?)
    }
}
