use ironmill_macros::Phase;

use crate::config::ProjectConfig;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::phases::tool_command;
use crate::template::TemplateVars;

/// Prune prebuilt binaries, then apply the patch series. One marker covers both.
#[Phase(
    id = "prune-patch",
    label = "Prune binaries and apply patches",
    after = ["fetch"]
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PrunePatch;

impl PrunePatch {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let vars = TemplateVars::for_project(cfg, &ctx.workspace)?;
        ctx.run(tool_command(cfg, &vars, &cfg.tools.prune, "prune")?)?;
        ctx.run(tool_command(cfg, &vars, &cfg.tools.patch, "patch")?)?;
        Ok(())
    }
}
