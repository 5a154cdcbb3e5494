use std::fs;

use ironmill_macros::Phase;

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::phases::tool_command;
use crate::template::TemplateVars;

#[Phase(
    id = "domain-substitution",
    label = "Substitute domains",
    after = ["prune-patch"]
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainSubstitution;

impl DomainSubstitution {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let artifact = ctx.workspace.domsub_cache.clone();
        // The substitution tool refuses to overwrite its own cache artifact.
        if artifact.exists() {
            tracing::warn!(path = %artifact.display(), "removing leftover substitution cache");
            ctx.log(&format!(
                "removing leftover substitution cache {}",
                artifact.display()
            ));
            fs::remove_file(&artifact).map_err(|e| {
                Error::io(format!("failed to remove {}", artifact.display()), e)
            })?;
        }

        let vars = TemplateVars::for_project(cfg, &ctx.workspace)?;
        ctx.run(tool_command(
            cfg,
            &vars,
            &cfg.tools.domain_substitution,
            "domain_substitution",
        )?)
    }
}
