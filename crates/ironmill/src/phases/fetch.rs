use ironmill_macros::Phase;

use crate::config::{ProjectConfig, SourceMode};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::phases::tool_command;
use crate::template::TemplateVars;

/// Produces the source tree. Skipped whenever the tree already looks usable,
/// whatever the markers say; running it invalidates everything downstream.
#[Phase(
    id = "fetch",
    label = "Fetch source tree",
    skip = "source-tree",
    invalidates_downstream = true
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Fetch;

impl Fetch {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace.clone();
        let partial = !ws.source_holds_only_layout();
        if ws.remove_source_tree()? && partial {
            tracing::warn!(path = %ws.source_dir.display(), "removed incomplete source tree");
            ctx.log(&format!(
                "removed incomplete source tree {}",
                ws.source_dir.display()
            ));
        }

        let vars = TemplateVars::for_project(cfg, &ws)?;
        match cfg.source.mode {
            SourceMode::Retrieve => {
                ctx.run(tool_command(cfg, &vars, &cfg.tools.retrieve, "retrieve")?)?;
                ctx.run(tool_command(cfg, &vars, &cfg.tools.unpack, "unpack")?)?;
            }
            SourceMode::Checkout => {
                ctx.run(tool_command(cfg, &vars, &cfg.tools.checkout, "checkout")?)?;
            }
        }

        if !ws.is_source_valid() {
            return Err(Error::Validation(format!(
                "{} finished but the tree is incomplete (expected {})",
                cfg.source.mode.as_str(),
                ws.validity_requirement()
            )));
        }
        ctx.log(&format!("source tree ready at {}", ws.source_dir.display()));
        Ok(())
    }
}
