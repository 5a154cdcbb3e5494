use ironmill_macros::Phase;

use crate::config::ProjectConfig;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::gn_args;

pub const ARGS_FILE: &str = "args.gn";

/// Materializes `<out_dir>/args.gn` from the base flags and the project
/// override. Runs on every invocation so flag edits always reach the build.
#[Phase(
    id = "configure",
    label = "Write build arguments",
    skip = "never",
    after = ["local-patches"]
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Configure;

impl Configure {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let base = cfg.project_path(&cfg.inputs.base_args);
        let local = cfg.project_path(&cfg.inputs.override_args);
        let dest = ctx.workspace.out_dir.join(ARGS_FILE);

        let out = gn_args::materialize(&base, Some(&local), &dest)?;
        if out.changed {
            tracing::info!(path = %out.path.display(), digest = %out.digest, "build arguments changed");
            ctx.log(&format!(
                "wrote {} ({} args, sha256 {})",
                out.path.display(),
                out.args.len(),
                out.digest
            ));
        } else {
            ctx.log(&format!("{} unchanged", out.path.display()));
        }
        Ok(())
    }
}
