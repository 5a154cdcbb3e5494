use std::fs;
use std::path::{Component, Path};

use ironmill_macros::Phase;

use crate::config::{ProjectConfig, ToolchainLink};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::gn_args::GnArgs;
use crate::phases::{ARGS_FILE, optional_tool_command};
use crate::template::TemplateVars;

/// Brings the in-tree compiler, the runtime toolchain and (when the build
/// arguments ask for one) the sysroot up to date.
#[Phase(
    id = "toolchain",
    label = "Prepare toolchains",
    after = ["endpoint-rewrite"]
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Toolchain;

impl Toolchain {
    fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let vars = TemplateVars::for_project(cfg, &ctx.workspace)?;

        for link in &cfg.toolchain.links {
            link_prebuilt(cfg, &vars, ctx, link)?;
        }

        for (name, template) in [
            ("update_compiler", &cfg.tools.update_compiler),
            ("update_runtime_toolchain", &cfg.tools.update_runtime_toolchain),
        ] {
            match optional_tool_command(cfg, &vars, template)? {
                Some(cmd) => ctx.run(cmd)?,
                None => ctx.log(&format!("tools.{name} is empty, skipping")),
            }
        }

        if sysroot_requested(cfg, ctx)? {
            match optional_tool_command(cfg, &vars, &cfg.tools.install_sysroot)? {
                Some(cmd) => ctx.run(cmd)?,
                None => {
                    tracing::warn!("sysroot requested but tools.install_sysroot is empty");
                    ctx.log("WARN: sysroot requested but tools.install_sysroot is empty");
                }
            }
        } else {
            ctx.log("sysroot not requested");
        }
        Ok(())
    }
}

fn sysroot_requested(cfg: &ProjectConfig, ctx: &ExecCtx) -> Result<bool> {
    let path = ctx.workspace.out_dir.join(ARGS_FILE);
    let text = fs::read_to_string(&path).map_err(|e| {
        Error::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let args = GnArgs::parse(&text)?;
    Ok(args.get_bool(cfg.toolchain.sysroot_flag.trim()) == Some(true))
}

fn link_prebuilt(
    cfg: &ProjectConfig,
    vars: &TemplateVars,
    ctx: &ExecCtx,
    link: &ToolchainLink,
) -> Result<()> {
    let from = cfg.project_path(&vars.expand(&link.from)?);
    let rel = Path::new(link.to.trim());
    if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::Project(format!(
            "toolchain link '{}' must be relative to the source tree",
            link.to
        )));
    }
    let to = ctx.workspace.source_dir.join(rel);

    if fs::symlink_metadata(&to).is_ok() {
        tracing::warn!(path = %to.display(), "toolchain link target already present");
        ctx.log(&format!("WARN: {} already present, not linking", to.display()));
        return Ok(());
    }
    if !from.exists() {
        return Err(Error::msg(format!(
            "prebuilt toolchain {} does not exist",
            from.display()
        )));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
    }
    symlink(&from, &to)?;
    ctx.log(&format!("linked {} -> {}", to.display(), from.display()));
    Ok(())
}

#[cfg(unix)]
fn symlink(from: &Path, to: &Path) -> Result<()> {
    std::os::unix::fs::symlink(from, to)
        .map_err(|e| Error::io(format!("failed to link {}", to.display()), e))
}

#[cfg(not(unix))]
fn symlink(_from: &Path, to: &Path) -> Result<()> {
    Err(Error::msg(format!(
        "toolchain links are only supported on unix ({})",
        to.display()
    )))
}
