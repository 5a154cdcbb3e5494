//! The standard preparation phases, in pipeline order.

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::executor::CommandSpec;
use crate::pipeline::{Phase, Pipeline};
use crate::template::TemplateVars;

pub mod configure;
pub mod domain_substitution;
pub mod endpoint_rewrite;
pub mod fetch;
pub mod local_patches;
pub mod prune_patch;
pub mod toolchain;

pub use configure::{ARGS_FILE, Configure};
pub use domain_substitution::DomainSubstitution;
pub use endpoint_rewrite::EndpointRewrite;
pub use fetch::Fetch;
pub use local_patches::LocalPatches;
pub use prune_patch::PrunePatch;
pub use toolchain::Toolchain;

pub fn standard_phases() -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(Fetch),
        Box::new(PrunePatch),
        Box::new(DomainSubstitution),
        Box::new(LocalPatches),
        Box::new(Configure),
        Box::new(EndpointRewrite),
        Box::new(Toolchain),
    ]
}

pub fn standard_pipeline() -> Result<Pipeline> {
    Pipeline::new(standard_phases())
}

/// Expand a required collaborator template. Commands run from the project directory.
pub(crate) fn tool_command(
    cfg: &ProjectConfig,
    vars: &TemplateVars,
    template: &[String],
    name: &str,
) -> Result<CommandSpec> {
    optional_tool_command(cfg, vars, template)?
        .ok_or_else(|| Error::Project(format!("tools.{name} must not be empty")))
}

/// An empty template means the step is disabled.
pub(crate) fn optional_tool_command(
    cfg: &ProjectConfig,
    vars: &TemplateVars,
    template: &[String],
) -> Result<Option<CommandSpec>> {
    if template.is_empty() {
        return Ok(None);
    }
    let argv = vars.expand_argv(template)?;
    Ok(Some(CommandSpec::from_argv(argv)?.cwd(&cfg.project_dir)))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::pipeline::SkipRule;
    use crate::workspace::Workspace;

    #[test]
    fn standard_order_and_rules() {
        let pipeline = standard_pipeline().expect("pipeline");
        assert_eq!(
            pipeline.ids(),
            [
                "fetch",
                "prune-patch",
                "domain-substitution",
                "local-patches",
                "configure",
                "endpoint-rewrite",
                "toolchain",
            ]
        );

        let phases = standard_phases();
        assert_eq!(phases[0].skip_rule(), SkipRule::SourceTree);
        assert!(phases[0].invalidates_downstream());
        assert_eq!(phases[4].skip_rule(), SkipRule::Never);
        assert!(
            phases[1..]
                .iter()
                .filter(|p| p.id() != "configure")
                .all(|p| p.skip_rule() == SkipRule::Marker)
        );
        assert_eq!(
            LocalPatches::AFTER,
            &["prune-patch", "domain-substitution"]
        );
    }

    #[test]
    fn empty_required_template_is_rejected() {
        let cfg = ProjectConfig::defaults_in(Path::new("/p"));
        let ws = Workspace::from_config(&cfg).expect("workspace");
        let vars = TemplateVars::for_project(&cfg, &ws).expect("vars");

        let err = tool_command(&cfg, &vars, &[], "prune").unwrap_err().to_string();
        assert!(err.contains("tools.prune"), "unexpected err: {err}");
        assert!(optional_tool_command(&cfg, &vars, &[]).expect("ok").is_none());

        let spec = tool_command(&cfg, &vars, &cfg.tools.prune, "prune").expect("spec");
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/p")));
        assert_eq!(spec.args[1], "/p/build/src");
    }
}
