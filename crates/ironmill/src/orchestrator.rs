use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::builder::{BuildExecutor, BuildOutcome, resolve_jobs};
use crate::cache::{CacheConfig, CacheCoordinator};
use crate::config::{ProjectConfig, SourceMode};
use crate::error::{Error, Result};
use crate::executor::{CommandRunner, ExecCtx, ExecEvent, ExecSink};
use crate::gn_args;
use crate::markers::MarkerRecord;
use crate::phases::{ARGS_FILE, standard_pipeline};
use crate::pipeline::{Pipeline, PipelineReport, PlannedPhase};
use crate::workspace::{ResetOptions, ResetReport, Workspace, WorkspaceLock};

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub clean: bool,
    pub purge_caches: bool,
    pub source_mode: Option<SourceMode>,
    /// Raw worker count override, as read from the environment.
    pub jobs_override: Option<String>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub reset: Option<ResetReport>,
    pub pipeline: PipelineReport,
    pub cache: CacheConfig,
    pub build: BuildOutcome,
}

impl RunSummary {
    /// Ninja's status passes through; a signal maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self.build.exit_code {
            Some(c) => c,
            None => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project_dir: PathBuf,
    pub workspace: PathBuf,
    pub source_mode: SourceMode,
    pub source_valid: bool,
    pub phases: Vec<PlannedPhase>,
    pub markers: Vec<MarkerRecord>,
    pub gn_present: bool,
    pub args_digest: Option<String>,
}

pub struct Orchestrator {
    cfg: ProjectConfig,
    workspace: Workspace,
    pipeline: Pipeline,
    runner: Arc<dyn CommandRunner>,
    sink: Arc<dyn ExecSink>,
    cache_search_path: Option<OsString>,
}

impl Orchestrator {
    pub fn new(cfg: ProjectConfig, runner: Arc<dyn CommandRunner>, sink: Arc<dyn ExecSink>) -> Result<Self> {
        let workspace = Workspace::from_config(&cfg)?;
        Ok(Self {
            cfg,
            workspace,
            pipeline: standard_pipeline()?,
            runner,
            sink,
            cache_search_path: None,
        })
    }

    pub fn with_cache_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.cache_search_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.cfg
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// One build request end to end. Phase and build failures are emitted to the
    /// sink before they are returned; a failing ninja is not an error.
    pub fn run(&self, req: &BuildRequest) -> Result<RunSummary> {
        let res = self.run_inner(req);
        let (ok, error) = match &res {
            Ok(s) if s.build.success() => (true, None),
            Ok(s) => (false, Some(format!("build exited with status {}", s.exit_code()))),
            Err(e) => (false, Some(e.to_string())),
        };
        self.sink.emit(ExecEvent::Done { ok, error });
        res
    }

    fn run_inner(&self, req: &BuildRequest) -> Result<RunSummary> {
        let _lock = WorkspaceLock::acquire(&self.workspace)?;

        let mut cfg = self.cfg.clone();
        if let Some(mode) = req.source_mode {
            cfg.source.mode = mode;
        }
        let jobs = resolve_jobs(req.jobs_override.as_deref(), cfg.build.jobs, num_cpus::get())?;
        tracing::info!(
            workspace = %self.workspace.root.display(),
            mode = cfg.source.mode.as_str(),
            jobs,
            clean = req.clean,
            "build requested"
        );

        let reset = if req.clean {
            let opts = if req.purge_caches {
                ResetOptions::purge_all()
            } else {
                ResetOptions::default()
            };
            let report = self.workspace.reset(opts)?;
            tracing::info!(removed = report.removed.len(), "workspace reset");
            Some(report)
        } else {
            None
        };

        self.workspace.ensure_layout()?;

        let mut ctx = ExecCtx::new(
            self.workspace.clone(),
            Arc::clone(&self.runner),
            Arc::clone(&self.sink),
        );
        let pipeline = self.pipeline.run(&cfg, &mut ctx).check()?;

        let mut coordinator = CacheCoordinator::new(&cfg, &self.workspace)?;
        if let Some(path) = &self.cache_search_path {
            coordinator = coordinator.with_search_path(path.clone());
        }
        let cache = coordinator.configure();

        let build = BuildExecutor::new(&cfg, jobs).invoke(&mut ctx, &cache)?;
        Ok(RunSummary {
            reset,
            pipeline,
            cache,
            build,
        })
    }

    /// Phase plan and marker state. Touches nothing.
    pub fn status(&self) -> Result<StatusReport> {
        let ws = &self.workspace;
        let gn = crate::template::TemplateVars::for_project(&self.cfg, ws)?
            .get("gn")
            .map(PathBuf::from)
            .unwrap_or_default();
        let digest = fs::read_to_string(gn_args::digest_path(&ws.out_dir.join(ARGS_FILE)))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(StatusReport {
            project_dir: self.cfg.project_dir.clone(),
            workspace: ws.root.clone(),
            source_mode: self.cfg.source.mode,
            source_valid: ws.is_source_valid(),
            phases: self.pipeline.preview(ws),
            markers: ws.markers().list()?,
            gn_present: gn.is_file(),
            args_digest: digest,
        })
    }

    pub fn clean(&self, purge_caches: bool) -> Result<ResetReport> {
        let _lock = WorkspaceLock::acquire(&self.workspace)?;
        let opts = if purge_caches {
            ResetOptions::purge_all()
        } else {
            ResetOptions::default()
        };
        self.workspace.reset(opts)
    }

    /// Clear one phase's marker (and with `cascade`, every later one). Returns the cleared ids.
    pub fn invalidate(&self, phase: &str, cascade: bool) -> Result<Vec<String>> {
        let Some(downstream) = self.pipeline.downstream_of(phase) else {
            return Err(Error::msg(format!(
                "unknown phase '{phase}' (known: {})",
                self.pipeline.ids().join(", ")
            )));
        };
        let _lock = WorkspaceLock::acquire(&self.workspace)?;
        let markers = self.workspace.markers();

        let mut ids = vec![phase];
        if cascade {
            ids.extend(downstream);
        }
        let mut cleared = Vec::new();
        for id in ids {
            if markers.has(id) {
                markers.clear(id)?;
                cleared.push(id.to_string());
            }
        }
        if phase == crate::phases::Fetch::ID && self.workspace.is_source_valid() {
            tracing::warn!("fetch is skipped while the source tree is valid; use `clean` to fetch again");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::mpsc;

    use super::*;
    use crate::executor::{ChannelSink, ScriptedRunner};

    fn orchestrator(dir: &Path) -> Orchestrator {
        let (tx, _) = mpsc::channel();
        Orchestrator::new(
            ProjectConfig::defaults_in(dir),
            Arc::new(ScriptedRunner::new()),
            Arc::new(ChannelSink::new(tx)),
        )
        .expect("orchestrator")
    }

    #[test]
    fn status_on_empty_workspace_plans_everything() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let o = orchestrator(tmp.path());

        let status = o.status().expect("status");
        assert!(!status.source_valid);
        assert!(status.markers.is_empty());
        assert!(!status.gn_present);
        assert_eq!(status.phases.len(), 7);
        assert!(
            status
                .phases
                .iter()
                .all(|p| p.decision == crate::pipeline::Decision::Run)
        );
        assert!(!o.workspace().root.exists(), "status must not create the workspace");
    }

    #[test]
    fn invalidate_rejects_unknown_phase_and_cascades_on_request() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let o = orchestrator(tmp.path());
        let markers = o.workspace().markers();
        for id in o.pipeline().ids() {
            markers.set(id).expect("seed");
        }

        assert!(o.invalidate("compile", false).is_err());

        let cleared = o.invalidate("toolchain", false).expect("single");
        assert_eq!(cleared, ["toolchain"]);
        assert!(markers.has("endpoint-rewrite"));

        let cleared = o.invalidate("domain-substitution", true).expect("cascade");
        assert_eq!(
            cleared,
            ["domain-substitution", "local-patches", "configure", "endpoint-rewrite"]
        );
        assert!(markers.has("prune-patch"));
    }
}
