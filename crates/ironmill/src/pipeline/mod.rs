//! The incremental state machine: which phases run, in what order, and when
//! their markers are written.
//!
//! Phase states live only for one invocation. The durable state is the marker
//! directory plus the source tree itself.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ExecEvent};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipRule {
    /// Skip while the phase's marker is present.
    Marker,
    /// Skip while the source tree passes the validity check, regardless of markers.
    SourceTree,
    /// Run on every invocation.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    MarkerPresent,
    SourceTreeValid,
}

impl SkipReason {
    pub fn describe(self) -> &'static str {
        match self {
            SkipReason::MarkerPresent => "already completed",
            SkipReason::SourceTreeValid => "source tree present",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "action", content = "reason")]
pub enum Decision {
    Run,
    Skip(SkipReason),
}

/// One ordered unit of preparation work. Implemented through `#[Phase(..)]`.
pub trait Phase: Send + Sync {
    /// Stable identifier; also the marker key.
    fn id(&self) -> &'static str;
    fn label(&self) -> &'static str;
    fn skip_rule(&self) -> SkipRule;
    /// Phases that must appear earlier in the pipeline.
    fn after(&self) -> &'static [&'static str];
    /// Running this phase clears the markers of every later phase first.
    fn invalidates_downstream(&self) -> bool;
    fn execute(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub id: String,
    pub state: PhaseState,
    pub skipped: Option<SkipReason>,
    #[serde(skip)]
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub records: Vec<PhaseRecord>,
    /// The error of the phase that halted the pipeline.
    pub failure: Option<Error>,
}

impl PipelineReport {
    pub fn state_of(&self, id: &str) -> Option<PhaseState> {
        self.records.iter().find(|r| r.id == id).map(|r| r.state)
    }

    pub fn executed_ids(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.skipped.is_none() && r.state != PhaseState::Pending)
            .map(|r| r.id.as_str())
            .collect()
    }

    pub fn skipped_ids(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.skipped.is_some())
            .map(|r| r.id.as_str())
            .collect()
    }

    pub fn failed_phase(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.state == PhaseState::Failed)
            .map(|r| r.id.as_str())
    }

    /// Hand back the report, or the failure that halted it.
    pub fn check(mut self) -> Result<Self> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedPhase {
    pub id: &'static str,
    pub label: &'static str,
    pub skip_rule: SkipRule,
    pub marker: bool,
    pub decision: Decision,
}

pub struct Pipeline {
    phases: Vec<Box<dyn Phase>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

impl Pipeline {
    pub fn new(phases: Vec<Box<dyn Phase>>) -> Result<Self> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for phase in &phases {
            let id = phase.id();
            for dep in phase.after() {
                if !seen.contains(dep) {
                    return Err(Error::msg(format!(
                        "phase '{id}' must run after '{dep}', which is not an earlier phase"
                    )));
                }
            }
            if !seen.insert(id) {
                return Err(Error::msg(format!("duplicate phase id '{id}'")));
            }
        }
        Ok(Self { phases })
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.id()).collect()
    }

    /// Ids of the phases after `id`, in order.
    pub fn downstream_of(&self, id: &str) -> Option<Vec<&'static str>> {
        let idx = self.phases.iter().position(|p| p.id() == id)?;
        Some(self.phases[idx + 1..].iter().map(|p| p.id()).collect())
    }

    pub fn decide(&self, phase: &dyn Phase, ws: &Workspace) -> Decision {
        match phase.skip_rule() {
            SkipRule::Marker if ws.markers().has(phase.id()) => {
                Decision::Skip(SkipReason::MarkerPresent)
            }
            SkipRule::SourceTree if ws.is_source_valid() => {
                Decision::Skip(SkipReason::SourceTreeValid)
            }
            _ => Decision::Run,
        }
    }

    /// What `run` would do right now, without side effects.
    pub fn preview(&self, ws: &Workspace) -> Vec<PlannedPhase> {
        let mut invalidated = false;
        let markers = ws.markers();
        self.phases
            .iter()
            .map(|phase| {
                let mut decision = self.decide(phase.as_ref(), ws);
                if invalidated && phase.skip_rule() == SkipRule::Marker {
                    decision = Decision::Run;
                }
                if decision == Decision::Run && phase.invalidates_downstream() {
                    invalidated = true;
                }
                PlannedPhase {
                    id: phase.id(),
                    label: phase.label(),
                    skip_rule: phase.skip_rule(),
                    marker: markers.has(phase.id()),
                    decision,
                }
            })
            .collect()
    }

    /// Walk the phases in order. The first failure halts the walk; later phases stay `Pending`.
    pub fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> PipelineReport {
        let mut report = PipelineReport {
            records: self
                .phases
                .iter()
                .map(|p| PhaseRecord {
                    id: p.id().to_string(),
                    state: PhaseState::Pending,
                    skipped: None,
                    elapsed: Duration::ZERO,
                })
                .collect(),
            failure: None,
        };

        for (idx, phase) in self.phases.iter().enumerate() {
            let id = phase.id();
            if let Decision::Skip(reason) = self.decide(phase.as_ref(), &ctx.workspace) {
                tracing::info!(phase = id, reason = reason.describe(), "skipping phase");
                ctx.sink.emit(ExecEvent::PhaseSkipped {
                    id: id.to_string(),
                    reason: reason.describe().to_string(),
                });
                let rec = &mut report.records[idx];
                rec.state = PhaseState::Completed;
                rec.skipped = Some(reason);
                continue;
            }

            ctx.set_phase(id);
            report.records[idx].state = PhaseState::Running;
            ctx.sink.emit(ExecEvent::PhaseStarted {
                id: id.to_string(),
                label: phase.label().to_string(),
            });
            tracing::info!(phase = id, "running phase");

            let started = Instant::now();
            let res = self.execute_phase(idx, cfg, ctx);
            let elapsed = started.elapsed();
            report.records[idx].elapsed = elapsed;

            ctx.sink.emit(ExecEvent::PhaseFinished {
                id: id.to_string(),
                ok: res.is_ok(),
                error: res.as_ref().err().map(|e| e.to_string()),
                elapsed_ms: elapsed.as_millis(),
            });

            match res {
                Ok(()) => report.records[idx].state = PhaseState::Completed,
                Err(e) => {
                    tracing::error!(phase = id, error = %e, "phase failed");
                    report.records[idx].state = PhaseState::Failed;
                    report.failure = Some(e);
                    break;
                }
            }
        }
        ctx.current_phase = None;
        report
    }

    fn execute_phase(&self, idx: usize, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> {
        let phase = &self.phases[idx];
        let markers = ctx.workspace.markers();
        if phase.invalidates_downstream() {
            for later in &self.phases[idx + 1..] {
                markers.clear(later.id())?;
            }
        }
        // A marker must never survive a rerun that fails part way.
        markers.clear(phase.id())?;
        if let Err(e) = phase.execute(cfg, ctx) {
            // Later phases were built on a tree this phase has since touched.
            for later in &self.phases[idx + 1..] {
                if let Err(clear_err) = markers.clear(later.id()) {
                    tracing::warn!(phase = later.id(), error = %clear_err, "failed to clear marker");
                }
            }
            return Err(e);
        }
        markers.set(phase.id())
    }
}
