use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::CacheConfig;
use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ExecEvent};
use crate::phases::{optional_tool_command, tool_command};
use crate::template::TemplateVars;

pub const JOBS_ENV: &str = "IRONMILL_JOBS";
pub const BUILD_STEP: &str = "build";

/// Worker count: the environment override, then the project setting, then the
/// host CPU count. Zero means "host CPU count" wherever it appears.
pub fn resolve_jobs(env_override: Option<&str>, configured: Option<usize>, cores: usize) -> Result<usize> {
    let cores = cores.max(1);
    if let Some(raw) = env_override.map(str::trim).filter(|s| !s.is_empty()) {
        let n: usize = raw.parse().map_err(|_| {
            Error::Project(format!("{JOBS_ENV} must be a non-negative integer, got '{raw}'"))
        })?;
        return Ok(if n == 0 { cores } else { n });
    }
    Ok(match configured {
        Some(n) if n > 0 => n,
        _ => cores,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    /// Ninja's exit status, verbatim. `None` when it was killed by a signal.
    pub exit_code: Option<i32>,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub jobs: usize,
    pub targets: Vec<String>,
    pub bootstrapped_gn: bool,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// Drives the build-graph generator and ninja. Never retries.
pub struct BuildExecutor<'a> {
    cfg: &'a ProjectConfig,
    jobs: usize,
}

impl<'a> BuildExecutor<'a> {
    pub fn new(cfg: &'a ProjectConfig, jobs: usize) -> Self {
        Self { cfg, jobs }
    }

    pub fn invoke(&self, ctx: &mut ExecCtx, cache: &CacheConfig) -> Result<BuildOutcome> {
        ctx.set_phase(BUILD_STEP);
        ctx.sink.emit(ExecEvent::PhaseStarted {
            id: BUILD_STEP.into(),
            label: format!("Build {}", self.cfg.build.targets.join(", ")),
        });
        let started = Instant::now();
        let res = self.invoke_inner(ctx, cache, started);
        let elapsed = started.elapsed();

        ctx.sink.emit(ExecEvent::PhaseFinished {
            id: BUILD_STEP.into(),
            ok: matches!(&res, Ok(o) if o.success()),
            error: match &res {
                Ok(o) if !o.success() => Some(match o.exit_code {
                    Some(c) => format!("ninja exited with status {c}"),
                    None => "ninja was terminated by a signal".into(),
                }),
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            },
            elapsed_ms: elapsed.as_millis(),
        });
        ctx.current_phase = None;
        res
    }

    fn invoke_inner(&self, ctx: &mut ExecCtx, cache: &CacheConfig, started: Instant) -> Result<BuildOutcome> {
        let cfg = self.cfg;
        let out_dir = ctx.workspace.out_dir.clone();
        fs::create_dir_all(&out_dir)
            .map_err(|e| Error::io(format!("failed to create {}", out_dir.display()), e))?;

        let mut vars = TemplateVars::for_project(cfg, &ctx.workspace)?;
        vars.set("jobs", self.jobs.to_string());
        let gn = vars.get("gn").unwrap_or_default().to_string();

        // Bootstrap is keyed on the binary itself, not on a marker.
        let mut bootstrapped_gn = false;
        if !Path::new(&gn).is_file() {
            match optional_tool_command(cfg, &vars, &cfg.tools.gn_bootstrap)? {
                Some(cmd) => {
                    ctx.run(cmd.envs(&cache.env))?;
                    bootstrapped_gn = true;
                }
                None => {
                    return Err(Error::Project(format!(
                        "{gn} does not exist and tools.gn_bootstrap is empty"
                    )));
                }
            }
        }

        ctx.run(tool_command(cfg, &vars, &cfg.tools.gn_gen, "gn_gen")?.envs(&cache.env))?;

        let mut ninja = tool_command(cfg, &vars, &cfg.tools.ninja, "ninja")?.envs(&cache.env);
        for t in &cfg.build.targets {
            ninja = ninja.arg(t);
        }
        tracing::info!(jobs = self.jobs, cache = cache.enabled, "starting build");
        let status = ctx.run_status(&ninja)?;
        let elapsed = started.elapsed();

        ctx.sink.emit(ExecEvent::BuildFinished {
            exit_code: status.code,
            jobs: self.jobs,
            elapsed_ms: elapsed.as_millis(),
        });
        tracing::info!(code = ?status.code, elapsed_ms = elapsed.as_millis() as u64, "build finished");

        Ok(BuildOutcome {
            exit_code: status.code,
            elapsed,
            jobs: self.jobs,
            targets: cfg.build.targets.clone(),
            bootstrapped_gn,
        })
    }
}
