use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ironmill::builder::JOBS_ENV;
use ironmill::config::{self, SourceMode};
use ironmill::executor::{ProcessRunner, StdoutSink};
use ironmill::orchestrator::{BuildRequest, Orchestrator};
use ironmill::pipeline::Decision;
use ironmill::workspace::Workspace;
use ironmill::{Result, logging};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the workspace to a buildable state and run the build
    Build {
        /// Project file (defaults to ./ironmill.toml, or built-in defaults)
        config: Option<PathBuf>,
        /// Reset the workspace first (caches are kept)
        #[arg(long)]
        clean: bool,
        /// With --clean, also delete the download and compiler caches
        #[arg(long, requires = "clean")]
        purge_caches: bool,
        /// Clone the source tree instead of retrieving the release archive
        #[arg(long, conflicts_with = "retrieve")]
        checkout: bool,
        /// Retrieve and unpack the release archive
        #[arg(long)]
        retrieve: bool,
    },
    /// Show which phases would run and which markers are set
    Status {
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reset the workspace without building
    Clean {
        config: Option<PathBuf>,
        /// Also delete the download and compiler caches
        #[arg(long)]
        purge_caches: bool,
    },
    /// Clear a phase marker so the phase runs again
    Invalidate {
        /// Phase id (e.g. prune-patch)
        phase: String,
        config: Option<PathBuf>,
        /// Also clear every later phase
        #[arg(long)]
        cascade: bool,
    },
    /// Print the fully-resolved project config (after imports/extends and defaults)
    Resolve { config: Option<PathBuf> },
}

fn main() {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    logging::init(args.verbose, args.log_json);

    let code = match dispatch(args.cmd) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn dispatch(cmd: Command) -> Result<i32> {
    match cmd {
        Command::Build {
            config,
            clean,
            purge_caches,
            checkout,
            retrieve,
        } => {
            let source_mode = if checkout {
                Some(SourceMode::Checkout)
            } else if retrieve {
                Some(SourceMode::Retrieve)
            } else {
                None
            };
            let req = BuildRequest {
                clean,
                purge_caches,
                source_mode,
                jobs_override: std::env::var(JOBS_ENV).ok(),
            };
            cmd_build(config, &req)
        }
        Command::Status { config, json } => cmd_status(config, json).map(|_| 0),
        Command::Clean {
            config,
            purge_caches,
        } => cmd_clean(config, purge_caches).map(|_| 0),
        Command::Invalidate {
            phase,
            config,
            cascade,
        } => cmd_invalidate(config, &phase, cascade).map(|_| 0),
        Command::Resolve { config } => cmd_resolve(config).map(|_| 0),
    }
}

fn orchestrator(path: Option<PathBuf>) -> Result<Orchestrator> {
    let cfg = config::load_project(path.as_deref())?;
    let ws = Workspace::from_config(&cfg)?;
    let sink = Arc::new(StdoutSink::new(Some(ws.log_dir.clone())));
    Orchestrator::new(cfg, Arc::new(ProcessRunner), sink)
}

fn cmd_build(path: Option<PathBuf>, req: &BuildRequest) -> Result<i32> {
    let summary = orchestrator(path)?.run(req)?;
    if !summary.cache.enabled {
        println!("NOTE: compiler cache disabled");
    }
    Ok(summary.exit_code())
}

fn cmd_status(path: Option<PathBuf>, json: bool) -> Result<()> {
    let status = orchestrator(path)?.status()?;
    if json {
        let s = serde_json::to_string_pretty(&status)
            .map_err(|e| ironmill::Error::msg(format!("failed to encode status: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    println!("workspace: {}", status.workspace.display());
    println!(
        "source:    {} ({})",
        if status.source_valid { "valid" } else { "missing or incomplete" },
        status.source_mode.as_str()
    );
    for (i, p) in status.phases.iter().enumerate() {
        let action = match p.decision {
            Decision::Run => "run".to_string(),
            Decision::Skip(reason) => format!("skip ({})", reason.describe()),
        };
        println!(
            "{:>2}. {:<20} marker={:<3}  {}",
            i + 1,
            p.id,
            if p.marker { "yes" } else { "no" },
            action
        );
    }
    println!("gn:        {}", if status.gn_present { "present" } else { "absent" });
    if let Some(d) = &status.args_digest {
        println!("args.gn:   sha256 {d}");
    }
    Ok(())
}

fn cmd_clean(path: Option<PathBuf>, purge_caches: bool) -> Result<()> {
    let report = orchestrator(path)?.clean(purge_caches)?;
    if report.removed.is_empty() {
        println!("nothing to remove");
    }
    for p in &report.removed {
        println!("removed {}", p.display());
    }
    Ok(())
}

fn cmd_invalidate(path: Option<PathBuf>, phase: &str, cascade: bool) -> Result<()> {
    let cleared = orchestrator(path)?.invalidate(phase, cascade)?;
    if cleared.is_empty() {
        println!("no markers were set");
    } else {
        println!("cleared: {}", cleared.join(", "));
    }
    Ok(())
}

fn cmd_resolve(path: Option<PathBuf>) -> Result<()> {
    let cfg = config::load_project(path.as_deref())?;
    let s = toml::to_string_pretty(&cfg)
        .map_err(|e| ironmill::Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}
