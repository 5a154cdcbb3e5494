use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "IRONMILL_LOG";

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber on stderr. Stdout is reserved for progress
/// lines and command output. `IRONMILL_LOG` takes precedence over `-v`.
pub fn init(verbose: u8, json: bool) {
    if INITIALIZED.get().is_some() {
        return;
    }
    let default = match verbose {
        0 => "ironmill=info",
        1 => "ironmill=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if let Err(e) = res {
        eprintln!("logging already initialised: {e}");
    }
    let _ = INITIALIZED.set(());
}
