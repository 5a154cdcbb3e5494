use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A collaborator process exited nonzero (or was killed by a signal).
    #[error("phase '{phase}' failed: `{command}` {}", describe_exit(.code))]
    ExternalCommand {
        phase: String,
        command: String,
        code: Option<i32>,
    },

    /// The materialized build configuration could not be produced or read back.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The source tree is structurally invalid after a fetch that should have produced it.
    #[error("source tree validation failed: {0}")]
    Validation(String),

    #[error("project config error: {0}")]
    Project(String),

    #[error("workspace is locked by another invocation ({})", .0.display())]
    Locked(PathBuf),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code to surface for this error. Collaborator exit codes pass through unchanged.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ExternalCommand { code: Some(c), .. } if *c != 0 => *c,
            _ => 1,
        }
    }

    pub fn failed_phase(&self) -> Option<&str> {
        match self {
            Error::ExternalCommand { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exited with status {c}"),
        None => "was terminated by a signal".into(),
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io("i/o error", err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Project(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_command_exit_code_passes_through() {
        let err = Error::ExternalCommand {
            phase: "domain-substitution".into(),
            command: "python3 utils/domain_substitution.py apply".into(),
            code: Some(3),
        };
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.failed_phase(), Some("domain-substitution"));
        let text = err.to_string();
        assert!(text.contains("domain-substitution"), "unexpected: {text}");
        assert!(text.contains("status 3"), "unexpected: {text}");
    }

    #[test]
    fn signalled_command_maps_to_generic_failure() {
        let err = Error::ExternalCommand {
            phase: "fetch".into(),
            command: "unpack".into(),
            code: None,
        };
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn non_command_errors_exit_with_one() {
        assert_eq!(Error::Validation("missing BUILD.gn".into()).exit_code(), 1);
        assert_eq!(Error::msg("boom").exit_code(), 1);
    }
}
