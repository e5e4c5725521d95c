//! CLI-level errors, mapped to process exit codes mirroring the original driver.

use thiserror::Error;

/// Exit code contract: 0 ok, 1 internal error, 130 interrupted, 2 usage error.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Session(#[from] kirk_core::errors::SessionError),

    #[error(transparent)]
    Plugin(#[from] kirk_core::errors::PluginError),

    #[error("interrupted")]
    Interrupted,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Interrupted => 130,
            Self::Session(_) | Self::Plugin(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirk_core::errors::{PluginError, SessionError};

    #[test]
    fn exit_codes_match_the_documented_contract() {
        assert_eq!(CliError::Usage("bad flag".to_string()).exit_code(), 2);
        assert_eq!(CliError::Interrupted.exit_code(), 130);
        assert_eq!(
            CliError::Session(SessionError::NoTestsSelected).exit_code(),
            1
        );
        assert_eq!(
            CliError::Plugin(PluginError::NotFound("ssh".to_string(), "host".to_string())).exit_code(),
            1
        );
    }
}
