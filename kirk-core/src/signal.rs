//! Ctrl-C / SIGTERM handling for the CLI.
//!
//! Kirk only cares about "please stop soon" (no job-control or info-query signals), so this is
//! a scaled-down version of a full terminal signal multiplexer: one `ShutdownEvent` stream.

use crate::errors::SignalHandlerSetupError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    Interrupt,
    #[cfg(unix)]
    Term,
    #[cfg(unix)]
    Hangup,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// Installs real OS signal handlers.
    Standard,
    /// Never fires. Used in tests.
    Noop,
}

impl SignalHandlerKind {
    pub fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

pub struct SignalHandler {
    signals: Option<imp::Signals>,
}

impl SignalHandler {
    pub fn new() -> Result<Self, SignalHandlerSetupError> {
        Ok(Self {
            signals: Some(imp::Signals::new()?),
        })
    }

    pub fn noop() -> Self {
        Self { signals: None }
    }

    pub async fn recv(&mut self) -> Option<ShutdownEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::ShutdownEvent;
    use crate::errors::SignalHandlerSetupError;
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub(super) struct Signals {
        interrupt: Signal,
        term: Signal,
        hangup: Signal,
    }

    impl Signals {
        pub(super) fn new() -> Result<Self, SignalHandlerSetupError> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                term: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            tokio::select! {
                _ = self.interrupt.recv() => Some(ShutdownEvent::Interrupt),
                _ = self.term.recv() => Some(ShutdownEvent::Term),
                _ = self.hangup.recv() => Some(ShutdownEvent::Hangup),
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::ShutdownEvent;
    use crate::errors::SignalHandlerSetupError;

    pub(super) struct Signals;

    impl Signals {
        pub(super) fn new() -> Result<Self, SignalHandlerSetupError> {
            Ok(Self)
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            tokio::signal::ctrl_c().await.ok()?;
            Some(ShutdownEvent::Interrupt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_handler_never_fires() {
        let mut handler = SignalHandlerKind::Noop.build().unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), handler.recv()).await;
        assert!(result.is_err());
    }
}
