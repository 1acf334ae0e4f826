use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },
    #[error("failed to start terminal: {source}")]
    TerminalStart {
        #[source]
        source: std::io::Error,
    },
    #[error("terminal command failed: {detail}")]
    TerminalCommand { detail: String },
    #[error("terminal died")]
    TerminalDied,
    #[error("failed to send chat message: {detail}")]
    SendFailed { detail: String },
    #[error("share server error: {detail}")]
    Share { detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub(crate) fn terminal_start(source: std::io::Error) -> Self {
        Self::TerminalStart { source }
    }

    pub(crate) fn terminal_command(detail: impl Into<String>) -> Self {
        Self::TerminalCommand {
            detail: detail.into(),
        }
    }

    pub(crate) fn send_failed(detail: impl Into<String>) -> Self {
        Self::SendFailed {
            detail: detail.into(),
        }
    }

    pub(crate) fn share(detail: impl Into<String>) -> Self {
        Self::Share {
            detail: detail.into(),
        }
    }
}

/// Why a session left the `running` state. Drives the final chat message and
/// is recorded once; the first close request wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserExit,
    TerminalDied,
    Idle,
    Forced,
}

impl CloseReason {
    pub fn message(self) -> &'static str {
        match self {
            CloseReason::UserExit => "Session closed. Bye!",
            CloseReason::TerminalDied => "The terminal exited. Session closed.",
            CloseReason::Idle => "Session closed due to inactivity.",
            CloseReason::Forced => "The bot is shutting down. Session closed.",
        }
    }
}
