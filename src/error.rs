use thiserror::Error;

/// Failure modes surfaced by the instrument controllers.
///
/// The recovery policy keys off the variant: `NeedsReconnect` tears the
/// connection down and rebuilds it, `NeedsSelfHeal` runs the pulse
/// generator repair loop, anything else is handled by the caller's
/// blanket escalation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("connection to {device} lost: {reason}")]
    NeedsReconnect { device: &'static str, reason: String },

    #[error("{device} left a healthy state: {reason}")]
    NeedsSelfHeal { device: &'static str, reason: String },

    #[error("serial port error")]
    Serial(#[from] serialport::Error),

    #[error("device I/O failed")]
    Io(#[from] std::io::Error),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        after: std::time::Duration,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("parameter change rejected: {reason}")]
    Rejected { reason: String },

    #[error("stop requested, abandoning device recovery")]
    Stopped,

    #[error("unrecoverable device failure: {0}")]
    Fatal(String),
}

impl DeviceError {
    pub fn needs_reconnect(device: &'static str, reason: impl Into<String>) -> Self {
        DeviceError::NeedsReconnect {
            device,
            reason: reason.into(),
        }
    }

    pub fn needs_self_heal(device: &'static str, reason: impl Into<String>) -> Self {
        DeviceError::NeedsSelfHeal {
            device,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        DeviceError::Rejected {
            reason: reason.into(),
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
