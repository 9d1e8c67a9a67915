use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// The full error taxonomy of spec §7. Every variant here is returned
/// synchronously to the caller without mutating broker state, except the
/// force-end/shutdown kinds, which are internally originated and only ever
/// surface via `transmission_ended.reason` / the audit record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("channel is full")]
    ChannelFull,

    #[error("permission denied")]
    PermissionDenied,

    #[error("participant not present")]
    NotPresent,

    #[error("channel busy: {current_transmitter} is transmitting")]
    Busy { current_transmitter: String },

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("no active transmission for this session")]
    NoSession,

    #[error("chunk too large")]
    TooLarge,

    #[error("sequence too old")]
    TooOld,

    #[error("no such channel")]
    NoSuchChannel,

    #[error("server is shutting down")]
    ServerShutdown,
}

impl CoreError {
    /// Stable, machine-parseable kind string for the wire `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ChannelFull => "channel_full",
            CoreError::PermissionDenied => "permission_denied",
            CoreError::NotPresent => "not_present",
            CoreError::Busy { .. } => "busy",
            CoreError::Invalid(_) => "invalid",
            CoreError::NoSession => "no_session",
            CoreError::TooLarge => "too_large",
            CoreError::TooOld => "too_old",
            CoreError::NoSuchChannel => "no_such_channel",
            CoreError::ServerShutdown => "server_shutdown",
        }
    }
}
