use std::time::Duration;

use serenity::model::id::{ChannelId, GuildId};
use thiserror::Error;

/// Typed failures of the playback core.
///
/// The chat-facing layer renders these straight into user messages, so
/// every variant carries enough context to be read without the logs.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Metadata lookup returned the empty sentinel track.
    #[error("no se pudo resolver `{0}`")]
    Unresolvable(String),

    /// No registered resolver claims the locator.
    #[error("plataforma no soportada para `{0}`")]
    Unsupported(String),

    #[error("no se encontró la guild {0}")]
    GuildNotFound(GuildId),

    #[error("no se encontró el canal de voz {0}")]
    ChannelNotFound(ChannelId),

    #[error("error al unirse al canal de voz: {0}")]
    Join(String),

    /// An external process could not be spawned or exited badly.
    #[error("{program}: {message}")]
    Process { program: String, message: String },

    #[error("metadata inválida para `{locator}`: {message}")]
    Metadata { locator: String, message: String },

    #[error("error de transporte de voz: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub fn process(program: impl Into<String>, message: impl ToString) -> Self {
        Self::Process {
            program: program.into(),
            message: message.to_string(),
        }
    }

    /// Lookup failures abort the whole playback loop instead of one track.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            Self::GuildNotFound(_) | Self::ChannelNotFound(_) | Self::Join(_)
        )
    }
}

pub type PlayerResult<T> = Result<T, PlayerError>;

/// Formats a track length for chat messages (`3m 12s`).
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}
