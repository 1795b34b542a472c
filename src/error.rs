use poise::serenity_prelude::{self as serenity, UserId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    // State errors
    #[error("Failed to save state to '{path}': {source}")]
    StateSave {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load state from '{path}': {source}")]
    StateLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse state file '{path}': {source}")]
    StateParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    // Verification errors
    #[error("User {user_id} already has an open ticket")]
    DuplicateTicket { user_id: UserId },

    // Booking-check errors
    #[error("Booking API error: {message}")]
    BookingApi { message: String },

    // Discord errors
    #[error("Discord API error: {message}")]
    Discord { message: String },

    // Generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<serenity::Error> for BotError {
    fn from(err: serenity::Error) -> Self {
        BotError::Discord {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

/// Short opaque reference shown to end users when a command fails.
/// The detailed error is logged server-side under the same reference.
pub fn error_reference() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reference_short_and_unique() {
        let a = error_reference();
        let b = error_reference();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
