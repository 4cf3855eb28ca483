use std::fmt;

/// Failure talking to a backing store (key-value, message, or room store).
///
/// Collaborator stores are behind trait objects, so their concrete error
/// types are flattened into a message here.
#[derive(Debug, Clone)]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced to a client in reply to a gateway command.
///
/// None of these terminate the connection; each maps to a wire reason code
/// echoed back with enough context to correlate with the originating request.
#[derive(Debug)]
pub enum CommandError {
    RoomNotFound { room_id: String },
    NotAMember { room_id: String },
    Validation { message: String },
    RateLimited { action: &'static str, retry_after_secs: u64 },
    Store(StoreError),
}

impl CommandError {
    /// Wire reason code for error events.
    pub fn reason(&self) -> &'static str {
        match self {
            CommandError::RoomNotFound { .. } => "room_not_found",
            CommandError::NotAMember { .. } => "not_a_member",
            CommandError::Validation { .. } => "validation",
            CommandError::RateLimited { .. } => "rate_limited",
            CommandError::Store(_) => "internal",
        }
    }

    /// The room id the failed command targeted, when there is one.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            CommandError::RoomNotFound { room_id } | CommandError::NotAMember { room_id } => {
                Some(room_id)
            }
            _ => None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::RoomNotFound { room_id } => write!(f, "room not found: {room_id}"),
            CommandError::NotAMember { room_id } => write!(f, "not a member of {room_id}"),
            CommandError::Validation { message } => write!(f, "{message}"),
            CommandError::RateLimited {
                action,
                retry_after_secs,
            } => write!(f, "rate limited on {action}, retry in {retry_after_secs}s"),
            CommandError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        tracing::error!(%err, "store error during command");
        CommandError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_match_wire_contract() {
        let cases = [
            (
                CommandError::RoomNotFound {
                    room_id: "room_x".into(),
                },
                "room_not_found",
            ),
            (
                CommandError::NotAMember {
                    room_id: "room_x".into(),
                },
                "not_a_member",
            ),
            (
                CommandError::Validation {
                    message: "empty".into(),
                },
                "validation",
            ),
            (
                CommandError::RateLimited {
                    action: "send_message",
                    retry_after_secs: 12,
                },
                "rate_limited",
            ),
            (
                CommandError::Store(StoreError::backend("down")),
                "internal",
            ),
        ];
        for (err, reason) in cases {
            assert_eq!(err.reason(), reason);
        }
    }

    #[test]
    fn room_id_present_only_for_room_errors() {
        let err = CommandError::NotAMember {
            room_id: "room_a".into(),
        };
        assert_eq!(err.room_id(), Some("room_a"));

        let err = CommandError::Validation {
            message: "too long".into(),
        };
        assert!(err.room_id().is_none());
    }
}
