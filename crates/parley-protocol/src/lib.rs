//! Shared broker protocol: ids, tool argument/result types, events, errors.

pub mod error;
pub mod event;
pub mod ids;
pub mod tool;

pub use error::{BrokerError, BrokerResult};
pub use event::BrokerEvent;
pub use ids::{CallId, ItemId, SessionId};
pub use tool::{
    CheckInboxResult, ChoiceOption, ChoiceResult, MultiSelectResult, OperatorKey,
    PendingMessages, RegisterSessionArgs, RegisterSessionResult, SettingsSnapshot, SpeakResult,
    VoiceProfile,
};

#[cfg(test)]
mod tests {
    use crate::error::BrokerError;
    use crate::ids::SessionId;

    #[test]
    fn session_id_round_trips_as_json_string() {
        let session_id = SessionId::new("sess-1");
        let serialized = serde_json::to_string(&session_id).expect("serialize session id");
        let deserialized: SessionId =
            serde_json::from_str(&serialized).expect("deserialize session id");

        assert_eq!(serialized, "\"sess-1\"");
        assert_eq!(deserialized, session_id);
    }

    #[test]
    fn error_codes_are_stable_for_agent_responses() {
        assert_eq!(
            BrokerError::InvalidRequest("empty choices".into()).code(),
            "invalid_request"
        );
        assert_eq!(BrokerError::Cancelled("operator".into()).code(), "cancelled");
        assert_eq!(
            BrokerError::SessionClosed("gone".into()).code(),
            "cancelled"
        );
        assert_eq!(BrokerError::Internal("bug".into()).code(), "internal");
    }
}
