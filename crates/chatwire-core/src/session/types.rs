use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Streaming,
    Completed,
    Errored,
    Aborted,
}

impl SessionStatus {
    /// Terminal states are final: nothing moves a session out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SessionStatus::Pending, "pending", false)]
    #[case(SessionStatus::Streaming, "streaming", false)]
    #[case(SessionStatus::Completed, "completed", true)]
    #[case(SessionStatus::Errored, "errored", true)]
    #[case(SessionStatus::Aborted, "aborted", true)]
    fn test_status_text_and_terminality(
        #[case] status: SessionStatus,
        #[case] text: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(status.to_string(), text);
        assert_eq!(SessionStatus::from_str(text).unwrap(), status);
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn test_session_id_round_trips_through_text() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
