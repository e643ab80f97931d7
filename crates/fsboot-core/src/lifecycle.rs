use crate::stage::StageId;
use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Where an orchestrator run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running(StageId),
    Aborted,
    Completed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Completed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not_started"),
            Self::Running(stage) => write!(f, "running({stage})"),
            Self::Aborted => f.write_str("aborted"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), CoreError> {
    let valid = match (from, to) {
        (RunState::NotStarted, RunState::Running(_) | RunState::Aborted | RunState::Completed)
        | (RunState::Running(_), RunState::Aborted | RunState::Completed) => true,
        (RunState::Running(current), RunState::Running(next)) => next > current,
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(
            validate_transition(RunState::NotStarted, RunState::Running(StageId::Network)).is_ok()
        );
        assert!(validate_transition(
            RunState::Running(StageId::Network),
            RunState::Running(StageId::Iscsi)
        )
        .is_ok());
        assert!(validate_transition(
            RunState::Running(StageId::Iscsi),
            RunState::Running(StageId::Nextcloud)
        )
        .is_ok());
        assert!(validate_transition(RunState::Running(StageId::Cache), RunState::Aborted).is_ok());
        assert!(
            validate_transition(RunState::Running(StageId::Nextcloud), RunState::Completed).is_ok()
        );
        // empty pipeline
        assert!(validate_transition(RunState::NotStarted, RunState::Completed).is_ok());
        assert!(validate_transition(RunState::NotStarted, RunState::Aborted).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(
            RunState::Running(StageId::Cache),
            RunState::Running(StageId::Iscsi)
        )
        .is_err());
        assert!(validate_transition(
            RunState::Running(StageId::Cache),
            RunState::Running(StageId::Cache)
        )
        .is_err());
        assert!(
            validate_transition(RunState::Completed, RunState::Running(StageId::Network)).is_err()
        );
        assert!(validate_transition(RunState::Aborted, RunState::Completed).is_err());
        assert!(
            validate_transition(RunState::Running(StageId::Network), RunState::NotStarted).is_err()
        );
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Aborted.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(!RunState::Running(StageId::Iscsi).is_terminal());
    }
}
