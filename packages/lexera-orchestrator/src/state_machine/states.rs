use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeState {
    Idle,
    ReceivingChange,
    AnalyzingImpact,
    CheckingEditState,
    CapturingEdit,
    CheckingUnsaved,
    PromptingUser,
    SavingUnsaved,
    ClearingCache,
    LoadingNew,
    UpdatingBackend,
    SyncingFrontend,
    Complete,
    Cancelled,
    Error,
}

use ChangeState::*;

impl ChangeState {
    /// States reachable from `self` without going through `Error`.
    pub fn allowed_transitions(self) -> &'static [ChangeState] {
        match self {
            Idle => &[ReceivingChange],
            ReceivingChange => &[AnalyzingImpact],
            // Straight to Complete when the change turns out to be a no-op
            AnalyzingImpact => &[CheckingEditState, Complete],
            CheckingEditState => &[CapturingEdit, CheckingUnsaved],
            CapturingEdit => &[CheckingUnsaved],
            CheckingUnsaved => &[PromptingUser, ClearingCache],
            PromptingUser => &[SavingUnsaved, ClearingCache, Cancelled],
            SavingUnsaved => &[ClearingCache],
            ClearingCache => &[LoadingNew],
            LoadingNew => &[UpdatingBackend],
            UpdatingBackend => &[SyncingFrontend],
            SyncingFrontend => &[Complete],
            Complete | Cancelled | Error => &[Idle],
        }
    }

    pub fn can_transition_to(self, next: ChangeState) -> bool {
        // Any working state may fail
        (next == Error && !self.is_terminal() && self != Idle)
            || self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Complete | Cancelled | Error)
    }
}

impl std::fmt::Display for ChangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Idle => "IDLE",
            ReceivingChange => "RECEIVING_CHANGE",
            AnalyzingImpact => "ANALYZING_IMPACT",
            CheckingEditState => "CHECKING_EDIT_STATE",
            CapturingEdit => "CAPTURING_EDIT",
            CheckingUnsaved => "CHECKING_UNSAVED",
            PromptingUser => "PROMPTING_USER",
            SavingUnsaved => "SAVING_UNSAVED",
            ClearingCache => "CLEARING_CACHE",
            LoadingNew => "LOADING_NEW",
            UpdatingBackend => "UPDATING_BACKEND",
            SyncingFrontend => "SYNCING_FRONTEND",
            Complete => "COMPLETE",
            Cancelled => "CANCELLED",
            Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [
            Idle,
            ReceivingChange,
            AnalyzingImpact,
            CheckingEditState,
            CheckingUnsaved,
            ClearingCache,
            LoadingNew,
            UpdatingBackend,
            SyncingFrontend,
            Complete,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_detours() {
        assert!(CheckingEditState.can_transition_to(CapturingEdit));
        assert!(CheckingUnsaved.can_transition_to(PromptingUser));
        assert!(PromptingUser.can_transition_to(Cancelled));
        assert!(PromptingUser.can_transition_to(SavingUnsaved));
    }

    #[test]
    fn test_error_reachable_from_working_states_only() {
        assert!(LoadingNew.can_transition_to(Error));
        assert!(ReceivingChange.can_transition_to(Error));
        assert!(!Idle.can_transition_to(Error));
        assert!(!Complete.can_transition_to(Error));
    }

    #[test]
    fn test_skipping_stages_is_illegal() {
        assert!(!ReceivingChange.can_transition_to(LoadingNew));
        assert!(!ClearingCache.can_transition_to(Complete));
        assert!(!Cancelled.can_transition_to(ReceivingChange));
    }
}
