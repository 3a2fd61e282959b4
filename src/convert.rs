//! Marshalling of raw engine results into client outcomes.
//!
//! Engines report optional values with explicit validity flags and a NaN
//! expiration; clients see plain `Option`s.

use crate::backend::{
    LicenseResult, LicenseUpdateResult, LoadSessionResult, RawKeyStatus, RawKeyStatuses,
    RawMessage, RemoveSessionDataResult,
};
use crate::key::KeyStatusEntry;
use crate::types::{
    LicenseOutcome, LicenseUpdateOutcome, LoadSessionOutcome, Message, SessionLoadFailure,
    SuccessValue,
};

pub(crate) fn key_status_entries(statuses: Vec<RawKeyStatus>) -> Vec<KeyStatusEntry> {
    statuses
        .into_iter()
        .map(|(key_id, status)| KeyStatusEntry::new(key_id, status))
        .collect()
}

pub(crate) fn optional_key_statuses(statuses: RawKeyStatuses) -> Option<Vec<KeyStatusEntry>> {
    statuses
        .is_valid
        .then(|| key_status_entries(statuses.statuses))
}

pub(crate) fn optional_message(message: RawMessage) -> Option<Message> {
    message
        .is_valid
        .then(|| Message::new(message.message_type, message.buffer))
}

pub(crate) fn optional_expiration(expiration: f64) -> Option<f64> {
    (!expiration.is_nan()).then_some(expiration)
}

/// Enforce "no load failure iff succeeded" on an engine report.
pub(crate) fn load_failure(success: SuccessValue, reported: SessionLoadFailure) -> SessionLoadFailure {
    match (success, reported) {
        (SuccessValue::Succeeded, SessionLoadFailure::None) => SessionLoadFailure::None,
        (SuccessValue::Succeeded, other) => {
            warn!("engine reported load failure {:?} for a successful load", other);
            SessionLoadFailure::None
        }
        (SuccessValue::Failed, SessionLoadFailure::None) => {
            warn!("engine reported a failed load without a reason");
            SessionLoadFailure::Other
        }
        (SuccessValue::Failed, reason) => reason,
    }
}

pub(crate) fn license_outcome(result: LicenseResult) -> LicenseOutcome {
    LicenseOutcome {
        message: result.message,
        session_id: result.session_id,
        needs_individualization: result.needs_individualization,
        success: result.success,
    }
}

pub(crate) fn license_update_outcome(result: LicenseUpdateResult) -> LicenseUpdateOutcome {
    LicenseUpdateOutcome {
        session_was_closed: result.session_was_closed,
        key_statuses: optional_key_statuses(result.key_statuses),
        changed_expiration: optional_expiration(result.changed_expiration),
        message: optional_message(result.message),
        success: result.success,
    }
}

pub(crate) fn load_session_outcome(result: LoadSessionResult) -> LoadSessionOutcome {
    LoadSessionOutcome {
        key_statuses: optional_key_statuses(result.key_statuses),
        changed_expiration: optional_expiration(result.changed_expiration),
        message: optional_message(result.message),
        success: result.success,
        load_failure: load_failure(result.success, result.load_failure),
    }
}

/// Key statuses, release message payload and success of a removal.
pub(crate) fn remove_session_data_parts(
    result: RemoveSessionDataResult,
) -> (Vec<KeyStatusEntry>, Option<Vec<u8>>, SuccessValue) {
    let key_statuses = optional_key_statuses(result.key_statuses).unwrap_or_default();
    let message = optional_message(result.message).map(|message| message.payload);
    (key_statuses, message, result.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NO_EXPIRATION;
    use crate::key::KeyStatus;
    use crate::types::MessageType;

    #[test]
    fn invalid_fields_become_none() {
        let outcome = license_update_outcome(LicenseUpdateResult {
            session_was_closed: false,
            key_statuses: RawKeyStatuses {
                is_valid: false,
                statuses: vec![(vec![1], KeyStatus::Usable)],
            },
            changed_expiration: NO_EXPIRATION,
            message: RawMessage {
                is_valid: false,
                message_type: MessageType::LicenseRenewal,
                buffer: vec![9],
            },
            success: SuccessValue::Succeeded,
        });
        assert_eq!(outcome.key_statuses, None);
        assert_eq!(outcome.changed_expiration, None);
        assert_eq!(outcome.message, None);
    }

    #[test]
    fn valid_fields_are_carried_over() {
        let outcome = load_session_outcome(LoadSessionResult {
            key_statuses: RawKeyStatuses::valid(vec![(vec![7; 16], KeyStatus::OutputRestricted)]),
            changed_expiration: 0.0,
            message: RawMessage::valid(MessageType::LicenseRenewal, b"renew".to_vec()),
            success: SuccessValue::Succeeded,
            load_failure: SessionLoadFailure::None,
        });
        assert_eq!(
            outcome.key_statuses,
            Some(vec![KeyStatusEntry::new(vec![7; 16], KeyStatus::OutputRestricted)])
        );
        assert_eq!(outcome.changed_expiration, Some(0.0));
        assert_eq!(
            outcome.message,
            Some(Message::new(MessageType::LicenseRenewal, b"renew".to_vec()))
        );
    }

    #[test]
    fn load_failure_matches_success() {
        use SessionLoadFailure as F;
        assert_eq!(load_failure(SuccessValue::Succeeded, F::None), F::None);
        assert_eq!(load_failure(SuccessValue::Succeeded, F::QuotaExceeded), F::None);
        assert_eq!(load_failure(SuccessValue::Failed, F::None), F::Other);
        assert_eq!(load_failure(SuccessValue::Failed, F::NoSessionData), F::NoSessionData);
        assert_eq!(
            load_failure(SuccessValue::Failed, F::MismatchedSessionType),
            F::MismatchedSessionType
        );
    }

    #[test]
    fn failed_license_has_no_message() {
        let outcome = license_outcome(LicenseResult::failed());
        assert!(outcome.message.is_empty());
        assert!(outcome.session_id.is_empty());
        assert_eq!(outcome.success, SuccessValue::Failed);
    }
}
