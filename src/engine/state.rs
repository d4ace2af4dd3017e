use chrono::{DateTime, Utc};

use super::EngineError;
use crate::model::{Transfer, TransferStatus};

impl TransferStatus {
    /// Whether the transfer is settled. A `cancelled` transfer may still be reversed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Cancelled
                | TransferStatus::Reversed
        )
    }

    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;

        matches!(
            (*self, next),
            (Pending, Processing | Failed | Cancelled)
                | (Processing, Completed | Failed | Cancelled | Reversed)
                | (Cancelled, Reversed)
        )
    }
}

/// Move `transfer` to `next`, stamping `updated_at` (and `completed_at` on completion).
///
/// Leaves the transfer untouched on an illegal transition.
pub(crate) fn advance(
    transfer: &mut Transfer,
    next: TransferStatus,
    at: DateTime<Utc>,
) -> Result<(), EngineError> {
    if !transfer.status.can_transition_to(next) {
        return Err(EngineError::InvalidState {
            key: transfer.idempotency_key.clone(),
            from: transfer.status,
            to: next,
        });
    }

    transfer.status = next;
    transfer.updated_at = at;
    if next == TransferStatus::Completed {
        transfer.completed_at = Some(at);
    }
    Ok(())
}
