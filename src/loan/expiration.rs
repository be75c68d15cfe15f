//! Expiration tracking
//!
//! Pure time computation over a loan's activation window. No side effects;
//! both the liquidation engine and the expiration query endpoint call this.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::loan::{Loan, LoanStatus};

/// Expiration computation errors. Fatal only for the loan being evaluated;
/// a scan over many loans skips the bad record and continues.
#[derive(Debug, thiserror::Error)]
pub enum ExpirationError {
    #[error("Loan {0} has no end time set")]
    MissingEndTime(Uuid),

    #[error("Loan {0} has end time before start time")]
    InvertedTimestamps(Uuid),
}

/// Time remaining on a loan, relative to a caller-supplied `now`.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationStatus {
    pub remaining_days: i64,
    /// Hours remaining beyond the whole days.
    pub remaining_hours: i64,
    pub is_overdue: bool,
}

/// Compute time remaining and overdue state. `is_overdue` holds only for an
/// active loan strictly past its end time, and is monotonic in `now`.
pub fn compute(loan: &Loan, now: DateTime<Utc>) -> Result<ExpirationStatus, ExpirationError> {
    let end_time = loan.end_time.ok_or(ExpirationError::MissingEndTime(loan.id))?;

    if let Some(start_time) = loan.start_time {
        if end_time < start_time {
            return Err(ExpirationError::InvertedTimestamps(loan.id));
        }
    }

    let remaining = (end_time - now).max(chrono::Duration::zero());
    let is_overdue = now > end_time && loan.status == LoanStatus::Active;

    Ok(ExpirationStatus {
        remaining_days: remaining.num_days(),
        remaining_hours: remaining.num_hours() % 24,
        is_overdue,
    })
}
