mod error;

pub use error::{ErrorKind, LedgerError};

use chrono::{DateTime, Utc};
use std::fmt;

pub type UserId = i64;

/// Point amounts in hundredths, so `Points(5050)` is 50.50 points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Points(i64);

impl Points {
    pub const ZERO: Points = Points(0);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths)
    }

    pub const fn whole(points: i64) -> Self {
        Self(points.saturating_mul(100))
    }

    /// Rounds a decimal amount (as reported by the accrual service) to hundredths.
    ///
    /// Non-finite or negative inputs yield `None`.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let scaled = (value * 100.0).round();
        if scaled > i64::MAX as f64 {
            return None;
        }
        Some(Self(scaled as i64))
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Lifecycle of a submitted order: `NEW -> PROCESSING -> {PROCESSED | INVALID}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::New,
        OrderStatus::Processing,
        OrderStatus::Processed,
        OrderStatus::Invalid,
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, LedgerError> {
        match value {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(LedgerError::Internal(format!(
                "invalid order status value in database: {other}"
            ))),
        }
    }

    /// Whether `self -> next` is a legal forward step.
    ///
    /// `PROCESSING -> PROCESSING` is allowed: it is the lease refresh done by a reclaim.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::New, OrderStatus::Processing)
                | (OrderStatus::Processing, OrderStatus::Processing)
                | (OrderStatus::Processing, OrderStatus::Processed)
                | (OrderStatus::Processing, OrderStatus::Invalid)
        )
    }

    /// Statuses an order may be in for a conditional update to `next` to apply.
    pub fn sources_of(next: OrderStatus) -> Vec<OrderStatus> {
        OrderStatus::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: i64,
    pub user_id: UserId,
    pub number: String,
    pub status: OrderStatus,
    pub points_awarded: Option<Points>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
}

/// Kind of an append-only balance entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Accrual,
    Withdrawal,
}

impl EntryKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            EntryKind::Accrual => "accrual",
            EntryKind::Withdrawal => "withdrawal",
        }
    }
}

/// Materialized per-user balance row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    pub current: Points,
    pub withdrawn: Points,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub order_number: String,
    pub amount: Points,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    pub order_number: String,
    pub amount: Points,
    pub processed_at: DateTime<Utc>,
}

/// Result of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The row was no longer `PROCESSING`; nothing was written.
    Skipped,
}

impl Transition {
    pub fn from_rows_affected(rows: usize) -> Self {
        if rows == 0 {
            Transition::Skipped
        } else {
            Transition::Applied
        }
    }
}

/// What one missing-accrual sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub entries_inserted: u64,
    pub users_recomputed: Vec<UserId>,
}
