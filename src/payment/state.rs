//! Payment state machine.
//!
//! State IDs are stored as SMALLINT; negative IDs are the abnormal
//! terminals.
//!
//! ```text
//! pending ──handshake──▶ paying ──success──▶ paid ──refund──▶ refunded
//!    │                     │                   ▲
//!    │                     ├─timeout──▶ cancelled
//!    │                     └─failure──▶ failed
//!    └─manual cancel──▶ cancelled
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum PaymentState {
    /// Record inserted, provider handshake not yet confirmed
    Pending = 0,

    /// Provider accepted the trade (QR / prepay token issued)
    Paying = 10,

    /// Settled. Terminal except via explicit refund
    Paid = 20,

    /// Fully refunded
    Refunded = 30,

    /// Provider reported terminal failure
    Failed = -10,

    /// Expired or manually cancelled before settlement
    Cancelled = -20,
}

impl PaymentState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(PaymentState::Pending),
            10 => Some(PaymentState::Paying),
            20 => Some(PaymentState::Paid),
            30 => Some(PaymentState::Refunded),
            -10 => Some(PaymentState::Failed),
            -20 => Some(PaymentState::Cancelled),
            _ => None,
        }
    }

    /// States that no longer mutate, except `Paid` via explicit refund.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Paid
                | PaymentState::Refunded
                | PaymentState::Failed
                | PaymentState::Cancelled
        )
    }

    /// States a validated callback may settle from.
    #[inline]
    pub fn is_settleable(&self) -> bool {
        matches!(self, PaymentState::Pending | PaymentState::Paying)
    }

    /// Permitted edges. No state ever returns to `Pending`.
    pub fn can_transition_to(&self, next: PaymentState) -> bool {
        use PaymentState::*;
        matches!(
            (self, next),
            (Pending, Paying)
                | (Pending, Cancelled)
                | (Paying, Paid)
                | (Paying, Failed)
                | (Paying, Cancelled)
                | (Paid, Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "PENDING",
            PaymentState::Paying => "PAYING",
            PaymentState::Paid => "PAID",
            PaymentState::Refunded => "REFUNDED",
            PaymentState::Failed => "FAILED",
            PaymentState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
