//! Escrow state machine
//!
//! `apply` is a pure function: it takes the current escrow row and an event,
//! and returns the next row together with the effects the caller must carry
//! out in the same transaction. Nothing is mutated in place, and an event
//! that is not valid in the current state is an error rather than a no-op.
//!
//! ```text
//! CREATED --funding_confirmed--> FUNDED --delivery_confirmed--> RELEASED
//!                                  |                              |  \
//!                                  +--dispute_opened--> DISPUTED <+   auto_release_due (stays RELEASED)
//!                                                          |
//!                                       dispute_resolved   v
//! RELEASED / RESOLVED --settlement_confirmed--> CLOSED  RESOLVED
//! ```

use crate::{
    error::EscrowError,
    models::{Escrow, EscrowState, PayoutKind, ReleaseTiming, Role},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Input driving an escrow transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowEvent {
    /// Confirmed, non-dust deposits on the active destination reached this sum
    FundingConfirmed { funded_amount: i64 },
    /// Seller confirmed delivery
    DeliveryConfirmed,
    /// Either party opened a dispute
    DisputeOpened { opened_by: Role },
    /// Resolving authority decided the split
    DisputeResolved {
        to_seller: i64,
        to_buyer: i64,
        price_at_open: i64,
    },
    /// Periodic scan found the auto-release time in the past
    AutoReleaseDue,
    /// The settlement payout reached CONFIRMED
    SettlementConfirmed { payout_id: i64 },
}

impl EscrowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FundingConfirmed { .. } => "funding_confirmed",
            Self::DeliveryConfirmed => "delivery_confirmed",
            Self::DisputeOpened { .. } => "dispute_opened",
            Self::DisputeResolved { .. } => "dispute_resolved",
            Self::AutoReleaseDue => "auto_release_due",
            Self::SettlementConfirmed { .. } => "settlement_confirmed",
        }
    }
}

/// Work the caller performs alongside writing the new row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Move the funded amount from the chain-deposits account into the escrow account
    PostFunding { amount: i64 },
    /// Delivery timers were stamped
    DisputeWindowOpened {
        dispute_deadline: DateTime<Utc>,
        auto_release_at: DateTime<Utc>,
    },
    /// Insert the OPEN dispute row
    OpenDispute { opened_by: Role },
    /// Credit the decided split to the seller and buyer accounts
    PostDisputeAllocation { to_seller: i64, to_buyer: i64 },
    /// A payout of this kind should now be created
    RequestSettlement { kind: PayoutKind },
    /// The escrow reached its terminal state
    Closed { payout_id: i64 },
}

/// Result of applying an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: EscrowState,
    pub escrow: Escrow,
    pub event: EscrowEvent,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn to(&self) -> EscrowState {
        self.escrow.state
    }
}

/// Compute the next escrow row for `event`
pub fn apply(
    escrow: &Escrow,
    event: &EscrowEvent,
    now: DateTime<Utc>,
    timing: &ReleaseTiming,
) -> EscrowResult<Transition> {
    let reject = || EscrowError::state_transition(escrow.state, event.name());
    let mut next = escrow.clone();
    next.updated_at = now;

    let effects = match (escrow.state, event) {
        (EscrowState::Created, EscrowEvent::FundingConfirmed { funded_amount }) => {
            if *funded_amount < escrow.deposit_total {
                return Err(reject());
            }
            next.state = EscrowState::Funded;
            vec![Effect::PostFunding {
                amount: *funded_amount,
            }]
        }

        (EscrowState::Funded, EscrowEvent::DeliveryConfirmed) => {
            let dispute_deadline = now + timing.dispute_window;
            let auto_release_at = now + timing.auto_release_delay;
            next.state = EscrowState::Released;
            next.delivered_at = Some(now);
            next.dispute_deadline = Some(dispute_deadline);
            next.auto_release_at = Some(auto_release_at);
            vec![Effect::DisputeWindowOpened {
                dispute_deadline,
                auto_release_at,
            }]
        }

        (EscrowState::Funded, EscrowEvent::DisputeOpened { opened_by }) => {
            next.state = EscrowState::Disputed;
            vec![Effect::OpenDispute {
                opened_by: *opened_by,
            }]
        }

        (EscrowState::Released, EscrowEvent::DisputeOpened { opened_by }) => {
            let window_open = escrow
                .dispute_deadline
                .map(|deadline| now < deadline)
                .unwrap_or(false);
            if !window_open || escrow.auto_released_at.is_some() {
                return Err(reject());
            }
            next.state = EscrowState::Disputed;
            vec![Effect::OpenDispute {
                opened_by: *opened_by,
            }]
        }

        (
            EscrowState::Disputed,
            EscrowEvent::DisputeResolved {
                to_seller,
                to_buyer,
                price_at_open,
            },
        ) => {
            validate_split(*to_seller, *to_buyer, *price_at_open)?;
            next.state = EscrowState::Resolved;
            vec![
                Effect::PostDisputeAllocation {
                    to_seller: *to_seller,
                    to_buyer: *to_buyer,
                },
                Effect::RequestSettlement {
                    kind: PayoutKind::Dispute,
                },
            ]
        }

        (EscrowState::Released, EscrowEvent::AutoReleaseDue) => {
            let due = escrow
                .auto_release_at
                .map(|at| at <= now)
                .unwrap_or(false);
            if !due || escrow.auto_released_at.is_some() {
                return Err(reject());
            }
            next.auto_released_at = Some(now);
            vec![Effect::RequestSettlement {
                kind: PayoutKind::Normal,
            }]
        }

        (EscrowState::Released, EscrowEvent::SettlementConfirmed { payout_id })
            if escrow.auto_released_at.is_some() =>
        {
            next.state = EscrowState::Closed;
            vec![Effect::Closed {
                payout_id: *payout_id,
            }]
        }

        (EscrowState::Resolved, EscrowEvent::SettlementConfirmed { payout_id }) => {
            next.state = EscrowState::Closed;
            vec![Effect::Closed {
                payout_id: *payout_id,
            }]
        }

        _ => return Err(reject()),
    };

    Ok(Transition {
        from: escrow.state,
        escrow: next,
        event: event.clone(),
        effects,
    })
}

/// Splits must be non-negative and fit inside the price at dispute time
pub fn validate_split(to_seller: i64, to_buyer: i64, price_at_open: i64) -> EscrowResult<()> {
    if to_seller < 0 || to_buyer < 0 {
        return Err(EscrowError::invalid_argument(format!(
            "dispute split must be non-negative (seller {}, buyer {})",
            to_seller, to_buyer
        )));
    }
    let total = to_seller
        .checked_add(to_buyer)
        .ok_or_else(|| EscrowError::invalid_argument("dispute split overflows"))?;
    if total > price_at_open {
        return Err(EscrowError::invalid_argument(format!(
            "dispute split {} exceeds price at open {}",
            total, price_at_open
        )));
    }
    Ok(())
}
