use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::types::{AuctionId, LoanId, PartyId, TermId};

/// all events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // term events
    TermCreated {
        term_id: TermId,
        liquidation_bonus: Rate,
        auction_length_secs: u64,
        timestamp: DateTime<Utc>,
    },
    RateChangeQueued {
        term_id: TermId,
        new_rate: Rate,
        effective_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    RateChangeCommitted {
        term_id: TermId,
        old_rate: Rate,
        new_rate: Rate,
        timestamp: DateTime<Utc>,
    },
    IndexAccrued {
        term_id: TermId,
        old_index: Rate,
        new_index: Rate,
        elapsed_secs: i64,
        timestamp: DateTime<Utc>,
    },

    // loan lifecycle events
    LoanCreated {
        loan_id: LoanId,
        term_id: TermId,
        lender: PartyId,
        borrower: PartyId,
        collateral_amount: Money,
        debt_amount: Money,
        timestamp: DateTime<Utc>,
    },
    InterestCapitalized {
        loan_id: LoanId,
        amount: Money,
        new_debt: Money,
        timestamp: DateTime<Utc>,
    },
    DebtChanged {
        loan_id: LoanId,
        delta: Money,
        new_debt: Money,
        timestamp: DateTime<Utc>,
    },
    CollateralChanged {
        loan_id: LoanId,
        delta: Money,
        new_collateral: Money,
        timestamp: DateTime<Utc>,
    },
    LoanRepaid {
        loan_id: LoanId,
        settlement_amount: Money,
        timestamp: DateTime<Utc>,
    },

    // liquidation and auction events
    CollateralSeized {
        loan_id: LoanId,
        collateral_amount: Money,
        lender: PartyId,
        timestamp: DateTime<Utc>,
    },
    AuctionCreated {
        auction_id: AuctionId,
        loan_id: LoanId,
        recovery_amount: Money,
        duration_secs: u64,
        timestamp: DateTime<Utc>,
    },
    AuctionSettled {
        auction_id: AuctionId,
        loan_id: LoanId,
        bidder: PartyId,
        bid_amount: Money,
        collateral_offered: Money,
        borrower_return: Money,
        timestamp: DateTime<Utc>,
    },
    AuctionReclaimed {
        auction_id: AuctionId,
        loan_id: LoanId,
        collateral_amount: Money,
        timestamp: DateTime<Utc>,
    },
    AuctionStopped {
        auction_id: AuctionId,
        loan_id: LoanId,
        timestamp: DateTime<Utc>,
    },

    // collaborator events
    BorrowerHookFailed {
        loan_id: LoanId,
        hook: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    FlashLoanCompleted {
        receiver: PartyId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
}

/// event buffer collected during operations
///
/// kept `Clone` so a failed operation can roll its emissions back with the
/// rest of the coordinator state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
