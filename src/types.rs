use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::{Money, Rate};

/// arena id for a loan, assigned by an ever-incrementing counter
pub type LoanId = u64;

/// arena id for a term template
pub type TermId = u64;

/// arena id for an auction
pub type AuctionId = u64;

/// unique identifier for a lender, borrower, or other account
pub type PartyId = Uuid;

/// unique identifier for an escrowed asset
pub type AssetId = Uuid;

/// upper bound on an auction window
pub const MAX_AUCTION_LENGTH_SECS: u64 = 30 * 86_400;

/// loan lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanState {
    /// loan open and accruing interest
    Active,
    /// a live auction is selling the collateral
    Liquidating,
    /// terminal: repaid, settled, reclaimed, or seized
    Inactive,
}

/// a single collateralized loan between one lender and one borrower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub state: LoanState,
    pub term_id: TermId,
    pub borrower: PartyId,
    pub lender: PartyId,
    pub collateral_asset: AssetId,
    pub collateral_amount: Money,
    pub debt_asset: AssetId,
    pub debt_amount: Money,
    /// term index snapshot as of the loan's last touch
    pub user_borrow_index: Rate,
    pub last_update: DateTime<Utc>,
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.state == LoanState::Active
    }

    pub fn is_liquidating(&self) -> bool {
        self.state == LoanState::Liquidating
    }

    pub fn is_closed(&self) -> bool {
        self.state == LoanState::Inactive
    }
}

/// parameters for a new term template
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermConfig {
    /// scalar applied to debt+interest at liquidation, within [1.0, 2.0]
    pub liquidation_bonus: Rate,
    /// auction window in seconds, zero means instant seizure
    pub auction_length_secs: u64,
    /// per-second accrual rate used when no rate source is plugged in
    pub fixed_rate: Rate,
}

/// a queued fixed-rate change, committed by index accrual at its instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingRate {
    pub rate: Rate,
    pub effective_at: DateTime<Utc>,
}

/// a reusable loan term template with its lazily-updated borrow index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub liquidation_bonus: Rate,
    pub auction_length_secs: u64,
    pub fixed_rate: Rate,
    /// monotonic non-decreasing accumulator, starts at 1.0
    pub base_borrow_index: Rate,
    pub last_update: DateTime<Utc>,
    pub pending_rate: Option<PendingRate>,
}

impl Term {
    pub fn instant_seizure(&self) -> bool {
        self.auction_length_secs == 0
    }
}

/// a live dutch auction over one liquidating loan, frozen at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    pub id: AuctionId,
    pub loan_id: LoanId,
    /// debt + accrued interest, scaled by the liquidation bonus
    pub recovery_amount: Money,
    pub duration_secs: u64,
    pub start_time: DateTime<Utc>,
}

impl Auction {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.start_time + chrono::Duration::seconds(self.duration_secs as i64)
    }
}

/// current auction price: what a filler pays and what they receive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuctionQuote {
    pub bid_amount: Money,
    pub collateral_offered: Money,
}

impl AuctionQuote {
    /// a bid is only accepted while both sides of the price are non-zero
    pub fn is_actionable(&self) -> bool {
        self.bid_amount.is_positive() && self.collateral_offered.is_positive()
    }
}

/// capability-specific acknowledgement a mandatory hook must return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookAck {
    LoanVerified,
    DebtChangeAcknowledged,
    CollateralChangeAcknowledged,
    SettlementAcknowledged,
    FlashLoanAcknowledged,
}

/// a single custody movement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub asset: AssetId,
    pub from: PartyId,
    pub to: PartyId,
    pub amount: Money,
}

impl Transfer {
    pub fn new(asset: AssetId, from: PartyId, to: PartyId, amount: Money) -> Self {
        Self {
            asset,
            from,
            to,
            amount,
        }
    }

    /// the compensating movement, used to unwind an executed batch
    pub fn reversed(&self) -> Transfer {
        Transfer {
            asset: self.asset,
            from: self.to,
            to: self.from,
            amount: self.amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_loan() -> Loan {
        Loan {
            id: 7,
            state: LoanState::Active,
            term_id: 1,
            borrower: Uuid::new_v4(),
            lender: Uuid::new_v4(),
            collateral_asset: Uuid::new_v4(),
            collateral_amount: Money::from_major(10),
            debt_asset: Uuid::new_v4(),
            debt_amount: Money::from_major(5),
            user_borrow_index: Rate::from_decimal(dec!(1.01)),
            last_update: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_loan_json_round_trip() {
        let loan = sample_loan();
        let json = serde_json::to_string(&loan).unwrap();
        let back: Loan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loan);
    }

    #[test]
    fn test_auction_expiry() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let auction = Auction {
            id: 1,
            loan_id: 7,
            recovery_amount: Money::from_major(9),
            duration_secs: 100,
            start_time: start,
        };
        assert_eq!(auction.expires_at(), start + chrono::Duration::seconds(100));
    }

    #[test]
    fn test_quote_actionable() {
        let both = AuctionQuote {
            bid_amount: Money::from_major(1),
            collateral_offered: Money::from_major(1),
        };
        let lapsed = AuctionQuote {
            bid_amount: Money::ZERO,
            collateral_offered: Money::ZERO,
        };
        let opening = AuctionQuote {
            bid_amount: Money::from_major(1),
            collateral_offered: Money::ZERO,
        };
        assert!(both.is_actionable());
        assert!(!lapsed.is_actionable());
        assert!(!opening.is_actionable());
    }

    #[test]
    fn test_transfer_reversed() {
        let t = Transfer::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::from_major(3),
        );
        let r = t.reversed();
        assert_eq!(r.from, t.to);
        assert_eq!(r.to, t.from);
        assert_eq!(r.reversed(), t);
    }
}
