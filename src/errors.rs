use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::decimal::{Money, Rate};
use crate::types::{AuctionId, LoanId, LoanState, TermId};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("loan not found: {id}")]
    LoanNotFound { id: LoanId },

    #[error("term not found: {id}")]
    TermNotFound { id: TermId },

    #[error("auction not found: {id}")]
    AuctionNotFound { id: AuctionId },

    #[error("invalid terms: {message}")]
    InvalidTerms { message: String },

    #[error("loan verification rejected by lender {lender}")]
    VerificationFailed { lender: Uuid },

    #[error("unauthorized: {party} may not {operation}")]
    Unauthorized { party: Uuid, operation: String },

    #[error("loan {id} in state {state:?}, expected {expected:?}")]
    InvalidLoanState {
        id: LoanId,
        state: LoanState,
        expected: LoanState,
    },

    #[error("loan {id} is liquidating: only full settlement is accepted")]
    PartialRepaymentDuringLiquidation { id: LoanId },

    #[error("loan {id} is liquidating: collateral is locked")]
    CollateralLocked { id: LoanId },

    #[error("zero-amount adjustment rejected")]
    ZeroAmount,

    #[error("insufficient collateral: available {available}, requested {requested}")]
    InsufficientCollateral {
        available: Money,
        requested: Money,
    },

    #[error("auction {id} has lapsed: no price remains")]
    AuctionLapsed { id: AuctionId },

    #[error("auction {id} not yet clearing: no collateral on offer")]
    AuctionNotClearing { id: AuctionId },

    #[error("auction {id} not expired until {expires_at}, current time {current_time}")]
    AuctionNotExpired {
        id: AuctionId,
        expires_at: DateTime<Utc>,
        current_time: DateTime<Utc>,
    },

    #[error("term {id} has a queued rate change")]
    TermRateUpdating { id: TermId },

    #[error("rate change already queued for term {id}")]
    RateChangeAlreadyQueued { id: TermId },

    #[error("rate change for term {id} effective {effective_at} is already past at {current_time}")]
    RateChangeInPast {
        id: TermId,
        effective_at: DateTime<Utc>,
        current_time: DateTime<Utc>,
    },

    #[error("hook rejected: {hook} returned the wrong acknowledgement")]
    HookRejected { hook: String },

    #[error("hook failed: {hook}: {message}")]
    HookFailed { hook: String, message: String },

    #[error("no lender handler registered for {lender}")]
    LenderNotRegistered { lender: Uuid },

    #[error("flash loan not repaid: expected {expected}, receiver failed")]
    FlashLoanNotRepaid { expected: Money },

    #[error("transfer failed: {asset} {amount} from {from} to {to}: {message}")]
    TransferFailed {
        asset: Uuid,
        from: Uuid,
        to: Uuid,
        amount: Money,
        message: String,
    },

    #[error("re-entrant call rejected")]
    ReentrantCall,

    #[error("rate source failed for term {term_id}: {message}")]
    RateSourceFailed { term_id: TermId, message: String },

    #[error("invalid rate: {rate}")]
    InvalidRate { rate: Rate },
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
