use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::decimal::{Money, Rate};
use crate::errors::{CoordinatorError, Result};
use crate::events::{Event, EventStore};
use crate::types::{AssetId, HookAck, Loan, PartyId, TermId};

/// failure reported by a collaborator callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        HookError(message.into())
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HookError {}

/// result of a mandatory hook: failure aborts the calling operation
pub type HookResult<T> = std::result::Result<T, HookError>;

/// pluggable per-second rate supplier for a term
pub trait RateSource {
    fn rate(&self, term_id: TermId, elapsed: Duration) -> HookResult<Rate>;
}

/// lender-side callbacks; every one of these gates its operation
pub trait LenderHooks {
    /// consulted before a proposed loan is funded
    fn verify_loan(&self, loan: &Loan, data: &[u8]) -> HookResult<HookAck>;

    /// invoked after a borrow or repay moved balances
    fn on_debt_changed(&self, loan: &Loan, delta: Money) -> HookResult<HookAck>;

    /// invoked after collateral was added or withdrawn
    fn on_collateral_changed(&self, loan: &Loan, delta: Money) -> HookResult<HookAck>;

    /// invoked when an auction settles or the collateral is reclaimed
    fn on_settlement(&self, loan: &Loan, proceeds: Money) -> HookResult<HookAck>;
}

/// borrower-side notifications, consulted only when a handler is registered
///
/// failures here are captured and discarded; the borrower is not the party
/// whose consent the protocol structurally requires
pub trait BorrowerHooks {
    fn on_liquidation(&self, loan: &Loan) -> HookResult<()>;

    fn on_rebalance(&self, loan: &Loan, delta: Money) -> HookResult<()>;

    fn on_settlement(&self, loan: &Loan, collateral_returned: Money) -> HookResult<()>;
}

/// flash-loan callback; must acknowledge or the whole call fails
pub trait FlashLoanReceiver {
    fn on_flash_loan(&self, asset: AssetId, amount: Money, data: &[u8]) -> HookResult<HookAck>;
}

/// maps parties to their registered handlers and applies the two failure
/// semantics: lender hooks are fatal, borrower hooks are advisory
#[derive(Default)]
pub struct HookDispatcher {
    lenders: HashMap<PartyId, Box<dyn LenderHooks>>,
    borrowers: HashMap<PartyId, Box<dyn BorrowerHooks>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_lender(&mut self, party: PartyId, handler: Box<dyn LenderHooks>) {
        self.lenders.insert(party, handler);
    }

    pub fn register_borrower(&mut self, party: PartyId, handler: Box<dyn BorrowerHooks>) {
        self.borrowers.insert(party, handler);
    }

    fn lender(&self, party: PartyId) -> Result<&dyn LenderHooks> {
        self.lenders
            .get(&party)
            .map(Box::as_ref)
            .ok_or(CoordinatorError::LenderNotRegistered { lender: party })
    }

    pub fn verify_loan(&self, loan: &Loan, data: &[u8]) -> Result<()> {
        let ack = self
            .lender(loan.lender)?
            .verify_loan(loan, data)
            .map_err(|_| CoordinatorError::VerificationFailed {
                lender: loan.lender,
            })?;
        expect_ack("verify_loan", ack, HookAck::LoanVerified)
    }

    pub fn debt_changed(&self, loan: &Loan, delta: Money) -> Result<()> {
        let ack = self
            .lender(loan.lender)?
            .on_debt_changed(loan, delta)
            .map_err(|e| fatal("on_debt_changed", e))?;
        expect_ack("on_debt_changed", ack, HookAck::DebtChangeAcknowledged)
    }

    pub fn collateral_changed(&self, loan: &Loan, delta: Money) -> Result<()> {
        let ack = self
            .lender(loan.lender)?
            .on_collateral_changed(loan, delta)
            .map_err(|e| fatal("on_collateral_changed", e))?;
        expect_ack(
            "on_collateral_changed",
            ack,
            HookAck::CollateralChangeAcknowledged,
        )
    }

    pub fn lender_settlement(&self, loan: &Loan, proceeds: Money) -> Result<()> {
        let ack = self
            .lender(loan.lender)?
            .on_settlement(loan, proceeds)
            .map_err(|e| fatal("on_settlement", e))?;
        expect_ack("on_settlement", ack, HookAck::SettlementAcknowledged)
    }

    pub fn notify_liquidation(&self, loan: &Loan, events: &mut EventStore, now: DateTime<Utc>) {
        if let Some(handler) = self.borrowers.get(&loan.borrower) {
            if let Err(e) = handler.on_liquidation(loan) {
                record_advisory_failure(events, loan, "on_liquidation", e, now);
            }
        }
    }

    pub fn notify_rebalance(
        &self,
        loan: &Loan,
        delta: Money,
        events: &mut EventStore,
        now: DateTime<Utc>,
    ) {
        if let Some(handler) = self.borrowers.get(&loan.borrower) {
            if let Err(e) = handler.on_rebalance(loan, delta) {
                record_advisory_failure(events, loan, "on_rebalance", e, now);
            }
        }
    }

    pub fn notify_settlement(
        &self,
        loan: &Loan,
        collateral_returned: Money,
        events: &mut EventStore,
        now: DateTime<Utc>,
    ) {
        if let Some(handler) = self.borrowers.get(&loan.borrower) {
            if let Err(e) = handler.on_settlement(loan, collateral_returned) {
                record_advisory_failure(events, loan, "on_settlement", e, now);
            }
        }
    }
}

fn expect_ack(hook: &str, got: HookAck, want: HookAck) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(CoordinatorError::HookRejected {
            hook: hook.to_string(),
        })
    }
}

fn fatal(hook: &str, e: HookError) -> CoordinatorError {
    CoordinatorError::HookFailed {
        hook: hook.to_string(),
        message: e.to_string(),
    }
}

fn record_advisory_failure(
    events: &mut EventStore,
    loan: &Loan,
    hook: &str,
    e: HookError,
    now: DateTime<Utc>,
) {
    events.emit(Event::BorrowerHookFailed {
        loan_id: loan.id,
        hook: hook.to_string(),
        message: e.to_string(),
        timestamp: now,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoanState;
    use chrono::TimeZone;
    use uuid::Uuid;

    struct WrongAckLender;

    impl LenderHooks for WrongAckLender {
        fn verify_loan(&self, _loan: &Loan, _data: &[u8]) -> HookResult<HookAck> {
            Ok(HookAck::LoanVerified)
        }

        fn on_debt_changed(&self, _loan: &Loan, _delta: Money) -> HookResult<HookAck> {
            // acknowledges, but with the wrong capability token
            Ok(HookAck::SettlementAcknowledged)
        }

        fn on_collateral_changed(&self, _loan: &Loan, _delta: Money) -> HookResult<HookAck> {
            Err(HookError::new("ratio too thin"))
        }

        fn on_settlement(&self, _loan: &Loan, _proceeds: Money) -> HookResult<HookAck> {
            Ok(HookAck::SettlementAcknowledged)
        }
    }

    struct SulkingBorrower;

    impl BorrowerHooks for SulkingBorrower {
        fn on_liquidation(&self, _loan: &Loan) -> HookResult<()> {
            Err(HookError::new("refusing to be liquidated"))
        }

        fn on_rebalance(&self, _loan: &Loan, _delta: Money) -> HookResult<()> {
            Ok(())
        }

        fn on_settlement(&self, _loan: &Loan, _returned: Money) -> HookResult<()> {
            Ok(())
        }
    }

    fn loan(lender: PartyId, borrower: PartyId) -> Loan {
        Loan {
            id: 0,
            state: LoanState::Active,
            term_id: 0,
            borrower,
            lender,
            collateral_asset: Uuid::new_v4(),
            collateral_amount: Money::from_major(1),
            debt_asset: Uuid::new_v4(),
            debt_amount: Money::from_major(1),
            user_borrow_index: Rate::ONE,
            last_update: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_wrong_ack_is_rejected() {
        let lender = Uuid::new_v4();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.register_lender(lender, Box::new(WrongAckLender));

        let loan = loan(lender, Uuid::new_v4());

        assert!(dispatcher.verify_loan(&loan, &[]).is_ok());
        assert!(matches!(
            dispatcher.debt_changed(&loan, Money::ONE),
            Err(CoordinatorError::HookRejected { .. })
        ));
        assert!(matches!(
            dispatcher.collateral_changed(&loan, Money::ONE),
            Err(CoordinatorError::HookFailed { .. })
        ));
    }

    #[test]
    fn test_unregistered_lender() {
        let dispatcher = HookDispatcher::new();
        let loan = loan(Uuid::new_v4(), Uuid::new_v4());

        assert!(matches!(
            dispatcher.verify_loan(&loan, &[]),
            Err(CoordinatorError::LenderNotRegistered { .. })
        ));
    }

    #[test]
    fn test_borrower_failure_is_absorbed() {
        let borrower = Uuid::new_v4();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.register_borrower(borrower, Box::new(SulkingBorrower));

        let loan = loan(Uuid::new_v4(), borrower);
        let mut events = EventStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        dispatcher.notify_liquidation(&loan, &mut events, now);

        assert!(matches!(
            events.events(),
            [Event::BorrowerHookFailed { .. }]
        ));
    }

    #[test]
    fn test_unregistered_borrower_is_skipped() {
        let dispatcher = HookDispatcher::new();
        let loan = loan(Uuid::new_v4(), Uuid::new_v4());
        let mut events = EventStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        dispatcher.notify_settlement(&loan, Money::ONE, &mut events, now);
        assert!(events.events().is_empty());
    }
}
