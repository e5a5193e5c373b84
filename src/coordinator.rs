use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};

use crate::auction;
use crate::custody::AssetCustody;
use crate::decimal::{Money, Rate};
use crate::errors::{CoordinatorError, Result};
use crate::events::{Event, EventStore};
use crate::guard::ReentrancyGuard;
use crate::hooks::{BorrowerHooks, FlashLoanReceiver, HookDispatcher, LenderHooks, RateSource};
use crate::interest;
use crate::ledger::{AuctionBook, BorrowerIndex, LoanLedger, TermRegistry};
use crate::types::{
    AssetId, Auction, AuctionId, AuctionQuote, HookAck, Loan, LoanId, LoanState, PartyId,
    PendingRate, Term, TermConfig, TermId, Transfer, MAX_AUCTION_LENGTH_SECS,
};

/// everything the coordinator persists
///
/// cheap to clone: mutating operations checkpoint this on entry and restore
/// it wholesale if anything downstream fails, so no call is ever partially
/// applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub loans: LoanLedger,
    pub terms: TermRegistry,
    pub auctions: AuctionBook,
    pub borrowers: BorrowerIndex,
    pub events: EventStore,
}

/// the lending coordinator: escrows assets, tracks per-loan accrual, and
/// liquidates through two-phase dutch auctions
pub struct Coordinator<C: AssetCustody> {
    escrow: PartyId,
    state: CoordinatorState,
    custody: C,
    hooks: HookDispatcher,
    rate_sources: HashMap<TermId, Box<dyn RateSource>>,
    guard: ReentrancyGuard,
}

impl<C: AssetCustody> Coordinator<C> {
    /// create a coordinator escrowing under the given custody account
    pub fn new(escrow: PartyId, custody: C) -> Self {
        Self {
            escrow,
            state: CoordinatorState::default(),
            custody,
            hooks: HookDispatcher::new(),
            rate_sources: HashMap::new(),
            guard: ReentrancyGuard::new(),
        }
    }

    pub fn escrow(&self) -> PartyId {
        self.escrow
    }

    pub fn custody(&self) -> &C {
        &self.custody
    }

    pub fn custody_mut(&mut self) -> &mut C {
        &mut self.custody
    }

    pub fn register_lender(&mut self, party: PartyId, handler: Box<dyn LenderHooks>) {
        self.hooks.register_lender(party, handler);
    }

    pub fn register_borrower(&mut self, party: PartyId, handler: Box<dyn BorrowerHooks>) {
        self.hooks.register_borrower(party, handler);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.state.events.take_events()
    }

    // ---- term configuration ----

    /// append a term template; terms are never modified or removed
    pub fn set_term(
        &mut self,
        config: TermConfig,
        rate_source: Option<Box<dyn RateSource>>,
        time_provider: &SafeTimeProvider,
    ) -> Result<TermId> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();

        if config.liquidation_bonus < Rate::ONE
            || config.liquidation_bonus > Rate::from_percentage(200)
        {
            return Err(CoordinatorError::InvalidTerms {
                message: format!(
                    "liquidation bonus {} outside [1.0, 2.0]",
                    config.liquidation_bonus.as_decimal()
                ),
            });
        }
        if config.auction_length_secs > MAX_AUCTION_LENGTH_SECS {
            return Err(CoordinatorError::InvalidTerms {
                message: format!(
                    "auction length {}s exceeds 30 days",
                    config.auction_length_secs
                ),
            });
        }
        if config.fixed_rate.as_decimal().is_sign_negative() {
            return Err(CoordinatorError::InvalidRate {
                rate: config.fixed_rate,
            });
        }

        let term_id = self.state.terms.insert(Term {
            id: 0,
            liquidation_bonus: config.liquidation_bonus,
            auction_length_secs: config.auction_length_secs,
            fixed_rate: config.fixed_rate,
            base_borrow_index: Rate::ONE,
            last_update: now,
            pending_rate: None,
        });
        if let Some(source) = rate_source {
            self.rate_sources.insert(term_id, source);
        }

        self.state.events.emit(Event::TermCreated {
            term_id,
            liquidation_bonus: config.liquidation_bonus,
            auction_length_secs: config.auction_length_secs,
            timestamp: now,
        });
        Ok(term_id)
    }

    /// queue a fixed-rate change; committed by index accrual once effective
    pub fn queue_rate(
        &mut self,
        term_id: TermId,
        new_rate: Rate,
        effective_at: DateTime<Utc>,
        time_provider: &SafeTimeProvider,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();

        if new_rate.as_decimal().is_sign_negative() {
            return Err(CoordinatorError::InvalidRate { rate: new_rate });
        }
        if effective_at < now {
            return Err(CoordinatorError::RateChangeInPast {
                id: term_id,
                effective_at,
                current_time: now,
            });
        }
        let term = self
            .state
            .terms
            .get_mut(term_id)
            .ok_or(CoordinatorError::TermNotFound { id: term_id })?;
        if term.pending_rate.is_some() {
            return Err(CoordinatorError::RateChangeAlreadyQueued { id: term_id });
        }
        term.pending_rate = Some(PendingRate {
            rate: new_rate,
            effective_at,
        });

        self.state.events.emit(Event::RateChangeQueued {
            term_id,
            new_rate,
            effective_at,
            timestamp: now,
        });
        Ok(())
    }

    /// lazily advance a term's borrow index to the current instant
    pub fn accrue_index(
        &mut self,
        term_id: TermId,
        time_provider: &SafeTimeProvider,
    ) -> Result<Rate> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        self.accrue_index_inner(term_id, now)
    }

    fn accrue_index_inner(&mut self, term_id: TermId, now: DateTime<Utc>) -> Result<Rate> {
        let source = self.rate_sources.get(&term_id).map(Box::as_ref);
        let term = self
            .state
            .terms
            .get_mut(term_id)
            .ok_or(CoordinatorError::TermNotFound { id: term_id })?;
        interest::accrue_index(term, source, &mut self.state.events, now)
    }

    /// refresh the term index, then the loan's snapshot, in that order
    fn refresh_loan(&mut self, loan_id: LoanId, now: DateTime<Utc>) -> Result<()> {
        let term_id = self
            .state
            .loans
            .get(loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?
            .term_id;
        let index = self.accrue_index_inner(term_id, now)?;
        let loan = self
            .state
            .loans
            .get_mut(loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        interest::touch_loan(loan, index, &mut self.state.events, now);
        Ok(())
    }

    // ---- loan lifecycle ----

    pub fn create_loan(
        &mut self,
        lender: PartyId,
        borrower: PartyId,
        collateral_asset: AssetId,
        debt_asset: AssetId,
        collateral_amount: Money,
        debt_amount: Money,
        term_id: TermId,
        data: &[u8],
        time_provider: &SafeTimeProvider,
    ) -> Result<LoanId> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        let checkpoint = self.state.clone();

        let result = self.create_loan_inner(
            lender,
            borrower,
            collateral_asset,
            debt_asset,
            collateral_amount,
            debt_amount,
            term_id,
            data,
            now,
        );
        if result.is_err() {
            self.state = checkpoint;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn create_loan_inner(
        &mut self,
        lender: PartyId,
        borrower: PartyId,
        collateral_asset: AssetId,
        debt_asset: AssetId,
        collateral_amount: Money,
        debt_amount: Money,
        term_id: TermId,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<LoanId> {
        if !debt_amount.is_positive() || collateral_amount.is_negative() {
            return Err(CoordinatorError::ZeroAmount);
        }

        let term = self
            .state
            .terms
            .get(term_id)
            .ok_or(CoordinatorError::TermNotFound { id: term_id })?;
        if term.pending_rate.is_some() {
            return Err(CoordinatorError::TermRateUpdating { id: term_id });
        }

        let index = self.accrue_index_inner(term_id, now)?;

        let loan_id = self.state.loans.insert(Loan {
            id: 0,
            state: LoanState::Active,
            term_id,
            borrower,
            lender,
            collateral_asset,
            collateral_amount,
            debt_asset,
            debt_amount,
            user_borrow_index: index,
            last_update: now,
        });
        self.state.borrowers.add(borrower, loan_id);
        self.state.events.emit(Event::LoanCreated {
            loan_id,
            term_id,
            lender,
            borrower,
            collateral_amount,
            debt_amount,
            timestamp: now,
        });

        let loan = self
            .state
            .loans
            .get(loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        self.hooks.verify_loan(&loan, data)?;

        let batch = [
            Transfer::new(collateral_asset, borrower, self.escrow, collateral_amount),
            Transfer::new(debt_asset, lender, borrower, debt_amount),
        ];
        self.custody.execute(&batch)?;

        Ok(loan_id)
    }

    /// adjust a loan's debt: negative borrows more, positive repays up to
    /// the outstanding total (repaying exactly that settles the loan)
    pub fn change_debt(
        &mut self,
        caller: PartyId,
        loan_id: LoanId,
        on_behalf_of: PartyId,
        amount: Money,
        time_provider: &SafeTimeProvider,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        let checkpoint = self.state.clone();

        let result = self.change_debt_inner(caller, loan_id, on_behalf_of, amount, now);
        if result.is_err() {
            self.state = checkpoint;
        }
        result
    }

    fn change_debt_inner(
        &mut self,
        caller: PartyId,
        loan_id: LoanId,
        on_behalf_of: PartyId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(CoordinatorError::ZeroAmount);
        }
        let state = self
            .state
            .loans
            .get(loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?
            .state;
        if state == LoanState::Inactive {
            return Err(CoordinatorError::InvalidLoanState {
                id: loan_id,
                state,
                expected: LoanState::Active,
            });
        }

        self.refresh_loan(loan_id, now)?;
        let loan = self
            .state
            .loans
            .get(loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;

        if amount.is_negative() {
            // borrow more
            if loan.state != LoanState::Active {
                return Err(CoordinatorError::InvalidLoanState {
                    id: loan_id,
                    state: loan.state,
                    expected: LoanState::Active,
                });
            }
            if caller != loan.borrower {
                return Err(CoordinatorError::Unauthorized {
                    party: caller,
                    operation: "borrow more against this loan".to_string(),
                });
            }
            let extra = amount.abs();
            let updated = {
                let loan = self
                .state
                .loans
                .get_mut(loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
                loan.debt_amount += extra;
                loan.clone()
            };
            self.state.events.emit(Event::DebtChanged {
                loan_id,
                delta: amount,
                new_debt: updated.debt_amount,
                timestamp: now,
            });

            let batch = [Transfer::new(
                loan.debt_asset,
                loan.lender,
                on_behalf_of,
                extra,
            )];
            self.custody.execute(&batch)?;
            if let Err(e) = self.hooks.debt_changed(&updated, amount) {
                self.custody.execute(&reversed(&batch))?;
                return Err(e);
            }
            self.hooks
                .notify_rebalance(&updated, amount, &mut self.state.events, now);
            return Ok(());
        }

        // repay, clamped to the outstanding total
        let outstanding = loan.debt_amount;
        let repay = amount.min(outstanding);
        let full = repay == outstanding;

        if loan.state == LoanState::Liquidating && !full {
            return Err(CoordinatorError::PartialRepaymentDuringLiquidation { id: loan_id });
        }

        let mut batch = vec![Transfer::new(loan.debt_asset, caller, loan.lender, repay)];
        let updated = {
            let loan = self
                .state
                .loans
                .get_mut(loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
            loan.debt_amount -= repay;
            if full {
                loan.state = LoanState::Inactive;
            }
            loan.clone()
        };

        if full {
            self.state.borrowers.remove(updated.borrower, loan_id);
            if let Some(auction) = self.state.auctions.for_loan(loan_id).cloned() {
                self.state.auctions.remove(auction.id);
                self.state.events.emit(Event::AuctionStopped {
                    auction_id: auction.id,
                    loan_id,
                    timestamp: now,
                });
            }
            self.state.events.emit(Event::LoanRepaid {
                loan_id,
                settlement_amount: repay,
                timestamp: now,
            });
            batch.push(Transfer::new(
                updated.collateral_asset,
                self.escrow,
                updated.borrower,
                updated.collateral_amount,
            ));
        } else {
            self.state.events.emit(Event::DebtChanged {
                loan_id,
                delta: repay,
                new_debt: updated.debt_amount,
                timestamp: now,
            });
        }

        self.custody.execute(&batch)?;
        if let Err(e) = self.hooks.debt_changed(&updated, repay) {
            self.custody.execute(&reversed(&batch))?;
            return Err(e);
        }
        self.hooks
            .notify_rebalance(&updated, repay, &mut self.state.events, now);
        Ok(())
    }

    /// adjust a loan's collateral: positive adds, negative withdraws
    /// (borrower only); locked entirely while an auction is live
    pub fn change_collateral(
        &mut self,
        caller: PartyId,
        loan_id: LoanId,
        on_behalf_of: PartyId,
        amount: Money,
        time_provider: &SafeTimeProvider,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        let checkpoint = self.state.clone();

        let result = self.change_collateral_inner(caller, loan_id, on_behalf_of, amount, now);
        if result.is_err() {
            self.state = checkpoint;
        }
        result
    }

    fn change_collateral_inner(
        &mut self,
        caller: PartyId,
        loan_id: LoanId,
        on_behalf_of: PartyId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(CoordinatorError::ZeroAmount);
        }
        let loan = self
            .state
            .loans
            .get(loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        match loan.state {
            LoanState::Active => {}
            LoanState::Liquidating => {
                return Err(CoordinatorError::CollateralLocked { id: loan_id })
            }
            LoanState::Inactive => {
                return Err(CoordinatorError::InvalidLoanState {
                    id: loan_id,
                    state: loan.state,
                    expected: LoanState::Active,
                })
            }
        }

        // recorded debt must reflect reality before the lender judges the ratio
        self.refresh_loan(loan_id, now)?;
        let loan = self
            .state
            .loans
            .get(loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;

        let batch = if amount.is_negative() {
            if caller != loan.borrower {
                return Err(CoordinatorError::Unauthorized {
                    party: caller,
                    operation: "withdraw collateral".to_string(),
                });
            }
            let withdraw = amount.abs();
            if withdraw > loan.collateral_amount {
                return Err(CoordinatorError::InsufficientCollateral {
                    available: loan.collateral_amount,
                    requested: withdraw,
                });
            }
            [Transfer::new(
                loan.collateral_asset,
                self.escrow,
                on_behalf_of,
                withdraw,
            )]
        } else {
            [Transfer::new(
                loan.collateral_asset,
                caller,
                self.escrow,
                amount,
            )]
        };

        let updated = {
            let loan = self
                .state
                .loans
                .get_mut(loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
            if amount.is_negative() {
                loan.collateral_amount -= amount.abs();
            } else {
                loan.collateral_amount += amount;
            }
            loan.clone()
        };
        self.state.events.emit(Event::CollateralChanged {
            loan_id,
            delta: amount,
            new_collateral: updated.collateral_amount,
            timestamp: now,
        });

        self.custody.execute(&batch)?;
        if let Err(e) = self.hooks.collateral_changed(&updated, amount) {
            self.custody.execute(&reversed(&batch))?;
            return Err(e);
        }
        self.hooks
            .notify_rebalance(&updated, amount, &mut self.state.events, now);
        Ok(())
    }

    // ---- liquidation and auctions ----

    /// start liquidating a loan; returns the auction id, or `None` when the
    /// term's zero auction length means the collateral was seized outright
    pub fn liquidate(
        &mut self,
        caller: PartyId,
        loan_id: LoanId,
        time_provider: &SafeTimeProvider,
    ) -> Result<Option<AuctionId>> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        let checkpoint = self.state.clone();

        let result = self.liquidate_inner(caller, loan_id, now);
        if result.is_err() {
            self.state = checkpoint;
        }
        result
    }

    fn liquidate_inner(
        &mut self,
        caller: PartyId,
        loan_id: LoanId,
        now: DateTime<Utc>,
    ) -> Result<Option<AuctionId>> {
        let loan = self
            .state
            .loans
            .get(loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        if caller != loan.lender {
            return Err(CoordinatorError::Unauthorized {
                party: caller,
                operation: "liquidate this loan".to_string(),
            });
        }
        if loan.state != LoanState::Active {
            return Err(CoordinatorError::InvalidLoanState {
                id: loan_id,
                state: loan.state,
                expected: LoanState::Active,
            });
        }

        self.refresh_loan(loan_id, now)?;
        let loan = self
            .state
            .loans
            .get(loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        let term = self
            .state
            .terms
            .get(loan.term_id)
            .cloned()
            .ok_or(CoordinatorError::TermNotFound { id: loan.term_id })?;

        let recovery = loan.debt_amount.scale(term.liquidation_bonus);

        if term.instant_seizure() {
            {
                let loan = self
                .state
                .loans
                .get_mut(loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
                loan.state = LoanState::Inactive;
            }
            self.state.borrowers.remove(loan.borrower, loan_id);
            self.state.events.emit(Event::CollateralSeized {
                loan_id,
                collateral_amount: loan.collateral_amount,
                lender: loan.lender,
                timestamp: now,
            });

            let batch = [Transfer::new(
                loan.collateral_asset,
                self.escrow,
                loan.lender,
                loan.collateral_amount,
            )];
            self.custody.execute(&batch)?;
            self.hooks
                .notify_liquidation(&loan, &mut self.state.events, now);
            return Ok(None);
        }

        let auction_id = self.state.auctions.insert(Auction {
            id: 0,
            loan_id,
            recovery_amount: recovery,
            duration_secs: term.auction_length_secs,
            start_time: now,
        });
        let loan = {
            let loan = self
                .state
                .loans
                .get_mut(loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
            loan.state = LoanState::Liquidating;
            loan.clone()
        };
        self.state.events.emit(Event::AuctionCreated {
            auction_id,
            loan_id,
            recovery_amount: recovery,
            duration_secs: term.auction_length_secs,
            timestamp: now,
        });

        self.hooks
            .notify_liquidation(&loan, &mut self.state.events, now);
        Ok(Some(auction_id))
    }

    /// fill a live auction at its current two-phase price
    pub fn bid(
        &mut self,
        caller: PartyId,
        auction_id: AuctionId,
        time_provider: &SafeTimeProvider,
    ) -> Result<AuctionQuote> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        let checkpoint = self.state.clone();

        let result = self.bid_inner(caller, auction_id, now);
        if result.is_err() {
            self.state = checkpoint;
        }
        result
    }

    fn bid_inner(
        &mut self,
        caller: PartyId,
        auction_id: AuctionId,
        now: DateTime<Utc>,
    ) -> Result<AuctionQuote> {
        let auction = self
            .state
            .auctions
            .get(auction_id)
            .cloned()
            .ok_or(CoordinatorError::AuctionNotFound { id: auction_id })?;
        let loan = self
            .state
            .loans
            .get(auction.loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;

        let quote = auction::quote(&auction, loan.collateral_amount, now);
        if !quote.is_actionable() {
            if now >= auction.expires_at() {
                return Err(CoordinatorError::AuctionLapsed { id: auction_id });
            }
            return Err(CoordinatorError::AuctionNotClearing { id: auction_id });
        }

        let borrower_return = loan.collateral_amount - quote.collateral_offered;

        {
            let loan = self
                .state
                .loans
                .get_mut(auction.loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;
            loan.state = LoanState::Inactive;
        }
        self.state.auctions.remove(auction_id);
        self.state.borrowers.remove(loan.borrower, loan.id);
        self.state.events.emit(Event::AuctionSettled {
            auction_id,
            loan_id: loan.id,
            bidder: caller,
            bid_amount: quote.bid_amount,
            collateral_offered: quote.collateral_offered,
            borrower_return,
            timestamp: now,
        });

        let mut batch = vec![
            Transfer::new(loan.debt_asset, caller, loan.lender, quote.bid_amount),
            Transfer::new(
                loan.collateral_asset,
                self.escrow,
                caller,
                quote.collateral_offered,
            ),
        ];
        if borrower_return.is_positive() {
            batch.push(Transfer::new(
                loan.collateral_asset,
                self.escrow,
                loan.borrower,
                borrower_return,
            ));
        }

        self.custody.execute(&batch)?;
        if let Err(e) = self.hooks.lender_settlement(&loan, quote.bid_amount) {
            self.custody.execute(&reversed(&batch))?;
            return Err(e);
        }
        self.hooks
            .notify_settlement(&loan, borrower_return, &mut self.state.events, now);
        Ok(quote)
    }

    /// after an auction lapses unfilled, the lender absorbs the loss and
    /// takes the full collateral
    pub fn reclaim(
        &mut self,
        caller: PartyId,
        auction_id: AuctionId,
        time_provider: &SafeTimeProvider,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();
        let checkpoint = self.state.clone();

        let result = self.reclaim_inner(caller, auction_id, now);
        if result.is_err() {
            self.state = checkpoint;
        }
        result
    }

    fn reclaim_inner(
        &mut self,
        caller: PartyId,
        auction_id: AuctionId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let auction = self
            .state
            .auctions
            .get(auction_id)
            .cloned()
            .ok_or(CoordinatorError::AuctionNotFound { id: auction_id })?;
        let loan = self
            .state
            .loans
            .get(auction.loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;

        if caller != loan.lender {
            return Err(CoordinatorError::Unauthorized {
                party: caller,
                operation: "reclaim this auction".to_string(),
            });
        }
        if now < auction.expires_at() {
            return Err(CoordinatorError::AuctionNotExpired {
                id: auction_id,
                expires_at: auction.expires_at(),
                current_time: now,
            });
        }

        {
            let loan = self
                .state
                .loans
                .get_mut(auction.loan_id)
                .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;
            loan.state = LoanState::Inactive;
        }
        self.state.auctions.remove(auction_id);
        self.state.borrowers.remove(loan.borrower, loan.id);
        self.state.events.emit(Event::AuctionReclaimed {
            auction_id,
            loan_id: loan.id,
            collateral_amount: loan.collateral_amount,
            timestamp: now,
        });

        let batch = [Transfer::new(
            loan.collateral_asset,
            self.escrow,
            loan.lender,
            loan.collateral_amount,
        )];
        self.custody.execute(&batch)?;
        if let Err(e) = self.hooks.lender_settlement(&loan, loan.collateral_amount) {
            self.custody.execute(&reversed(&batch))?;
            return Err(e);
        }
        self.hooks
            .notify_settlement(&loan, Money::ZERO, &mut self.state.events, now);
        Ok(())
    }

    /// cancel a live auction and return the loan to `Active`; the
    /// borrower's collateral stays escrowed untouched
    pub fn stop_auction(
        &mut self,
        caller: PartyId,
        auction_id: AuctionId,
        time_provider: &SafeTimeProvider,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();

        let auction = self
            .state
            .auctions
            .get(auction_id)
            .cloned()
            .ok_or(CoordinatorError::AuctionNotFound { id: auction_id })?;
        let loan = self
            .state
            .loans
            .get(auction.loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;
        if caller != loan.lender {
            return Err(CoordinatorError::Unauthorized {
                party: caller,
                operation: "stop this auction".to_string(),
            });
        }

        self.state.auctions.remove(auction_id);
        let loan = self
            .state
            .loans
            .get_mut(auction.loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;
        loan.state = LoanState::Active;
        self.state.events.emit(Event::AuctionStopped {
            auction_id,
            loan_id: auction.loan_id,
            timestamp: now,
        });
        Ok(())
    }

    // ---- flash loans ----

    /// lend escrowed balance for the duration of one callback; the receiver
    /// must acknowledge and the same amount is pulled straight back
    pub fn flash_loan(
        &mut self,
        receiver_party: PartyId,
        asset: AssetId,
        amount: Money,
        receiver: &dyn FlashLoanReceiver,
        data: &[u8],
        time_provider: &SafeTimeProvider,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let now = time_provider.now();

        if !amount.is_positive() {
            return Err(CoordinatorError::ZeroAmount);
        }

        let out = Transfer::new(asset, self.escrow, receiver_party, amount);
        self.custody.transfer(&out)?;

        match receiver.on_flash_loan(asset, amount, data) {
            Ok(HookAck::FlashLoanAcknowledged) => {}
            Ok(_) => {
                self.custody.transfer(&out.reversed())?;
                return Err(CoordinatorError::HookRejected {
                    hook: "on_flash_loan".to_string(),
                });
            }
            Err(_) => {
                self.custody.transfer(&out.reversed())?;
                return Err(CoordinatorError::FlashLoanNotRepaid { expected: amount });
            }
        }

        self.custody
            .transfer(&out.reversed())
            .map_err(|_| CoordinatorError::FlashLoanNotRepaid { expected: amount })?;

        self.state.events.emit(Event::FlashLoanCompleted {
            receiver: receiver_party,
            amount,
            timestamp: now,
        });
        Ok(())
    }

    // ---- read-only views ----

    /// a loan record, optionally with pending interest folded into the debt
    pub fn loan(
        &self,
        loan_id: LoanId,
        include_pending_interest: bool,
        time_provider: &SafeTimeProvider,
    ) -> Result<Loan> {
        let mut loan = self
            .state
            .loans
            .get(loan_id)
            .cloned()
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        if include_pending_interest {
            loan.debt_amount += self.accrued_interest(loan_id, time_provider)?;
        }
        Ok(loan)
    }

    pub fn term(&self, term_id: TermId) -> Result<Term> {
        self.state
            .terms
            .get(term_id)
            .cloned()
            .ok_or(CoordinatorError::TermNotFound { id: term_id })
    }

    pub fn auction(&self, auction_id: AuctionId) -> Result<Auction> {
        self.state
            .auctions
            .get(auction_id)
            .cloned()
            .ok_or(CoordinatorError::AuctionNotFound { id: auction_id })
    }

    /// the current two-phase price of a live auction
    pub fn auction_quote(
        &self,
        auction_id: AuctionId,
        time_provider: &SafeTimeProvider,
    ) -> Result<AuctionQuote> {
        let auction = self
            .state
            .auctions
            .get(auction_id)
            .ok_or(CoordinatorError::AuctionNotFound { id: auction_id })?;
        let loan = self
            .state
            .loans
            .get(auction.loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: auction.loan_id })?;
        Ok(auction::quote(auction, loan.collateral_amount, time_provider.now()))
    }

    /// interest outstanding on a loan as of now, without mutating anything
    pub fn accrued_interest(
        &self,
        loan_id: LoanId,
        time_provider: &SafeTimeProvider,
    ) -> Result<Money> {
        let loan = self
            .state
            .loans
            .get(loan_id)
            .ok_or(CoordinatorError::LoanNotFound { id: loan_id })?;
        let term = self
            .state
            .terms
            .get(loan.term_id)
            .ok_or(CoordinatorError::TermNotFound { id: loan.term_id })?;

        // project the index forward on a scratch copy
        let mut scratch = term.clone();
        let mut discard = EventStore::new();
        let source = self.rate_sources.get(&loan.term_id).map(Box::as_ref);
        let index =
            interest::accrue_index(&mut scratch, source, &mut discard, time_provider.now())?;
        Ok(interest::pending_interest(loan, index))
    }

    pub fn loans_of(&self, borrower: PartyId) -> &[LoanId] {
        self.state.borrowers.loans_of(borrower)
    }

    pub fn events(&self) -> &[Event] {
        self.state.events.events()
    }
}

fn reversed(batch: &[Transfer]) -> Vec<Transfer> {
    batch.iter().rev().map(Transfer::reversed).collect()
}
