use chrono::{DateTime, Duration, Utc};

use crate::decimal::{Money, Rate};
use crate::errors::{CoordinatorError, Result};
use crate::events::{Event, EventStore};
use crate::hooks::RateSource;
use crate::types::{Loan, Term};

/// advance a term's borrow index up to `now`
///
/// lazy and idempotent within one instant: a second call at the same time
/// leaves the index untouched. a queued rate change is committed here,
/// accruing piecewise at the old rate up to its effective instant and at
/// the new rate after it.
pub fn accrue_index(
    term: &mut Term,
    source: Option<&dyn RateSource>,
    events: &mut EventStore,
    now: DateTime<Utc>,
) -> Result<Rate> {
    let elapsed = (now - term.last_update).num_seconds();
    if elapsed <= 0 {
        return Ok(term.base_borrow_index);
    }

    let old_index = term.base_borrow_index;

    if let Some(pending) = term.pending_rate {
        if now >= pending.effective_at {
            // the new rate never reprices time before the last accrual
            let boundary = pending.effective_at.max(term.last_update);
            let pre_secs = (boundary - term.last_update).num_seconds();
            if pre_secs > 0 {
                let rate = rate_for(term, source, pre_secs)?;
                term.base_borrow_index += rate.accumulate(pre_secs);
            }

            let old_rate = term.fixed_rate;
            term.fixed_rate = pending.rate;
            term.pending_rate = None;
            events.emit(Event::RateChangeCommitted {
                term_id: term.id,
                old_rate,
                new_rate: term.fixed_rate,
                timestamp: now,
            });

            let post_secs = (now - boundary).num_seconds();
            if post_secs > 0 {
                let rate = rate_for(term, source, post_secs)?;
                term.base_borrow_index += rate.accumulate(post_secs);
            }

            term.last_update = now;
            events.emit(Event::IndexAccrued {
                term_id: term.id,
                old_index,
                new_index: term.base_borrow_index,
                elapsed_secs: elapsed,
                timestamp: now,
            });
            return Ok(term.base_borrow_index);
        }
    }

    let rate = rate_for(term, source, elapsed)?;
    term.base_borrow_index += rate.accumulate(elapsed);
    term.last_update = now;
    events.emit(Event::IndexAccrued {
        term_id: term.id,
        old_index,
        new_index: term.base_borrow_index,
        elapsed_secs: elapsed,
        timestamp: now,
    });
    Ok(term.base_borrow_index)
}

/// per-second rate for a term: the pluggable source if configured, the
/// stored fixed rate otherwise. negative rates would break index
/// monotonicity and are rejected.
fn rate_for(term: &Term, source: Option<&dyn RateSource>, elapsed_secs: i64) -> Result<Rate> {
    let rate = match source {
        Some(source) => source
            .rate(term.id, Duration::seconds(elapsed_secs))
            .map_err(|e| CoordinatorError::RateSourceFailed {
                term_id: term.id,
                message: e.to_string(),
            })?,
        None => term.fixed_rate,
    };
    if rate.as_decimal().is_sign_negative() {
        return Err(CoordinatorError::InvalidRate { rate });
    }
    Ok(rate)
}

/// a loan's interest outstanding since its own last touch, scaled by the
/// outstanding principal. zero if the loan was already touched against the
/// given index.
pub fn pending_interest(loan: &Loan, index: Rate) -> Money {
    loan.debt_amount.scale(index.delta_from(loan.user_borrow_index))
}

/// capitalize pending interest into the loan's debt and refresh its index
/// snapshot; returns the amount capitalized
pub fn touch_loan(
    loan: &mut Loan,
    index: Rate,
    events: &mut EventStore,
    now: DateTime<Utc>,
) -> Money {
    let interest = pending_interest(loan, index);
    if interest.is_positive() {
        loan.debt_amount += interest;
        events.emit(Event::InterestCapitalized {
            loan_id: loan.id,
            amount: interest,
            new_debt: loan.debt_amount,
            timestamp: now,
        });
    }
    loan.user_borrow_index = index;
    loan.last_update = now;
    interest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookError, HookResult};
    use crate::types::{LoanState, PendingRate, TermId};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn term(fixed_rate: Rate) -> Term {
        Term {
            id: 0,
            liquidation_bonus: Rate::from_decimal(dec!(1.5)),
            auction_length_secs: 100,
            fixed_rate,
            base_borrow_index: Rate::ONE,
            last_update: start(),
            pending_rate: None,
        }
    }

    fn loan(debt: Money, index: Rate) -> Loan {
        Loan {
            id: 0,
            state: LoanState::Active,
            term_id: 0,
            borrower: Uuid::new_v4(),
            lender: Uuid::new_v4(),
            collateral_asset: Uuid::new_v4(),
            collateral_amount: Money::from_major(1),
            debt_asset: Uuid::new_v4(),
            debt_amount: debt,
            user_borrow_index: index,
            last_update: start(),
        }
    }

    #[test]
    fn test_index_accrues_elapsed_times_rate() {
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        let mut events = EventStore::new();

        let index = accrue_index(&mut term, None, &mut events, start() + Duration::seconds(10))
            .unwrap();

        assert_eq!(index, Rate::from_decimal(dec!(1.01)));
        assert_eq!(term.last_update, start() + Duration::seconds(10));
    }

    #[test]
    fn test_accrual_idempotent_within_instant() {
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        let mut events = EventStore::new();
        let now = start() + Duration::seconds(10);

        let first = accrue_index(&mut term, None, &mut events, now).unwrap();
        let second = accrue_index(&mut term, None, &mut events, now).unwrap();

        assert_eq!(first, second);
        // only one accrual event was emitted
        let accruals = events
            .events()
            .iter()
            .filter(|e| matches!(e, Event::IndexAccrued { .. }))
            .count();
        assert_eq!(accruals, 1);
    }

    #[test]
    fn test_index_monotonic_under_fixed_rate() {
        let mut term = term(Rate::from_decimal(dec!(0.0001)));
        let mut events = EventStore::new();
        let mut previous = term.base_borrow_index;

        for secs in [1, 5, 50, 500, 5000] {
            let index =
                accrue_index(&mut term, None, &mut events, start() + Duration::seconds(secs))
                    .unwrap();
            assert!(index >= previous);
            previous = index;
        }
    }

    #[test]
    fn test_pending_interest_scales_with_principal() {
        let index = Rate::from_decimal(dec!(1.02));
        let small = loan(Money::from_major(100), Rate::ONE);
        let large = loan(Money::from_major(1000), Rate::ONE);

        assert_eq!(pending_interest(&small, index), Money::from_major(2));
        assert_eq!(pending_interest(&large, index), Money::from_major(20));
    }

    #[test]
    fn test_pending_interest_zero_when_touched() {
        let index = Rate::from_decimal(dec!(1.02));
        let loan = loan(Money::from_major(100), index);

        assert_eq!(pending_interest(&loan, index), Money::ZERO);
    }

    #[test]
    fn test_touch_capitalizes_into_debt() {
        let index = Rate::from_decimal(dec!(1.05));
        let mut loan = loan(Money::from_major(200), Rate::ONE);
        let mut events = EventStore::new();
        let now = start() + Duration::seconds(30);

        let interest = touch_loan(&mut loan, index, &mut events, now);

        assert_eq!(interest, Money::from_major(10));
        assert_eq!(loan.debt_amount, Money::from_major(210));
        assert_eq!(loan.user_borrow_index, index);
        assert_eq!(loan.last_update, now);
    }

    #[test]
    fn test_queued_rate_commits_piecewise() {
        // 0.001/s for 10s, then 0.002/s for 10s
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        term.pending_rate = Some(PendingRate {
            rate: Rate::from_decimal(dec!(0.002)),
            effective_at: start() + Duration::seconds(10),
        });
        let mut events = EventStore::new();

        let index = accrue_index(&mut term, None, &mut events, start() + Duration::seconds(20))
            .unwrap();

        assert_eq!(index, Rate::from_decimal(dec!(1.030)));
        assert_eq!(term.fixed_rate, Rate::from_decimal(dec!(0.002)));
        assert!(term.pending_rate.is_none());
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::RateChangeCommitted { .. })));
    }

    #[test]
    fn test_stale_pending_rate_does_not_backdate() {
        // effective instant before the last accrual: the new rate applies
        // only from the last accrual forward, never to earlier time
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        term.pending_rate = Some(PendingRate {
            rate: Rate::from_decimal(dec!(0.002)),
            effective_at: start() - Duration::seconds(100),
        });
        let mut events = EventStore::new();

        let index = accrue_index(&mut term, None, &mut events, start() + Duration::seconds(10))
            .unwrap();

        assert_eq!(index, Rate::from_decimal(dec!(1.02)));
        assert_eq!(term.fixed_rate, Rate::from_decimal(dec!(0.002)));
        assert!(term.pending_rate.is_none());
    }

    struct FlatSource(Rate);

    impl RateSource for FlatSource {
        fn rate(&self, _term_id: TermId, _elapsed: Duration) -> HookResult<Rate> {
            Ok(self.0)
        }
    }

    struct BrokenSource;

    impl RateSource for BrokenSource {
        fn rate(&self, _term_id: TermId, _elapsed: Duration) -> HookResult<Rate> {
            Err(HookError::new("oracle offline"))
        }
    }

    #[test]
    fn test_rate_source_overrides_fixed_rate() {
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        let source = FlatSource(Rate::from_decimal(dec!(0.005)));
        let mut events = EventStore::new();

        let index = accrue_index(
            &mut term,
            Some(&source),
            &mut events,
            start() + Duration::seconds(10),
        )
        .unwrap();

        assert_eq!(index, Rate::from_decimal(dec!(1.05)));
    }

    #[test]
    fn test_rate_source_failure_propagates() {
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        let mut events = EventStore::new();

        let err = accrue_index(
            &mut term,
            Some(&BrokenSource),
            &mut events,
            start() + Duration::seconds(10),
        )
        .unwrap_err();

        assert!(matches!(err, CoordinatorError::RateSourceFailed { .. }));
        // index untouched on failure
        assert_eq!(term.base_borrow_index, Rate::ONE);
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut term = term(Rate::from_decimal(dec!(0.001)));
        let source = FlatSource(Rate::from_decimal(dec!(-0.001)));
        let mut events = EventStore::new();

        let err = accrue_index(
            &mut term,
            Some(&source),
            &mut events,
            start() + Duration::seconds(10),
        )
        .unwrap_err();

        assert!(matches!(err, CoordinatorError::InvalidRate { .. }));
    }
}
