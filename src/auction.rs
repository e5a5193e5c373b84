use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::decimal::Money;
use crate::types::{Auction, AuctionQuote};

/// current price of a live auction over the given posted collateral
///
/// two phases around the midpoint `m = duration / 2`:
/// - `t <= m`: the filler pays the full recovery amount; the collateral on
///   offer rises linearly from zero to the full posted amount. this keeps
///   instant opportunistic fills unattractive and leaves the borrower a
///   window to repay.
/// - `m < t < duration`: all collateral is on offer; the debt-side price
///   falls linearly from the recovery amount to zero.
/// - `t >= duration`: `(0, 0)` — the auction has lapsed and only reclaim
///   remains.
///
/// the debt price never goes negative and the offer never exceeds the
/// posted collateral, so cost per unit collateral is non-increasing in `t`.
pub fn quote(auction: &Auction, collateral: Money, now: DateTime<Utc>) -> AuctionQuote {
    let elapsed = (now - auction.start_time).num_seconds().max(0);
    let duration = auction.duration_secs as i64;

    if duration == 0 || elapsed >= duration {
        return AuctionQuote {
            bid_amount: Money::ZERO,
            collateral_offered: Money::ZERO,
        };
    }

    let midpoint = Decimal::from(duration) / dec!(2);
    let t = Decimal::from(elapsed);

    if t <= midpoint {
        AuctionQuote {
            bid_amount: auction.recovery_amount,
            collateral_offered: collateral * (t / midpoint),
        }
    } else {
        AuctionQuote {
            bid_amount: auction.recovery_amount * (Decimal::ONE - (t - midpoint) / midpoint),
            collateral_offered: collateral,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn auction(recovery: Money, duration_secs: u64) -> Auction {
        Auction {
            id: 0,
            loan_id: 0,
            recovery_amount: recovery,
            duration_secs,
            start_time: start(),
        }
    }

    #[test]
    fn test_opening_price() {
        let auction = auction(Money::from_major(150), 100);
        let q = quote(&auction, Money::from_major(10), start());

        assert_eq!(q.bid_amount, Money::from_major(150));
        assert_eq!(q.collateral_offered, Money::ZERO);
        assert!(!q.is_actionable());
    }

    #[test]
    fn test_midpoint_offers_everything_at_full_price() {
        let auction = auction(Money::from_major(150), 100);
        let q = quote(
            &auction,
            Money::from_major(10),
            start() + Duration::seconds(50),
        );

        assert_eq!(q.bid_amount, Money::from_major(150));
        assert_eq!(q.collateral_offered, Money::from_major(10));
    }

    #[test]
    fn test_collateral_rising_phase() {
        let auction = auction(Money::from_major(150), 100);
        let q = quote(
            &auction,
            Money::from_major(10),
            start() + Duration::seconds(20),
        );

        // 20/50 of the collateral at the undiscounted recovery price
        assert_eq!(q.bid_amount, Money::from_major(150));
        assert_eq!(q.collateral_offered, Money::from_major(4));
    }

    #[test]
    fn test_price_falling_phase() {
        let auction = auction(Money::from_major(150), 100);
        let q = quote(
            &auction,
            Money::from_major(10),
            start() + Duration::seconds(90),
        );

        // full collateral, price discounted by (90-50)/50
        assert_eq!(q.collateral_offered, Money::from_major(10));
        assert_eq!(q.bid_amount, Money::from_major(30));
        assert!(q.bid_amount < auction.recovery_amount);
    }

    #[test]
    fn test_lapsed_auction_quotes_zero() {
        let auction = auction(Money::from_major(150), 100);

        for secs in [100, 101, 10_000] {
            let q = quote(
                &auction,
                Money::from_major(10),
                start() + Duration::seconds(secs),
            );
            assert_eq!(q.bid_amount, Money::ZERO);
            assert_eq!(q.collateral_offered, Money::ZERO);
        }
    }

    #[test]
    fn test_cost_per_unit_collateral_non_increasing() {
        let auction = auction(Money::from_major(150), 100);
        let collateral = Money::from_major(10);
        let mut previous: Option<Decimal> = None;

        for secs in 1..100 {
            let q = quote(&auction, collateral, start() + Duration::seconds(secs));
            if q.collateral_offered.is_zero() {
                continue;
            }
            let unit_cost = q.bid_amount.as_decimal() / q.collateral_offered.as_decimal();
            if let Some(prev) = previous {
                assert!(unit_cost <= prev, "unit cost rose at t={}", secs);
            }
            previous = Some(unit_cost);
        }
    }

    #[test]
    fn test_odd_duration_midpoint() {
        let auction = auction(Money::from_major(100), 9);
        let collateral = Money::from_major(1);

        // t=4 is still in the rising phase (m = 4.5), t=5 is past it
        let rising = quote(&auction, collateral, start() + Duration::seconds(4));
        let falling = quote(&auction, collateral, start() + Duration::seconds(5));

        assert_eq!(rising.bid_amount, Money::from_major(100));
        assert!(rising.collateral_offered < collateral);
        assert_eq!(falling.collateral_offered, collateral);
        assert!(falling.bid_amount < Money::from_major(100));
    }
}
