//! Ratcheting trailing stop.
//!
//! Shared verbatim by the strategy cycle and the fast stop poller so both
//! drivers arrive at the same stop for the same price.
//!
//! ```text
//! trail = max(multiplier * volatility_at_entry, price * stop_pct)
//! long:  candidate = highest - trail, accepted only if above the current stop
//! short: candidate = lowest  + trail, accepted only if below the current stop
//! ```

use crate::services::strategies::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailParams {
    pub multiplier: f64,
    pub stop_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailUpdate {
    /// Highest price seen (long) or lowest (short), including this one.
    pub extremum: f64,
    pub stop: f64,
    pub trail_distance: f64,
    /// The stop moved on this update.
    pub ratcheted: bool,
}

#[inline]
pub fn trail_distance(price: f64, volatility: f64, params: &TrailParams) -> f64 {
    (params.multiplier * volatility).max(price * params.stop_pct)
}

/// Fold `price` into the running extremum and ratchet the stop.
pub fn update(
    side: Side,
    price: f64,
    extremum: f64,
    current_stop: f64,
    volatility_at_entry: f64,
    params: &TrailParams,
) -> TrailUpdate {
    let dist = trail_distance(price, volatility_at_entry, params);
    let (extremum, candidate) = match side {
        Side::Long => {
            let hi = extremum.max(price);
            (hi, hi - dist)
        }
        Side::Short => {
            let lo = extremum.min(price);
            (lo, lo + dist)
        }
    };
    let ratcheted = match side {
        Side::Long => candidate > current_stop,
        Side::Short => candidate < current_stop,
    };
    TrailUpdate {
        extremum,
        stop: if ratcheted { candidate } else { current_stop },
        trail_distance: dist,
        ratcheted,
    }
}

/// Price has crossed the stop against the position.
#[inline]
pub fn stop_hit(side: Side, price: f64, stop: f64) -> bool {
    match side {
        Side::Long => price <= stop,
        Side::Short => price >= stop,
    }
}

/// Price has reached the profit target in the position's favour.
#[inline]
pub fn target_hit(side: Side, price: f64, target: f64) -> bool {
    match side {
        Side::Long => price >= target,
        Side::Short => price <= target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const P: TrailParams = TrailParams { multiplier: 1.1, stop_pct: 0.008 };

    #[test]
    fn long_ratchets_up_from_new_high() {
        let u = update(Side::Long, 105.0, 100.0, 98.9, 1.0, &P);
        assert_eq!(u.extremum, 105.0);
        assert!((u.stop - 103.9).abs() < 1e-9);
        assert!(u.ratcheted);
    }

    #[test]
    fn long_never_loosens_on_pullback() {
        let u = update(Side::Long, 103.8, 105.0, 103.9, 1.0, &P);
        assert_eq!(u.extremum, 105.0);
        assert!((u.stop - 103.9).abs() < 1e-9);
        assert!(!u.ratcheted);
        assert!(stop_hit(Side::Long, 103.8, u.stop));
    }

    #[test]
    fn percentage_floor_wins_when_volatility_is_small() {
        // 200 * 0.008 = 1.6 > 1.1 * 1.0
        assert!((trail_distance(200.0, 1.0, &P) - 1.6).abs() < 1e-9);
        assert!((trail_distance(100.0, 1.0, &P) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn short_mirrors_long() {
        let u = update(Side::Short, 95.0, 100.0, 101.1, 1.0, &P);
        assert_eq!(u.extremum, 95.0);
        assert!((u.stop - 96.1).abs() < 1e-9);
        let back = update(Side::Short, 96.2, u.extremum, u.stop, 1.0, &P);
        assert_eq!(back.stop, u.stop);
        assert!(stop_hit(Side::Short, 96.2, back.stop));
        assert!(!stop_hit(Side::Short, 96.0, back.stop));
    }

    #[test]
    fn target_checks_are_directional() {
        assert!(target_hit(Side::Long, 101.0, 101.0));
        assert!(!target_hit(Side::Long, 100.9, 101.0));
        assert!(target_hit(Side::Short, 98.9, 99.0));
        assert!(!target_hit(Side::Short, 99.1, 99.0));
    }

    proptest! {
        #[test]
        fn long_stop_is_non_decreasing_on_rising_prices(
            start in 1.0f64..1_000.0,
            steps in proptest::collection::vec(0.0f64..5.0, 1..50),
            vol in 0.0f64..10.0,
        ) {
            let mut price = start;
            let mut ext = start;
            let mut stop = start - trail_distance(start, vol, &P);
            for s in steps {
                price += s;
                let u = update(Side::Long, price, ext, stop, vol, &P);
                prop_assert!(u.stop >= stop);
                prop_assert!(u.extremum >= ext);
                ext = u.extremum;
                stop = u.stop;
            }
        }

        #[test]
        fn short_stop_is_non_increasing_on_falling_prices(
            start in 100.0f64..1_000.0,
            steps in proptest::collection::vec(0.0f64..1.0, 1..50),
            vol in 0.0f64..10.0,
        ) {
            let mut price = start;
            let mut ext = start;
            let mut stop = start + trail_distance(start, vol, &P);
            for s in steps {
                price -= s;
                let u = update(Side::Short, price, ext, stop, vol, &P);
                prop_assert!(u.stop <= stop);
                prop_assert!(u.extremum <= ext);
                ext = u.extremum;
                stop = u.stop;
            }
        }
    }
}
