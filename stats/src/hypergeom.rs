//! Hypergeometric tail probabilities for gene set over-representation.

use statrs::function::factorial::ln_binomial;

/// Probability of drawing at least `overlap` members of a set of size
/// `set_size` when `drawn` items are sampled without replacement from a
/// universe of `universe` items.
///
/// Returns 1 for a zero overlap and 0 when the overlap is impossible.
pub fn hypergeometric_upper_tail(overlap: u64, set_size: u64, universe: u64, drawn: u64) -> f64 {
    if overlap == 0 {
        return 1.0;
    }
    let set_size = set_size.min(universe);
    let drawn = drawn.min(universe);
    let max_overlap = set_size.min(drawn);
    if overlap > max_overlap {
        return 0.0;
    }
    let denom = ln_binomial(universe, drawn);
    let others = universe - set_size;
    let mut total = 0.0;
    for k in overlap..=max_overlap {
        if drawn - k > others {
            continue;
        }
        total += (ln_binomial(set_size, k) + ln_binomial(others, drawn - k) - denom).exp();
    }
    total.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, proptest};

    #[test]
    fn test_known_values() {
        // N=10, K=4, n=3: P(X >= 2) = (C(4,2)C(6,1) + C(4,3)) / C(10,3) = 40/120
        let p = hypergeometric_upper_tail(2, 4, 10, 3);
        assert!((p - 40.0 / 120.0).abs() < 1e-12);
        assert_eq!(hypergeometric_upper_tail(0, 4, 10, 3), 1.0);
        assert_eq!(hypergeometric_upper_tail(4, 4, 10, 3), 0.0);
    }

    proptest! {
        #[test]
        fn prop_tail_is_monotone(universe in 1u64..200, a in 0u64..200, b in 0u64..200) {
            let set_size = a % (universe + 1);
            let drawn = b % (universe + 1);
            let mut last = 1.0;
            for k in 0..=set_size.min(drawn) {
                let p = hypergeometric_upper_tail(k, set_size, universe, drawn);
                prop_assert!((0.0..=1.0).contains(&p));
                prop_assert!(p <= last + 1e-9);
                last = p;
            }
        }
    }
}
