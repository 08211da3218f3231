use crate::common::DimSize;

/// Ceiling division which treats a zero divisor as producing zero.
pub fn ceil_div(a: DimSize, b: DimSize) -> DimSize {
    if b == 0 {
        return 0;
    }
    divrem::DivCeil::div_ceil(a, b)
}

/// Rounds `a` up to the next multiple of `b`.
pub fn align_up(a: DimSize, b: DimSize) -> DimSize {
    ceil_div(a, b) * b
}

pub fn gcd(mut a: DimSize, mut b: DimSize) -> DimSize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

pub fn lcm(a: DimSize, b: DimSize) -> DimSize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

/// Returns the factors of an integer, in ascending order.
pub fn factors(x: DimSize) -> Vec<DimSize> {
    let mut result = Vec::new();
    let mut i = 1;
    while i * i <= x {
        if x % i == 0 {
            result.push(i);
            if x / i != i {
                result.push(x / i);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

/// Factors of `x` merged with the powers of two up to `x`, ascending and deduplicated.
///
/// These are the block counts a tile may span along an axis: factors divide the
/// axis exactly, powers of two leave a tail.
pub fn block_candidates(x: DimSize) -> Vec<DimSize> {
    let mut result = factors(x);
    let mut p = 1;
    while p <= x {
        result.push(p);
        p *= 2;
    }
    result.sort_unstable();
    result.dedup();
    result
}

/// Merges two ascending lists into one ascending, deduplicated list.
pub fn merge_ascending(a: &[DimSize], b: &[DimSize]) -> Vec<DimSize> {
    let mut result = a.iter().chain(b).copied().collect::<Vec<_>>();
    result.sort_unstable();
    result.dedup();
    result
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ceil_div_by_zero_is_zero() {
        assert_eq!(ceil_div(7, 0), 0);
    }

    #[test]
    fn test_factors_of_32() {
        assert_eq!(factors(32), vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_factors_of_prime() {
        assert_eq!(factors(13), vec![1, 13]);
    }

    #[test]
    fn test_block_candidates_include_powers_of_two() {
        assert_eq!(block_candidates(12), vec![1, 2, 3, 4, 6, 8, 12]);
    }

    #[test]
    fn test_join_into_string() {
        assert_eq!(join_into_string([1, 2, 3], "x"), "1x2x3");
    }

    proptest! {
        #[test]
        fn test_align_up_is_smallest_multiple(a in 0u64..10_000, b in 1u64..512) {
            let aligned = align_up(a, b);
            prop_assert_eq!(aligned % b, 0);
            prop_assert!(aligned >= a);
            prop_assert!(aligned < a + b);
        }

        #[test]
        fn test_lcm_is_divisible_by_both(a in 1u64..500, b in 1u64..500) {
            let l = lcm(a, b);
            prop_assert_eq!(l % a, 0);
            prop_assert_eq!(l % b, 0);
            prop_assert_eq!(l * gcd(a, b), a * b);
        }

        #[test]
        fn test_factors_divide(x in 1u64..5_000) {
            let f = factors(x);
            prop_assert!(f.iter().all(|d| x % d == 0));
            prop_assert_eq!(f.first().copied(), Some(1));
            prop_assert_eq!(f.last().copied(), Some(x));
        }
    }
}
