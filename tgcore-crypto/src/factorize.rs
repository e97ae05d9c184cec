//! Pollard-rho (Brent variant) factorization of the `pq` challenge.

/// Upper bound on Brent's cycle length before an attempt is abandoned.
const MAX_ROUNDS: u128 = 1 << 22;

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn abs_sub(a: u128, b: u128) -> u128 {
    a.max(b) - a.min(b)
}

fn step(y: u128, c: u128, n: u128) -> u128 {
    (y * y % n + c) % n
}

fn brent(n: u128, c: u128) -> Option<u128> {
    if n % 2 == 0 {
        return Some(2);
    }

    let m = 7 * (n / 13);
    let mut y = 3 * (n / 7);
    let (mut g, mut r, mut q) = (1u128, 1u128, 1u128);
    let (mut x, mut ys) = (0u128, 0u128);

    while g == 1 {
        if r > MAX_ROUNDS {
            return None;
        }
        x = y;
        for _ in 0..r {
            y = step(y, c, n);
        }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..m.min(r - k) {
                y = step(y, c, n);
                q = q * abs_sub(x, y) % n;
            }
            g = gcd(q, n);
            k += m;
        }
        r *= 2;
    }

    if g == n {
        for _ in 0..MAX_ROUNDS {
            ys = step(ys, c, n);
            g = gcd(abs_sub(x, ys), n);
            if g > 1 {
                break;
            }
        }
    }

    (g > 1 && g < n).then_some(g)
}

/// Split `pq` into `(p, q)` with `p <= q`, or `None` when no non-trivial
/// factor is found.
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    if pq < 4 {
        return None;
    }
    let n = u128::from(pq);
    [43u128, 47, 53, 59, 61].into_iter().find_map(|attempt| {
        let g = brent(n, attempt * (n / 103))?;
        let (p, q) = (g as u64, (n / g) as u64);
        Some((p.min(q), p.max(q)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_challenges() {
        assert_eq!(factorize(1470626929934143021), Some((1206429347, 1218991343)));
        assert_eq!(factorize(2363612107535801713), Some((1518968219, 1556064227)));
    }

    #[test]
    fn even_and_degenerate_inputs() {
        assert_eq!(factorize(2 * 1_000_003), Some((2, 1_000_003)));
        assert_eq!(factorize(1), None);
    }

    #[test]
    fn prime_has_no_factor() {
        assert_eq!(factorize(1_000_000_007), None);
    }
}
