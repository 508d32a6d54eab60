//! PQ factorisation
//!
//! The server challenge is a 64-bit product of two primes. Splitting it uses
//! trial division for small factors, then Pollard-Brent rho with 128-bit
//! modular multiplication. Both factors are checked with a deterministic
//! Miller-Rabin before they are accepted.

/// Witnesses that make Miller-Rabin deterministic for every `u64`.
const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

const TRIAL_DIVISION_LIMIT: u64 = 1 << 12;

/// Upper bound on the rho cycle length before a seed is abandoned.
const MAX_CYCLE: u64 = 1 << 24;

/// Split `pq` into `(p, q)` with `p <= q`, both prime.
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    if pq < 4 || is_prime(pq) {
        return None;
    }

    let divisor = small_factor(pq).or_else(|| {
        (1..64u64).find_map(|c| pollard_brent(pq, c, 2 + c * 7 % pq))
    })?;

    let (p, q) = {
        let other = pq / divisor;
        (divisor.min(other), divisor.max(other))
    };
    (is_prime(p) && is_prime(q)).then_some((p, q))
}

fn small_factor(n: u64) -> Option<u64> {
    if n % 2 == 0 {
        return Some(2);
    }
    let mut d = 3;
    while d <= TRIAL_DIVISION_LIMIT && d * d <= n {
        if n % d == 0 {
            return Some(d);
        }
        d += 2;
    }
    None
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1 % m;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Deterministic primality test for 64-bit integers.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for &w in &WITNESSES {
        if n % w == 0 {
            return n == w;
        }
    }

    let s = (n - 1).trailing_zeros();
    let d = (n - 1) >> s;
    'witness: for &a in &WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// One Pollard-Brent run with polynomial `x^2 + c`. Returns a non-trivial
/// divisor of `n`, or `None` if this seed cycles without finding one.
fn pollard_brent(n: u64, c: u64, seed: u64) -> Option<u64> {
    const BATCH: u64 = 128;

    let f = |x: u64| ((mul_mod(x, x, n) as u128 + c as u128) % n as u128) as u64;

    let mut y = seed % n;
    let mut r = 1u64;
    let mut q = 1u64;
    let mut g = 1u64;
    let mut x = y;
    let mut ys = y;

    while g == 1 {
        x = y;
        for _ in 0..r {
            y = f(y);
        }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..BATCH.min(r - k) {
                y = f(y);
                q = mul_mod(q, x.abs_diff(y), n);
            }
            g = gcd(q, n);
            k += BATCH;
        }
        r *= 2;
        if r > MAX_CYCLE {
            return None;
        }
    }

    if g == n {
        // Batch overshot; step one at a time from the last checkpoint.
        loop {
            ys = f(ys);
            g = gcd(x.abs_diff(ys), n);
            if g > 1 {
                break;
            }
        }
    }

    (g != n).then_some(g)
}
