//! Diffie-Hellman parameter validation and key agreement.
//!
//! A server-supplied group is only used once all of these hold:
//! - `p` is a 2048-bit safe prime (`p` and `(p - 1) / 2` both prime)
//! - `g` is in `2..=7` and generates the prime-order subgroup of `p`
//! - `g_a` (and our own `g_b`) lie in `(2^1984, p - 2^1984)`

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypto::{to_be_padded, AUTH_KEY_LEN};
use crate::error::AuthError;

/// Required size of the DH prime.
pub const DH_PRIME_BITS: u64 = 2048;

/// Margin kept between group elements and the edges of the group.
const SAFETY_MARGIN_BITS: u64 = DH_PRIME_BITS - 64;

const SMALL_PRIMES: [u32; 24] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
];

fn invalid(reason: impl Into<String>) -> AuthError {
    AuthError::InvalidDhParameters(reason.into())
}

/// Check that `g` generates the quadratic-residue subgroup of `p`.
pub fn check_generator(g: u32, p: &BigUint) -> Result<(), AuthError> {
    let rem = |m: u32| -> u32 {
        let r = p % m;
        r.iter_u32_digits().next().unwrap_or(0)
    };
    let ok = match g {
        2 => rem(8) == 7,
        3 => rem(3) == 2,
        4 => true,
        5 => matches!(rem(5), 1 | 4),
        6 => matches!(rem(24), 19 | 23),
        7 => matches!(rem(7), 3 | 5 | 6),
        _ => return Err(invalid(format!("generator {} out of range", g))),
    };
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("generator {} does not match the prime", g)))
    }
}

/// Miller-Rabin with `rounds` random witnesses.
pub fn is_probable_prime(n: &BigUint, rounds: u32) -> bool {
    for &sp in &SMALL_PRIMES {
        let sp = BigUint::from(sp);
        if *n == sp {
            return true;
        }
        if (n % &sp).is_zero() {
            return false;
        }
    }
    if *n < BigUint::from(2u32) {
        return false;
    }

    let one = BigUint::one();
    let two = BigUint::from(2u32);
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    let mut rng = rand::thread_rng();
    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = &x * &x % n;
            if x == n_minus_one {
                continue 'witness;
            }
            if x == one {
                return false;
            }
        }
        return false;
    }
    true
}

/// Check that `p` is a 2048-bit safe prime.
pub fn check_safe_prime(p: &BigUint, rounds: u32) -> Result<(), AuthError> {
    if p.bits() != DH_PRIME_BITS {
        return Err(invalid(format!("prime has {} bits", p.bits())));
    }
    if !is_probable_prime(p, rounds) {
        return Err(invalid("dh_prime is not prime"));
    }
    let half = (p - 1u32) >> 1u32;
    if !is_probable_prime(&half, rounds) {
        return Err(invalid("(dh_prime - 1) / 2 is not prime"));
    }
    Ok(())
}

/// Check that a public value lies safely inside the group.
pub fn check_group_element(x: &BigUint, p: &BigUint, what: &str) -> Result<(), AuthError> {
    let one = BigUint::one();
    if *x <= one || *x >= p - &one {
        return Err(invalid(format!("{} outside (1, p - 1)", what)));
    }
    let margin = one << SAFETY_MARGIN_BITS;
    if *x < margin || *x > p - &margin {
        return Err(invalid(format!("{} too close to the group bounds", what)));
    }
    Ok(())
}

/// Fresh private exponent for this side of the exchange.
pub fn generate_secret(p: &BigUint) -> BigUint {
    OsRng.gen_biguint_range(&BigUint::from(2u32), &(p - 1u32))
}

/// `g^secret mod p`
pub fn public_value(g: u32, secret: &BigUint, p: &BigUint) -> BigUint {
    BigUint::from(g).modpow(secret, p)
}

/// `peer^secret mod p`, as the fixed-size auth key bytes.
pub fn shared_secret(peer: &BigUint, secret: &BigUint, p: &BigUint) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(to_be_padded(&peer.modpow(secret, p), AUTH_KEY_LEN))
}
