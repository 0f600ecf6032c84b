//! # GF(2^8) Arithmetic
//!
//! Table-driven Galois field math for the Reed-Solomon codec. The field is
//! generated by the primitive polynomial `x^8 + x^4 + x^3 + x^2 + 1`
//! (0x11D), the same field used by the `fec_id = 129` coding scheme.

use once_cell::sync::Lazy;

const PRIMITIVE_POLY: u16 = 0x11D;

struct Tables {
    /// alpha^i for i in 0..512 (doubled so products of logs need no modulo).
    exp: [u8; 512],
    /// log_alpha(x) for x in 1..=255; log[0] is unused.
    log: [u16; 256],
    /// Multiplicative inverse; inv[0] = 0.
    inv: [u8; 256],
}

static TABLES: Lazy<Tables> = Lazy::new(|| {
    let mut exp = [0u8; 512];
    let mut log = [0u16; 256];
    let mut x: u16 = 1;
    for i in 0..255 {
        exp[i] = x as u8;
        log[x as usize] = i as u16;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    let mut inv = [0u8; 256];
    for v in 1..256 {
        inv[v] = exp[(255 - log[v]) as usize];
    }
    Tables { exp, log, inv }
});

/// alpha^x. Valid for `x < 512`.
#[inline]
pub fn gexp(x: usize) -> u8 {
    TABLES.exp[x]
}

/// Field multiplication.
#[inline]
pub fn gmult(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        let t = &*TABLES;
        t.exp[(t.log[a as usize] + t.log[b as usize]) as usize]
    }
}

/// Multiplicative inverse; `ginv(0) == 0`.
#[inline]
pub fn ginv(a: u8) -> u8 {
    TABLES.inv[a as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_table_cycles() {
        assert_eq!(gexp(0), 1);
        assert_eq!(gexp(1), 2);
        assert_eq!(gexp(255), gexp(0));
        assert_eq!(gexp(300), gexp(45));
    }

    #[test]
    fn mult_identity_and_zero() {
        for a in 0..=255u8 {
            assert_eq!(gmult(a, 1), a);
            assert_eq!(gmult(1, a), a);
            assert_eq!(gmult(a, 0), 0);
            assert_eq!(gmult(0, a), 0);
        }
    }

    #[test]
    fn mult_is_commutative_and_associative() {
        for a in [3u8, 29, 117, 200, 255] {
            for b in [7u8, 64, 90, 254] {
                assert_eq!(gmult(a, b), gmult(b, a));
                for c in [2u8, 111] {
                    assert_eq!(gmult(gmult(a, b), c), gmult(a, gmult(b, c)));
                }
            }
        }
    }

    #[test]
    fn inverse_multiplies_to_one() {
        assert_eq!(ginv(0), 0);
        for a in 1..=255u8 {
            assert_eq!(gmult(a, ginv(a)), 1, "a = {a}");
        }
    }

    #[test]
    fn distributes_over_xor() {
        for a in [5u8, 77, 130] {
            for b in [9u8, 211] {
                for c in [33u8, 180] {
                    assert_eq!(gmult(a, b ^ c), gmult(a, b) ^ gmult(a, c));
                }
            }
        }
    }
}
