//! # Reed-Solomon FEC Codec
//!
//! Systematic Reed-Solomon over GF(2^8), block length `ndata + nparity`
//! bounded by 255. Source symbols travel unmodified; parity symbols are
//! appended after the data positions.
//!
//! The encoder is incremental: source vectors are fed one at a time in
//! ascending segment order and the parity shift register updates in place,
//! so a block's parity can be built as its segments are queued for
//! transmission. Feeding all `ndata` vectors yields the same parity as a
//! one-shot computation over the whole block.
//!
//! The decoder is erasure-only: given the erased positions (which the
//! block's pending state already knows), it rebuilds the missing source
//! vectors from syndromes, the erasure locator polynomial Lambda, and the
//! modified evaluator Omega. No error location is attempted.

use crate::galois::{gexp, ginv, gmult};

/// Upper bound on `ndata + nparity` for the 8-bit symbol field.
pub const MAX_BLOCK_LEN: usize = 255;

// ─── Encoder ────────────────────────────────────────────────────────────────

/// Incremental systematic encoder for a fixed parity count and vector size.
pub struct RsEncoder {
    nparity: usize,
    vector_size: usize,
    /// Generator polynomial coefficients, ascending powers; `nparity + 1`
    /// entries with `gen_poly[nparity] == 1`.
    gen_poly: Vec<u8>,
    scratch: Vec<u8>,
}

impl RsEncoder {
    /// Build an encoder. `nparity` may be zero (encoding is then a no-op).
    pub fn new(nparity: usize, vector_size: usize) -> Self {
        assert!(nparity < 129, "parity count out of range");
        RsEncoder {
            nparity,
            vector_size,
            gen_poly: generator_polynomial(nparity),
            scratch: vec![0u8; vector_size],
        }
    }

    pub fn nparity(&self) -> usize {
        self.nparity
    }

    pub fn vector_size(&self) -> usize {
        self.vector_size
    }

    /// Fold one source vector into the parity shift register.
    ///
    /// `parity` must hold `nparity` vectors of at least `vector_size` bytes,
    /// zero-filled at block start, and source vectors must be fed in
    /// ascending segment order. `data` shorter than `vector_size` is
    /// treated as zero-padded.
    pub fn encode(&mut self, data: &[u8], parity: &mut [Vec<u8>]) {
        let npar = self.nparity;
        if npar == 0 {
            return;
        }
        debug_assert!(parity.len() >= npar);
        let vec_size = self.vector_size;
        self.scratch[..vec_size].copy_from_slice(&parity[0][..vec_size]);
        for i in 0..npar - 1 {
            let coef = self.gen_poly[npar - 1 - i];
            let (head, tail) = parity.split_at_mut(i + 1);
            let current = &mut head[i];
            let next = &tail[0];
            for j in 0..vec_size {
                let d = data.get(j).copied().unwrap_or(0);
                current[j] = next[j] ^ gmult(coef, d ^ self.scratch[j]);
            }
        }
        let coef = self.gen_poly[0];
        let last = &mut parity[npar - 1];
        for j in 0..vec_size {
            let d = data.get(j).copied().unwrap_or(0);
            last[j] = gmult(coef, d ^ self.scratch[j]);
        }
    }
}

/// `g(x) = prod_{n=1..nparity} (x + alpha^n)`, coefficients ascending.
fn generator_polynomial(nparity: usize) -> Vec<u8> {
    let mut poly = vec![0u8; nparity + 1];
    poly[0] = 1;
    for n in 1..=nparity {
        // poly *= (x + alpha^n)
        let root = gexp(n);
        let mut carry = 0u8;
        for coef in poly.iter_mut().take(n + 1) {
            let shifted = carry;
            carry = *coef;
            *coef = gmult(*coef, root) ^ shifted;
        }
    }
    poly
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Erasure decoder for a fixed parity count and vector size.
pub struct RsDecoder {
    nparity: usize,
    vector_size: usize,
    lambda: Vec<u8>,
    syndromes: Vec<Vec<u8>>,
    omegas: Vec<Vec<u8>>,
    scratch: Vec<u8>,
}

impl RsDecoder {
    pub fn new(nparity: usize, vector_size: usize) -> Self {
        assert!(nparity <= 128, "parity count out of range");
        RsDecoder {
            nparity,
            vector_size,
            lambda: vec![0u8; 2 * nparity.max(1)],
            syndromes: vec![vec![0u8; vector_size]; nparity],
            omegas: vec![vec![0u8; vector_size]; nparity],
            scratch: vec![0u8; vector_size],
        }
    }

    pub fn nparity(&self) -> usize {
        self.nparity
    }

    /// Recover erased source vectors in place.
    ///
    /// `vectors` holds the `ndata + nparity` block positions; `None` entries
    /// are treated as zero. `erasure_locs` lists the erased positions in
    /// ascending order with `erasure_locs.len() <= nparity`; erased *data*
    /// positions must carry zero-filled buffers to receive the recovered
    /// bytes (parity erasures need none and are skipped). Returns the
    /// number of erasures processed.
    pub fn decode(
        &mut self,
        vectors: &mut [Option<Vec<u8>>],
        ndata: usize,
        erasure_locs: &[u16],
    ) -> usize {
        let npar = self.nparity;
        let erasure_count = erasure_locs.len();
        debug_assert!(erasure_count > 0 && erasure_count <= npar);
        let nvecs = ndata + npar;
        debug_assert_eq!(vectors.len(), nvecs);
        let vec_size = self.vector_size;

        // (A) Syndrome vectors by Horner accumulation, position 0 first.
        for i in 0..npar {
            let x = gexp(i + 1);
            let syn = &mut self.syndromes[i];
            syn.fill(0);
            for j in 0..nvecs {
                let data: &[u8] = match &vectors[j] {
                    Some(v) => v,
                    None => &self.scratch,
                };
                for n in 0..vec_size {
                    syn[n] = data.get(n).copied().unwrap_or(0) ^ gmult(x, syn[n]);
                }
            }
        }

        // (B) Erasure locator polynomial Lambda.
        let degree = 2 * npar;
        self.lambda.fill(0);
        self.lambda[0] = 1;
        for &loc in erasure_locs {
            let x = gexp(nvecs - 1 - loc as usize);
            for j in (1..degree).rev() {
                self.lambda[j] ^= gmult(x, self.lambda[j - 1]);
            }
        }

        // (C) Modified Omega = (Lambda * S) mod x^nparity.
        for i in 0..npar {
            self.omegas[i].fill(0);
            for j in 0..=i {
                let lk = self.lambda[i - j];
                let syn = &self.syndromes[j];
                let omega = &mut self.omegas[i];
                for n in 0..vec_size {
                    omega[n] ^= gmult(syn[n], lk);
                }
            }
        }

        // (D) Fill data erasures by Forney evaluation; parity erasures are
        // not reconstructed.
        for &loc in erasure_locs {
            let loc = loc as usize;
            if loc >= ndata {
                break;
            }
            let k = nvecs - 1 - loc;
            // Lambda'(alpha^-k): odd powers only.
            let mut denom = 0u8;
            for j in (1..degree).step_by(2) {
                denom ^= gmult(self.lambda[j], gexp((255 - k) * (j - 1) % 255));
            }
            let denom = ginv(denom);
            let evec = vectors[loc]
                .as_mut()
                .expect("erased data position must carry a zero-filled buffer");
            for (j, omega) in self.omegas.iter().enumerate().take(npar) {
                let x = gexp((255 - k) * j % 255);
                for n in 0..vec_size {
                    evec[n] ^= gmult(omega[n], x);
                }
            }
            for byte in evec.iter_mut().take(vec_size) {
                *byte = gmult(*byte, denom);
            }
        }

        erasure_count
    }
}
