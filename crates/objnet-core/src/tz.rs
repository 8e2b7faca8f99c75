//! Homomorphic Tillich–Zémor hashing.
//!
//! A digest is a 2×2 matrix over GF(2^127) (modulus x^127 + x^63 + 1). Every
//! input bit selects one of two generator matrices and the digest is their
//! product in input order, so the digest of `a ++ b` is the matrix product
//! of the digests of `a` and `b`. That is what lets a running digest be
//! built chunk by chunk and compared with a digest the remote node computes
//! over a whole range.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ObjnetError, Result};

pub const DIGEST_SIZE: usize = 64;

const ELEMENT_MASK: u128 = (1u128 << 127) - 1;
/// x^127 reduces to x^63 + 1.
const REDUCTION: u128 = (1u128 << 63) | 1;

/// Element of GF(2^127), kept reduced below 2^127.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Gf127(u128);

impl Gf127 {
    const ZERO: Gf127 = Gf127(0);
    const ONE: Gf127 = Gf127(1);

    fn mul_x(self) -> Gf127 {
        let carry = self.0 >> 126 & 1;
        let shifted = (self.0 << 1) & ELEMENT_MASK;
        if carry == 1 {
            Gf127(shifted ^ REDUCTION)
        } else {
            Gf127(shifted)
        }
    }

    fn add(self, other: Gf127) -> Gf127 {
        Gf127(self.0 ^ other.0)
    }

    fn mul(self, other: Gf127) -> Gf127 {
        let mut acc = Gf127::ZERO;
        for bit in (0..127).rev() {
            acc = acc.mul_x();
            if other.0 >> bit & 1 == 1 {
                acc = acc.add(self);
            }
        }
        acc
    }
}

/// Row-major 2×2 matrix `[[a, b], [c, d]]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Matrix([Gf127; 4]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([Gf127::ONE, Gf127::ZERO, Gf127::ZERO, Gf127::ONE]);

    /// Right-multiply by the generator for one input bit.
    ///
    /// A = [[x, 1], [1, 0]], B = [[x, x+1], [1, 1]].
    fn absorb_bit(&mut self, bit: bool) {
        let [a, b, c, d] = self.0;
        let ax = a.mul_x();
        let cx = c.mul_x();
        self.0 = if bit {
            [ax.add(b), ax.add(a).add(b), cx.add(d), cx.add(c).add(d)]
        } else {
            [ax.add(b), a, cx.add(d), c]
        };
    }

    fn absorb(&mut self, data: &[u8]) {
        for byte in data {
            for shift in (0..8).rev() {
                self.absorb_bit(byte >> shift & 1 == 1);
            }
        }
    }

    fn mul(&self, rhs: &Matrix) -> Matrix {
        let [a, b, c, d] = self.0;
        let [e, f, g, h] = rhs.0;
        Matrix([
            a.mul(e).add(b.mul(g)),
            a.mul(f).add(b.mul(h)),
            c.mul(e).add(d.mul(g)),
            c.mul(f).add(d.mul(h)),
        ])
    }

    fn to_digest(self) -> Digest {
        let mut out = [0u8; DIGEST_SIZE];
        for (slot, element) in out.chunks_exact_mut(16).zip(self.0.iter()) {
            slot.copy_from_slice(&element.0.to_be_bytes());
        }
        Digest(out)
    }

    fn from_digest(digest: &Digest) -> Result<Matrix> {
        let mut elements = [Gf127::ZERO; 4];
        for (element, slot) in elements.iter_mut().zip(digest.0.chunks_exact(16)) {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(slot);
            let value = u128::from_be_bytes(raw);
            if value > ELEMENT_MASK {
                return Err(ObjnetError::Hash("digest element out of field range"));
            }
            *element = Gf127(value);
        }
        Ok(Matrix(elements))
    }
}

/// 64-byte homomorphic digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(#[serde(with = "crate::serde_hex")] [u8; DIGEST_SIZE]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for Digest {
    type Err = ObjnetError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| ObjnetError::format("digest", e))?;
        let arr: [u8; DIGEST_SIZE] = bytes
            .try_into()
            .map_err(|_| ObjnetError::format("digest", "expected 64 bytes"))?;
        Ok(Digest(arr))
    }
}

/// Digest of `data`.
pub fn digest(data: &[u8]) -> Digest {
    let mut m = Matrix::IDENTITY;
    m.absorb(data);
    m.to_digest()
}

/// Combine digests of adjacent ranges, in order, into the digest of the
/// concatenated range.
pub fn concat(digests: &[Digest]) -> Result<Digest> {
    let (first, rest) = digests
        .split_first()
        .ok_or(ObjnetError::Hash("cannot concatenate an empty digest list"))?;
    let mut acc = Matrix::from_digest(first)?;
    for d in rest {
        acc = acc.mul(&Matrix::from_digest(d)?);
    }
    Ok(acc.to_digest())
}

/// XOR `data` with `salt` repeated cyclically from the first byte.
pub fn salt_xor(data: &[u8], salt: &[u8]) -> Vec<u8> {
    if salt.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(salt.iter().cycle())
        .map(|(b, s)| b ^ s)
        .collect()
}

/// Digest of a range as a node computes it for a range-hash request.
pub fn salted_digest(data: &[u8], salt: &[u8]) -> Digest {
    if salt.is_empty() {
        digest(data)
    } else {
        digest(&salt_xor(data, salt))
    }
}

/// Running digest over a byte stream, owned by exactly one transfer.
#[derive(Clone, Debug)]
pub struct Accumulator {
    state: Matrix,
    absorbed: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            state: Matrix::IDENTITY,
            absorbed: 0,
        }
    }

    pub fn absorb(&mut self, bytes: &[u8]) {
        self.state.absorb(bytes);
        self.absorbed += bytes.len() as u64;
    }

    /// Number of bytes absorbed so far.
    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }

    pub fn finalize(self) -> Digest {
        self.state.to_digest()
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}
