//! Ring arithmetic for the Ringtail lattice scheme
//!
//! Polynomials live in Z_q[x] / (x^phi + 1) with coefficients kept in
//! centered representation, i.e. in [-(q-1)/2, (q-1)/2].

use digest::{ExtendableOutput, Update, XofReader};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha3::Shake256;
use zeroize::Zeroize;

/// Reduce a value into centered representation mod q
pub fn center(v: i64, q: i64) -> i64 {
    let r = v.rem_euclid(q);
    if r > (q - 1) / 2 {
        r - q
    } else {
        r
    }
}

/// A ring element: phi coefficients mod q
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poly {
    /// Coefficients, constant term first
    pub coeffs: Vec<i64>,
}

impl Poly {
    /// The zero polynomial of dimension phi
    pub fn zero(phi: usize) -> Self {
        Self {
            coeffs: vec![0; phi],
        }
    }

    /// The signed monomial `sign * x^degree`
    pub fn monomial(phi: usize, degree: usize, sign: i64) -> Self {
        let mut p = Self::zero(phi);
        p.coeffs[degree % phi] = sign;
        p
    }

    /// Ring dimension
    pub fn dim(&self) -> usize {
        self.coeffs.len()
    }

    /// Coefficient-wise addition mod q
    pub fn add(&self, other: &Poly, q: i64) -> Poly {
        let coeffs = self
            .coeffs
            .iter()
            .zip(&other.coeffs)
            .map(|(a, b)| center(a + b, q))
            .collect();
        Poly { coeffs }
    }

    /// Coefficient-wise subtraction mod q
    pub fn sub(&self, other: &Poly, q: i64) -> Poly {
        let coeffs = self
            .coeffs
            .iter()
            .zip(&other.coeffs)
            .map(|(a, b)| center(a - b, q))
            .collect();
        Poly { coeffs }
    }

    /// Negacyclic convolution: multiplication mod (x^phi + 1, q)
    pub fn mul(&self, other: &Poly, q: i64) -> Poly {
        let phi = self.coeffs.len();
        let mut acc = vec![0i128; phi];
        for (i, &a) in self.coeffs.iter().enumerate() {
            if a == 0 {
                continue;
            }
            for (j, &b) in other.coeffs.iter().enumerate() {
                let k = i + j;
                let term = a as i128 * b as i128;
                if k < phi {
                    acc[k] += term;
                } else {
                    acc[k - phi] -= term;
                }
            }
        }
        let coeffs = acc
            .into_iter()
            .map(|v| center((v % q as i128) as i64, q))
            .collect();
        Poly { coeffs }
    }

    /// Largest coefficient magnitude
    pub fn inf_norm(&self) -> i64 {
        self.coeffs.iter().map(|c| c.abs()).max().unwrap_or(0)
    }

    /// Number of nonzero coefficients. Scans every coefficient so the
    /// running time does not depend on which ones are nonzero.
    pub fn weight(&self) -> usize {
        let mut w = 0usize;
        for &c in &self.coeffs {
            w += usize::from(c != 0);
        }
        w
    }

    /// Coefficient equality without early exit
    pub fn ct_eq(&self, other: &Poly) -> bool {
        if self.coeffs.len() != other.coeffs.len() {
            return false;
        }
        let mut diff = 0i64;
        for (a, b) in self.coeffs.iter().zip(&other.coeffs) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Keep the rounded high bits, dropping xi low-order bits per
    /// coefficient. The dropped part has magnitude at most 2^(xi-1).
    pub fn compress(&self, xi: u32) -> Poly {
        let coeffs = self
            .coeffs
            .iter()
            .map(|&v| (v + (1i64 << (xi - 1))) >> xi)
            .collect();
        Poly { coeffs }
    }

    /// Inverse of [`Poly::compress`] up to the rounding error
    pub fn decompress(&self, xi: u32, q: i64) -> Poly {
        let coeffs = self.coeffs.iter().map(|&v| center(v << xi, q)).collect();
        Poly { coeffs }
    }

    /// Feed this polynomial's canonical encoding into a hasher
    pub fn digest_into(&self, hasher: &mut blake3::Hasher) {
        for &c in &self.coeffs {
            hasher.update(&c.to_le_bytes());
        }
    }

    /// Sample coefficients uniformly in (-bound, bound)
    pub fn sample_bounded<R: Rng>(rng: &mut R, phi: usize, bound: i64) -> Self {
        let coeffs = (0..phi).map(|_| rng.gen_range(-(bound - 1)..bound)).collect();
        Poly { coeffs }
    }

    /// Expand a uniform ring element from a SHAKE256 stream
    pub fn expand_uniform(seed: &[u8; 32], domain: &[u8], index: u32, phi: usize, q: i64) -> Self {
        let mut xof = Shake256::default();
        xof.update(seed);
        xof.update(domain);
        xof.update(&index.to_le_bytes());
        let mut reader = xof.finalize_xof();

        let bits = 64 - (q as u64).leading_zeros();
        let mask: u64 = (1u64 << bits) - 1;
        let mut coeffs = Vec::with_capacity(phi);
        let mut buf = [0u8; 8];
        while coeffs.len() < phi {
            reader.read(&mut buf);
            let v = u64::from_le_bytes(buf) & mask;
            if (v as i64) < q {
                coeffs.push(center(v as i64, q));
            }
        }
        Poly { coeffs }
    }
}

impl Zeroize for Poly {
    fn zeroize(&mut self) {
        self.coeffs.zeroize();
    }
}

/// A vector of ring elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolyVector {
    pub polys: Vec<Poly>,
}

impl PolyVector {
    pub fn zero(len: usize, phi: usize) -> Self {
        Self {
            polys: (0..len).map(|_| Poly::zero(phi)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.polys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polys.is_empty()
    }

    pub fn add(&self, other: &PolyVector, q: i64) -> PolyVector {
        let polys = self
            .polys
            .iter()
            .zip(&other.polys)
            .map(|(a, b)| a.add(b, q))
            .collect();
        PolyVector { polys }
    }

    pub fn sub(&self, other: &PolyVector, q: i64) -> PolyVector {
        let polys = self
            .polys
            .iter()
            .zip(&other.polys)
            .map(|(a, b)| a.sub(b, q))
            .collect();
        PolyVector { polys }
    }

    /// Multiply every entry by the same ring element
    pub fn mul_poly(&self, c: &Poly, q: i64) -> PolyVector {
        let polys = self.polys.iter().map(|p| p.mul(c, q)).collect();
        PolyVector { polys }
    }

    pub fn inf_norm(&self) -> i64 {
        self.polys.iter().map(Poly::inf_norm).max().unwrap_or(0)
    }

    /// Entry-wise equality without early exit
    pub fn ct_eq(&self, other: &PolyVector) -> bool {
        if self.polys.len() != other.polys.len() {
            return false;
        }
        let mut ok = true;
        for (a, b) in self.polys.iter().zip(&other.polys) {
            ok &= a.ct_eq(b);
        }
        ok
    }

    pub fn digest_into(&self, hasher: &mut blake3::Hasher) {
        for p in &self.polys {
            p.digest_into(hasher);
        }
    }

    pub fn sample_bounded<R: Rng>(rng: &mut R, len: usize, phi: usize, bound: i64) -> Self {
        Self {
            polys: (0..len)
                .map(|_| Poly::sample_bounded(rng, phi, bound))
                .collect(),
        }
    }
}

impl Zeroize for PolyVector {
    fn zeroize(&mut self) {
        for p in &mut self.polys {
            p.zeroize();
        }
    }
}

/// A row-major matrix of ring elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolyMatrix {
    pub rows: usize,
    pub cols: usize,
    entries: Vec<Poly>,
}

impl PolyMatrix {
    pub fn zero(rows: usize, cols: usize, phi: usize) -> Self {
        Self {
            rows,
            cols,
            entries: (0..rows * cols).map(|_| Poly::zero(phi)).collect(),
        }
    }

    pub fn at(&self, row: usize, col: usize) -> &Poly {
        &self.entries[row * self.cols + col]
    }

    pub fn at_mut(&mut self, row: usize, col: usize) -> &mut Poly {
        &mut self.entries[row * self.cols + col]
    }

    /// Matrix-vector product: (rows x cols) * (cols) -> (rows)
    pub fn mul_vector(&self, v: &PolyVector, q: i64) -> PolyVector {
        debug_assert_eq!(self.cols, v.len());
        let phi = self.entries[0].dim();
        let mut out = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let mut acc = Poly::zero(phi);
            for c in 0..self.cols {
                acc = acc.add(&self.at(r, c).mul(&v.polys[c], q), q);
            }
            out.push(acc);
        }
        PolyVector { polys: out }
    }

    /// Matrix-matrix product: (rows x cols) * (cols x k) -> (rows x k)
    pub fn mul_matrix(&self, other: &PolyMatrix, q: i64) -> PolyMatrix {
        debug_assert_eq!(self.cols, other.rows);
        let phi = self.entries[0].dim();
        let mut out = PolyMatrix::zero(self.rows, other.cols, phi);
        for r in 0..self.rows {
            for c in 0..other.cols {
                let mut acc = Poly::zero(phi);
                for k in 0..self.cols {
                    acc = acc.add(&self.at(r, k).mul(other.at(k, c), q), q);
                }
                *out.at_mut(r, c) = acc;
            }
        }
        out
    }

    /// Fold the columns with a combining vector of length `cols`:
    /// out[r] = sum_c entry[r][c] * g[c]
    pub fn fold(&self, g: &[Poly], q: i64) -> PolyVector {
        debug_assert_eq!(self.cols, g.len());
        let phi = self.entries[0].dim();
        let mut out = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let mut acc = Poly::zero(phi);
            for c in 0..self.cols {
                acc = acc.add(&self.at(r, c).mul(&g[c], q), q);
            }
            out.push(acc);
        }
        PolyVector { polys: out }
    }

    /// Apply [`Poly::compress`] entry-wise
    pub fn compress(&self, xi: u32) -> PolyMatrix {
        PolyMatrix {
            rows: self.rows,
            cols: self.cols,
            entries: self.entries.iter().map(|p| p.compress(xi)).collect(),
        }
    }

    /// Apply [`Poly::decompress`] entry-wise
    pub fn decompress(&self, xi: u32, q: i64) -> PolyMatrix {
        PolyMatrix {
            rows: self.rows,
            cols: self.cols,
            entries: self.entries.iter().map(|p| p.decompress(xi, q)).collect(),
        }
    }

    pub fn digest_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.rows as u32).to_le_bytes());
        hasher.update(&(self.cols as u32).to_le_bytes());
        for p in &self.entries {
            p.digest_into(hasher);
        }
    }

    /// Expand a uniform matrix from a public seed
    pub fn expand_uniform(
        seed: &[u8; 32],
        domain: &[u8],
        rows: usize,
        cols: usize,
        phi: usize,
        q: i64,
    ) -> Self {
        let entries = (0..rows * cols)
            .map(|i| Poly::expand_uniform(seed, domain, i as u32, phi, q))
            .collect();
        Self {
            rows,
            cols,
            entries,
        }
    }

    pub fn sample_bounded<R: Rng>(
        rng: &mut R,
        rows: usize,
        cols: usize,
        phi: usize,
        bound: i64,
    ) -> Self {
        Self {
            rows,
            cols,
            entries: (0..rows * cols)
                .map(|_| Poly::sample_bounded(rng, phi, bound))
                .collect(),
        }
    }
}

impl Zeroize for PolyMatrix {
    fn zeroize(&mut self) {
        for p in &mut self.entries {
            p.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    const Q: i64 = 8_380_417;

    #[test]
    fn centering() {
        assert_eq!(center(0, Q), 0);
        assert_eq!(center(Q, Q), 0);
        assert_eq!(center(Q - 1, Q), -1);
        assert_eq!(center(-1, Q), -1);
        assert_eq!(center((Q - 1) / 2, Q), (Q - 1) / 2);
        assert_eq!(center((Q + 1) / 2, Q), -(Q - 1) / 2);
    }

    #[test]
    fn negacyclic_wraparound() {
        // x^(phi-1) * x = -1 in Z_q[x]/(x^phi + 1)
        let phi = 8;
        let a = Poly::monomial(phi, phi - 1, 1);
        let b = Poly::monomial(phi, 1, 1);
        let c = a.mul(&b, Q);
        assert_eq!(c.coeffs[0], -1);
        assert!(c.coeffs[1..].iter().all(|&v| v == 0));
    }

    #[test]
    fn monomial_mul_preserves_norm() {
        let mut rng = ChaCha20Rng::from_seed([7u8; 32]);
        let p = Poly::sample_bounded(&mut rng, 16, 1000);
        let g = Poly::monomial(16, 5, -1);
        assert_eq!(p.mul(&g, Q).inf_norm(), p.inf_norm());
    }

    #[test]
    fn mul_distributes_over_add() {
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let a = Poly::sample_bounded(&mut rng, 16, 5000);
        let b = Poly::sample_bounded(&mut rng, 16, 5000);
        let c = Poly::sample_bounded(&mut rng, 16, 5000);
        let lhs = a.add(&b, Q).mul(&c, Q);
        let rhs = a.mul(&c, Q).add(&b.mul(&c, Q), Q);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn rounding_error_is_bounded() {
        let mut rng = ChaCha20Rng::from_seed([2u8; 32]);
        let xi = 9u32;
        let p = Poly::sample_bounded(&mut rng, 64, (Q - 1) / 2);
        let err = p.sub(&p.compress(xi).decompress(xi, Q), Q);
        assert!(err.inf_norm() <= 1 << (xi - 1));
    }

    #[test]
    fn uniform_expansion_is_deterministic() {
        let seed = [9u8; 32];
        let a = Poly::expand_uniform(&seed, b"A", 3, 32, Q);
        let b = Poly::expand_uniform(&seed, b"A", 3, 32, Q);
        let c = Poly::expand_uniform(&seed, b"A", 4, 32, Q);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.inf_norm() <= (Q - 1) / 2);
    }

    #[test]
    fn matrix_vector_linear() {
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let mat = PolyMatrix::sample_bounded(&mut rng, 3, 2, 16, 3000);
        let u = PolyVector::sample_bounded(&mut rng, 2, 16, 3000);
        let v = PolyVector::sample_bounded(&mut rng, 2, 16, 3000);
        let lhs = mat.mul_vector(&u.add(&v, Q), Q);
        let rhs = mat.mul_vector(&u, Q).add(&mat.mul_vector(&v, Q), Q);
        assert!(lhs.ct_eq(&rhs));
    }

    #[test]
    fn fold_matches_mul_matrix() {
        let mut rng = ChaCha20Rng::from_seed([4u8; 32]);
        let mat = PolyMatrix::sample_bounded(&mut rng, 2, 3, 16, 3000);
        let g = vec![
            Poly::monomial(16, 0, 1),
            Poly::monomial(16, 2, -1),
            Poly::monomial(16, 7, 1),
        ];
        let folded = mat.fold(&g, Q);
        for r in 0..2 {
            let mut acc = Poly::zero(16);
            for c in 0..3 {
                acc = acc.add(&mat.at(r, c).mul(&g[c], Q), Q);
            }
            assert_eq!(folded.polys[r], acc);
        }
    }
}
