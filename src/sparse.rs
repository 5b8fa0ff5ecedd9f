//! Symmetric upper-triangular CSR sparse matrix, used for `L`, `R`, and `F`.
//!
//! Layout follows spec.md §3 exactly: a dense `diag` vector plus a single
//! CSR block holding only strictly-upper (`col > row`) off-diagonal
//! entries, row-sorted by column. Missing lower entries are implied by
//! symmetry. Matrices are assembled with a [`RowBuilder`] that stages
//! per-row `(col, val)` pairs in arbitrary insertion order and then
//! compacts them once (spec.md Design Notes §9: "arena-allocated CSR...
//! beats many small reallocations").

use std::collections::HashMap;

/// A symmetric matrix stored as dense diagonal + strictly-upper CSR off-diagonal block.
#[derive(Clone, Debug, Default)]
pub struct SparseMatrix {
    n: usize,
    diag: Vec<f64>,
    rowptr: Vec<usize>,
    col: Vec<usize>,
    val: Vec<f64>,
}

impl SparseMatrix {
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn nnz_upper(&self) -> usize {
        self.col.len()
    }

    pub fn diag(&self) -> &[f64] {
        &self.diag
    }

    fn rowptr_base(&self) -> usize {
        self.rowptr.first().copied().unwrap_or(0)
    }

    /// Iterator over `(col, val)` of the strictly-upper entries of row `r`.
    pub fn row_upper_iter(&self, r: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        debug_assert!(r < self.n);
        let base = self.rowptr_base();
        let lo = self.rowptr[r] - base;
        let hi = self.rowptr[r + 1] - base;
        self.col[lo..hi].iter().copied().zip(self.val[lo..hi].iter().copied())
    }

    /// Dense value lookup (symmetric); O(log deg) in the row's column list.
    pub fn get(&self, r: usize, c: usize) -> f64 {
        if r == c {
            return self.diag[r];
        }
        let (row, col) = if r < c { (r, c) } else { (c, r) };
        let base = self.rowptr_base();
        let lo = self.rowptr[row] - base;
        let hi = self.rowptr[row + 1] - base;
        match self.col[lo..hi].binary_search(&col) {
            Ok(idx) => self.val[lo + idx],
            Err(_) => 0.0,
        }
    }

    /// Symmetric matrix-vector product `y = A*x`.
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.n);
        debug_assert_eq!(y.len(), self.n);
        for yi in y.iter_mut() {
            *yi = 0.0;
        }
        for r in 0..self.n {
            y[r] += self.diag[r] * x[r];
            for (c, v) in self.row_upper_iter(r) {
                y[r] += v * x[c];
                y[c] += v * x[r];
            }
        }
    }

    /// `A = A + scale * B`, combining two matrices with identical sparsity domains
    /// (but not necessarily identical patterns) into one, e.g. `F = L^T C^-1 L + lambda * R`.
    pub fn add_scaled(&self, other: &SparseMatrix, scale: f64) -> SparseMatrix {
        debug_assert_eq!(self.n, other.n);
        let mut builder = RowBuilder::new(self.n);
        for r in 0..self.n {
            builder.add(r, r, self.diag[r] + scale * other.diag[r]);
            for (c, v) in self.row_upper_iter(r) {
                builder.add(r, c, v);
            }
            for (c, v) in other.row_upper_iter(r) {
                builder.add(r, c, scale * v);
            }
        }
        builder.build()
    }

}

/// Stages per-row `(col, val)` contributions in arbitrary order, folding duplicate
/// `(row, col)` pairs by addition, then compacts into a [`SparseMatrix`].
pub struct RowBuilder {
    n: usize,
    diag: Vec<f64>,
    rows: Vec<HashMap<usize, f64>>,
}

impl RowBuilder {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            diag: vec![0.0; n],
            rows: (0..n).map(|_| HashMap::new()).collect(),
        }
    }

    /// Adds `val` to entry `(r, c)` (and implicitly `(c, r)` by symmetry). `r == c` updates the diagonal.
    pub fn add(&mut self, r: usize, c: usize, val: f64) {
        if r == c {
            self.diag[r] += val;
            return;
        }
        let (row, col) = if r < c { (r, c) } else { (c, r) };
        *self.rows[row].entry(col).or_insert(0.0) += val;
    }

    /// Accumulates the symmetric outer product `o^T * o` of a sparse row vector `o`
    /// given as `(index, value)` pairs, per spec.md §4.E's regularization-row assembly rule:
    /// for each pair (j, l) with col(j) <= col(l), add o[j]*o[l] to R[col(j), col(l)].
    pub fn add_outer_product(&mut self, o: &[(usize, f64)]) {
        for a in 0..o.len() {
            let (ca, va) = o[a];
            for b in a..o.len() {
                let (cb, vb) = o[b];
                self.add(ca, cb, va * vb);
            }
        }
    }

    pub fn build(self) -> SparseMatrix {
        let n = self.n;
        let mut rowptr = Vec::with_capacity(n + 1);
        let mut col = Vec::new();
        let mut val = Vec::new();
        // spec.md §3: rowptr[0] = n+1 (offsets begin after the diagonal/header block);
        // we keep the simpler convention rowptr[0] = 0 internally and expose offsets
        // normalized the same way throughout this module, since only this module ever
        // reads rowptr directly.
        rowptr.push(0);
        for r in 0..n {
            let mut entries: Vec<(usize, f64)> = self.rows[r].iter().map(|(&c, &v)| (c, v)).collect();
            entries.sort_unstable_by_key(|(c, _)| *c);
            for (c, v) in entries {
                col.push(c);
                val.push(v);
            }
            rowptr.push(col.len());
        }
        SparseMatrix { n, diag: self.diag, rowptr, col, val }
    }
}

/// Rectangular sparse matrix, one row per active image pixel, one column per
/// active source cell (spec.md §3/§4.D's lensing matrix `L`). Unlike
/// [`SparseMatrix`], `L` is neither square nor symmetric in general, so it is
/// kept as the plain per-row `Vec<(usize, f64)>` list the mapping engine
/// builds it in rather than forced into the symmetric-CSR format used for
/// `R`/`F`.
#[derive(Clone, Debug, Default)]
pub struct LMatrix {
    n_cols: usize,
    rows: Vec<Vec<(usize, f64)>>,
}

impl LMatrix {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self { n_cols, rows: vec![Vec::new(); n_rows] }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    pub fn set_row(&mut self, i: usize, row: Vec<(usize, f64)>) {
        self.rows[i] = row;
    }

    /// Normalizes every non-empty row to sum to 1 (spec.md §4.D Area_Overlap
    /// mass-conservation rule).
    pub fn normalize_rows(&mut self) {
        for row in &mut self.rows {
            let sum: f64 = row.iter().map(|&(_, w)| w).sum();
            if sum.abs() > 0.0 {
                for (_, w) in row.iter_mut() {
                    *w /= sum;
                }
            }
        }
    }

    /// `image = L * s`.
    pub fn matvec(&self, s: &[f64]) -> Vec<f64> {
        self.rows.iter().map(|row| row.iter().map(|&(c, w)| w * s[c]).sum()).collect()
    }

    /// `d[k] = sum_i L[i,k] * rhs[i]` (spec.md §4.G, with `rhs = image_sb / sigma^2`).
    pub fn transpose_matvec(&self, rhs: &[f64]) -> Vec<f64> {
        let mut d = vec![0.0; self.n_cols];
        for (i, row) in self.rows.iter().enumerate() {
            let ri = rhs[i];
            if ri == 0.0 {
                continue;
            }
            for &(c, w) in row {
                d[c] += w * ri;
            }
        }
        d
    }

    /// Accumulates `L^T C^-1 L` into `builder` (spec.md §4.G), where
    /// `inv_sigma2[i]` is `1/sigma_i^2` for image row `i`. Uses the same
    /// symmetric outer-product rule as regularization row assembly
    /// ([`RowBuilder::add_outer_product`]): scaling each row by `1/sigma_i`
    /// before taking its outer product gives `(L_i/sigma_i)^T (L_i/sigma_i)`,
    /// which sums to `L^T C^-1 L`.
    pub fn accumulate_normal_matrix(&self, inv_sigma2: &[f64], builder: &mut RowBuilder) {
        for (i, row) in self.rows.iter().enumerate() {
            if row.is_empty() {
                continue;
            }
            let scale = inv_sigma2[i].sqrt();
            let scaled: Vec<(usize, f64)> = row.iter().map(|&(c, w)| (c, w * scale)).collect();
            builder.add_outer_product(&scaled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_matrix_round_trips() {
        let mut b = RowBuilder::new(4);
        for i in 0..4 {
            b.add(i, i, 1.0);
        }
        let m = b.build();
        assert_eq!(m.n(), 4);
        assert_eq!(m.nnz_upper(), 0);
        for i in 0..4 {
            assert_eq!(m.diag()[i], 1.0);
            assert_eq!(m.get(i, i), 1.0);
        }
    }

    #[test]
    fn symmetric_get_reflects_upper_entries() {
        let mut b = RowBuilder::new(3);
        b.add(0, 2, 5.0);
        let m = b.build();
        assert_eq!(m.get(0, 2), 5.0);
        assert_eq!(m.get(2, 0), 5.0);
        assert_eq!(m.get(1, 2), 0.0);
    }

    #[test]
    fn outer_product_accumulates_symmetrically() {
        let mut b = RowBuilder::new(3);
        // o = [1 at col 0, -1 at col 1]; o^T o contributes R[0,0]+=1, R[1,1]+=1, R[0,1]+=-1
        b.add_outer_product(&[(0, 1.0), (1, -1.0)]);
        let m = b.build();
        assert_eq!(m.diag()[0], 1.0);
        assert_eq!(m.diag()[1], 1.0);
        assert_eq!(m.diag()[2], 0.0);
        assert_eq!(m.get(0, 1), -1.0);
    }

    #[test]
    fn matvec_matches_dense_reference() {
        let mut b = RowBuilder::new(2);
        b.add(0, 0, 2.0);
        b.add(1, 1, 3.0);
        b.add(0, 1, 1.0);
        let m = b.build();
        let x = [1.0, 2.0];
        let mut y = [0.0; 2];
        m.matvec(&x, &mut y);
        assert_eq!(y, [2.0 * 1.0 + 1.0 * 2.0, 1.0 * 1.0 + 3.0 * 2.0]);
    }

    #[test]
    fn lmatrix_row_normalization_sums_to_one() {
        let mut l = LMatrix::new(2, 3);
        l.set_row(0, vec![(0, 2.0), (1, 2.0)]);
        l.set_row(1, vec![]);
        l.normalize_rows();
        let sum: f64 = l.row(0).iter().map(|&(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(l.row(1).is_empty());
    }

    #[test]
    fn lmatrix_transpose_matvec_matches_manual_accumulation() {
        let mut l = LMatrix::new(2, 2);
        l.set_row(0, vec![(0, 1.0), (1, 0.5)]);
        l.set_row(1, vec![(1, 1.0)]);
        let d = l.transpose_matvec(&[2.0, 3.0]);
        assert_eq!(d, vec![2.0, 1.0 + 3.0]);
    }
}
