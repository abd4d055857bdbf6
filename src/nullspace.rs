//! Reduction of homogeneous linear constraints C·x = 0 to free parameters.
//!
//! Columns of C that no row touches pass through as identity variables.
//! The touched ("participating") columns are gathered into a small dense
//! matrix whose null-space basis is read off its reduced row echelon form.
//! The embedding U then satisfies C·U·y = 0 for every y.

use crate::types::SeamlessError;
use ndarray::Array2;
use sprs::{CsMat, TriMat};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct ConstraintReduction {
    /// P × P_red embedding of the free parameters into the full potential.
    pub embedding: CsMat<f64>,
    /// Columns touched by at least one constraint row, ascending.
    pub participating: Vec<usize>,
    /// Columns no constraint touches, ascending.
    pub passthrough: Vec<usize>,
    /// Row rank of C.
    pub rank: usize,
}

impl ConstraintReduction {
    pub fn full_size(&self) -> usize {
        self.embedding.rows()
    }

    pub fn reduced_size(&self) -> usize {
        self.embedding.cols()
    }

    pub fn nullity(&self) -> usize {
        self.participating.len() - self.rank
    }
}

/// Build the free-parameter embedding for the constraint matrix `c`.
///
/// Fails with [`SeamlessError::EmptyNullSpace`] when the constraints pin
/// every participating column, and with
/// [`SeamlessError::NonFiniteConstraint`] on NaN/∞ coefficients.
pub fn reduce_constraints(c: &CsMat<f64>) -> Result<ConstraintReduction, SeamlessError> {
    let num_cols = c.cols();

    let mut touched = BTreeSet::new();
    for (&v, (row, col)) in c.iter() {
        if !v.is_finite() {
            return Err(SeamlessError::NonFiniteConstraint { row, col });
        }
        touched.insert(col);
    }

    if c.rows() == 0 || touched.is_empty() {
        return Ok(ConstraintReduction {
            embedding: CsMat::eye(num_cols),
            participating: Vec::new(),
            passthrough: (0..num_cols).collect(),
            rank: 0,
        });
    }

    let participating: Vec<usize> = touched.into_iter().collect();
    let mut column_slot = vec![usize::MAX; num_cols];
    for (slot, &col) in participating.iter().enumerate() {
        column_slot[col] = slot;
    }
    let passthrough: Vec<usize> = (0..num_cols).filter(|&j| column_slot[j] == usize::MAX).collect();

    let mut dense = Array2::<f64>::zeros((c.rows(), participating.len()));
    for (&v, (row, col)) in c.iter() {
        dense[[row, column_slot[col]]] += v;
    }

    let (rank, kernel) = null_space(dense);
    if kernel.ncols() == 0 {
        return Err(SeamlessError::EmptyNullSpace {
            participating: participating.len(),
            rank,
        });
    }

    let num_pass = passthrough.len();
    let reduced = num_pass + kernel.ncols();
    let mut tri = TriMat::with_capacity((num_cols, reduced), num_pass + kernel.len());
    for (i, &col) in passthrough.iter().enumerate() {
        tri.add_triplet(col, i, 1.0);
    }
    for ((slot, j), &v) in kernel.indexed_iter() {
        if v != 0.0 {
            tri.add_triplet(participating[slot], num_pass + j, v);
        }
    }

    Ok(ConstraintReduction {
        embedding: tri.to_csr(),
        participating,
        passthrough,
        rank,
    })
}

/// Rank and right null-space basis (p × nullity) of a dense m × p matrix.
///
/// Gauss-Jordan elimination with partial pivoting; entries at or below
/// `ε · max(m, p) · max|a|` count as zero.
pub fn null_space(mut a: Array2<f64>) -> (usize, Array2<f64>) {
    let (m, p) = a.dim();
    let largest = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let tol = f64::EPSILON * m.max(p) as f64 * largest;

    let mut pivot_cols = Vec::with_capacity(m.min(p));
    let mut r = 0;
    for col in 0..p {
        if r == m {
            break;
        }
        let (best, best_abs) = (r..m)
            .map(|i| (i, a[[i, col]].abs()))
            .fold((r, -1.0), |acc, x| if x.1 > acc.1 { x } else { acc });
        if best_abs <= tol {
            for i in r..m {
                a[[i, col]] = 0.0;
            }
            continue;
        }

        if best != r {
            for j in 0..p {
                a.swap([r, j], [best, j]);
            }
        }

        let pivot = a[[r, col]];
        for j in col..p {
            a[[r, j]] /= pivot;
        }
        for i in 0..m {
            if i == r {
                continue;
            }
            let factor = a[[i, col]];
            if factor != 0.0 {
                for j in col..p {
                    a[[i, j]] -= factor * a[[r, j]];
                }
            }
        }

        pivot_cols.push(col);
        r += 1;
    }

    let rank = pivot_cols.len();
    let mut is_pivot = vec![false; p];
    for &c in &pivot_cols {
        is_pivot[c] = true;
    }
    let free_cols: Vec<usize> = (0..p).filter(|&j| !is_pivot[j]).collect();

    let mut kernel = Array2::zeros((p, free_cols.len()));
    for (k, &f) in free_cols.iter().enumerate() {
        kernel[[f, k]] = 1.0;
        for (row, &pc) in pivot_cols.iter().enumerate() {
            kernel[[pc, k]] = -a[[row, f]];
        }
    }

    (rank, kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::spmv;

    fn csr(rows: usize, cols: usize, entries: &[(usize, usize, f64)]) -> CsMat<f64> {
        let mut tri = TriMat::new((rows, cols));
        for &(r, c, v) in entries {
            tri.add_triplet(r, c, v);
        }
        tri.to_csr()
    }

    fn probe(len: usize, seed: f64) -> Vec<f64> {
        (0..len).map(|i| ((i as f64 + 1.0) * seed).sin()).collect()
    }

    fn assert_embedding_feasible(c: &CsMat<f64>, red: &ConstraintReduction) {
        for seed in [0.37, 1.3, 2.9] {
            let y = probe(red.reduced_size(), seed);
            let x = spmv(&red.embedding, &y);
            let cx = spmv(c, &x);
            let worst = cx.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            assert!(worst < 1e-12, "C·U·y = {cx:?}");
        }
    }

    #[test]
    fn no_constraints_is_identity() {
        let c = CsMat::<f64>::zero((0, 5));
        let red = reduce_constraints(&c).unwrap();
        assert_eq!(red.embedding.shape(), (5, 5));
        for (&v, (r, col)) in red.embedding.iter() {
            assert_eq!(r, col);
            assert_eq!(v, 1.0);
        }
        assert_eq!(red.embedding.nnz(), 5);
    }

    #[test]
    fn seam_constraints_are_satisfied_exactly() {
        // x1 - x4 = 0,  x2 + x5 - 2 x6 = 0
        let c = csr(2, 8, &[(0, 1, 1.0), (0, 4, -1.0), (1, 2, 1.0), (1, 5, 1.0), (1, 6, -2.0)]);
        let red = reduce_constraints(&c).unwrap();
        assert_eq!(red.rank, 2);
        assert_eq!(red.participating, vec![1, 2, 4, 5, 6]);
        assert_eq!(red.passthrough, vec![0, 3, 7]);
        assert_eq!(red.reduced_size(), 8 - 2);
        assert_embedding_feasible(&c, &red);
    }

    #[test]
    fn redundant_rows_do_not_inflate_rank() {
        let c = csr(
            3,
            4,
            &[
                (0, 0, 1.0), (0, 1, -1.0),
                (1, 1, 1.0), (1, 2, -1.0),
                (2, 0, 2.0), (2, 2, -2.0), // 2·(row0 + row1)
            ],
        );
        let red = reduce_constraints(&c).unwrap();
        assert_eq!(red.rank, 2);
        assert_eq!(red.nullity(), 1);
        assert_eq!(red.reduced_size(), 4 - 2);
        assert_embedding_feasible(&c, &red);
    }

    #[test]
    fn non_integer_coefficients() {
        let c = csr(2, 5, &[(0, 0, 0.3), (0, 2, 1.7), (0, 3, -0.4), (1, 2, 2.5), (1, 4, 0.9)]);
        let red = reduce_constraints(&c).unwrap();
        assert_eq!(red.reduced_size(), 3);
        assert_embedding_feasible(&c, &red);
    }

    #[test]
    fn fully_pinned_columns_fail() {
        let c = csr(1, 3, &[(0, 1, 1.0)]);
        let err = reduce_constraints(&c).unwrap_err();
        assert!(matches!(err, SeamlessError::EmptyNullSpace { participating: 1, rank: 1 }));
        assert!(err.is_initialization_failure());
    }

    #[test]
    fn non_finite_coefficient_is_rejected() {
        let c = csr(1, 3, &[(0, 0, 1.0), (0, 2, f64::NAN)]);
        assert!(matches!(
            reduce_constraints(&c),
            Err(SeamlessError::NonFiniteConstraint { row: 0, col: 2 })
        ));
    }

    #[test]
    fn null_space_dimension() {
        let a = Array2::from_shape_vec((2, 4), vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]).unwrap();
        let (rank, k) = null_space(a.clone());
        assert_eq!(rank, 1);
        assert_eq!(k.dim(), (4, 3));
        let prod = a.dot(&k);
        assert!(prod.iter().all(|v| v.abs() < 1e-12));
    }
}
