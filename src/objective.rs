//! Residual blocks and their analytic Jacobian.
//!
//! The state the solver sees is the reduced vector `x = [y ; u]` (reduced
//! potential, current field).  `UExt` lifts it to `[X ; u]` with `X = U·y`.
//! Blocks, in this fixed order:
//!
//!   1. integration   wI · (u − L·G2·X)
//!   2. closeness     wC · (u − u₀)
//!   3. constraints   wK · (X[fixed] − values)
//!   4. barrier       wB · b(imag(u))            (local injectivity only)
//!
//! Every block Jacobian is its derivative in the lifted basis times `UExt`.
//!
//! A flipped or degenerate branch pair (imag ≤ 0) has barrier value and
//! derivative `+∞`.  Its Jacobian row is `+∞` times the partials of imag, so
//! stored entries whose partial is zero become NaN (always the case for a
//! branch paired with itself, N = 1).  Solvers should treat a non-finite
//! residual as a rejected step rather than read that row.

use crate::barrier::{BarrierEvaluation, BarrierLayout};
use crate::poisson::diagonal;
use crate::types::{spmv, vstack, Evaluation, SeamlessError, Weights};
use sprs::{CsMat, TriMat};

/// Read-only operators shared by every evaluation.
#[derive(Debug, Clone)]
pub struct ObjectiveOperators {
    /// G2 = projector · G, 2N|F| × P.
    pub g2: CsMat<f64>,
    /// `[[U, 0], [0, I]]`, (P + 2N|F|) × (P_red + 2N|F|).
    pub extended: CsMat<f64>,
    pub param_length: f64,
    /// Reduced input field u₀ (2N|F|).
    pub reduced_field: Vec<f64>,
    pub fixed_indices: Vec<usize>,
    pub fixed_values: Vec<f64>,
    pub barrier: BarrierLayout,
    pub weights: Weights,
    pub barrier_half_width: f64,
    pub local_injectivity: bool,
}

/// Block-diagonal lift `[[U, 0], [0, I_field]]`.
pub fn extended_embedding(embedding: &CsMat<f64>, field_size: usize) -> CsMat<f64> {
    let (p, p_red) = embedding.shape();
    let mut tri = TriMat::with_capacity((p + field_size, p_red + field_size), embedding.nnz() + field_size);
    for (&v, (r, c)) in embedding.iter() {
        tri.add_triplet(r, c, v);
    }
    for k in 0..field_size {
        tri.add_triplet(p + k, p_red + k, 1.0);
    }
    tri.to_csr()
}

fn scaled(a: CsMat<f64>, w: f64) -> CsMat<f64> {
    a.map(|&v| v * w)
}

impl ObjectiveOperators {
    pub fn potential_size(&self) -> usize {
        self.g2.cols()
    }

    pub fn field_size(&self) -> usize {
        self.reduced_field.len()
    }

    /// Length of the reduced state vector.
    pub fn x_size(&self) -> usize {
        self.extended.cols()
    }

    pub fn residual_size(&self) -> usize {
        let base = 2 * self.field_size() + self.fixed_indices.len();
        if self.local_injectivity {
            base + self.barrier.num_terms()
        } else {
            base
        }
    }

    // ─────────────────────────────────────────────────────────
    //  Block derivatives in the lifted basis
    // ─────────────────────────────────────────────────────────

    /// d(u − L·G2·X) / d[X ; u] = [−L·G2 | I].
    pub fn integration_derivative(&self) -> CsMat<f64> {
        let p = self.potential_size();
        let fs = self.field_size();
        let mut tri = TriMat::with_capacity((fs, p + fs), self.g2.nnz() + fs);
        for (&v, (r, c)) in self.g2.iter() {
            tri.add_triplet(r, c, -self.param_length * v);
        }
        for i in 0..fs {
            tri.add_triplet(i, p + i, 1.0);
        }
        tri.to_csr()
    }

    /// d(u − u₀) / d[X ; u] = [0 | I].
    pub fn close_derivative(&self) -> CsMat<f64> {
        let p = self.potential_size();
        let fs = self.field_size();
        let mut tri = TriMat::with_capacity((fs, p + fs), fs);
        for i in 0..fs {
            tri.add_triplet(i, p + i, 1.0);
        }
        tri.to_csr()
    }

    /// Row `i` selects `X[fixed_i]`.
    pub fn constraint_derivative(&self) -> CsMat<f64> {
        let full = self.extended.rows();
        let mut tri = TriMat::with_capacity((self.fixed_indices.len(), full), self.fixed_indices.len());
        for (i, &idx) in self.fixed_indices.iter().enumerate() {
            tri.add_triplet(i, idx, 1.0);
        }
        tri.to_csr()
    }

    // ─────────────────────────────────────────────────────────
    //  Evaluation
    // ─────────────────────────────────────────────────────────

    /// Residual at the reduced state `x` and, when requested, its Jacobian.
    pub fn evaluate(&self, x: &[f64], compute_jacobian: bool) -> Result<Evaluation, SeamlessError> {
        if x.len() != self.x_size() {
            return Err(SeamlessError::Shape(format!(
                "state has {} entries, expected {}",
                x.len(),
                self.x_size()
            )));
        }

        let w = &self.weights;
        let p = self.potential_size();
        let lifted = spmv(&self.extended, x);
        let (potential, field) = lifted.split_at(p);

        let gx = spmv(&self.g2, potential);
        let integration: Vec<f64> = field
            .iter()
            .zip(&gx)
            .map(|(&u, &g)| u - self.param_length * g)
            .collect();
        let integrability = integration.iter().fold(0.0_f64, |m, v| m.max(v.abs()));

        let mut residual = Vec::with_capacity(self.residual_size());
        residual.extend(integration.iter().map(|v| v * w.integration));
        residual.extend(
            field
                .iter()
                .zip(&self.reduced_field)
                .map(|(&u, &u0)| (u - u0) * w.close),
        );
        residual.extend(
            self.fixed_indices
                .iter()
                .zip(&self.fixed_values)
                .map(|(&i, &v)| (potential[i] - v) * w.constraint),
        );

        let barrier = self
            .local_injectivity
            .then(|| self.barrier.evaluate(field, self.barrier_half_width, compute_jacobian));
        if let Some(b) = &barrier {
            residual.extend(b.values.iter().map(|v| v * w.barrier));
        }

        if !compute_jacobian {
            return Ok(Evaluation {
                residual,
                jacobian: None,
                integrability,
            });
        }

        let g_integration = scaled(&self.integration_derivative() * &self.extended, w.integration);
        let g_close = scaled(&self.close_derivative() * &self.extended, w.close);
        let g_const = scaled(&self.constraint_derivative() * &self.extended, w.constraint);

        let barrier_terms = barrier.and_then(|b| {
            let BarrierEvaluation { derivatives, imag_gradient, .. } = b;
            imag_gradient.map(|g| (derivatives, g))
        });

        let jacobian = match barrier_terms {
            Some((derivatives, imag_gradient)) => {
                // imag depends on the field exactly as the closeness block does,
                // so its weighted Jacobian is reused here.
                let g_barrier = scaled(
                    &(&diagonal(&derivatives) * &imag_gradient) * &g_close,
                    w.integration,
                );
                vstack(&[&g_integration, &g_close, &g_const, &g_barrier])
            }
            None => vstack(&[&g_integration, &g_close, &g_const]),
        };

        Ok(Evaluation {
            residual,
            jacobian: Some(jacobian),
            integrability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReferenceArea;
    use ndarray::Array2;

    /// Two potential entries, one face with one branch, no reduction.
    fn tiny(local_injectivity: bool) -> ObjectiveOperators {
        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 0, -1.0);
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(1, 1, 0.5);
        let reduced = Array2::from_shape_vec((1, 2), vec![1.0, 0.5]).unwrap();
        ObjectiveOperators {
            g2: tri.to_csr(),
            extended: extended_embedding(&CsMat::eye(2), 2),
            param_length: 2.0,
            reduced_field: vec![1.0, 0.5],
            fixed_indices: vec![1],
            fixed_values: vec![0.25],
            barrier: BarrierLayout::new(&reduced, 1, ReferenceArea::Unit),
            weights: Weights {
                integration: 3.0,
                close: 2.0,
                constraint: 5.0,
                barrier: 7.0,
            },
            barrier_half_width: 0.5,
            local_injectivity,
        }
    }

    #[test]
    fn residual_blocks_in_order() {
        let ops = tiny(false);
        let x = [0.5, 1.0, 1.5, 0.0];
        let eval = ops.evaluate(&x, false).unwrap();
        // G2·X = [0.5, 0.5];  u − 2·G2·X = [0.5, −1.0]
        let expected = [1.5, -3.0, 1.0, -1.0, 3.75];
        assert_eq!(eval.residual.len(), expected.len());
        for (a, b) in eval.residual.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-14, "{:?}", eval.residual);
        }
        assert!((eval.integrability - 1.0).abs() < 1e-14);
        assert!(eval.jacobian.is_none());
    }

    #[test]
    fn barrier_block_adds_one_row_per_branch() {
        let off = tiny(false);
        let on = tiny(true);
        let x = [0.5, 1.0, 1.5, 0.0];
        let a = off.evaluate(&x, true).unwrap();
        let b = on.evaluate(&x, true).unwrap();
        assert_eq!(b.residual.len(), a.residual.len() + 1);
        assert_eq!(b.jacobian.as_ref().unwrap().rows(), a.jacobian.unwrap().rows() + 1);
        // a single branch paired with itself is degenerate
        assert_eq!(*b.residual.last().unwrap(), f64::INFINITY);
        let jac = b.jacobian.unwrap();
        let last = jac.outer_view(jac.rows() - 1).unwrap();
        assert!(last.nnz() > 0);
        assert!(last.iter().all(|(_, v)| !v.is_finite()), "{last:?}");
        assert!(last.iter().any(|(_, v)| v.is_nan()), "{last:?}");
    }

    #[test]
    fn linear_blocks_have_exact_jacobian() {
        let ops = tiny(false);
        let x = [0.3, -0.2, 0.9, 0.1];
        let eval = ops.evaluate(&x, true).unwrap();
        let jac = eval.jacobian.unwrap().to_dense();
        let h = 1e-6;
        for j in 0..4 {
            let mut xp = x;
            let mut xm = x;
            xp[j] += h;
            xm[j] -= h;
            let rp = ops.evaluate(&xp, false).unwrap().residual;
            let rm = ops.evaluate(&xm, false).unwrap().residual;
            for i in 0..rp.len() {
                let fd = (rp[i] - rm[i]) / (2.0 * h);
                assert!((fd - jac[[i, j]]).abs() < 1e-7, "J[{i},{j}]: fd={fd}, an={}", jac[[i, j]]);
            }
        }
    }

    #[test]
    fn wrong_state_length_is_rejected() {
        let ops = tiny(false);
        assert!(matches!(ops.evaluate(&[0.0; 3], false), Err(SeamlessError::Shape(_))));
    }
}
