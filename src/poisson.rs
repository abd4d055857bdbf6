//! Initial potential: a constrained Poisson solve in the reduced space.
//!
//!   1. Normalise the raw field by its mean branch length and fold the
//!      factor into the parameterisation length L.
//!   2. E = Uᵀ Gᵀ M G U,   f = Uᵀ Gᵀ M (raw / L).
//!   3. Border E with the fixed-value rows A = U[fixed, :].  Factorise the
//!      symmetric indefinite system with LDLᵀ after a small relative
//!      perturbation of the primal diagonal.
//!   4. Refine against the unperturbed bordered matrix, so the result is the
//!      exact constrained least-squares potential.  A free additive constant
//!      (nothing fixed) stays at the perturbed solve's choice.
//!   5. Keep the primal part of the solution and lift it with U.

use crate::types::{spmv, Factorization, SeamlessError};
use ndarray::Array2;
use sprs::{CsMat, TriMat};

/// Upper bound on refinement sweeps against the unperturbed system.
const MAX_REFINEMENT_STEPS: usize = 100;

// ─────────────────────────────────────────────────────────────
//  Field normalisation
// ─────────────────────────────────────────────────────────────

/// Normalised raw field plus the resulting parameterisation length.
#[derive(Debug, Clone)]
pub struct FieldScale {
    pub field: Array2<f64>,
    /// Mean length of the raw branch vectors (1.0 for an all-zero field).
    pub mean_norm: f64,
    /// `bbox_diagonal · length_ratio / mean_norm`.
    pub param_length: f64,
}

/// Divide the field (|F| × 3N) by its mean branch length.
pub fn normalize_field(raw: &Array2<f64>, n: usize, bbox_diagonal: f64, length_ratio: f64) -> FieldScale {
    let nf = raw.nrows();
    let mut total = 0.0;
    for f in 0..nf {
        for k in 0..n {
            let sq: f64 = (0..3).map(|d| raw[[f, 3 * k + d]].powi(2)).sum();
            total += sq.sqrt();
        }
    }
    let mut mean_norm = total / (n * nf) as f64;
    if !(mean_norm > 0.0) || !mean_norm.is_finite() {
        mean_norm = 1.0;
    }

    FieldScale {
        field: raw / mean_norm,
        mean_norm,
        param_length: bbox_diagonal * length_ratio / mean_norm,
    }
}

// ─────────────────────────────────────────────────────────────
//  Bordered Poisson system
// ─────────────────────────────────────────────────────────────

/// Inputs of the constrained least-squares solve for the potential.
#[derive(Debug)]
pub struct PoissonProblem<'a> {
    /// G: potential → 3N|F| per-face gradients.
    pub gradient: &'a CsMat<f64>,
    /// U: reduced potential → full potential.
    pub embedding: &'a CsMat<f64>,
    /// Diagonal of M (3N|F| positive entries).
    pub mass: &'a [f64],
    /// Normalised raw field, flattened face-major (3N|F|).
    pub field: &'a [f64],
    pub param_length: f64,
    pub fixed_indices: &'a [usize],
    pub fixed_values: &'a [f64],
    /// Relative perturbation of the primal diagonal.
    pub regularization: f64,
}

/// Assembled KKT matrix and right-hand side.
#[derive(Debug, Clone)]
pub struct BorderedSystem {
    /// Exact bordered matrix `[[E, Aᵀ], [A, 0]]` (CSC).
    pub matrix: CsMat<f64>,
    /// Same with `ε·I` added to the primal block; this one is factorised.
    pub regularized: CsMat<f64>,
    pub rhs: Vec<f64>,
    /// Number of reduced potential unknowns (rows before the multipliers).
    pub primal_size: usize,
}

/// Initial potential in reduced and full coordinates.
#[derive(Debug, Clone)]
pub struct InitialPotential {
    pub reduced: Vec<f64>,
    pub full: Vec<f64>,
}

/// Sparse diagonal matrix with the given entries.
pub fn diagonal(values: &[f64]) -> CsMat<f64> {
    let n = values.len();
    CsMat::new((n, n), (0..=n).collect(), (0..n).collect(), values.to_vec())
}

impl<'a> PoissonProblem<'a> {
    pub fn assemble(&self) -> BorderedSystem {
        let gu = &self.gradient.to_csr() * &self.embedding.to_csr();
        let gu_t: CsMat<f64> = gu.transpose_view().to_csr();
        let mgu = &diagonal(self.mass) * &gu;
        let energy = &gu_t * &mgu;

        let primal_size = self.embedding.cols();
        let num_fixed = self.fixed_indices.len();

        let weighted: Vec<f64> = self
            .field
            .iter()
            .zip(self.mass)
            .map(|(&g, &m)| m * g / self.param_length)
            .collect();
        let mut rhs = spmv(&gu_t, &weighted);
        rhs.extend_from_slice(self.fixed_values);

        let max_diag = energy.diag().data().iter().fold(0.0_f64, |m, &v| m.max(v.abs()));
        let perturbation = if max_diag > 0.0 {
            self.regularization * max_diag
        } else {
            self.regularization
        };

        let size = primal_size + num_fixed;
        let mut tri = TriMat::with_capacity((size, size), energy.nnz() + primal_size + 2 * num_fixed);
        for (&v, (r, c)) in energy.iter() {
            tri.add_triplet(r, c, v);
        }

        // A = U[fixed, :]
        let u = self.embedding.to_csr();
        for (row, &idx) in self.fixed_indices.iter().enumerate() {
            if let Some(u_row) = u.outer_view(idx) {
                for (col, &v) in u_row.iter() {
                    tri.add_triplet(primal_size + row, col, v);
                    tri.add_triplet(col, primal_size + row, v);
                }
            }
        }

        let matrix = tri.to_csc();
        if perturbation > 0.0 {
            for i in 0..primal_size {
                tri.add_triplet(i, i, perturbation);
            }
        }

        BorderedSystem {
            matrix,
            regularized: tri.to_csc(),
            rhs,
            primal_size,
        }
    }

    /// Assemble, factorise and solve.  Factorisation failure is returned as
    /// [`SeamlessError::Linalg`].
    pub fn solve(&self) -> Result<InitialPotential, SeamlessError> {
        let system = self.assemble();
        let factorization = Factorization::new(system.regularized.view(), system.primal_size)?;
        let solution = factorization.solve_refined(&system.matrix, &system.rhs, MAX_REFINEMENT_STEPS);

        if let Some(index) = solution.iter().position(|v| !v.is_finite()) {
            return Err(sprs::errors::LinalgError::SingularMatrix(sprs::errors::SingularMatrixInfo {
                index,
                reason: "non-finite entry in bordered solution",
            })
            .into());
        }

        let reduced = solution[..system.primal_size].to_vec();
        let full = spmv(self.embedding, &reduced);
        Ok(InitialPotential { reduced, full })
    }
}
