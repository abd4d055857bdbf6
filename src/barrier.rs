//! Local-injectivity barrier on consecutive branch pairs.
//!
//! For face `f`, branch `j` with tangent vectors `c = u_j`, `n = u_{j+1}`
//! (cyclic) the imaginary product is `(c.x·n.y − c.y·n.x) / a_fj`.  With
//! `t = imag / s` the barrier is
//!
//! ```text
//!   b(imag) = 1 / (t³ − 3t² + 3t) − 1        for 0 < imag < s
//!           = +∞                              for imag ≤ 0
//!           = 0                               for imag ≥ s
//! ```
//!
//! so it diverges at degeneracy and is flat past the safety margin.

use crate::types::{ReferenceArea, BARRIER_FLAT_TOLERANCE};
use ndarray::Array2;
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Scalar barrier
// ─────────────────────────────────────────────────────────────

/// Cubic transition `t³ − 3t² + 3t = 1 − (1 − t)³`.
#[inline]
pub fn spline(t: f64) -> f64 {
    t * t * t - 3.0 * t * t + 3.0 * t
}

/// d spline(imag / s) / d imag, with the boundary overrides.
#[inline]
pub fn spline_derivative(imag: f64, s: f64) -> f64 {
    if imag <= 0.0 {
        return f64::INFINITY;
    }
    if imag >= s {
        return 0.0;
    }
    3.0 * (imag * imag / (s * s * s)) - 6.0 * (imag / (s * s)) + 3.0 / s
}

/// Barrier value for an imaginary product.
#[inline]
pub fn barrier_value(imag: f64, s: f64) -> f64 {
    if imag <= 0.0 {
        return f64::INFINITY;
    }
    if imag >= s {
        return 0.0;
    }
    1.0 / spline(imag / s) - 1.0
}

/// d barrier / d imag.  Zero where the barrier is numerically flat,
/// `+∞` where the barrier itself is `+∞`.
#[inline]
pub fn barrier_derivative(imag: f64, s: f64) -> f64 {
    let value = barrier_value(imag, s);
    if value.abs() < BARRIER_FLAT_TOLERANCE {
        return 0.0;
    }
    if value == f64::INFINITY {
        return f64::INFINITY;
    }
    let sp = spline(imag / s);
    -spline_derivative(imag, s) / (sp * sp)
}

// ─────────────────────────────────────────────────────────────
//  Per-mesh layout
// ─────────────────────────────────────────────────────────────

/// Index maps and reference areas, fixed for the lifetime of a problem.
///
/// Row `N·f + j` of the imaginary-product map reads the four reduced-field
/// entries stored in `columns[N·f + j]`.
#[derive(Debug, Clone)]
pub struct BarrierLayout {
    pub n: usize,
    pub num_faces: usize,
    pub reference_area: Vec<f64>,
    pub columns: Vec<[usize; 4]>,
}

/// Barrier values for every (face, branch) and, on request, the
/// call-local derivative data needed for the Jacobian.
#[derive(Debug, Clone)]
pub struct BarrierEvaluation {
    pub imag: Vec<f64>,
    pub values: Vec<f64>,
    /// d barrier / d imag per (face, branch); empty without gradient.
    pub derivatives: Vec<f64>,
    /// d imag / d field, N|F| × 2N|F|.
    pub imag_gradient: Option<CsMat<f64>>,
}

impl BarrierLayout {
    /// Build the layout from the initial reduced field (|F| × 2N).
    pub fn new(reduced_field: &Array2<f64>, n: usize, mode: ReferenceArea) -> Self {
        let num_faces = reduced_field.nrows();
        let mut reference_area = Vec::with_capacity(n * num_faces);
        let mut columns = Vec::with_capacity(n * num_faces);

        for f in 0..num_faces {
            for j in 0..n {
                let jn = (j + 1) % n;
                columns.push([
                    2 * n * f + 2 * j,
                    2 * n * f + 2 * j + 1,
                    2 * n * f + 2 * jn,
                    2 * n * f + 2 * jn + 1,
                ]);

                let area = match mode {
                    ReferenceArea::Unit => 1.0,
                    ReferenceArea::NormProduct => {
                        let c = reduced_field[[f, 2 * j]].hypot(reduced_field[[f, 2 * j + 1]]);
                        let nx = reduced_field[[f, 2 * jn]].hypot(reduced_field[[f, 2 * jn + 1]]);
                        let p = c * nx;
                        if p > 0.0 && p.is_finite() { p } else { 1.0 }
                    }
                };
                reference_area.push(area);
            }
        }

        Self {
            n,
            num_faces,
            reference_area,
            columns,
        }
    }

    pub fn num_terms(&self) -> usize {
        self.n * self.num_faces
    }

    pub fn field_size(&self) -> usize {
        2 * self.n * self.num_faces
    }

    /// Evaluate the barrier on the current reduced field (2N|F| entries).
    pub fn evaluate(&self, field: &[f64], s: f64, with_gradient: bool) -> BarrierEvaluation {
        let terms = self.num_terms();
        let mut imag = Vec::with_capacity(terms);
        let mut values = Vec::with_capacity(terms);
        let capacity = if with_gradient { terms } else { 0 };
        let mut derivatives = Vec::with_capacity(capacity);
        let mut tri = TriMat::with_capacity((terms, self.field_size()), 4 * capacity);

        for (row, cols) in self.columns.iter().enumerate() {
            let a = self.reference_area[row];
            let (cx, cy) = (field[cols[0]], field[cols[1]]);
            let (nx, ny) = (field[cols[2]], field[cols[3]]);
            let ip = (cx * ny - cy * nx) / a;

            imag.push(ip);
            values.push(barrier_value(ip, s));

            if with_gradient {
                derivatives.push(barrier_derivative(ip, s));
                let partials = [ny / a, -nx / a, -cy / a, cx / a];
                for (&col, &v) in cols.iter().zip(partials.iter()) {
                    tri.add_triplet(row, col, v);
                }
            }
        }

        BarrierEvaluation {
            imag,
            values,
            derivatives,
            imag_gradient: with_gradient.then(|| tri.to_csr()),
        }
    }

    /// Nonzero structure of d imag / d field (values 1.0).
    pub fn pattern(&self) -> CsMat<f64> {
        let mut tri = TriMat::with_capacity((self.num_terms(), self.field_size()), 4 * self.num_terms());
        for (row, cols) in self.columns.iter().enumerate() {
            for &col in cols {
                tri.add_triplet(row, col, 1.0);
            }
        }
        tri.to_csr().map(|_| 1.0)
    }
}
