//! Projection of the per-face 3D field into per-face 2D tangent coordinates.
//!
//! For every face `f`, branch `k` the 3D block `3N·f + 3k .. +3` maps to the
//! 2D block `2N·f + 2k .. +2` through the rows `(B1_f, B2_f)`.

use crate::mesh::local_basis;
use ndarray::Array2;
use sprs::{CsMat, TriMat};

/// Tangent frames, projection operator and the reduced field.
#[derive(Debug, Clone)]
pub struct TangentReduction {
    pub b1: Array2<f64>,      // |F| × 3
    pub b2: Array2<f64>,      // |F| × 3
    pub normals: Array2<f64>, // |F| × 3
    /// Block-diagonal projector, 2N|F| × 3N|F|.
    pub projector: CsMat<f64>,
    /// Field in tangent coordinates, |F| × 2N.
    pub reduced_field: Array2<f64>,
}

impl TangentReduction {
    /// Build frames from the mesh and project `raw_field` (|F| × 3N).
    pub fn new(
        vertices: &Array2<f64>,
        faces: &Array2<usize>,
        raw_field: &Array2<f64>,
        n: usize,
    ) -> Self {
        let (b1, b2, normals) = local_basis(vertices, faces);
        let projector = projection_operator(&b1, &b2, n);
        let reduced_field = project_field(raw_field, &b1, &b2, n);
        Self {
            b1,
            b2,
            normals,
            projector,
            reduced_field,
        }
    }

    /// Reduced field flattened face-major: `[f0 b0.x f0 b0.y f0 b1.x …]`.
    pub fn reduced_field_vec(&self) -> Vec<f64> {
        self.reduced_field.iter().copied().collect()
    }

    /// `projector · gradient`: potential → reduced field space.
    pub fn reduce_operator(&self, gradient: &CsMat<f64>) -> CsMat<f64> {
        &self.projector * &gradient.to_csr()
    }
}

/// Sparse projector from the 3N|F| layout to the 2N|F| layout.
pub fn projection_operator(b1: &Array2<f64>, b2: &Array2<f64>, n: usize) -> CsMat<f64> {
    let nf = b1.nrows();
    let mut tri = TriMat::with_capacity((2 * n * nf, 3 * n * nf), 6 * n * nf);
    for f in 0..nf {
        for k in 0..n {
            for d in 0..3 {
                tri.add_triplet(2 * n * f + 2 * k, 3 * n * f + 3 * k + d, b1[[f, d]]);
                tri.add_triplet(2 * n * f + 2 * k + 1, 3 * n * f + 3 * k + d, b2[[f, d]]);
            }
        }
    }
    tri.to_csr()
}

/// Dense equivalent of applying [`projection_operator`] face by face.
pub fn project_field(raw_field: &Array2<f64>, b1: &Array2<f64>, b2: &Array2<f64>, n: usize) -> Array2<f64> {
    let nf = raw_field.nrows();
    let mut out = Array2::zeros((nf, 2 * n));
    for f in 0..nf {
        for k in 0..n {
            let (mut u, mut v) = (0.0, 0.0);
            for d in 0..3 {
                u += raw_field[[f, 3 * k + d]] * b1[[f, d]];
                v += raw_field[[f, 3 * k + d]] * b2[[f, d]];
            }
            out[[f, 2 * k]] = u;
            out[[f, 2 * k + 1]] = v;
        }
    }
    out
}

/// Raw field flattened face-major, matching the projector's column layout.
pub fn flatten_field(raw_field: &Array2<f64>) -> Vec<f64> {
    raw_field.iter().copied().collect()
}
