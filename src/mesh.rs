//! Triangle-mesh helpers: bounding box, per-face tangent frames and the
//! per-face gradient of piecewise-linear N-branch potentials.
//!
//! The potential layout used by [`gradient_operator`] is vertex-major:
//! entry `N·v + k` is the value of branch `k` at vertex `v`.

use ndarray::Array2;
use sprs::{CsMat, TriMat};

type Vec3 = [f64; 3];

#[inline]
fn row3(m: &Array2<f64>, i: usize) -> Vec3 {
    [m[[i, 0]], m[[i, 1]], m[[i, 2]]]
}

#[inline]
fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn norm(a: Vec3) -> f64 {
    (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
}

#[inline]
fn normalized(a: Vec3) -> Vec3 {
    let l = norm(a);
    [a[0] / l, a[1] / l, a[2] / l]
}

/// Length of the axis-aligned bounding-box diagonal.
pub fn bounding_box_diagonal(vertices: &Array2<f64>) -> f64 {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for row in vertices.rows() {
        for d in 0..3 {
            lo[d] = lo[d].min(row[d]);
            hi[d] = hi[d].max(row[d]);
        }
    }
    if vertices.nrows() == 0 {
        return 0.0;
    }
    norm(sub(hi, lo))
}

/// Orthonormal frame per face: `b1` along the first edge, `normal` the
/// unit face normal and `b2 = normal × b1`.  Each output is |F| × 3.
///
/// Faces must be non-degenerate.
pub fn local_basis(
    vertices: &Array2<f64>,
    faces: &Array2<usize>,
) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let nf = faces.nrows();
    let mut b1 = Array2::zeros((nf, 3));
    let mut b2 = Array2::zeros((nf, 3));
    let mut normals = Array2::zeros((nf, 3));

    for f in 0..nf {
        let p0 = row3(vertices, faces[[f, 0]]);
        let p1 = row3(vertices, faces[[f, 1]]);
        let p2 = row3(vertices, faces[[f, 2]]);

        let e1 = sub(p1, p0);
        let e2 = sub(p2, p0);
        let n = normalized(cross(e1, e2));
        let t1 = normalized(e1);
        let t2 = normalized(cross(n, t1));

        for d in 0..3 {
            b1[[f, d]] = t1[d];
            b2[[f, d]] = t2[d];
            normals[[f, d]] = n[d];
        }
    }

    (b1, b2, normals)
}

/// Gradient of piecewise-linear vertex functions, one per branch.
///
/// Returns a (3N·|F|) × (N·|V|) matrix: row `3N·f + 3k + d` is coordinate `d`
/// of the gradient of branch `k` on face `f`.
pub fn gradient_operator(vertices: &Array2<f64>, faces: &Array2<usize>, n: usize) -> CsMat<f64> {
    let nf = faces.nrows();
    let nv = vertices.nrows();
    let mut tri = TriMat::with_capacity((3 * n * nf, n * nv), 9 * n * nf);

    for f in 0..nf {
        let corners = [faces[[f, 0]], faces[[f, 1]], faces[[f, 2]]];
        let p = corners.map(|v| row3(vertices, v));
        let area_normal = cross(sub(p[1], p[0]), sub(p[2], p[0]));
        let double_area = norm(area_normal);
        let unit_normal = normalized(area_normal);

        for a in 0..3 {
            // edge opposite corner `a`, counter-clockwise
            let e = sub(p[(a + 2) % 3], p[(a + 1) % 3]);
            let g = cross(unit_normal, e);
            for k in 0..n {
                for d in 0..3 {
                    tri.add_triplet(3 * n * f + 3 * k + d, n * corners[a] + k, g[d] / double_area);
                }
            }
        }
    }

    tri.to_csr()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle() -> (Array2<f64>, Array2<usize>) {
        let v = Array2::from_shape_vec(
            (3, 3),
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        )
        .unwrap();
        let f = Array2::from_shape_vec((1, 3), vec![0, 1, 2]).unwrap();
        (v, f)
    }

    #[test]
    fn basis_is_orthonormal_and_tangent() {
        let v = Array2::from_shape_vec(
            (3, 3),
            vec![0.0, 0.0, 0.0, 2.0, 1.0, 0.5, -0.3, 1.0, 2.0],
        )
        .unwrap();
        let f = Array2::from_shape_vec((1, 3), vec![0, 1, 2]).unwrap();
        let (b1, b2, n) = local_basis(&v, &f);
        let dot = |a: &Array2<f64>, b: &Array2<f64>| (0..3).map(|d| a[[0, d]] * b[[0, d]]).sum::<f64>();
        assert!((dot(&b1, &b1) - 1.0).abs() < 1e-12);
        assert!((dot(&b2, &b2) - 1.0).abs() < 1e-12);
        assert!(dot(&b1, &b2).abs() < 1e-12);
        assert!(dot(&b1, &n).abs() < 1e-12);
        assert!(dot(&b2, &n).abs() < 1e-12);
    }

    #[test]
    fn gradient_of_linear_function_is_exact() {
        let (v, f) = unit_triangle();
        let g = gradient_operator(&v, &f, 2);
        assert_eq!(g.shape(), (6, 6));

        // branch 0 = x, branch 1 = 2y - 1
        let mut phi = vec![0.0; 6];
        for vi in 0..3 {
            phi[2 * vi] = v[[vi, 0]];
            phi[2 * vi + 1] = 2.0 * v[[vi, 1]] - 1.0;
        }
        let grad = crate::types::spmv(&g, &phi);
        let expected = [1.0, 0.0, 0.0, 0.0, 2.0, 0.0];
        for (a, b) in grad.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12, "{grad:?}");
        }
    }

    #[test]
    fn constants_have_zero_gradient() {
        let (v, f) = unit_triangle();
        let g = gradient_operator(&v, &f, 1);
        let grad = crate::types::spmv(&g, &[3.5, 3.5, 3.5]);
        assert!(grad.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn bbox_diagonal() {
        let (v, _) = unit_triangle();
        assert!((bounding_box_diagonal(&v) - 2.0_f64.sqrt()).abs() < 1e-12);
    }
}
