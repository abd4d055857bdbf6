//! Finite-difference verification of the analytic Jacobian.
//!
//! Central differences of `objective_jacobian` residuals are compared to the
//! returned sparse Jacobian, column by column.  The linear blocks must match
//! directly.  The barrier block is checked through its documented scaling:
//! its Jacobian rows equal `wI·wC · d(imag)/dx · b'(imag)`, while the residual
//! is `wB · b(imag)`.

use ndarray::Array2;
use seamless::mesh::gradient_operator;
use seamless::{LeastSquaresTraits, SeamlessInput, SeamlessIntegration, SeamlessOptions, Weights};
use sprs::TriMat;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Slightly non-planar quad so the tangent frames differ per face.
fn bent_quad() -> (Array2<f64>, Array2<usize>) {
    let v = Array2::from_shape_vec(
        (4, 3),
        vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.1, 0.0, 1.0, -0.05, 1.1, 0.9, 0.2],
    )
    .unwrap();
    let f = Array2::from_shape_vec((2, 3), vec![0, 1, 2, 1, 3, 2]).unwrap();
    (v, f)
}

/// Four branches 90° apart in each face's tangent plane, with a small twist
/// so that not every imaginary product is identical.
fn cross_field(vertices: &Array2<f64>, faces: &Array2<usize>) -> Array2<f64> {
    let (b1, b2, _) = seamless::mesh::local_basis(vertices, faces);
    let nf = faces.nrows();
    let mut field = Array2::zeros((nf, 12));
    for f in 0..nf {
        for k in 0..4 {
            let a = std::f64::consts::FRAC_PI_2 * k as f64 + 0.1 * f as f64;
            let len = 1.0 + 0.1 * k as f64;
            for d in 0..3 {
                field[[f, 3 * k + d]] = len * (a.cos() * b1[[f, d]] + a.sin() * b2[[f, d]]);
            }
        }
    }
    field
}

fn problem(local_injectivity: bool) -> SeamlessIntegration {
    let (v, f) = bent_quad();
    let field = cross_field(&v, &f);
    let g = gradient_operator(&v, &f, 4);
    let mut input = SeamlessInput::unconstrained(v, f, field, 4, g);

    // tie branch 0 at vertex 0 to branch 2 at vertex 3
    let mut c = TriMat::new((1, input.num_potential()));
    c.add_triplet(0, 0, 1.0);
    c.add_triplet(0, 4 * 3 + 2, -1.0);
    input.constraints = c.to_csr();
    input.fixed_indices = vec![1];
    input.fixed_values = vec![0.0];

    let options = SeamlessOptions {
        weights: Weights {
            integration: 3.0,
            close: 2.0,
            constraint: 5.0,
            barrier: 0.5,
        },
        barrier_half_width: 4.0,
        length_ratio: 0.5,
        local_injectivity,
        ..SeamlessOptions::default()
    };
    let mut traits = SeamlessIntegration::new(input, options);
    traits.init(false).expect("init should succeed");
    traits
}

/// A state near the initial solution, off any symmetric point.
fn probe_state(traits: &SeamlessIntegration) -> Vec<f64> {
    traits
        .initial_solution()
        .unwrap()
        .iter()
        .enumerate()
        .map(|(i, &x)| x + 0.01 * ((i * 7 % 11) as f64 - 5.0) / 5.0)
        .collect()
}

fn fd_column(traits: &SeamlessIntegration, x: &[f64], j: usize, h: f64) -> Vec<f64> {
    let mut xp = x.to_vec();
    let mut xm = x.to_vec();
    xp[j] += h;
    xm[j] -= h;
    let rp = traits.objective_jacobian(&xp, false).unwrap().residual;
    let rm = traits.objective_jacobian(&xm, false).unwrap().residual;
    rp.iter().zip(&rm).map(|(p, m)| (p - m) / (2.0 * h)).collect()
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn fd_linear_blocks() {
    let traits = problem(false);
    let x = probe_state(&traits);
    let jac = traits.objective_jacobian(&x, true).unwrap().jacobian.unwrap().to_dense();
    assert_eq!(jac.dim(), (traits.residual_size(), traits.x_size()));

    let h = 1e-6;
    for j in 0..traits.x_size() {
        let fd = fd_column(&traits, &x, j, h);
        for (i, &d) in fd.iter().enumerate() {
            let an = jac[[i, j]];
            assert!(
                (d - an).abs() <= 1e-6 * an.abs().max(1.0),
                "J[{i},{j}]: fd={d:.8e}, an={an:.8e}"
            );
        }
    }
}

#[test]
fn fd_barrier_block() {
    let traits = problem(true);
    let x = probe_state(&traits);
    let eval = traits.objective_jacobian(&x, true).unwrap();
    assert!(eval.residual.iter().all(|r| r.is_finite()), "probe state hit the barrier wall");
    let jac = eval.jacobian.unwrap().to_dense();

    let linear_rows = traits.residual_size() - 4 * 2;
    let (w_i, w_c, w_b) = (3.0, 2.0, 0.5);

    let h = 1e-7;
    for j in 0..traits.x_size() {
        let fd = fd_column(&traits, &x, j, h);
        for i in linear_rows..traits.residual_size() {
            let expected = fd[i] / w_b;
            let an = jac[[i, j]] / (w_i * w_c);
            assert!(
                (expected - an).abs() <= 1e-5 * an.abs().max(1.0),
                "barrier J[{i},{j}]: fd={expected:.8e}, an={an:.8e}"
            );
        }
    }
}
