//! Jacobian sparsity pattern, computed once before any iteration.
//!
//! Mirrors the block layout of [`ObjectiveOperators::evaluate`]: each block
//! pattern is the pattern of its lifted derivative times the pattern of
//! `UExt`, and the barrier block is `pattern(d imag / d u) · pattern(close)`.
//! All stored values are 1.0.

use crate::objective::ObjectiveOperators;
use crate::types::{pattern_of, vstack};
use sprs::CsMat;

/// Product of two patterns, normalised back to 1.0 entries.
fn pattern_product(a: &CsMat<f64>, b: &CsMat<f64>) -> CsMat<f64> {
    pattern_of(&(a * b))
}

pub fn jacobian_pattern(ops: &ObjectiveOperators) -> CsMat<f64> {
    let lift = pattern_of(&ops.extended);

    let integration = pattern_product(&pattern_of(&ops.integration_derivative()), &lift);
    let close = pattern_product(&pattern_of(&ops.close_derivative()), &lift);
    let constraint = pattern_product(&pattern_of(&ops.constraint_derivative()), &lift);

    if ops.local_injectivity {
        let barrier = pattern_product(&ops.barrier.pattern(), &close);
        vstack(&[&integration, &close, &constraint, &barrier])
    } else {
        vstack(&[&integration, &close, &constraint])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierLayout;
    use crate::objective::extended_embedding;
    use crate::types::{nonzero_locations, ReferenceArea, Weights};
    use ndarray::Array2;
    use sprs::TriMat;

    fn ops(local_injectivity: bool) -> ObjectiveOperators {
        let mut g2 = TriMat::new((4, 3));
        g2.add_triplet(0, 0, 1.0);
        g2.add_triplet(1, 2, -1.0);
        g2.add_triplet(2, 1, 0.5);
        g2.add_triplet(3, 0, 2.0);
        let mut u = TriMat::new((3, 2));
        u.add_triplet(0, 0, 1.0);
        u.add_triplet(1, 1, 1.0);
        u.add_triplet(2, 1, 1.0);
        let field = Array2::from_shape_vec((1, 4), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        ObjectiveOperators {
            g2: g2.to_csr(),
            extended: extended_embedding(&u.to_csr(), 4),
            param_length: 1.0,
            reduced_field: vec![1.0, 0.0, 0.0, 1.0],
            fixed_indices: vec![2],
            fixed_values: vec![0.0],
            barrier: BarrierLayout::new(&field, 2, ReferenceArea::Unit),
            weights: Weights::default(),
            barrier_half_width: 2.0,
            local_injectivity,
        }
    }

    #[test]
    fn rows_match_the_residual_layout() {
        for enabled in [false, true] {
            let o = ops(enabled);
            let p = jacobian_pattern(&o);
            assert_eq!(p.rows(), o.residual_size());
            assert_eq!(p.cols(), o.x_size());
            assert!(p.iter().all(|(&v, _)| v == 1.0));
        }
    }

    #[test]
    fn pattern_is_idempotent() {
        let o = ops(true);
        assert_eq!(nonzero_locations(&jacobian_pattern(&o)), nonzero_locations(&jacobian_pattern(&o)));
    }

    #[test]
    fn pattern_covers_the_jacobian() {
        let o = ops(true);
        let pattern = nonzero_locations(&jacobian_pattern(&o));
        let x = [0.2, -0.4, 0.9, 0.1, -0.3, 1.1];
        let jac = o.evaluate(&x, true).unwrap().jacobian.unwrap();
        for loc in nonzero_locations(&jac) {
            assert!(pattern.binary_search(&loc).is_ok(), "{loc:?} outside the pattern");
        }
    }
}
