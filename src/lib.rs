//! **seamless**: seamless integration of an N-directional field into a
//! potential, posed as a nonlinear least-squares problem.
//!
//! The pipeline, built once by [`SeamlessIntegration::init`]:
//!
//! 1. **Tangent reduction** (`tangent`): local face bases, 3D → 2D field projection.
//! 2. **Constraint reduction** (`nullspace`): null-space embedding `X = U·y` of the
//!    linear seam constraints.
//! 3. **Initial solution** (`poisson`): constrained Poisson fit via an LDLᵀ-factored
//!    KKT system.
//! 4. **Residuals** (`objective`, `barrier`): integration, closeness, fixed-value and
//!    local-injectivity blocks with their analytic Jacobian.
//! 5. **Sparsity** (`pattern`): the Jacobian nonzero structure, computed once.
//!
//! A downstream Gauss–Newton/LM solver drives the result through
//! [`LeastSquaresTraits`]; `optimizer` ships an L-BFGS driver via `argmin`.

pub mod types;
pub mod mesh;
pub mod tangent;
pub mod nullspace;
pub mod poisson;
pub mod barrier;
pub mod objective;
pub mod pattern;
pub mod integration;
pub mod optimizer;

pub use integration::SeamlessIntegration;
pub use optimizer::{minimize, OptimizerOptions, OptimizerResult};
pub use types::{
    Evaluation, IterationControl, LeastSquaresTraits, ReferenceArea, SeamlessError,
    SeamlessInput, SeamlessOptions, Weights,
};
