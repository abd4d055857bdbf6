use ndarray::Array2;
use sprs::{CsMat, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};
use std::fmt;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, SeamlessError>`
/// instead of panicking.  Barrier blow-ups are *not* errors: a flipped or
/// degenerate branch pair evaluates to `+∞` on purpose.
#[derive(Debug, Error)]
pub enum SeamlessError {
    /// Sparse factorisation of the bordered system failed (singular,
    /// redundant or inconsistent fixed values).
    #[error("linear algebra error: {0}")]
    Linalg(#[from] sprs::errors::LinalgError),
    /// The constraint matrix leaves no degrees of freedom on the columns it
    /// touches, so no null-space basis can be extracted.
    #[error("constraint null space is empty: {participating} participating columns, rank {rank}")]
    EmptyNullSpace { participating: usize, rank: usize },
    /// NaN or infinite coefficient in the constraint matrix.
    #[error("non-finite constraint coefficient at ({row}, {col})")]
    NonFiniteConstraint { row: usize, col: usize },
    /// An evaluation was requested before a successful `init`.
    #[error("traits not initialized (call init first)")]
    NotInitialized,
    /// Shape mismatch in input data.
    #[error("shape error: {0}")]
    Shape(String),
    /// The downstream driver returned an error.
    #[error("solver error: {0}")]
    Solver(String),
}

impl SeamlessError {
    /// `true` for the recoverable failures `init` can report: the caller may
    /// retry with different constraints.
    pub fn is_initialization_failure(&self) -> bool {
        matches!(
            self,
            Self::Linalg(_) | Self::EmptyNullSpace { .. } | Self::NonFiniteConstraint { .. }
        )
    }
}

impl From<argmin::core::Error> for SeamlessError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Barrier values below this magnitude get a zero derivative.
pub const BARRIER_FLAT_TOLERANCE: f64 = 1e-9;

/// Multiplier-block pivots smaller than this fraction of the largest one
/// are treated as singular.
pub const PIVOT_RELATIVE_TOLERANCE: f64 = 1e-12;

// ─────────────────────────────────────────────────────────────
//  Options
// ─────────────────────────────────────────────────────────────

/// Fixed weights of the four residual blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub integration: f64,
    pub close: f64,
    pub constraint: f64,
    pub barrier: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            integration: 1e4,
            close: 1.0,
            constraint: 1e4,
            barrier: 1e-4,
        }
    }
}

/// Reference area dividing the per-branch cross product inside the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceArea {
    /// 1.0 for every (face, branch).
    #[default]
    Unit,
    /// |curr|·|next| of the initial reduced field; 1.0 where that is zero.
    NormProduct,
}

#[derive(Debug, Clone)]
pub struct SeamlessOptions {
    pub weights: Weights,
    /// Barrier half-width `s`: the barrier vanishes once the imaginary
    /// product reaches `s`.
    pub barrier_half_width: f64,
    /// Fraction of the bounding-box diagonal used as parameterisation length.
    pub length_ratio: f64,
    /// Append the injectivity barrier block to the residual and Jacobian.
    pub local_injectivity: bool,
    pub reference_area: ReferenceArea,
    /// Relative diagonal perturbation of the primal block of the bordered
    /// system (scaled by the largest diagonal entry).
    pub regularization: f64,
}

impl Default for SeamlessOptions {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            barrier_half_width: 0.5,
            length_ratio: 0.01,
            local_injectivity: false,
            reference_area: ReferenceArea::Unit,
            regularization: 1e-8,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Input bundle  (immutable after construction)
// ─────────────────────────────────────────────────────────────

/// Everything the collaborators hand over: mesh, raw field, gradient
/// operator and linear constraints.
///
/// Layouts:
///   * `raw_field` row `f` holds the N branches of face `f` as
///     `[x0 y0 z0 x1 y1 z1 …]`.
///   * `gradient` maps the potential (P entries) to the same per-face,
///     per-branch 3D layout (3N·|F| rows).
///   * `constraints` is m × P; its rows are homogeneous (C·x = 0).
#[derive(Debug, Clone)]
pub struct SeamlessInput {
    pub vertices: Array2<f64>,   // |V| × 3
    pub faces: Array2<usize>,    // |F| × 3
    pub raw_field: Array2<f64>,  // |F| × 3N
    pub n: usize,
    pub gradient: CsMat<f64>,    // 3N|F| × P
    pub constraints: CsMat<f64>, // m × P
    pub fixed_indices: Vec<usize>,
    pub fixed_values: Vec<f64>,
    /// Diagonal branch masses (3N|F| positive entries); identity when `None`.
    pub mass: Option<Vec<f64>>,
}

impl SeamlessInput {
    /// Bundle with no constraints, no fixed values and unit masses.
    pub fn unconstrained(
        vertices: Array2<f64>,
        faces: Array2<usize>,
        raw_field: Array2<f64>,
        n: usize,
        gradient: CsMat<f64>,
    ) -> Self {
        let num_potential = gradient.cols();
        Self {
            vertices,
            faces,
            raw_field,
            n,
            gradient,
            constraints: CsMat::zero((0, num_potential)),
            fixed_indices: Vec::new(),
            fixed_values: Vec::new(),
            mass: None,
        }
    }

    pub fn num_faces(&self) -> usize {
        self.faces.nrows()
    }

    pub fn num_potential(&self) -> usize {
        self.gradient.cols()
    }

    /// Check every dimension and index the core relies on.
    pub fn validate(&self) -> Result<(), SeamlessError> {
        let nf = self.num_faces();
        let nv = self.vertices.nrows();
        if self.n == 0 {
            return Err(SeamlessError::Shape("branch count N must be positive".into()));
        }
        if self.vertices.ncols() != 3 || self.faces.ncols() != 3 {
            return Err(SeamlessError::Shape(format!(
                "vertices must be |V|×3 and faces |F|×3, got {:?} and {:?}",
                self.vertices.dim(),
                self.faces.dim()
            )));
        }
        if nf == 0 {
            return Err(SeamlessError::Shape("mesh has no faces".into()));
        }
        if let Some((f, &v)) = self
            .faces
            .indexed_iter()
            .map(|((f, _), v)| (f, v))
            .find(|(_, v)| **v >= nv)
        {
            return Err(SeamlessError::Shape(format!(
                "face {f} references vertex {v} (only {nv} vertices)"
            )));
        }
        if self.raw_field.dim() != (nf, 3 * self.n) {
            return Err(SeamlessError::Shape(format!(
                "raw field must be {}×{}, got {:?}",
                nf,
                3 * self.n,
                self.raw_field.dim()
            )));
        }
        if self.gradient.rows() != 3 * self.n * nf {
            return Err(SeamlessError::Shape(format!(
                "gradient operator must have {} rows, got {}",
                3 * self.n * nf,
                self.gradient.rows()
            )));
        }
        let np = self.num_potential();
        if self.constraints.cols() != np {
            return Err(SeamlessError::Shape(format!(
                "constraint matrix has {} columns, potential has {}",
                self.constraints.cols(),
                np
            )));
        }
        if self.fixed_indices.len() != self.fixed_values.len() {
            return Err(SeamlessError::Shape(format!(
                "{} fixed indices but {} fixed values",
                self.fixed_indices.len(),
                self.fixed_values.len()
            )));
        }
        if let Some(&i) = self.fixed_indices.iter().find(|&&i| i >= np) {
            return Err(SeamlessError::Shape(format!(
                "fixed index {i} out of range (potential size {np})"
            )));
        }
        if let Some(mass) = &self.mass {
            if mass.len() != 3 * self.n * nf {
                return Err(SeamlessError::Shape(format!(
                    "mass must have {} entries, got {}",
                    3 * self.n * nf,
                    mass.len()
                )));
            }
            if mass.iter().any(|&m| !(m > 0.0) || !m.is_finite()) {
                return Err(SeamlessError::Shape("mass entries must be finite and positive".into()));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Least-squares traits  (the capability a downstream solver consumes)
// ─────────────────────────────────────────────────────────────

/// What `post_iteration` tells the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationControl {
    Continue,
    Stop,
}

/// Residual vector, optional Jacobian and the integration infeasibility
/// diagnostic of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub residual: Vec<f64>,
    pub jacobian: Option<CsMat<f64>>,
    /// ‖current field − L·G2·x‖∞ (unweighted).  Informational only.
    pub integrability: f64,
}

/// Callback surface of a Gauss-Newton / Levenberg-Marquardt style solver.
///
/// The implementor supplies values, Jacobians and the Jacobian sparsity
/// pattern; step sizes and convergence belong to the caller.
pub trait LeastSquaresTraits {
    /// Build every derived operator and the initial state.  Must be called
    /// once before anything else.
    fn init(&mut self, verbose: bool) -> Result<(), SeamlessError>;

    /// Initial reduced state vector.
    fn initial_solution(&self) -> Result<Vec<f64>, SeamlessError>;

    fn pre_iteration(&mut self, _prev_x: &[f64]) {}

    /// Residual at `x` and, when `compute_jacobian`, its sparse Jacobian
    /// with respect to `x`.
    fn objective_jacobian(
        &self,
        x: &[f64],
        compute_jacobian: bool,
    ) -> Result<Evaluation, SeamlessError>;

    fn post_iteration(&mut self, _x: &[f64]) -> IterationControl {
        IterationControl::Continue
    }

    /// Union of all nonzero locations `objective_jacobian` can produce.
    fn jacobian_pattern(&self) -> Result<CsMat<f64>, SeamlessError>;

    /// Length of the reduced state vector.
    fn x_size(&self) -> usize;

    /// Length of the residual vector.
    fn residual_size(&self) -> usize;
}

// ─────────────────────────────────────────────────────────────
//  Factorisation of the bordered system
// ─────────────────────────────────────────────────────────────

/// Numeric LDLᵀ factorisation of a (possibly regularised) bordered KKT matrix
///
/// ```text
///   [ E + εI   Aᵀ ]
///   [ A        0  ]
/// ```
///
/// The primal block (first `primal_size` rows) is eliminated first, so its
/// pivots must be positive; the multiplier pivots are the negated Schur
/// complement and must be negative and non-negligible.
pub struct Factorization {
    ldl: LdlNumeric<f64, usize>,
    primal_size: usize,
}

impl fmt::Debug for Factorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Factorization(primal_size: {}, ...)", self.primal_size)
    }
}

impl Factorization {
    pub fn new(
        a: sprs::CsMatView<f64>,
        primal_size: usize,
    ) -> Result<Self, sprs::errors::LinalgError> {
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::NoReduction)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(a)?;
        validate_pivots(ldl.d(), primal_size)?;
        Ok(Self { ldl, primal_size })
    }

    /// Solve K x = rhs using the stored factorisation.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        self.ldl.solve(rhs)
    }

    /// Solve `matrix · x = rhs` by iterative refinement, using this
    /// factorisation as the preconditioner.
    ///
    /// `matrix` may differ from the factorised one (typically it is the
    /// unperturbed system whose primal block was regularised for the
    /// factorisation).  Sweeps stop once the residual reaches rounding
    /// level, stops shrinking, or `max_steps` is hit; the last iterate that
    /// reduced the residual is returned.
    pub fn solve_refined(&self, matrix: &CsMat<f64>, rhs: &[f64], max_steps: usize) -> Vec<f64> {
        let floor = f64::EPSILON * norm2(rhs);

        let mut x = self.solve(rhs);
        let mut residual = refinement_residual(matrix, rhs, &x);
        let mut norm = norm2(&residual);

        for step in 0..max_steps {
            if norm <= floor {
                log::trace!("refinement converged after {step} sweeps");
                break;
            }
            let dx = self.solve(&residual);
            let candidate: Vec<f64> = x.iter().zip(&dx).map(|(xi, di)| xi + di).collect();
            let next_residual = refinement_residual(matrix, rhs, &candidate);
            let next_norm = norm2(&next_residual);
            if !(next_norm < norm) {
                break;
            }
            x = candidate;
            residual = next_residual;
            norm = next_norm;
        }
        x
    }
}

fn refinement_residual(matrix: &CsMat<f64>, rhs: &[f64], x: &[f64]) -> Vec<f64> {
    let kx = spmv(matrix, x);
    rhs.iter().zip(&kx).map(|(b, k)| b - k).collect()
}

fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn validate_pivots(d: &[f64], primal_size: usize) -> Result<(), sprs::errors::LinalgError> {
    let singular = |index: usize, reason: &'static str| {
        sprs::errors::LinalgError::SingularMatrix(sprs::errors::SingularMatrixInfo { index, reason })
    };

    for (i, &di) in d.iter().enumerate() {
        if !di.is_finite() {
            return Err(singular(i, "non-finite pivot in bordered factorization"));
        }
        if i < primal_size && di <= 0.0 {
            return Err(singular(i, "D <= 0 in primal block (energy not SPD)"));
        }
    }

    let multipliers = &d[primal_size.min(d.len())..];
    let largest = multipliers.iter().fold(0.0_f64, |m, &v| m.max(v.abs()));
    for (k, &dk) in multipliers.iter().enumerate() {
        if dk >= 0.0 || dk.abs() <= PIVOT_RELATIVE_TOLERANCE * largest {
            return Err(singular(
                primal_size + k,
                "vanishing multiplier pivot (redundant or inconsistent fixed values)",
            ));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// y = A x  for a CSR (or CSC) matrix and dense slice.
pub fn spmv(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    assert_eq!(a.cols(), x.len(), "spmv dimension mismatch");
    let mut y = vec![0.0; a.rows()];
    for (v, (row, col)) in a.iter() {
        y[row] += v * x[col];
    }
    y
}

/// Stack blocks with equal column counts on top of each other.
pub fn vstack(blocks: &[&CsMat<f64>]) -> CsMat<f64> {
    let cols = blocks.first().map_or(0, |b| b.cols());
    let rows: usize = blocks.iter().map(|b| b.rows()).sum();
    let mut tri = sprs::TriMat::with_capacity((rows, cols), blocks.iter().map(|b| b.nnz()).sum());
    let mut offset = 0;
    for block in blocks {
        assert_eq!(block.cols(), cols, "vstack column mismatch");
        for (&v, (row, col)) in block.iter() {
            tri.add_triplet(offset + row, col, v);
        }
        offset += block.rows();
    }
    tri.to_csr()
}

/// Copy of `a` with every stored value replaced by 1.0.
pub fn pattern_of(a: &CsMat<f64>) -> CsMat<f64> {
    a.map(|_| 1.0)
}

/// Set of (row, col) locations stored in `a`, sorted.
pub fn nonzero_locations(a: &CsMat<f64>) -> Vec<(usize, usize)> {
    let mut locs: Vec<(usize, usize)> = a.iter().map(|(_, rc)| rc).collect();
    locs.sort_unstable();
    locs
}
