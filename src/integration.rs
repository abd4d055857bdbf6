//! `SeamlessIntegration`: the least-squares traits object a downstream
//! solver drives.
//!
//! `init` builds everything once (tangent reduction, constraint embedding,
//! initial Poisson potential, barrier layout, Jacobian pattern); afterwards
//! every operator is read-only and evaluations are side-effect free.

use crate::barrier::BarrierLayout;
use crate::mesh::bounding_box_diagonal;
use crate::nullspace::{reduce_constraints, ConstraintReduction};
use crate::objective::{extended_embedding, ObjectiveOperators};
use crate::pattern::jacobian_pattern;
use crate::poisson::{normalize_field, FieldScale, PoissonProblem};
use crate::tangent::{flatten_field, TangentReduction};
use crate::types::{
    spmv, Evaluation, LeastSquaresTraits, SeamlessError, SeamlessInput, SeamlessOptions,
};
use sprs::CsMat;

/// Everything derived by a successful `init`.
#[derive(Debug, Clone)]
pub struct Initialized {
    pub scale: FieldScale,
    pub tangent: TangentReduction,
    pub constraints: ConstraintReduction,
    pub operators: ObjectiveOperators,
    /// Full initial potential X₀ = U·y₀.
    pub initial_potential: Vec<f64>,
    /// Reduced initial state [y₀ ; u₀].
    pub initial_solution: Vec<f64>,
    pub pattern: CsMat<f64>,
    pub residual_size: usize,
    /// Integration infeasibility at the initial state.
    pub initial_integrability: f64,
}

#[derive(Debug, Clone)]
pub struct SeamlessIntegration {
    input: SeamlessInput,
    options: SeamlessOptions,
    state: Option<Initialized>,
}

impl SeamlessIntegration {
    pub fn new(input: SeamlessInput, options: SeamlessOptions) -> Self {
        Self {
            input,
            options,
            state: None,
        }
    }

    pub fn input(&self) -> &SeamlessInput {
        &self.input
    }

    pub fn options(&self) -> &SeamlessOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Derived data, or [`SeamlessError::NotInitialized`].
    pub fn initialized(&self) -> Result<&Initialized, SeamlessError> {
        self.state.as_ref().ok_or(SeamlessError::NotInitialized)
    }

    pub fn param_length(&self) -> Result<f64, SeamlessError> {
        Ok(self.initialized()?.scale.param_length)
    }

    pub fn initial_integrability(&self) -> Result<f64, SeamlessError> {
        Ok(self.initialized()?.initial_integrability)
    }

    /// Reduced input field u₀ (2N|F| entries, face-major).
    pub fn reduced_field(&self) -> Result<&[f64], SeamlessError> {
        Ok(&self.initialized()?.operators.reduced_field)
    }

    pub fn g2(&self) -> Result<&CsMat<f64>, SeamlessError> {
        Ok(&self.initialized()?.operators.g2)
    }

    /// Null-space embedding U (P × P_red).
    pub fn embedding(&self) -> Result<&CsMat<f64>, SeamlessError> {
        Ok(&self.initialized()?.constraints.embedding)
    }

    pub fn extended_embedding(&self) -> Result<&CsMat<f64>, SeamlessError> {
        Ok(&self.initialized()?.operators.extended)
    }

    pub fn initial_potential(&self) -> Result<&[f64], SeamlessError> {
        Ok(&self.initialized()?.initial_potential)
    }

    /// Lift a reduced state to (full potential, current field).
    pub fn full_state(&self, x: &[f64]) -> Result<(Vec<f64>, Vec<f64>), SeamlessError> {
        let ops = &self.initialized()?.operators;
        if x.len() != ops.x_size() {
            return Err(SeamlessError::Shape(format!(
                "state has {} entries, expected {}",
                x.len(),
                ops.x_size()
            )));
        }
        let mut lifted = spmv(&ops.extended, x);
        let field = lifted.split_off(ops.potential_size());
        Ok((lifted, field))
    }

    fn build(&self) -> Result<Initialized, SeamlessError> {
        let input = &self.input;
        let opts = &self.options;
        input.validate()?;

        let n = input.n;
        let nf = input.num_faces();

        let scale = normalize_field(
            &input.raw_field,
            n,
            bounding_box_diagonal(&input.vertices),
            opts.length_ratio,
        );
        let tangent = TangentReduction::new(&input.vertices, &input.faces, &scale.field, n);
        let g2 = tangent.reduce_operator(&input.gradient);

        let constraints = reduce_constraints(&input.constraints)?;
        log::debug!(
            "constraint reduction: {} participating columns, rank {}, {} → {} potential unknowns",
            constraints.participating.len(),
            constraints.rank,
            constraints.full_size(),
            constraints.reduced_size()
        );

        let unit_mass;
        let mass: &[f64] = match &input.mass {
            Some(m) => m,
            None => {
                unit_mass = vec![1.0; 3 * n * nf];
                &unit_mass
            }
        };
        let field = flatten_field(&scale.field);

        let potential = PoissonProblem {
            gradient: &input.gradient,
            embedding: &constraints.embedding,
            mass,
            field: &field,
            param_length: scale.param_length,
            fixed_indices: &input.fixed_indices,
            fixed_values: &input.fixed_values,
            regularization: opts.regularization,
        }
        .solve()?;

        let reduced_field = tangent.reduced_field_vec();
        let mut initial_solution = potential.reduced.clone();
        initial_solution.extend_from_slice(&reduced_field);

        let operators = ObjectiveOperators {
            g2,
            extended: extended_embedding(&constraints.embedding, reduced_field.len()),
            param_length: scale.param_length,
            barrier: BarrierLayout::new(&tangent.reduced_field, n, opts.reference_area),
            reduced_field,
            fixed_indices: input.fixed_indices.clone(),
            fixed_values: input.fixed_values.clone(),
            weights: opts.weights,
            barrier_half_width: opts.barrier_half_width,
            local_injectivity: opts.local_injectivity,
        };

        let pattern = jacobian_pattern(&operators);
        let first = operators.evaluate(&initial_solution, false)?;

        Ok(Initialized {
            scale,
            tangent,
            constraints,
            operators,
            initial_potential: potential.full,
            initial_solution,
            pattern,
            residual_size: first.residual.len(),
            initial_integrability: first.integrability,
        })
    }
}

impl LeastSquaresTraits for SeamlessIntegration {
    fn init(&mut self, verbose: bool) -> Result<(), SeamlessError> {
        let level = if verbose { log::Level::Info } else { log::Level::Debug };

        let built = match self.build() {
            Ok(b) => b,
            Err(e) => {
                if verbose {
                    log::warn!("initialization failed: {e}");
                }
                self.state = None;
                return Err(e);
            }
        };

        log::log!(
            level,
            "seamless init: |F|={}, N={}, potential {} → {}, state {}, residual {}, pattern nnz {}",
            self.input.num_faces(),
            self.input.n,
            built.constraints.full_size(),
            built.constraints.reduced_size(),
            built.initial_solution.len(),
            built.residual_size,
            built.pattern.nnz()
        );
        log::log!(
            level,
            "field mean length {:.6e}, parameterization length {:.6e}, initial integrability {:.6e}",
            built.scale.mean_norm,
            built.scale.param_length,
            built.initial_integrability
        );

        self.state = Some(built);
        Ok(())
    }

    fn initial_solution(&self) -> Result<Vec<f64>, SeamlessError> {
        Ok(self.initialized()?.initial_solution.clone())
    }

    fn objective_jacobian(
        &self,
        x: &[f64],
        compute_jacobian: bool,
    ) -> Result<Evaluation, SeamlessError> {
        self.initialized()?.operators.evaluate(x, compute_jacobian)
    }

    fn jacobian_pattern(&self) -> Result<CsMat<f64>, SeamlessError> {
        Ok(self.initialized()?.pattern.clone())
    }

    fn x_size(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.initial_solution.len())
    }

    fn residual_size(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.residual_size)
    }
}
