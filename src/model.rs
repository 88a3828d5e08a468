//! Categorical Hidden Markov Model fitted by expectation-maximization
//!
//! Each hidden state emits the five observed variables independently, so the
//! emission likelihood of a row is a product of five two-category
//! distributions. The observation rows form a single sequence in table order.

use crate::data::{ObservationTable, Variable};
use crate::error::ModelFitError;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

/// Number of hidden states in the model.
pub const NUM_STATES: usize = 4;

/// Categories per observed variable.
pub const NUM_CATEGORIES: usize = 2;

/// Tolerance used when checking that probability vectors sum to one.
pub const STOCHASTIC_TOLERANCE: f64 = 1e-6;

/// Expected occupancy below which a state keeps its previous parameters.
const MIN_OCCUPANCY: f64 = 1e-12;

/// Category codes of one observation row.
pub type Codes = [usize; Variable::COUNT];

/// Fitted (or starting) HMM parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct HmmParams {
    initial: Array1<f64>,
    transition: Array2<f64>,
    /// Indexed `[state, variable, category]`.
    emissions: Array3<f64>,
}

impl HmmParams {
    /// Build a parameter set, checking shapes and stochastic constraints.
    pub fn new(
        initial: Array1<f64>,
        transition: Array2<f64>,
        emissions: Array3<f64>,
    ) -> Result<Self, ModelFitError> {
        let n = initial.len();
        if n == 0 {
            return Err(ModelFitError::InvalidParameters(
                "model needs at least one state".to_string(),
            ));
        }
        if transition.dim() != (n, n) {
            return Err(ModelFitError::InvalidParameters(format!(
                "transition matrix is {:?}, expected ({n}, {n})",
                transition.dim()
            )));
        }
        if emissions.dim() != (n, Variable::COUNT, NUM_CATEGORIES) {
            return Err(ModelFitError::InvalidParameters(format!(
                "emission array is {:?}, expected ({n}, {}, {NUM_CATEGORIES})",
                emissions.dim(),
                Variable::COUNT
            )));
        }

        let params = Self {
            initial,
            transition,
            emissions,
        };
        params.validate(STOCHASTIC_TOLERANCE)?;
        Ok(params)
    }

    pub fn num_states(&self) -> usize {
        self.initial.len()
    }

    /// Probability of each state at the first observation.
    pub fn initial(&self) -> &Array1<f64> {
        &self.initial
    }

    /// Row-stochastic matrix: `transition[[i, j]]` is P(next = j | current = i).
    pub fn transition(&self) -> &Array2<f64> {
        &self.transition
    }

    /// Emission distribution of one variable in one state, indexed by
    /// category code.
    pub fn emission(&self, state: usize, variable: Variable) -> [f64; NUM_CATEGORIES] {
        let v = variable.index();
        [self.emissions[[state, v, 0]], self.emissions[[state, v, 1]]]
    }

    /// P(variable = category | state).
    pub fn prob_of(&self, state: usize, variable: Variable, category: usize) -> f64 {
        self.emissions[[state, variable.index(), category]]
    }

    fn emission_likelihood(&self, state: usize, codes: &Codes) -> f64 {
        codes
            .iter()
            .enumerate()
            .map(|(v, &category)| self.emissions[[state, v, category]])
            .product()
    }

    /// Check that the initial vector, every transition row and every
    /// emission distribution is a probability vector.
    pub fn validate(&self, tolerance: f64) -> Result<(), ModelFitError> {
        check_distribution("initial state probabilities", self.initial.view(), tolerance)?;

        for (i, row) in self.transition.outer_iter().enumerate() {
            check_distribution(&format!("transition row {i}"), row, tolerance)?;
        }

        for state in 0..self.num_states() {
            for variable in Variable::ALL {
                check_distribution(
                    &format!("state {state} emissions for {variable}"),
                    self.emissions.slice(s![state, variable.index(), ..]),
                    tolerance,
                )?;
            }
        }

        Ok(())
    }
}

fn check_distribution(
    what: &str,
    values: ArrayView1<f64>,
    tolerance: f64,
) -> Result<(), ModelFitError> {
    if let Some(bad) = values.iter().find(|p| !p.is_finite() || **p < 0.0) {
        return Err(ModelFitError::InvalidParameters(format!(
            "{what} contains {bad}"
        )));
    }
    let sum = values.sum();
    if (sum - 1.0).abs() > tolerance {
        return Err(ModelFitError::InvalidParameters(format!(
            "{what} sums to {sum}, expected 1.0"
        )));
    }
    Ok(())
}

/// EM settings. The seed is the only source of randomness in a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub max_iterations: usize,
    /// Relative log-likelihood change that counts as converged.
    pub tolerance: f64,
    pub seed: u64,
    /// Random starting points to try; the best likelihood wins.
    pub restarts: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            tolerance: 1e-6,
            seed: 123,
            restarts: 1,
        }
    }
}

/// Result of a successful fit.
#[derive(Debug, Clone)]
pub struct FittedHmm {
    pub params: HmmParams,
    pub log_likelihood: f64,
    pub iterations: usize,
    /// Most likely state sequence (Viterbi), one entry per observation.
    pub states: Vec<usize>,
    /// Posterior state probabilities, shape `(observations, states)`.
    pub posteriors: Array2<f64>,
}

impl FittedHmm {
    pub fn n_observations(&self) -> usize {
        self.states.len()
    }

    /// Free parameters: initial, transition and emission probabilities,
    /// each less its sum-to-one constraint.
    pub fn num_parameters(&self) -> usize {
        let n = self.params.num_states();
        (n - 1) + n * (n - 1) + n * Variable::COUNT * (NUM_CATEGORIES - 1)
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.num_parameters() as f64
    }

    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood
            + self.num_parameters() as f64 * (self.n_observations() as f64).ln()
    }

    /// Number of observations decoded into each state.
    pub fn state_occupancy(&self) -> Vec<usize> {
        let mut counts = vec![0; self.params.num_states()];
        for &state in &self.states {
            counts[state] += 1;
        }
        counts
    }
}

/// Fit a `NUM_STATES`-state HMM to the observation table.
///
/// A variable observed with a single level is accepted and fits with
/// probability 0 for the other level.
///
/// # Arguments
/// * `table` - Prepared observations, treated as one sequence in row order
/// * `config` - Iteration cap, convergence tolerance, seed and restarts
///
/// # Returns
/// * Fitted `FittedHmm` with decoded states and posteriors, or
///   `ModelFitError` when the table is too small, EM hits the iteration cap,
///   or the likelihood degenerates
pub fn fit_hmm(table: &ObservationTable, config: &FitConfig) -> Result<FittedHmm, ModelFitError> {
    if table.is_empty() {
        return Err(ModelFitError::EmptyInput);
    }
    if table.len() < NUM_STATES {
        return Err(ModelFitError::TooFewObservations {
            observations: table.len(),
            states: NUM_STATES,
        });
    }
    if config.max_iterations == 0 || config.tolerance.is_nan() || config.tolerance <= 0.0 {
        return Err(ModelFitError::InvalidParameters(format!(
            "max_iterations must be positive and tolerance > 0 (got {} and {})",
            config.max_iterations, config.tolerance
        )));
    }

    for variable in Variable::ALL {
        let counts = table.level_counts(variable);
        if counts.contains(&0) {
            warn!(
                variable = variable.name(),
                ?counts,
                "only one level observed; the other level will fit with probability 0"
            );
        }
    }

    let observations = table.codes();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(HmmParams, f64, usize)> = None;
    let mut last_error = None;

    for restart in 0..config.restarts.max(1) {
        let start = random_start(&mut rng);
        match run_em(start, &observations, config) {
            Ok((params, log_likelihood, iterations)) => {
                debug!(restart, log_likelihood, iterations, "EM run converged");
                if best.as_ref().map_or(true, |(_, ll, _)| log_likelihood > *ll) {
                    best = Some((params, log_likelihood, iterations));
                }
            }
            Err(err) => {
                warn!(restart, error = %err, "EM run failed");
                last_error = Some(err);
            }
        }
    }

    let (params, log_likelihood, iterations) = match best {
        Some(best) => best,
        None => {
            return Err(last_error.unwrap_or_else(|| {
                ModelFitError::NumericalInstability("no EM run completed".to_string())
            }))
        }
    };
    params.validate(STOCHASTIC_TOLERANCE)?;

    let states = decode(&params, &observations);
    let posteriors = posteriors(&params, &observations)?;

    info!(
        log_likelihood,
        iterations,
        observations = observations.len(),
        "HMM fitted"
    );

    Ok(FittedHmm {
        params,
        log_likelihood,
        iterations,
        states,
        posteriors,
    })
}

/// Iterate EM from one starting point until the relative likelihood change
/// drops below the tolerance.
fn run_em(
    mut params: HmmParams,
    observations: &[Codes],
    config: &FitConfig,
) -> Result<(HmmParams, f64, usize), ModelFitError> {
    let mut previous = f64::NEG_INFINITY;
    let mut last_change = f64::INFINITY;

    for iteration in 1..=config.max_iterations {
        let posterior = forward_backward(&params, observations)?;
        let log_likelihood = posterior.log_likelihood;
        if !log_likelihood.is_finite() {
            return Err(ModelFitError::NumericalInstability(format!(
                "log-likelihood became {log_likelihood} at iteration {iteration}"
            )));
        }
        debug!(iteration, log_likelihood, "EM iteration");

        if previous.is_finite() {
            last_change = (log_likelihood - previous).abs() / log_likelihood.abs().max(f64::MIN_POSITIVE);
            if last_change <= config.tolerance {
                return Ok((params, log_likelihood, iteration));
            }
        }

        params = maximize(&params, observations, &posterior);
        previous = log_likelihood;
    }

    Err(ModelFitError::NotConverged {
        iterations: config.max_iterations,
        last_change,
    })
}

fn random_start(rng: &mut StdRng) -> HmmParams {
    let n = NUM_STATES;
    let initial = Array1::from_elem(n, 1.0 / n as f64);

    let mut transition = Array2::from_shape_fn((n, n), |_| rng.gen_range(0.5..1.5));
    normalize_rows(&mut transition);

    let mut emissions = Array3::zeros((n, Variable::COUNT, NUM_CATEGORIES));
    for state in 0..n {
        for v in 0..Variable::COUNT {
            let p: f64 = rng.gen_range(0.1..0.9);
            emissions[[state, v, 0]] = 1.0 - p;
            emissions[[state, v, 1]] = p;
        }
    }

    HmmParams {
        initial,
        transition,
        emissions,
    }
}

fn normalize_rows(matrix: &mut Array2<f64>) {
    for mut row in matrix.outer_iter_mut() {
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

/// E-step output.
struct Posterior {
    /// P(state at t = i | all observations), shape `(T, N)`.
    gamma: Array2<f64>,
    /// Expected transition counts summed over time, shape `(N, N)`.
    xi: Array2<f64>,
    log_likelihood: f64,
}

/// Likelihood of every observation under every state, shape `(T, N)`.
fn emission_matrix(params: &HmmParams, observations: &[Codes]) -> Array2<f64> {
    Array2::from_shape_fn((observations.len(), params.num_states()), |(t, state)| {
        params.emission_likelihood(state, &observations[t])
    })
}

/// Scaled forward-backward pass.
fn forward_backward(params: &HmmParams, observations: &[Codes]) -> Result<Posterior, ModelFitError> {
    let steps = observations.len();
    if steps == 0 {
        return Err(ModelFitError::EmptyInput);
    }
    let n = params.num_states();
    let a = &params.transition;
    let b = emission_matrix(params, observations);

    let mut alpha = Array2::<f64>::zeros((steps, n));
    let mut scale = Array1::<f64>::zeros(steps);
    for t in 0..steps {
        for j in 0..n {
            let prior = if t == 0 {
                params.initial[j]
            } else {
                (0..n).map(|i| alpha[[t - 1, i]] * a[[i, j]]).sum::<f64>()
            };
            alpha[[t, j]] = prior * b[[t, j]];
        }
        let c = alpha.row(t).sum();
        if c <= 0.0 || !c.is_finite() {
            return Err(ModelFitError::NumericalInstability(format!(
                "observation {t} has zero likelihood under every state"
            )));
        }
        alpha.row_mut(t).mapv_inplace(|x| x / c);
        scale[t] = c;
    }

    let mut beta = Array2::<f64>::ones((steps, n));
    for t in (0..steps - 1).rev() {
        for i in 0..n {
            beta[[t, i]] = (0..n)
                .map(|j| a[[i, j]] * b[[t + 1, j]] * beta[[t + 1, j]])
                .sum::<f64>()
                / scale[t + 1];
        }
    }

    let mut gamma = &alpha * &beta;
    normalize_rows(&mut gamma);

    let mut xi = Array2::<f64>::zeros((n, n));
    for t in 0..steps - 1 {
        for i in 0..n {
            for j in 0..n {
                xi[[i, j]] += alpha[[t, i]] * a[[i, j]] * b[[t + 1, j]] * beta[[t + 1, j]] / scale[t + 1];
            }
        }
    }

    let log_likelihood = scale.iter().map(|c| c.ln()).sum::<f64>();
    Ok(Posterior {
        gamma,
        xi,
        log_likelihood,
    })
}

/// M-step: closed-form re-estimation from the E-step expectations.
fn maximize(current: &HmmParams, observations: &[Codes], posterior: &Posterior) -> HmmParams {
    let n = current.num_states();
    let initial = posterior.gamma.row(0).to_owned();

    let mut transition = current.transition.clone();
    for i in 0..n {
        let outgoing = posterior.xi.row(i).sum();
        if outgoing > MIN_OCCUPANCY {
            transition.row_mut(i).assign(&(&posterior.xi.row(i) / outgoing));
        }
    }

    let occupancy = posterior.gamma.sum_axis(Axis(0));
    let mut emissions = current.emissions.clone();
    for state in 0..n {
        if occupancy[state] <= MIN_OCCUPANCY {
            continue;
        }
        let mut counts = Array2::<f64>::zeros((Variable::COUNT, NUM_CATEGORIES));
        for (t, codes) in observations.iter().enumerate() {
            let weight = posterior.gamma[[t, state]];
            for (v, &category) in codes.iter().enumerate() {
                counts[[v, category]] += weight;
            }
        }
        for v in 0..Variable::COUNT {
            let total = counts.row(v).sum();
            for k in 0..NUM_CATEGORIES {
                emissions[[state, v, k]] = counts[[v, k]] / total;
            }
        }
    }

    HmmParams {
        initial,
        transition,
        emissions,
    }
}

/// Posterior state probabilities for each observation, shape
/// `(observations, states)`.
pub fn posteriors(params: &HmmParams, observations: &[Codes]) -> Result<Array2<f64>, ModelFitError> {
    Ok(forward_backward(params, observations)?.gamma)
}

/// Most likely hidden state sequence (Viterbi, in log space).
pub fn decode(params: &HmmParams, observations: &[Codes]) -> Vec<usize> {
    let steps = observations.len();
    if steps == 0 {
        return Vec::new();
    }
    let n = params.num_states();
    let log_a = params.transition.mapv(f64::ln);
    let log_b = emission_matrix(params, observations).mapv(f64::ln);

    let mut delta = Array2::from_elem((steps, n), f64::NEG_INFINITY);
    let mut backpointer = Array2::<usize>::zeros((steps, n));
    for state in 0..n {
        delta[[0, state]] = params.initial[state].ln() + log_b[[0, state]];
    }

    for t in 1..steps {
        for j in 0..n {
            let (best_prev, best) = (0..n)
                .map(|i| (i, delta[[t - 1, i]] + log_a[[i, j]]))
                .fold((0, f64::NEG_INFINITY), |acc, candidate| {
                    if candidate.1 > acc.1 {
                        candidate
                    } else {
                        acc
                    }
                });
            delta[[t, j]] = best + log_b[[t, j]];
            backpointer[[t, j]] = best_prev;
        }
    }

    let mut path = vec![0; steps];
    path[steps - 1] = argmax(delta.row(steps - 1));
    for t in (1..steps).rev() {
        path[t - 1] = backpointer[[t, path[t]]];
    }
    path
}

fn argmax(values: ArrayView1<f64>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}
