//! Markov-modulated Bernoulli arrival model fitted from a trace.
//!
//! An MMBP is the discrete-time analogue of a Markov-modulated Poisson
//! process: a finite state machine where each state draws per-step arrivals
//! at its own rate, capturing periods of burstiness in a flow. Fitting runs
//! top-down:
//!
//! 1. split the trace into fixed-width intervals and count arrivals,
//! 2. assign each interval an MMBP state via the LAMBDA rate-segmentation,
//! 3. estimate the state transition matrix,
//! 4. fit one work MGF per state from the samples landing in its intervals.
//!
//! The `(sigma, rho)` bound comes from the spectral radius of
//! `Diag(MGFs(theta)) * T`.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::operators::DepSet;
use super::search::binary_search_reverse;
use super::STEP_SIZE;
use crate::calculus::FlowId;
use crate::mgf::Mgf;
use crate::trace::ProcessedTrace;

/// Interval width used to segment a trace, in nanoseconds.
const INTERVAL_WIDTH_NS: u64 = 1_000_000_000;

/// Maximum number of MMBP states.
const MAX_NUM_STATES: usize = 10;

/// Fitted MMBP arrival process of one flow.
///
/// The dependency set is local to a registry instance and is not part of the
/// serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmbpArrival {
    /// `transition_matrix[from][to]` is the per-step transition probability.
    #[serde(rename = "transitionMatrix")]
    transition_matrix: Vec<Vec<f64>>,
    /// Per-state work MGF.
    #[serde(rename = "MGFs")]
    mgfs: Vec<Mgf>,
    #[serde(skip)]
    dependencies: DepSet,
}

impl MmbpArrival {
    /// Fit an MMBP from a processed trace.
    pub fn from_trace(trace: &mut ProcessedTrace) -> Self {
        let intervals = count_arrival_intervals(trace);
        let (states, lambdas) = determine_states_lambda(&intervals);
        let transition_matrix = init_transition_matrix(lambdas.len(), &states);
        let mgfs = init_mgfs(trace, lambdas.len(), &states, &lambdas);
        Self {
            transition_matrix,
            mgfs,
            dependencies: DepSet::new(),
        }
    }

    /// Build an MMBP directly from a transition matrix and per-state MGFs.
    pub fn from_parts(transition_matrix: Vec<Vec<f64>>, mgfs: Vec<Mgf>) -> Self {
        Self {
            transition_matrix,
            mgfs,
            dependencies: DepSet::new(),
        }
    }

    /// Number of MMBP states.
    pub fn num_states(&self) -> usize {
        self.mgfs.len()
    }

    /// The fitted state transition matrix.
    pub fn transition_matrix(&self) -> &[Vec<f64>] {
        &self.transition_matrix
    }

    /// Flow ids this arrival depends on.
    pub fn dependencies(&self) -> &DepSet {
        &self.dependencies
    }

    /// Record a dependency on a flow.
    pub fn add_dependency(&mut self, flow_id: FlowId) {
        self.dependencies.insert(flow_id);
    }

    /// Record dependencies on several flows.
    pub fn add_dependencies(&mut self, flow_ids: &[FlowId]) {
        self.dependencies.extend_from_slice(flow_ids);
    }

    /// Spectral radius of `Diag(MGFs(theta)) * T`, `+inf` if any state MGF
    /// is non-finite at this theta.
    pub fn spectral_radius(&self, theta: f64) -> f64 {
        if self.mgfs.len() == 2 {
            self.spectral_radius_two_state(theta)
        } else {
            self.spectral_radius_generic(theta)
        }
    }

    /// Hand-solved eigenvalues for the two-state case.
    fn spectral_radius_two_state(&self, theta: f64) -> f64 {
        let m0 = self.mgfs[0].calc(theta);
        let m1 = self.mgfs[1].calc(theta);
        if !(m0.is_finite() && m1.is_finite()) {
            return f64::INFINITY;
        }
        let t = &self.transition_matrix;
        let x = t[0][0] * m0;
        let y = t[1][1] * m1;
        let disc = ((x - y) * (x - y) + 4.0 * t[0][1] * t[1][0] * m0 * m1).sqrt();
        let l1 = (x + y + disc) / 2.0;
        let l2 = (x + y - disc) / 2.0;
        l1.abs().max(l2.abs())
    }

    /// General n-state case via eigenvalues.
    fn spectral_radius_generic(&self, theta: f64) -> f64 {
        let n = self.mgfs.len();
        let mut m = DMatrix::<f64>::zeros(n, n);
        for from in 0..n {
            let state_mgf = self.mgfs[from].calc(theta);
            if !state_mgf.is_finite() {
                return f64::INFINITY;
            }
            for to in 0..n {
                m[(from, to)] = state_mgf * self.transition_matrix[from][to];
            }
        }
        m.complex_eigenvalues()
            .iter()
            .map(|ev| ev.norm())
            .fold(0.0, f64::max)
    }

    /// `(sigma, rho)` bound at the given theta.
    pub fn calc_bound(&self, theta: f64) -> (f64, f64) {
        (0.0, self.spectral_radius(theta).ln() / theta)
    }
}

/// Count the arrivals landing in each fixed-width interval of the trace.
fn count_arrival_intervals(trace: &mut ProcessedTrace) -> Vec<f64> {
    let mut intervals = Vec::new();
    let mut count = 0.0;
    let mut next_interval_ns = INTERVAL_WIDTH_NS;
    trace.reset();
    while let Some(entry) = trace.next_entry() {
        while entry.arrival_ns >= next_interval_ns {
            intervals.push(count);
            count = 0.0;
            next_interval_ns += INTERVAL_WIDTH_NS;
        }
        count += 1.0;
    }
    intervals.push(count);
    intervals
}

/// One pass of the LAMBDA recurrence: starting from the top rate implied by
/// `high` and confidence parameter `a`, walk a geometric sequence of rates
/// downwards, filling `lambdas` from the highest state. Returns the lower
/// confidence edge of the bottom rate, or `-inf` if the sequence dips under
/// `low` before all states are placed.
fn lambda_algorithm(a: f64, low: f64, high: f64, lambdas: &mut [f64]) -> f64 {
    let mut lambda = (high + a * a / 4.0).sqrt() - a / 2.0;
    lambda *= lambda;
    for state in (1..lambdas.len()).rev() {
        if lambda < low {
            return f64::NEG_INFINITY;
        }
        lambdas[state] = lambda;
        lambda = lambda.sqrt() - a;
        lambda *= lambda;
    }
    lambdas[0] = lambda;
    lambda - a * lambda.sqrt()
}

/// Segment interval counts into MMBP states.
///
/// Each state covers a band of arrival rates around its lambda, sized by the
/// confidence parameter `a` (in standard deviations). If the full complement
/// of states fits the observed range, `a` is tightened by binary search;
/// otherwise unused states are dropped. Returns the per-interval state
/// assignment and the state rates.
fn determine_states_lambda(intervals: &[f64]) -> (Vec<usize>, Vec<f64>) {
    let mut low = intervals[0];
    let mut high = intervals[0];
    for &count in intervals {
        low = low.min(count);
        high = high.max(count);
    }

    let mut lambdas = vec![0.0; MAX_NUM_STATES];
    let mut a = 2.0;
    if lambda_algorithm(a, low, high, &mut lambdas).is_finite() {
        // All states fit: search for the tightest confidence interval that
        // still covers the full rate range.
        a = binary_search_reverse(0.0, high, low, 0.01, |x| {
            lambda_algorithm(x, low, high, &mut lambdas)
        });
        lambda_algorithm(a, low, high, &mut lambdas);
    } else {
        // Fewer states suffice at this confidence: drop the unused slots.
        lambdas.retain(|&lambda| lambda > 0.0);
        if lambdas.is_empty() {
            // Constant-rate trace: a single state at the peak rate.
            lambdas.push(high);
        }
    }

    // Assign each interval the highest state whose lower confidence edge it
    // exceeds.
    let mut states = vec![0usize; intervals.len()];
    for (index, &count) in intervals.iter().enumerate() {
        for state in (1..lambdas.len()).rev() {
            let lambda = lambdas[state];
            if count > lambda - a * lambda.sqrt() {
                states[index] = state;
                break;
            }
        }
    }
    (states, lambdas)
}

/// Estimate the per-step state transition matrix from the interval states.
fn init_transition_matrix(num_states: usize, states: &[usize]) -> Vec<Vec<f64>> {
    let mut matrix = vec![vec![0.0; num_states]; num_states];
    let mut durations_ns = vec![0u64; num_states];

    let mut from = states[0];
    durations_ns[from] += INTERVAL_WIDTH_NS;
    for &to in &states[1..] {
        durations_ns[to] += INTERVAL_WIDTH_NS;
        matrix[from][to] += 1.0;
        from = to;
    }

    for state in 0..num_states {
        let mut state_steps = (durations_ns[state] as f64 / 1e9 / STEP_SIZE).floor();
        if state_steps == 0.0 {
            state_steps = 1.0;
        }
        matrix[state][state] = 0.0;
        let mut prob_transition = 0.0;
        for to in 0..num_states {
            matrix[state][to] /= state_steps;
            prob_transition += matrix[state][to];
        }
        matrix[state][state] = 1.0 - prob_transition;
    }
    matrix
}

/// Fit one MGF per state from the trace samples in that state's intervals,
/// then set each state's per-step request probability from its rate.
fn init_mgfs(
    trace: &mut ProcessedTrace,
    num_states: usize,
    states: &[usize],
    lambdas: &[f64],
) -> Vec<Mgf> {
    let mut mgfs: Vec<Mgf> = (0..num_states).map(|_| Mgf::exponential()).collect();

    let mut next_interval_ns = INTERVAL_WIDTH_NS;
    let mut interval_index = 0;
    trace.reset();
    while let Some(entry) = trace.next_entry() {
        while entry.arrival_ns >= next_interval_ns {
            interval_index += 1;
            next_interval_ns += INTERVAL_WIDTH_NS;
        }
        mgfs[states[interval_index]].add_sample(&entry);
    }

    let interval_width_secs = INTERVAL_WIDTH_NS as f64 / 1e9;
    for (state, mgf) in mgfs.iter_mut().enumerate() {
        mgf.set_prob_request(lambdas[state] * STEP_SIZE / interval_width_secs);
    }
    mgfs
}
