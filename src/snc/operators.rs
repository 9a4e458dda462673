//! SNC operator algebra.
//!
//! Analysis combines operators into a DAG mirroring the queueing network and
//! collapses it into a latency bound. Arrival processes are upper-bounded and
//! service processes lower-bounded in the `(sigma, rho)` form: for a given
//! theta, the log-MGF of the cumulative process over `n` steps is within
//! `theta * (rho * n + sigma)`. Every operator therefore only needs to
//! produce `(sigma, rho)` at a requested theta.
//!
//! Operators whose two children share a flow id in their dependency sets are
//! *dependent*: their bound uses the Hoelder inequality with parameters
//! `(p, q)`, `1/p + 1/q = 1`. Any `p, q > 1` give a valid bound, so the
//! choice is an optimization problem; `p = q = 1` marks the independent case
//! and degenerates into the standard equations.
//!
//! Nodes live in a [`BoundArena`] built per analysis run and dropped with it.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::arrival::MmbpArrival;
use super::search::min_search;
use super::STEP_SIZE;
use crate::calculus::FlowId;

/// Sorted set of flow ids a bound depends on.
///
/// Two bounds are dependent iff their sets intersect, checked with a linear
/// merge walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepSet(Vec<FlowId>);

impl DepSet {
    /// Empty set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert a flow id, keeping the set sorted and duplicate-free.
    pub fn insert(&mut self, id: FlowId) {
        if let Err(pos) = self.0.binary_search(&id) {
            self.0.insert(pos, id);
        }
    }

    /// Union with another set.
    pub fn extend(&mut self, other: &DepSet) {
        for &id in &other.0 {
            self.insert(id);
        }
    }

    /// Insert every id in the slice.
    pub fn extend_from_slice(&mut self, ids: &[FlowId]) {
        for &id in ids {
            self.insert(id);
        }
    }

    /// True if the two sets share any flow id.
    pub fn intersects(&self, other: &DepSet) -> bool {
        let (a, b) = (&self.0, &other.0);
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i] == b[j] {
                return true;
            } else if a[i] < b[j] {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// True if the set contains the given flow id.
    pub fn contains(&self, id: FlowId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// True if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of flow ids in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Hoelder parameters of one bound, with the bracket the optimizer searches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoelderParams {
    p: f64,
    q: f64,
    lower_p: f64,
    upper_p: f64,
    lower_q: f64,
    upper_q: f64,
}

impl Default for HoelderParams {
    fn default() -> Self {
        // Independent marker: p = q = 1 with a collapsed bracket.
        Self {
            p: 1.0,
            q: 1.0,
            lower_p: 1.0,
            upper_p: 1.0,
            lower_q: 1.0,
            upper_q: 1.0,
        }
    }
}

impl HoelderParams {
    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn q(&self) -> f64 {
        self.q
    }

    /// Set `p`, deriving `q` from `1/p + 1/q = 1`. Values at or below 1
    /// reset the bound to independent.
    pub fn set_p(&mut self, p: f64) {
        if p <= 1.0 {
            *self = Self::default();
        } else {
            self.p = p;
            self.q = 1.0 / (1.0 - 1.0 / p);
        }
    }

    /// Set `q`, deriving `p` from `1/p + 1/q = 1`. Values at or below 1
    /// reset the bound to independent.
    pub fn set_q(&mut self, q: f64) {
        if q <= 1.0 {
            *self = Self::default();
        } else {
            self.p = 1.0 / (1.0 - 1.0 / q);
            self.q = q;
        }
    }

    /// Reset the optimization bracket to its initial search range.
    pub fn reset_opt_bounds(&mut self) {
        self.lower_p = 1.001;
        self.upper_p = 2.0;
        self.lower_q = 1.001;
        self.upper_q = 2.0;
        self.set_p(2.0);
    }
}

/// Index of a node within a [`BoundArena`].
pub type NodeId = usize;

#[derive(Debug)]
enum NodeKind<'a> {
    /// Leaf arrival process from a fitted traffic model.
    Mmbp(&'a MmbpArrival),
    /// Constant-rate service; `rho` is pre-scaled by the timestep.
    ConstantService { rho: f64 },
    /// Aggregate of two arrival processes.
    AggregateArrival { a: NodeId, b: NodeId },
    /// Convolution of two tandem service processes.
    ConvolutionService { s: NodeId, t: NodeId },
    /// Departure process of an arrival after passing through a service.
    OutputArrival { a: NodeId, s: NodeId },
    /// Service remaining once an arrival has been accounted for.
    LeftoverService { a: NodeId, s: NodeId },
}

#[derive(Debug)]
struct BoundNode<'a> {
    kind: NodeKind<'a>,
    deps: DepSet,
    hoelder: HoelderParams,
    /// This node (if dependent) followed by the dependent nodes beneath it.
    dependent: Vec<NodeId>,
}

/// Arena of operator nodes for one analysis run.
///
/// Composite nodes reference children by index; dropping the arena releases
/// the whole DAG at end of run.
#[derive(Debug, Default)]
pub struct BoundArena<'a> {
    nodes: Vec<BoundNode<'a>>,
}

impl<'a> BoundArena<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf node for a fitted arrival model.
    pub fn mmbp(&mut self, arrival: &'a MmbpArrival) -> NodeId {
        self.push(BoundNode {
            kind: NodeKind::Mmbp(arrival),
            deps: arrival.dependencies().clone(),
            hoelder: HoelderParams::default(),
            dependent: Vec::new(),
        })
    }

    /// Constant service with `bandwidth` work units per second.
    pub fn constant_service(&mut self, bandwidth: f64) -> NodeId {
        self.push(BoundNode {
            kind: NodeKind::ConstantService {
                rho: -(bandwidth * STEP_SIZE),
            },
            deps: DepSet::new(),
            hoelder: HoelderParams::default(),
            dependent: Vec::new(),
        })
    }

    /// Aggregate of two arrival processes.
    pub fn aggregate_arrival(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.compose(a, b, |a, b| NodeKind::AggregateArrival { a, b })
    }

    /// Convolution of two tandem service processes.
    pub fn convolution_service(&mut self, s: NodeId, t: NodeId) -> NodeId {
        self.compose(s, t, |s, t| NodeKind::ConvolutionService { s, t })
    }

    /// Departure bound of arrival `a` leaving a queue with service `s`.
    pub fn output_arrival(&mut self, a: NodeId, s: NodeId) -> NodeId {
        self.compose(a, s, |a, s| NodeKind::OutputArrival { a, s })
    }

    /// Service left over at a queue once arrival `a` is accounted for.
    pub fn leftover_service(&mut self, a: NodeId, s: NodeId) -> NodeId {
        self.compose(a, s, |a, s| NodeKind::LeftoverService { a, s })
    }

    /// Dependency set of a node.
    pub fn deps(&self, id: NodeId) -> &DepSet {
        &self.nodes[id].deps
    }

    /// True if the two nodes share a flow id in their dependency sets.
    pub fn check_dependence(&self, a: NodeId, b: NodeId) -> bool {
        self.nodes[a].deps.intersects(&self.nodes[b].deps)
    }

    fn push(&mut self, node: BoundNode<'a>) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn compose(
        &mut self,
        left: NodeId,
        right: NodeId,
        kind: impl FnOnce(NodeId, NodeId) -> NodeKind<'a>,
    ) -> NodeId {
        let id = self.nodes.len();
        let is_dependent = self.check_dependence(left, right);

        let mut hoelder = HoelderParams::default();
        let mut dependent = Vec::new();
        if is_dependent {
            hoelder.reset_opt_bounds();
            dependent.push(id);
        }
        dependent.extend_from_slice(&self.nodes[left].dependent);
        dependent.extend_from_slice(&self.nodes[right].dependent);

        let mut deps = self.nodes[left].deps.clone();
        deps.extend(&self.nodes[right].deps);

        self.push(BoundNode {
            kind: kind(left, right),
            deps,
            hoelder,
            dependent,
        })
    }

    /// Evaluate a node's `(sigma, rho)` bound at the given theta.
    pub fn calc_bound(&self, id: NodeId, theta: f64) -> (f64, f64) {
        let node = &self.nodes[id];
        let (p, q) = (node.hoelder.p(), node.hoelder.q());
        match node.kind {
            NodeKind::Mmbp(arrival) => arrival.calc_bound(theta),
            NodeKind::ConstantService { rho } => (0.0, rho),
            NodeKind::AggregateArrival { a, b } => {
                let (sigma_a, rho_a) = self.calc_bound(a, p * theta);
                let (sigma_b, rho_b) = self.calc_bound(b, q * theta);
                (sigma_a + sigma_b, rho_a + rho_b)
            }
            NodeKind::ConvolutionService { s, t } => {
                let (sigma_s, mut rho_s) = self.calc_bound(s, p * theta);
                let (sigma_t, rho_t) = self.calc_bound(t, q * theta);
                // Equal rates would put log(0) in the sigma term.
                if rho_s == rho_t {
                    rho_s *= 0.99;
                }
                let sigma = sigma_s + sigma_t
                    - (1.0 - (-theta * (rho_s - rho_t).abs()).exp()).ln() / theta;
                (sigma, rho_s.max(rho_t))
            }
            NodeKind::OutputArrival { a, s } => {
                let (sigma_a, rho_a) = self.calc_bound(a, p * theta);
                let (sigma_s, rho_s) = self.calc_bound(s, q * theta);
                // The output bound only exists for a stable queue.
                let sigma = if rho_a + rho_s < 0.0 {
                    sigma_a + sigma_s - (1.0 - (theta * (rho_a + rho_s)).exp()).ln() / theta
                } else {
                    f64::INFINITY
                };
                (sigma, rho_a)
            }
            NodeKind::LeftoverService { a, s } => {
                let (sigma_a, rho_a) = self.calc_bound(a, p * theta);
                let (sigma_s, rho_s) = self.calc_bound(s, q * theta);
                (sigma_a + sigma_s, rho_a + rho_s)
            }
        }
    }
}

/// Which Hoelder parameters a dependent slot refers to.
#[derive(Debug, Clone, Copy)]
enum Slot {
    /// The latency bound's own parameters.
    Root,
    /// An arena node's parameters.
    Node(NodeId),
}

/// Upper bound on the latency of arrival `A` through service `S`.
///
/// For the configured tail probability epsilon,
/// `Pr[latency > calc_latency()] < epsilon`.
pub struct LatencyBound<'m, 'a> {
    arena: &'m mut BoundArena<'a>,
    arrival: NodeId,
    service: NodeId,
    epsilon: f64,
    hoelder: HoelderParams,
    dependent: Vec<Slot>,
}

impl<'m, 'a> LatencyBound<'m, 'a> {
    pub fn new(
        arena: &'m mut BoundArena<'a>,
        arrival: NodeId,
        service: NodeId,
        epsilon: f64,
    ) -> Self {
        let mut hoelder = HoelderParams::default();
        let mut dependent = Vec::new();
        if arena.check_dependence(arrival, service) {
            hoelder.reset_opt_bounds();
            dependent.push(Slot::Root);
        }
        dependent.extend(arena.nodes[arrival].dependent.iter().map(|&n| Slot::Node(n)));
        dependent.extend(arena.nodes[service].dependent.iter().map(|&n| Slot::Node(n)));

        Self {
            arena,
            arrival,
            service,
            epsilon,
            hoelder,
            dependent,
        }
    }

    /// Number of dependent sub-bounds subject to Hoelder optimization.
    pub fn dependent_count(&self) -> usize {
        self.dependent.len()
    }

    /// Latency bound at a specific theta. Any positive theta yields a valid
    /// (possibly loose) bound; instability or log-domain violations yield
    /// `+inf`.
    pub fn calc_latency_at(&self, theta: f64) -> f64 {
        let (sigma_a, rho_a) = self.arena.calc_bound(self.arrival, self.hoelder.p() * theta);
        let (sigma_s, rho_s) = self.arena.calc_bound(self.service, self.hoelder.q() * theta);
        if !(rho_a.is_finite() && rho_s.is_finite()) {
            return f64::INFINITY;
        }
        if rho_a + rho_s >= 0.0 || rho_s >= 0.0 {
            return f64::INFINITY;
        }
        let inner = self.epsilon * (1.0 - (theta * (rho_a + rho_s)).exp());
        if inner <= 0.0 || inner > 1.0 {
            return f64::INFINITY;
        }
        let latency = (inner.ln() / theta - (sigma_a + sigma_s)) / rho_s * STEP_SIZE;
        if latency.is_nan() {
            return f64::INFINITY;
        }
        latency
    }

    /// Search for the theta producing the tightest latency bound.
    fn calc_theta(&self) -> f64 {
        const MIN_THETA: f64 = 1e-9;
        const INITIAL_THETA: f64 = 1000.0;
        const STEP_DECREASE_FACTOR: f64 = 10.0;

        let mut theta = INITIAL_THETA;
        let mut step = INITIAL_THETA / STEP_DECREASE_FACTOR;
        while step >= MIN_THETA {
            theta = min_search(
                (theta - STEP_DECREASE_FACTOR * step).max(MIN_THETA),
                theta + STEP_DECREASE_FACTOR * step,
                step,
                |t| self.calc_latency_at(t),
            );
            step /= STEP_DECREASE_FACTOR;
        }
        theta
    }

    /// Latency bound at the optimized theta.
    pub fn calc_latency(&self) -> f64 {
        self.calc_latency_at(self.calc_theta())
    }

    /// Optimize the Hoelder parameters of all dependent sub-bounds, then
    /// return the best latency found. Uses a fixed-seed random search so
    /// repeated calls on the same inputs agree.
    pub fn dependency_optimization(&mut self) -> f64 {
        const SEARCH_RANGE_DECREASE_COUNT: usize = 25;
        const SEARCH_RANGE_DECREASE_FACTOR: f64 = 1.2;

        let mut min_latency = self.calc_latency();
        if self.dependent.is_empty() {
            return min_latency;
        }
        let iteration_count = self.dependent.len() * 10;

        let mut best_p: Vec<f64> = (0..self.dependent.len())
            .map(|i| self.slot(self.dependent[i]).p())
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..SEARCH_RANGE_DECREASE_COUNT {
            // Randomly sample p/q assignments within the current brackets.
            for _ in 0..iteration_count {
                for i in 0..self.dependent.len() {
                    let slot = self.dependent[i];
                    let params = self.slot(slot);
                    let range_p = params.upper_p - params.lower_p;
                    let range_q = params.upper_q - params.lower_q;
                    let r = rng.gen::<f64>() * (range_p + range_q);
                    let params = self.slot_mut(slot);
                    if r <= range_p {
                        let lower_p = params.lower_p;
                        params.set_p(lower_p + r);
                    } else {
                        let lower_q = params.lower_q;
                        params.set_q(lower_q + (r - range_p));
                    }
                }
                let latency = self.calc_latency();
                if latency < min_latency {
                    min_latency = latency;
                    for (i, best) in best_p.iter_mut().enumerate() {
                        *best = self.slot(self.dependent[i]).p();
                    }
                }
            }
            // Recenter each bracket on its best value and shrink it.
            for i in 0..self.dependent.len() {
                let slot = self.dependent[i];
                let params = self.slot_mut(slot);
                let range_p = (params.upper_p - params.lower_p) / SEARCH_RANGE_DECREASE_FACTOR;
                let range_q = (params.upper_q - params.lower_q) / SEARCH_RANGE_DECREASE_FACTOR;
                params.set_p(best_p[i]);
                params.lower_p = (params.p() - range_p / 2.0).max(1.001);
                params.upper_p = params.lower_p + range_p;
                params.lower_q = (params.q() - range_q / 2.0).max(1.001);
                params.upper_q = params.lower_q + range_q;
            }
        }
        min_latency
    }

    fn slot(&self, slot: Slot) -> &HoelderParams {
        match slot {
            Slot::Root => &self.hoelder,
            Slot::Node(id) => &self.arena.nodes[id].hoelder,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut HoelderParams {
        match slot {
            Slot::Root => &mut self.hoelder,
            Slot::Node(id) => &mut self.arena.nodes[id].hoelder,
        }
    }
}
