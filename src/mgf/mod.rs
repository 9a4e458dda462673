//! Moment generating functions for per-timestep work distributions.
//!
//! An MGF encodes the distribution of work arriving in one discrete
//! timestep: with probability `p` a request arrives and contributes work
//! drawn from a request-size distribution, otherwise the step is empty.
//! If `mgf_inc` is the MGF of the request-size distribution, the overall
//! MGF is `p * mgf_inc(theta) + (1 - p)`.
//!
//! Request-size parameters are fitted incrementally from trace samples via
//! [`Mgf::add_sample`]; the request probability comes from the arrival rate
//! via [`Mgf::set_prob_request`].

use std::cell::RefCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::trace::ProcessedTraceEntry;

/// Large fallback rate used before any sample has been observed.
const DEFAULT_LAMBDA: f64 = 1e6;

/// A fitted per-timestep work MGF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mgf {
    /// Probability of a request arriving in a timestep.
    #[serde(default)]
    p: f64,
    #[serde(flatten)]
    kind: MgfKind,
}

/// Request-size distribution families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum MgfKind {
    /// Every request has the running mean size.
    #[serde(rename_all = "camelCase")]
    Deterministic {
        total_size: f64,
        count: u64,
        mean_size: f64,
    },
    /// Exponential sizes with rate fitted to the sample mean.
    #[serde(rename_all = "camelCase")]
    Exponential {
        total_size: f64,
        count: u64,
        lambda: f64,
    },
    /// Two-phase hyperexponential moment-matched on mean and variance.
    #[serde(rename_all = "camelCase")]
    Hyperexponential {
        mean_size: f64,
        var_sum_size: f64,
        count: u64,
        lambda1: f64,
        lambda2: f64,
        prob1: f64,
    },
    /// Two-phase hyperexponential with the phases bound to gets and puts.
    #[serde(rename_all = "camelCase")]
    HyperexponentialGetPut {
        get_size: f64,
        put_size: f64,
        get_count: u64,
        put_count: u64,
        lambda1: f64,
        lambda2: f64,
        prob1: f64,
    },
    /// Empirical distribution over the observed sizes.
    #[serde(rename_all = "camelCase")]
    Empirical {
        sizes: Vec<f64>,
        #[serde(skip)]
        memo: RefCell<HashMap<u64, f64>>,
    },
}

impl Mgf {
    /// Deterministic request sizes at the running mean.
    pub fn deterministic() -> Self {
        Self {
            p: 0.0,
            kind: MgfKind::Deterministic {
                total_size: 0.0,
                count: 0,
                mean_size: 0.0,
            },
        }
    }

    /// Exponential request sizes.
    pub fn exponential() -> Self {
        Self {
            p: 0.0,
            kind: MgfKind::Exponential {
                total_size: 0.0,
                count: 0,
                lambda: DEFAULT_LAMBDA,
            },
        }
    }

    /// Two-phase hyperexponential request sizes, moment-matched.
    pub fn hyperexponential() -> Self {
        Self {
            p: 0.0,
            kind: MgfKind::Hyperexponential {
                mean_size: 0.0,
                var_sum_size: 0.0,
                count: 0,
                lambda1: DEFAULT_LAMBDA,
                lambda2: DEFAULT_LAMBDA,
                prob1: 0.0,
            },
        }
    }

    /// Two-phase hyperexponential with get/put phases.
    pub fn hyperexponential_get_put() -> Self {
        Self {
            p: 0.0,
            kind: MgfKind::HyperexponentialGetPut {
                get_size: 0.0,
                put_size: 0.0,
                get_count: 0,
                put_count: 0,
                lambda1: DEFAULT_LAMBDA,
                lambda2: DEFAULT_LAMBDA,
                prob1: 0.0,
            },
        }
    }

    /// Empirical distribution directly over the trace sizes.
    pub fn empirical() -> Self {
        Self {
            p: 0.0,
            kind: MgfKind::Empirical {
                sizes: Vec::new(),
                memo: RefCell::new(HashMap::new()),
            },
        }
    }

    /// Set the probability of a request arriving in a timestep.
    pub fn set_prob_request(&mut self, p: f64) {
        self.p = p;
    }

    /// The configured per-timestep request probability.
    pub fn prob_request(&self) -> f64 {
        self.p
    }

    /// Incrementally fit the request-size distribution from one sample.
    pub fn add_sample(&mut self, entry: &ProcessedTraceEntry) {
        match &mut self.kind {
            MgfKind::Deterministic {
                total_size,
                count,
                mean_size,
            } => {
                *total_size += entry.work;
                *count += 1;
                *mean_size = *total_size / *count as f64;
            }
            MgfKind::Exponential {
                total_size,
                count,
                lambda,
            } => {
                *total_size += entry.work;
                *count += 1;
                *lambda = *count as f64 / *total_size;
            }
            MgfKind::Hyperexponential {
                mean_size,
                var_sum_size,
                count,
                lambda1,
                lambda2,
                prob1,
            } => {
                *count += 1;
                let n = *count as f64;
                *var_sum_size += (n - 1.0) * (entry.work - *mean_size)
                    * (entry.work - *mean_size)
                    / n;
                *mean_size += (entry.work - *mean_size) / n;
                let lambda_avg = 1.0 / *mean_size;
                let sample_var = *var_sum_size / (n - 1.0);
                let c2 = sample_var / (*mean_size * *mean_size);
                if c2.is_finite() && c2 >= 1.0 {
                    *lambda1 = lambda_avg / c2;
                    *lambda2 = lambda_avg * 2.0;
                    *prob1 = 1.0 / (2.0 * c2 - 1.0);
                } else {
                    *lambda1 = lambda_avg;
                    *lambda2 = lambda_avg;
                    *prob1 = 1.0;
                }
            }
            MgfKind::HyperexponentialGetPut {
                get_size,
                put_size,
                get_count,
                put_count,
                lambda1,
                lambda2,
                prob1,
            } => {
                if entry.is_get {
                    *get_size += entry.work;
                    *get_count += 1;
                    *lambda1 = *get_count as f64 / *get_size;
                } else {
                    *put_size += entry.work;
                    *put_count += 1;
                    *lambda2 = *put_count as f64 / *put_size;
                }
                *prob1 = *get_count as f64 / (*get_count + *put_count) as f64;
            }
            MgfKind::Empirical { sizes, memo } => {
                sizes.push(entry.work);
                memo.borrow_mut().clear();
            }
        }
    }

    /// Evaluate the MGF at the given theta, possibly `+inf`.
    pub fn calc(&self, theta: f64) -> f64 {
        let increment = match &self.kind {
            MgfKind::Deterministic { mean_size, .. } => (mean_size * theta).exp(),
            MgfKind::Exponential { lambda, .. } => {
                if theta < *lambda {
                    lambda / (lambda - theta)
                } else {
                    return f64::INFINITY;
                }
            }
            MgfKind::Hyperexponential {
                lambda1,
                lambda2,
                prob1,
                ..
            }
            | MgfKind::HyperexponentialGetPut {
                lambda1,
                lambda2,
                prob1,
                ..
            } => {
                if theta < *lambda1 && theta < *lambda2 {
                    prob1 * lambda1 / (lambda1 - theta)
                        + (1.0 - prob1) * lambda2 / (lambda2 - theta)
                } else {
                    return f64::INFINITY;
                }
            }
            MgfKind::Empirical { sizes, memo } => {
                if sizes.is_empty() {
                    return 1.0;
                }
                let key = theta.to_bits();
                let cached = memo.borrow().get(&key).copied();
                match cached {
                    Some(v) => v,
                    None => {
                        let sum: f64 = sizes.iter().map(|s| (s * theta).exp()).sum();
                        let v = sum / sizes.len() as f64;
                        memo.borrow_mut().insert(key, v);
                        v
                    }
                }
            }
        };
        self.p * increment + (1.0 - self.p)
    }
}
