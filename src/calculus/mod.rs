//! Network-calculus registry: queues, flows, and clients.
//!
//! A queue models one congestion point, which on a full-bisection network is
//! a host link direction. A flow is a stream of requests crossing an ordered
//! list of queues. A client (tenant) is an ordered set of flows with an
//! end-to-end latency SLO. The registry owns all records, keeps the
//! name/id tables, and runs the latency analyses over the topology.

pub mod analysis;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snc::arrival::MmbpArrival;

pub type FlowId = u32;
pub type ClientId = u32;
pub type QueueId = u32;

/// A stream of requests traversing one or more queues.
///
/// Topology is immutable after creation; `priority` and `latency` are
/// overwritten by priority assignment and analysis runs.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub client_id: ClientId,
    /// Ordered queues visited by the flow.
    pub queue_ids: Vec<QueueId>,
    /// Lower value = higher priority.
    pub priority: u32,
    /// Latest computed latency bound in seconds.
    pub latency: f64,
    /// Tail probability budget for this flow's latency bound.
    pub epsilon: f64,
    /// Fitted arrival model; owns the flow's dependency set.
    pub arrival: MmbpArrival,
}

/// A tenant: an ordered sequence of flows with an end-to-end SLO.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub flow_ids: Vec<FlowId>,
    /// SLO in seconds.
    pub slo: f64,
    /// SLO percentile in (0, 100).
    pub slo_percentile: f64,
    /// Latest computed latency (sum of flow latencies) in seconds.
    pub latency: f64,
}

/// A flow's incidence on a queue: which flow, and at which hop of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowHop {
    pub flow_id: FlowId,
    pub hop: usize,
}

/// One congestion point with a fixed service bandwidth.
#[derive(Debug, Clone)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    /// Bandwidth in work units per second.
    pub bandwidth: f64,
    /// Unordered incidences of the flows crossing this queue.
    pub flows: Vec<FlowHop>,
}

/// Which per-flow latency analysis the registry runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SncAlgorithm {
    /// Aggregate analysis with two-hop dependency avoidance.
    #[default]
    Aggregate,
    /// Per-hop bounds summed along the path.
    HopByHop,
    /// One bound against the convolved leftover services of the path.
    Convolution,
}

/// Flow description used when registering a client.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub name: String,
    pub queue_ids: Vec<QueueId>,
    pub priority: u32,
    pub arrival: MmbpArrival,
}

/// Sort key for analysis sweeps: priority ascending, and on ties the
/// higher-latency flow first (it cares more about its position).
pub fn priority_compare(f1: &Flow, f2: &Flow) -> Ordering {
    f1.priority.cmp(&f2.priority).then_with(|| {
        f2.latency
            .partial_cmp(&f1.latency)
            .unwrap_or(Ordering::Equal)
    })
}

/// Owner of all queue, flow, and client records.
///
/// Name uniqueness is the caller's contract (the admission controller
/// validates before mutating). The registry is `Clone` so a whole admission
/// batch can be staged on a copy and committed by swap.
#[derive(Debug, Clone)]
pub struct Registry {
    algorithm: SncAlgorithm,
    flows: BTreeMap<FlowId, Flow>,
    clients: BTreeMap<ClientId, Client>,
    queues: BTreeMap<QueueId, Queue>,
    flow_ids: BTreeMap<String, FlowId>,
    client_ids: BTreeMap<String, ClientId>,
    queue_ids: BTreeMap<String, QueueId>,
    next_flow_id: FlowId,
    next_client_id: ClientId,
    next_queue_id: QueueId,
}

impl Registry {
    pub fn new(algorithm: SncAlgorithm) -> Self {
        Self {
            algorithm,
            flows: BTreeMap::new(),
            clients: BTreeMap::new(),
            queues: BTreeMap::new(),
            flow_ids: BTreeMap::new(),
            client_ids: BTreeMap::new(),
            queue_ids: BTreeMap::new(),
            next_flow_id: 1,
            next_client_id: 1,
            next_queue_id: 1,
        }
    }

    pub fn algorithm(&self) -> SncAlgorithm {
        self.algorithm
    }

    // --- Lookups ---

    pub fn flow(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(&id)
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn queue(&self, id: QueueId) -> Option<&Queue> {
        self.queues.get(&id)
    }

    pub fn flow_id_by_name(&self, name: &str) -> Option<FlowId> {
        self.flow_ids.get(name).copied()
    }

    pub fn client_id_by_name(&self, name: &str) -> Option<ClientId> {
        self.client_ids.get(name).copied()
    }

    pub fn queue_id_by_name(&self, name: &str) -> Option<QueueId> {
        self.queue_ids.get(name).copied()
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    // --- Mutations ---

    /// Register a queue. The name must be unused.
    pub fn add_queue(&mut self, name: &str, bandwidth: f64) -> QueueId {
        let id = self.next_queue_id;
        self.next_queue_id += 1;
        self.queues.insert(
            id,
            Queue {
                id,
                name: name.to_string(),
                bandwidth,
                flows: Vec::new(),
            },
        );
        self.queue_ids.insert(name.to_string(), id);
        debug!(queue = name, id, bandwidth, "queue added");
        id
    }

    /// Remove a queue. Refuses while any flow still crosses it.
    pub fn del_queue(&mut self, id: QueueId) -> bool {
        let Some(queue) = self.queues.get(&id) else {
            return false;
        };
        if !queue.flows.is_empty() {
            return false;
        }
        let name = queue.name.clone();
        self.queue_ids.remove(&name);
        self.queues.remove(&id);
        debug!(queue = %name, id, "queue deleted");
        true
    }

    /// Register a client and all of its flows in one transaction.
    ///
    /// The client's tail budget `1 - slo_percentile/100` is split equally
    /// across its flows. Every flow is made to depend on itself, and every
    /// referenced queue gains an incidence entry.
    pub fn add_client(
        &mut self,
        name: &str,
        slo: f64,
        slo_percentile: f64,
        new_flows: Vec<NewFlow>,
    ) -> ClientId {
        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let epsilon_client = 1.0 - slo_percentile / 100.0;
        let epsilon_flow = if new_flows.is_empty() {
            epsilon_client
        } else {
            epsilon_client / new_flows.len() as f64
        };

        let mut flow_ids = Vec::with_capacity(new_flows.len());
        for new_flow in new_flows {
            let flow_id = self.next_flow_id;
            self.next_flow_id += 1;

            for (hop, &queue_id) in new_flow.queue_ids.iter().enumerate() {
                if let Some(queue) = self.queues.get_mut(&queue_id) {
                    queue.flows.push(FlowHop { flow_id, hop });
                }
            }

            let mut arrival = new_flow.arrival;
            arrival.add_dependency(flow_id);

            self.flow_ids.insert(new_flow.name.clone(), flow_id);
            self.flows.insert(
                flow_id,
                Flow {
                    id: flow_id,
                    name: new_flow.name,
                    client_id,
                    queue_ids: new_flow.queue_ids,
                    priority: new_flow.priority,
                    latency: 0.0,
                    epsilon: epsilon_flow,
                    arrival,
                },
            );
            flow_ids.push(flow_id);
        }

        self.client_ids.insert(name.to_string(), client_id);
        self.clients.insert(
            client_id,
            Client {
                id: client_id,
                name: name.to_string(),
                flow_ids,
                slo,
                slo_percentile,
                latency: 0.0,
            },
        );
        debug!(client = name, id = client_id, slo, "client added");
        client_id
    }

    /// Remove a client, cascading over its flows and their queue incidences.
    pub fn del_client(&mut self, client_id: ClientId) {
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };
        for flow_id in &client.flow_ids {
            let Some(flow) = self.flows.remove(flow_id) else {
                continue;
            };
            for queue_id in &flow.queue_ids {
                if let Some(queue) = self.queues.get_mut(queue_id) {
                    queue.flows.retain(|fh| fh.flow_id != *flow_id);
                }
            }
            self.flow_ids.remove(&flow.name);
        }
        self.client_ids.remove(&client.name);
        debug!(client = %client.name, id = client_id, "client deleted");
    }

    pub fn set_flow_priority(&mut self, flow_id: FlowId, priority: u32) {
        if let Some(flow) = self.flows.get_mut(&flow_id) {
            flow.priority = priority;
        }
    }

    /// Declare a symmetric dependency between two clients: every flow of
    /// each becomes dependent on every flow of the other.
    pub fn add_dependency(&mut self, client_a: ClientId, client_b: ClientId) {
        let flows_a = match self.clients.get(&client_a) {
            Some(c) => c.flow_ids.clone(),
            None => return,
        };
        let flows_b = match self.clients.get(&client_b) {
            Some(c) => c.flow_ids.clone(),
            None => return,
        };
        for flow_id in &flows_a {
            if let Some(flow) = self.flows.get_mut(flow_id) {
                flow.arrival.add_dependencies(&flows_b);
            }
        }
        for flow_id in &flows_b {
            if let Some(flow) = self.flows.get_mut(flow_id) {
                flow.arrival.add_dependencies(&flows_a);
            }
        }
    }

    // --- Latency ---

    /// Compute and store one flow's latency bound with the configured
    /// algorithm. Assumes priorities are already set.
    pub fn calc_flow_latency(&mut self, flow_id: FlowId) -> f64 {
        let updates = {
            let Some(flow) = self.flows.get(&flow_id) else {
                return 0.0;
            };
            match self.algorithm {
                SncAlgorithm::Aggregate => {
                    vec![(flow_id, analysis::aggregate_two_hop(self, flow))]
                }
                SncAlgorithm::HopByHop => analysis::hop_by_hop(self, Some(flow)),
                SncAlgorithm::Convolution => analysis::convolution(self, Some(flow)),
            }
        };
        let mut result = 0.0;
        for (id, latency) in updates {
            if let Some(flow) = self.flows.get_mut(&id) {
                flow.latency = latency;
            }
            if id == flow_id {
                result = latency;
            }
        }
        result
    }

    /// Compute and store a client's latency: the sum over its flows.
    pub fn calc_client_latency(&mut self, client_id: ClientId) -> f64 {
        let flow_ids = match self.clients.get(&client_id) {
            Some(c) => c.flow_ids.clone(),
            None => return 0.0,
        };
        let mut latency = 0.0;
        for flow_id in flow_ids {
            latency += self.calc_flow_latency(flow_id);
        }
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.latency = latency;
        }
        latency
    }

    /// Recompute latency for every client in the system.
    pub fn calc_all_latency(&mut self) {
        let client_ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for client_id in client_ids {
            self.calc_client_latency(client_id);
        }
    }
}
