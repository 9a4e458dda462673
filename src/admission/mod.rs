//! Admission control.
//!
//! A batch of tenants is admitted only if, with priorities re-assigned by
//! SLO, every new tenant and every already-admitted tenant it affects still
//! meets its SLO. The whole batch is staged on a copy of the registry and
//! committed by swap, so a rejected or failed batch leaves the live registry
//! untouched.

pub mod priority;
pub mod status;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calculus::{ClientId, FlowHop, NewFlow, QueueId, Registry, SncAlgorithm};
use crate::enforcer::Enforcer;
use crate::snc::arrival::MmbpArrival;

pub use priority::configure_priorities_by_slo;
pub use status::AdmissionStatus;

/// Queue registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: Option<String>,
    pub bandwidth: Option<f64>,
}

/// Flow registration request, as carried inside a client descriptor.
///
/// The enforcer address triple is opaque to the admission core; when all
/// three fields are present they are forwarded to the enforcer on admission
/// and deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDescriptor {
    pub name: Option<String>,
    pub queues: Option<Vec<String>>,
    /// Serialized arrival model, see [`MmbpArrival`].
    pub arrival_info: Option<serde_json::Value>,
    pub priority: Option<u32>,
    pub enforcer_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub src_addr: Option<String>,
}

/// Client (tenant) registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub name: Option<String>,
    #[serde(rename = "SLO")]
    pub slo: Option<f64>,
    #[serde(rename = "SLOpercentile")]
    pub slo_percentile: Option<f64>,
    pub flows: Option<Vec<FlowDescriptor>>,
    pub dependencies: Option<Vec<String>>,
}

/// Result of an `add_clients` call.
///
/// `admitted = false` with `status = Success` is a successful check with a
/// negative decision; only malformed requests produce a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionOutcome {
    pub status: AdmissionStatus,
    pub admitted: bool,
}

impl AdmissionOutcome {
    fn rejected(status: AdmissionStatus) -> Self {
        Self {
            status,
            admitted: false,
        }
    }
}

/// Owner of the registry and the admission decision logic.
pub struct AdmissionController {
    registry: Registry,
    /// Original descriptors of admitted clients, replayed to the enforcer
    /// on deletion.
    descriptors: BTreeMap<ClientId, ClientDescriptor>,
    enforcer: Box<dyn Enforcer>,
}

impl AdmissionController {
    pub fn new(algorithm: SncAlgorithm, enforcer: Box<dyn Enforcer>) -> Self {
        Self {
            registry: Registry::new(algorithm),
            descriptors: BTreeMap::new(),
            enforcer,
        }
    }

    /// Read access to the live registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a queue.
    pub fn add_queue(&mut self, descriptor: &QueueDescriptor) -> AdmissionStatus {
        let Some(name) = descriptor.name.as_deref() else {
            return AdmissionStatus::MissingArgument;
        };
        if self.registry.queue_id_by_name(name).is_some() {
            return AdmissionStatus::QueueNameInUse;
        }
        let Some(bandwidth) = descriptor.bandwidth else {
            return AdmissionStatus::MissingArgument;
        };
        if bandwidth <= 0.0 {
            return AdmissionStatus::InvalidArgument;
        }
        self.registry.add_queue(name, bandwidth);
        AdmissionStatus::Success
    }

    /// Delete a queue. Refused while flows still cross it.
    pub fn del_queue(&mut self, name: &str) -> AdmissionStatus {
        let Some(queue_id) = self.registry.queue_id_by_name(name) else {
            return AdmissionStatus::QueueNameNonexistent;
        };
        let has_flows = self
            .registry
            .queue(queue_id)
            .is_some_and(|q| !q.flows.is_empty());
        if has_flows {
            return AdmissionStatus::QueueHasActiveFlows;
        }
        self.registry.del_queue(queue_id);
        AdmissionStatus::Success
    }

    /// Admission-check a batch of clients and commit them if every new and
    /// affected client meets its SLO.
    pub fn add_clients(&mut self, descriptors: &[ClientDescriptor]) -> AdmissionOutcome {
        // Validate syntax, including uniqueness within the batch itself.
        let mut client_names = BTreeSet::new();
        let mut flow_names = BTreeSet::new();
        for descriptor in descriptors {
            let status = self.check_client_descriptor(
                &mut client_names,
                &mut flow_names,
                descriptor,
            );
            if status != AdmissionStatus::Success {
                return AdmissionOutcome::rejected(status);
            }
        }

        // Stage the whole batch on a copy of the registry; the live one is
        // only replaced on a positive verdict.
        let mut staged = self.registry.clone();
        let mut staged_descriptors = self.descriptors.clone();
        let mut new_client_ids = BTreeSet::new();

        for descriptor in descriptors {
            let Some(name) = descriptor.name.as_deref() else {
                return AdmissionOutcome::rejected(AdmissionStatus::MissingArgument);
            };
            let Some(slo) = descriptor.slo else {
                return AdmissionOutcome::rejected(AdmissionStatus::MissingArgument);
            };
            let slo_percentile = descriptor.slo_percentile.unwrap_or(99.9);

            let mut new_flows = Vec::new();
            for flow in descriptor.flows.as_deref().unwrap_or_default() {
                let Some(flow_name) = flow.name.as_deref() else {
                    return AdmissionOutcome::rejected(AdmissionStatus::MissingArgument);
                };
                let Some(arrival_info) = flow.arrival_info.as_ref() else {
                    return AdmissionOutcome::rejected(AdmissionStatus::MissingArgument);
                };
                let arrival: MmbpArrival = match serde_json::from_value(arrival_info.clone())
                {
                    Ok(arrival) => arrival,
                    Err(error) => {
                        warn!(flow = flow_name, %error, "invalid arrival model");
                        return AdmissionOutcome::rejected(AdmissionStatus::InvalidArgument);
                    }
                };
                let mut queue_ids: Vec<QueueId> = Vec::new();
                for queue_name in flow.queues.as_deref().unwrap_or_default() {
                    let Some(queue_id) = staged.queue_id_by_name(queue_name) else {
                        return AdmissionOutcome::rejected(
                            AdmissionStatus::QueueNameNonexistent,
                        );
                    };
                    queue_ids.push(queue_id);
                }
                new_flows.push(NewFlow {
                    name: flow_name.to_string(),
                    queue_ids,
                    priority: flow.priority.unwrap_or(1),
                    arrival,
                });
            }

            let client_id = staged.add_client(name, slo, slo_percentile, new_flows);
            new_client_ids.insert(client_id);
            staged_descriptors.insert(client_id, descriptor.clone());
        }

        // Wire declared inter-client dependencies.
        for descriptor in descriptors {
            let Some(dependencies) = descriptor.dependencies.as_deref() else {
                continue;
            };
            let client_id = descriptor
                .name
                .as_deref()
                .and_then(|name| staged.client_id_by_name(name));
            let Some(client_id) = client_id else {
                return AdmissionOutcome::rejected(AdmissionStatus::ClientNameNonexistent);
            };
            for dependency in dependencies {
                let Some(dependency_id) = staged.client_id_by_name(dependency) else {
                    return AdmissionOutcome::rejected(
                        AdmissionStatus::ClientNameNonexistent,
                    );
                };
                staged.add_dependency(client_id, dependency_id);
            }
        }

        configure_priorities_by_slo(&mut staged);

        // Check the new clients, collecting the flows they can affect.
        let mut admitted = true;
        let mut affected_flows: BTreeSet<FlowHop> = BTreeSet::new();
        for &client_id in &new_client_ids {
            let latency = staged.calc_client_latency(client_id);
            let (slo, flow_ids) = match staged.client(client_id) {
                Some(client) => (client.slo, client.flow_ids.clone()),
                None => continue,
            };
            if latency > slo {
                info!(client_id, latency, slo, "new client misses its SLO");
                admitted = false;
                break;
            }
            for flow_id in flow_ids {
                mark_affected_flows(&staged, &mut affected_flows, FlowHop { flow_id, hop: 0 }, 0);
            }
        }

        // Re-check incumbents whose latency the batch can change.
        if admitted {
            let mut affected_clients: BTreeSet<ClientId> = BTreeSet::new();
            for flow_hop in &affected_flows {
                if let Some(flow) = staged.flow(flow_hop.flow_id) {
                    affected_clients.insert(flow.client_id);
                }
            }
            for client_id in affected_clients {
                if new_client_ids.contains(&client_id) {
                    continue;
                }
                let latency = staged.calc_client_latency(client_id);
                let slo = staged
                    .client(client_id)
                    .map_or(f64::INFINITY, |client| client.slo);
                if latency > slo {
                    info!(client_id, latency, slo, "affected client misses its SLO");
                    admitted = false;
                    break;
                }
            }
        }

        if !admitted {
            // Drop the staged registry: the live one was never touched.
            return AdmissionOutcome {
                status: AdmissionStatus::Success,
                admitted: false,
            };
        }

        self.registry = staged;
        self.descriptors = staged_descriptors;
        for descriptor in descriptors {
            self.push_enforcer_updates(descriptor);
        }
        info!(clients = descriptors.len(), "batch admitted");
        AdmissionOutcome {
            status: AdmissionStatus::Success,
            admitted: true,
        }
    }

    /// Delete a client, revoking its flows at the enforcer.
    pub fn del_client(&mut self, name: &str) -> AdmissionStatus {
        let Some(client_id) = self.registry.client_id_by_name(name) else {
            return AdmissionStatus::ClientNameNonexistent;
        };
        if let Some(descriptor) = self.descriptors.remove(&client_id) {
            for flow in descriptor.flows.as_deref().unwrap_or_default() {
                if let (Some(enforcer_addr), Some(dst_addr), Some(src_addr)) = (
                    flow.enforcer_addr.as_deref(),
                    flow.dst_addr.as_deref(),
                    flow.src_addr.as_deref(),
                ) {
                    self.enforcer.remove(enforcer_addr, dst_addr, src_addr);
                }
            }
        }
        self.registry.del_client(client_id);
        AdmissionStatus::Success
    }

    /// Push the admitted priorities of a client's flows to the enforcer.
    fn push_enforcer_updates(&self, descriptor: &ClientDescriptor) {
        for flow in descriptor.flows.as_deref().unwrap_or_default() {
            let (Some(enforcer_addr), Some(dst_addr), Some(src_addr)) = (
                flow.enforcer_addr.as_deref(),
                flow.dst_addr.as_deref(),
                flow.src_addr.as_deref(),
            ) else {
                continue;
            };
            let priority = flow
                .name
                .as_deref()
                .and_then(|name| self.registry.flow_id_by_name(name))
                .and_then(|flow_id| self.registry.flow(flow_id))
                .map(|flow| flow.priority);
            if let Some(priority) = priority {
                self.enforcer.update(enforcer_addr, dst_addr, src_addr, priority);
            }
        }
    }

    fn check_flow_descriptor(
        &self,
        flow_names: &mut BTreeSet<String>,
        descriptor: &FlowDescriptor,
    ) -> AdmissionStatus {
        let Some(name) = descriptor.name.as_deref() else {
            return AdmissionStatus::MissingArgument;
        };
        if self.registry.flow_id_by_name(name).is_some() || !flow_names.insert(name.to_string())
        {
            return AdmissionStatus::FlowNameInUse;
        }
        let Some(queues) = descriptor.queues.as_deref() else {
            return AdmissionStatus::MissingArgument;
        };
        if queues.is_empty() {
            return AdmissionStatus::InvalidArgument;
        }
        for queue_name in queues {
            if self.registry.queue_id_by_name(queue_name).is_none() {
                return AdmissionStatus::QueueNameNonexistent;
            }
        }
        if descriptor.arrival_info.is_none() {
            return AdmissionStatus::MissingArgument;
        }
        AdmissionStatus::Success
    }

    fn check_client_descriptor(
        &self,
        client_names: &mut BTreeSet<String>,
        flow_names: &mut BTreeSet<String>,
        descriptor: &ClientDescriptor,
    ) -> AdmissionStatus {
        let Some(name) = descriptor.name.as_deref() else {
            return AdmissionStatus::MissingArgument;
        };
        if self.registry.client_id_by_name(name).is_some()
            || !client_names.insert(name.to_string())
        {
            return AdmissionStatus::ClientNameInUse;
        }
        let Some(slo) = descriptor.slo else {
            return AdmissionStatus::MissingArgument;
        };
        if slo <= 0.0 {
            return AdmissionStatus::InvalidArgument;
        }
        if let Some(percentile) = descriptor.slo_percentile {
            if !(percentile > 0.0 && percentile < 100.0) {
                return AdmissionStatus::InvalidArgument;
            }
        }
        let Some(flows) = descriptor.flows.as_deref() else {
            return AdmissionStatus::MissingArgument;
        };
        for flow in flows {
            let status = self.check_flow_descriptor(flow_names, flow);
            if status != AdmissionStatus::Success {
                return status;
            }
        }
        AdmissionStatus::Success
    }
}

/// DFS over shared downstream queues: a flow is affected if it shares a
/// queue, at that point of its path or later, with an affected flow of
/// higher-or-equal (numerically lower-or-equal) priority.
fn mark_affected_flows(
    registry: &Registry,
    affected: &mut BTreeSet<FlowHop>,
    flow_hop: FlowHop,
    priority: u32,
) {
    let Some(flow) = registry.flow(flow_hop.flow_id) else {
        return;
    };
    // Strictly higher-priority flows are unaffected.
    if flow.priority < priority {
        return;
    }
    if !affected.insert(flow_hop) {
        return;
    }
    for hop in flow_hop.hop..flow.queue_ids.len() {
        let Some(queue) = registry.queue(flow.queue_ids[hop]) else {
            continue;
        };
        for &next in &queue.flows {
            mark_affected_flows(registry, affected, next, flow.priority);
        }
    }
}
