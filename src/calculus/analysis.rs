//! Per-flow latency analyses.
//!
//! Each analysis builds an operator DAG in a fresh arena, seeded with the
//! flows' fitted arrival models and the queues' constant services, and
//! collapses it into a latency bound for the target flow. Priorities must be
//! assigned before any analysis runs.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::warn;

use super::{priority_compare, Flow, FlowId, QueueId, Registry};
use crate::snc::operators::{BoundArena, LatencyBound, NodeId};

/// Aggregate arrival processes while minimizing the number of dependent
/// operators: each arrival joins the first group it is independent of, and
/// the groups are folded together at the end. Fewer dependent nodes keeps
/// the Hoelder optimization low-dimensional.
fn aggregate_arrivals(arena: &mut BoundArena<'_>, arrivals: &[NodeId]) -> NodeId {
    debug_assert!(!arrivals.is_empty());
    let mut groups: Vec<NodeId> = Vec::new();
    for &arrival in arrivals {
        let mut placed = false;
        for group in groups.iter_mut() {
            if !arena.check_dependence(arrival, *group) {
                *group = arena.aggregate_arrival(arrival, *group);
                placed = true;
                break;
            }
        }
        if !placed {
            groups.push(arrival);
        }
    }
    let mut aggregate = groups[0];
    for &group in &groups[1..] {
        aggregate = arena.aggregate_arrival(aggregate, group);
    }
    aggregate
}

/// Flows competing in a sweep: all of them for a full recomputation, or the
/// ones at the target's priority and above, with the target itself last.
fn sweep_order<'a>(reg: &'a Registry, target: Option<&'a Flow>) -> Vec<&'a Flow> {
    let mut sorted: Vec<&Flow> = reg
        .flows()
        .filter(|f| match target {
            None => true,
            Some(t) => f.priority <= t.priority && f.id != t.id,
        })
        .collect();
    sorted.sort_by(|a, b| priority_compare(a, b));
    if let Some(t) = target {
        sorted.push(t);
    }
    sorted
}

/// Hop-by-hop analysis: walk flows in priority order, bounding the target at
/// every hop against the queue's current leftover service and summing the
/// per-hop bounds. The tail budget is split evenly across the hops.
pub(crate) fn hop_by_hop<'a>(
    reg: &'a Registry,
    target: Option<&'a Flow>,
) -> Vec<(FlowId, f64)> {
    let mut arena = BoundArena::new();
    let mut leftover: BTreeMap<QueueId, NodeId> = BTreeMap::new();
    for queue in reg.queues() {
        leftover.insert(queue.id, arena.constant_service(queue.bandwidth));
    }

    let mut results = Vec::new();
    for flow in sweep_order(reg, target) {
        let computes = target.map_or(true, |t| t.id == flow.id);
        let mut latency = 0.0;
        let mut arrival = arena.mmbp(&flow.arrival);
        for &queue_id in &flow.queue_ids {
            let Some(&service) = leftover.get(&queue_id) else {
                continue;
            };
            if computes {
                let epsilon = flow.epsilon / flow.queue_ids.len() as f64;
                latency += LatencyBound::new(&mut arena, arrival, service, epsilon)
                    .dependency_optimization();
            }
            leftover.insert(queue_id, arena.leftover_service(arrival, service));
            arrival = arena.output_arrival(arrival, service);
        }
        if computes {
            results.push((flow.id, latency));
        }
    }
    results
}

/// Convolution analysis: convolve the leftover services along the flow's
/// path and compute a single bound at the full tail budget.
pub(crate) fn convolution<'a>(
    reg: &'a Registry,
    target: Option<&'a Flow>,
) -> Vec<(FlowId, f64)> {
    let mut arena = BoundArena::new();
    let mut leftover: BTreeMap<QueueId, NodeId> = BTreeMap::new();
    for queue in reg.queues() {
        leftover.insert(queue.id, arena.constant_service(queue.bandwidth));
    }

    let mut results = Vec::new();
    for flow in sweep_order(reg, target) {
        let computes = target.map_or(true, |t| t.id == flow.id);
        let services: Vec<NodeId> = flow
            .queue_ids
            .iter()
            .filter_map(|qid| leftover.get(qid).copied())
            .collect();
        let Some(&first_service) = services.first() else {
            if computes {
                results.push((flow.id, 0.0));
            }
            continue;
        };

        let mut convolved = first_service;
        for &service in &services[1..] {
            convolved = arena.convolution_service(convolved, service);
        }

        let mut arrival = arena.mmbp(&flow.arrival);
        if computes {
            let latency = LatencyBound::new(&mut arena, arrival, convolved, flow.epsilon)
                .dependency_optimization();
            results.push((flow.id, latency));
        }
        for &queue_id in &flow.queue_ids {
            let Some(&service) = leftover.get(&queue_id) else {
                continue;
            };
            leftover.insert(queue_id, arena.leftover_service(arrival, service));
            arrival = arena.output_arrival(arrival, service);
        }
    }
    results
}

/// Aggregate analysis with two-hop dependency avoidance, the production
/// algorithm for end-host uplink/downlink paths. Supports one- and two-hop
/// flows; anything else is reported as infeasible.
pub(crate) fn aggregate_two_hop(reg: &Registry, flow: &Flow) -> f64 {
    match flow.queue_ids.len() {
        1 => aggregate_one_hop(reg, flow),
        2 => aggregate_two_hops(reg, flow),
        hops => {
            warn!(
                flow = %flow.name,
                hops,
                "aggregate analysis supports one or two hops",
            );
            f64::INFINITY
        }
    }
}

fn aggregate_one_hop(reg: &Registry, flow: &Flow) -> f64 {
    let Some(queue) = reg.queue(flow.queue_ids[0]) else {
        return f64::INFINITY;
    };
    let mut arena = BoundArena::new();

    // Competing arrivals of higher-or-equal priority at the flow's queue.
    let mut arrivals = Vec::new();
    for flow_hop in &queue.flows {
        // Single-hop queues are always someone's first hop.
        if flow_hop.hop != 0 {
            continue;
        }
        let Some(other) = reg.flow(flow_hop.flow_id) else {
            continue;
        };
        if other.priority <= flow.priority && other.id != flow.id {
            arrivals.push(arena.mmbp(&other.arrival));
        }
    }

    let mut service = arena.constant_service(queue.bandwidth);
    if !arrivals.is_empty() {
        let aggregate = aggregate_arrivals(&mut arena, &arrivals);
        service = arena.leftover_service(aggregate, service);
    }

    let arrival = arena.mmbp(&flow.arrival);
    let epsilon = flow.epsilon / flow.queue_ids.len() as f64;
    LatencyBound::new(&mut arena, arrival, service, epsilon).calc_latency()
}

fn aggregate_two_hops(reg: &Registry, flow: &Flow) -> f64 {
    let first_queue_id = flow.queue_ids[0];
    let second_queue_id = flow.queue_ids[1];
    let Some(second_queue) = reg.queue(second_queue_id) else {
        return f64::INFINITY;
    };

    // For every first-hop queue feeding this second queue, find the lowest
    // priority (largest value) among the competing flows that cross both.
    let mut first_queues: BTreeMap<QueueId, u32> = BTreeMap::new();
    for flow_hop in &second_queue.flows {
        if flow_hop.hop != 1 {
            continue;
        }
        let Some(other) = reg.flow(flow_hop.flow_id) else {
            continue;
        };
        if other.priority <= flow.priority {
            match first_queues.entry(other.queue_ids[0]) {
                Entry::Vacant(entry) => {
                    entry.insert(other.priority);
                }
                Entry::Occupied(mut entry) => {
                    if other.priority > *entry.get() {
                        entry.insert(other.priority);
                    }
                }
            }
        }
    }

    let mut arena = BoundArena::new();
    let mut first_queue_service: Option<NodeId> = None;
    let mut aggregate_arrival_shared: Option<NodeId> = None;
    let mut arrivals_second_queue: Vec<NodeId> = Vec::new();

    for (&queue_id, &lowest_priority) in &first_queues {
        let Some(queue) = reg.queue(queue_id) else {
            continue;
        };
        // Partition the competing arrivals at this first queue by whether
        // they also share the second queue.
        let mut arrivals_shared = Vec::new();
        let mut arrivals_non_shared = Vec::new();
        for flow_hop in &queue.flows {
            if flow_hop.hop != 0 {
                continue;
            }
            let Some(other) = reg.flow(flow_hop.flow_id) else {
                continue;
            };
            if other.priority <= lowest_priority && other.id != flow.id {
                let arrival = arena.mmbp(&other.arrival);
                if other.queue_ids.get(1) == Some(&second_queue_id) {
                    arrivals_shared.push(arrival);
                } else {
                    arrivals_non_shared.push(arrival);
                }
            }
        }

        let mut service = arena.constant_service(queue.bandwidth);
        if !arrivals_non_shared.is_empty() {
            let aggregate = aggregate_arrivals(&mut arena, &arrivals_non_shared);
            service = arena.leftover_service(aggregate, service);
        }

        if queue_id == first_queue_id {
            // The flow's own first hop: its shared competitors stay at the
            // front of the tandem instead of being pushed through an output
            // bound, avoiding an artificial dependency.
            first_queue_service = Some(service);
            if !arrivals_shared.is_empty() {
                aggregate_arrival_shared =
                    Some(aggregate_arrivals(&mut arena, &arrivals_shared));
            }
        } else if !arrivals_shared.is_empty() {
            // Competitors arriving from another first queue enter the second
            // queue through their output bound; each first queue stays a
            // separate summand.
            let aggregate = aggregate_arrivals(&mut arena, &arrivals_shared);
            let output = arena.output_arrival(aggregate, service);
            arrivals_second_queue.push(output);
        }
    }

    let mut second_service = arena.constant_service(second_queue.bandwidth);
    if !arrivals_second_queue.is_empty() {
        let aggregate = aggregate_arrivals(&mut arena, &arrivals_second_queue);
        second_service = arena.leftover_service(aggregate, second_service);
    }

    let Some(first_service) = first_queue_service else {
        // The flow itself crosses both queues, so its first queue is always
        // registered; a miss means the registry is inconsistent.
        warn!(flow = %flow.name, "first-hop queue missing from analysis");
        return f64::INFINITY;
    };

    let mut final_service = arena.convolution_service(first_service, second_service);
    if let Some(shared) = aggregate_arrival_shared {
        final_service = arena.leftover_service(shared, final_service);
    }

    let arrival = arena.mmbp(&flow.arrival);
    LatencyBound::new(&mut arena, arrival, final_service, flow.epsilon)
        .dependency_optimization()
}
