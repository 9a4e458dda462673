//! Priority assignment in order of SLO.

use tracing::debug;

use crate::calculus::Registry;

/// Assign flow priorities by client SLO: the tightest SLO gets priority 0,
/// each strictly larger SLO the next value, and equal SLOs share a priority.
/// Every flow of a client carries the client's priority.
pub fn configure_priorities_by_slo(registry: &mut Registry) {
    let mut clients: Vec<(f64, Vec<u32>)> = registry
        .clients()
        .map(|c| (c.slo, c.flow_ids.clone()))
        .collect();
    clients.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut priority = 0u32;
    let mut current_slo = None;
    for (slo, flow_ids) in clients {
        match current_slo {
            None => current_slo = Some(slo),
            Some(current) if slo > current => {
                priority += 1;
                current_slo = Some(slo);
            }
            Some(_) => {}
        }
        for flow_id in flow_ids {
            registry.set_flow_priority(flow_id, priority);
        }
    }
    debug!(levels = priority + 1, "priorities configured by SLO");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculus::{NewFlow, QueueId, SncAlgorithm};
    use crate::mgf::Mgf;
    use crate::snc::arrival::MmbpArrival;

    fn add_client(reg: &mut Registry, name: &str, slo: f64, queue: QueueId) {
        let mut mgf = Mgf::deterministic();
        mgf.set_prob_request(1.0);
        reg.add_client(
            name,
            slo,
            99.9,
            vec![NewFlow {
                name: format!("{name}-flow"),
                queue_ids: vec![queue],
                priority: 1,
                arrival: MmbpArrival::from_parts(vec![vec![1.0]], vec![mgf]),
            }],
        );
    }

    fn flow_priority(reg: &Registry, client: &str) -> u32 {
        let id = reg.flow_id_by_name(&format!("{client}-flow")).unwrap();
        reg.flow(id).unwrap().priority
    }

    #[test]
    fn test_smallest_slo_gets_priority_zero() {
        let mut reg = Registry::new(SncAlgorithm::Aggregate);
        let q = reg.add_queue("q", 1.0);
        add_client(&mut reg, "loose", 0.5, q);
        add_client(&mut reg, "tight", 0.001, q);
        add_client(&mut reg, "middle", 0.1, q);

        configure_priorities_by_slo(&mut reg);
        assert_eq!(flow_priority(&reg, "tight"), 0);
        assert_eq!(flow_priority(&reg, "middle"), 1);
        assert_eq!(flow_priority(&reg, "loose"), 2);
    }

    #[test]
    fn test_equal_slos_share_a_priority() {
        let mut reg = Registry::new(SncAlgorithm::Aggregate);
        let q = reg.add_queue("q", 1.0);
        add_client(&mut reg, "a", 0.01, q);
        add_client(&mut reg, "b", 0.01, q);
        add_client(&mut reg, "c", 0.05, q);

        configure_priorities_by_slo(&mut reg);
        assert_eq!(flow_priority(&reg, "a"), 0);
        assert_eq!(flow_priority(&reg, "b"), 0);
        assert_eq!(flow_priority(&reg, "c"), 1);
    }

    #[test]
    fn test_priorities_are_order_preserving() {
        let mut reg = Registry::new(SncAlgorithm::Aggregate);
        let q = reg.add_queue("q", 1.0);
        let slos = [0.4, 0.1, 0.2, 0.1, 0.3];
        for (i, slo) in slos.iter().enumerate() {
            add_client(&mut reg, &format!("c{i}"), *slo, q);
        }
        configure_priorities_by_slo(&mut reg);

        let mut pairs: Vec<(f64, u32)> = (0..slos.len())
            .map(|i| (slos[i], flow_priority(&reg, &format!("c{i}"))))
            .collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        for window in pairs.windows(2) {
            let ((slo_a, pri_a), (slo_b, pri_b)) = (window[0], window[1]);
            if slo_a == slo_b {
                assert_eq!(pri_a, pri_b);
            } else {
                assert!(pri_a < pri_b);
            }
        }
    }
}
