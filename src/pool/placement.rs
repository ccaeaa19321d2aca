//! Wires C1's rendezvous ranking into pod node affinity (spec.md §4.1,
//! §4.3 step 5).

use k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, PreferredSchedulingTerm,
};

use crate::rendezvous;

/// Build a `preferredDuringSchedulingIgnoredDuringExecution` node affinity
/// term listing the top-`k` nodes for `image`, weighted by `weight`
/// (spec.md §4.3 step 5: `k = ⌈replicas × spreadFactor⌉`).
pub fn preferred_affinity(image: &str, nodes: &[String], k: usize, weight: i32) -> NodeAffinity {
    let top = rendezvous::top_k(image, nodes, k);

    let term = PreferredSchedulingTerm {
        weight,
        preference: NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: "kubernetes.io/hostname".to_string(),
                operator: "In".to_string(),
                values: Some(top),
            }]),
            match_fields: None,
        },
    };

    NodeAffinity {
        preferred_during_scheduling_ignored_during_execution: Some(vec![term]),
        required_during_scheduling_ignored_during_execution: None,
    }
}

/// `k = ceil(replicas * spread_factor)`, at least 1 so an enabled
/// affinity always names at least one preferred node.
pub fn affinity_candidate_count(replicas: u32, spread_factor: f64) -> usize {
    ((replicas as f64 * spread_factor).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_count_rounds_up_and_floors_at_one() {
        assert_eq!(affinity_candidate_count(2, 1.0), 2);
        assert_eq!(affinity_candidate_count(2, 0.1), 1);
        assert_eq!(affinity_candidate_count(3, 1.5), 5);
    }

    #[test]
    fn preferred_affinity_uses_top_k_hostnames() {
        let nodes: Vec<String> = (0..5).map(|i| format!("node-{i}")).collect();
        let affinity = preferred_affinity("python:3.11-slim", &nodes, 2, 50);
        let terms = affinity
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].weight, 50);
        let values = terms[0].preference.match_expressions.as_ref().unwrap()[0]
            .values
            .as_ref()
            .unwrap();
        assert_eq!(values.len(), 2);
    }
}
