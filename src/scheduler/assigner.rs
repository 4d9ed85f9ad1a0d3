use crate::config::ChunkOverflow;
use crate::error::{FleetError, Result};

/// Chunk index for each node: node `i` gets chunk `i mod chunks`.
///
/// With fewer chunks than nodes some chunks run on several nodes.
pub fn assign_round_robin(nodes: usize, chunks: usize) -> Vec<usize> {
    if chunks == 0 {
        return Vec::new();
    }
    (0..nodes).map(|i| i % chunks).collect()
}

/// Chunks each node runs, in order, indexed by node position.
///
/// When there are more chunks than nodes, `ChunkOverflow::Reject` refuses the
/// plan and `ChunkOverflow::Spread` hands chunk `j` to node `j mod nodes`.
pub fn plan_assignments(
    nodes: usize,
    chunks: usize,
    overflow: ChunkOverflow,
) -> Result<Vec<Vec<usize>>> {
    if nodes == 0 || chunks == 0 {
        return Ok(vec![Vec::new(); nodes]);
    }
    if chunks <= nodes {
        return Ok(assign_round_robin(nodes, chunks)
            .into_iter()
            .map(|chunk| vec![chunk])
            .collect());
    }

    match overflow {
        ChunkOverflow::Reject => Err(FleetError::Config(format!(
            "{} chunks for {} nodes; raise chunk_size or grow the fleet",
            chunks, nodes
        ))),
        ChunkOverflow::Spread => {
            let mut plan = vec![Vec::new(); nodes];
            for chunk in 0..chunks {
                plan[chunk % nodes].push(chunk);
            }
            tracing::debug!(chunks, nodes, "Spreading surplus chunks across nodes");
            Ok(plan)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_nodes_three_chunks() {
        assert_eq!(assign_round_robin(5, 3), vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn assignment_is_deterministic() {
        assert_eq!(assign_round_robin(7, 4), assign_round_robin(7, 4));
        assert_eq!(assign_round_robin(3, 3), vec![0, 1, 2]);
        assert!(assign_round_robin(3, 0).is_empty());
    }

    #[test]
    fn plan_one_chunk_per_node_when_chunks_fit() {
        let plan = plan_assignments(4, 2, ChunkOverflow::Reject).unwrap();
        assert_eq!(plan, vec![vec![0], vec![1], vec![0], vec![1]]);
    }

    #[test]
    fn surplus_chunks_rejected_by_default() {
        let result = plan_assignments(2, 5, ChunkOverflow::default());
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[test]
    fn surplus_chunks_spread_in_order() {
        let plan = plan_assignments(2, 5, ChunkOverflow::Spread).unwrap();
        assert_eq!(plan, vec![vec![0, 2, 4], vec![1, 3]]);
        let mut all: Vec<usize> = plan.concat();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_fleet_has_empty_plan() {
        assert!(plan_assignments(0, 3, ChunkOverflow::Reject)
            .unwrap()
            .is_empty());
    }
}
