//! Meta-data validation utilities.

use crate::types::{Error, Result};

/// Validate that a name is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

/// First dependency cycle found, as the nodes along it with the first node
/// repeated at the end.
pub fn find_cycle(adjacency: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn visit(node: usize, adjacency: &[Vec<usize>], marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        path.push(node);
        for &next in &adjacency[node] {
            match marks.get(next) {
                Some(Mark::Active) => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Some(Mark::New) => {
                    if let Some(cycle) = visit(next, adjacency, marks, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; adjacency.len()];
    let mut path = Vec::new();
    for node in 0..adjacency.len() {
        if marks[node] == Mark::New {
            if let Some(cycle) = visit(node, adjacency, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Every node reachable from `roots`, dependencies before dependents, each
/// once. The graph must be acyclic.
pub fn load_order(adjacency: &[Vec<usize>], roots: &[usize]) -> Vec<usize> {
    fn visit(node: usize, adjacency: &[Vec<usize>], visited: &mut [bool], order: &mut Vec<usize>) {
        if visited[node] {
            return;
        }
        visited[node] = true;
        for &next in &adjacency[node] {
            visit(next, adjacency, visited, order);
        }
        order.push(node);
    }

    let mut visited = vec![false; adjacency.len()];
    let mut order = Vec::new();
    for &root in roots {
        if root < adjacency.len() {
            visit(root, adjacency, &mut visited, &mut order);
        }
    }
    order
}
