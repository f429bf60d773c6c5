// gatewarden/src/behavior/navigation.rs
//
// First-order navigation model over simplified request paths.
//
// Paths are simplified before they enter the model: numeric IDs become
// {id}, UUIDs become {guid}, so /users/42/orders and /users/97/orders
// share one node. Transitions are edges in a directed graph with a count
// weight; the conditional probability of the transition just taken is the
// edge count over the total outgoing count of the previous node.

use std::collections::HashMap;
use std::sync::LazyLock;

use petgraph::graphmap::DiGraphMap;
use regex::Regex;

static GUID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("guid segment pattern is valid")
});

static HEX_ID_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{16,}$").expect("hex id segment pattern is valid"));

/// Collapse volatile path segments so navigation edges generalize.
pub fn simplify_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        if segment.chars().all(|c| c.is_ascii_digit()) {
            out.push_str("{id}");
        } else if GUID_SEGMENT.is_match(segment) {
            out.push_str("{guid}");
        } else if HEX_ID_SEGMENT.is_match(&segment.to_lowercase()) {
            out.push_str("{id}");
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// What the model knew about a transition at the moment it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionStats {
    /// Conditional probability of this transition given the previous path,
    /// measured before the current observation was counted.
    pub probability: f64,
    /// Total outgoing observations from the previous path, before this one.
    pub prior_out:   u32,
}

#[derive(Debug, Default)]
pub struct NavigationModel {
    ids:   HashMap<String, u32>,
    graph: DiGraphMap<u32, u32>,
    last:  Option<u32>,
}

impl NavigationModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, simplified: &str) -> u32 {
        if let Some(&id) = self.ids.get(simplified) {
            return id;
        }
        let id = self.ids.len() as u32;
        self.ids.insert(simplified.to_string(), id);
        self.graph.add_node(id);
        id
    }

    fn outgoing_total(&self, node: u32) -> u32 {
        self.graph
            .edges(node)
            .map(|(_, _, &count)| count)
            .sum()
    }

    /// Record a navigation step. Returns the transition statistics seen
    /// from the previous path, or None on the first observation.
    pub fn record(&mut self, path: &str) -> Option<TransitionStats> {
        let simplified = simplify_path(path);
        let node = self.intern(&simplified);

        let stats = self.last.map(|prev| {
            let prior_out = self.outgoing_total(prev);
            let edge = self.graph.edge_weight(prev, node).copied().unwrap_or(0);
            let probability = if prior_out == 0 {
                0.0
            } else {
                edge as f64 / prior_out as f64
            };
            TransitionStats { probability, prior_out }
        });

        if let Some(prev) = self.last {
            let count = self.graph.edge_weight(prev, node).copied().unwrap_or(0);
            self.graph.add_edge(prev, node, count + 1);
        }
        self.last = Some(node);
        stats
    }

    pub fn distinct_paths(&self) -> usize {
        self.ids.len()
    }

    pub fn transition_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplification_collapses_ids_and_guids() {
        assert_eq!(simplify_path("/users/42/orders"), "/users/{id}/orders");
        assert_eq!(
            simplify_path("/item/9b2e8c7a-0f3d-4b1a-9e6f-2d5c8a7b4e1f"),
            "/item/{guid}"
        );
        assert_eq!(simplify_path("/session/deadbeefdeadbeef42"), "/session/{id}");
        assert_eq!(simplify_path("/about?q=1"), "/about");
        assert_eq!(simplify_path("/"), "/");
        assert_eq!(simplify_path(""), "/");
    }

    #[test]
    fn first_observation_has_no_transition() {
        let mut nav = NavigationModel::new();
        assert!(nav.record("/home").is_none());
    }

    #[test]
    fn repeated_transition_converges_to_probability_one() {
        let mut nav = NavigationModel::new();
        nav.record("/a");
        for _ in 0..5 {
            nav.record("/b");
            nav.record("/a");
        }
        let stats = nav.record("/b").unwrap();
        assert!(stats.probability > 0.9, "p = {}", stats.probability);
        assert!(stats.prior_out >= 5);
    }

    #[test]
    fn unseen_transition_has_probability_zero() {
        let mut nav = NavigationModel::new();
        nav.record("/a");
        nav.record("/b");
        nav.record("/a");
        nav.record("/b");
        nav.record("/a");
        // /a has only ever gone to /b.
        let stats = nav.record("/c").unwrap();
        assert_eq!(stats.probability, 0.0);
        assert_eq!(stats.prior_out, 2);
    }

    #[test]
    fn id_bearing_paths_share_one_node() {
        let mut nav = NavigationModel::new();
        nav.record("/users/1");
        nav.record("/users/2");
        nav.record("/users/30000");
        assert_eq!(nav.distinct_paths(), 1);
    }
}
