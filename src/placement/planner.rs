//! Placement of a version's fragments across fragment servers.
//!
//! Servers are grouped by failure domain and taken round by round: the first
//! round uses the best server of every domain before any domain gets a second
//! fragment. Within a round servers are ordered by free space (descending),
//! then by name, with domains the caller wants to avoid pushed to the back.

use super::PlacementError;
use crate::cluster::ServerInfo;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Space every server keeps free beyond the fragment being placed
    pub reserve_bytes: u64,

    /// Allow reusing servers when there are fewer servers than fragments
    pub allow_degraded: bool,
}

/// What one placement request needs
#[derive(Debug, Clone, Default)]
pub struct PlacementConstraints {
    pub fragment_count: usize,

    /// Bytes each fragment occupies on its server
    pub fragment_size: u64,

    /// Servers that must not receive a fragment
    pub exclude: HashSet<String>,

    /// Failure domains to use only after every other domain
    pub avoid_domains: HashSet<String>,

    /// Reuse servers round-robin when distinct ones run out
    pub allow_degraded: bool,

    /// Distinct servers a degraded placement still needs
    pub min_spread: usize,
}

impl PlacementConstraints {
    pub fn new(fragment_count: usize, fragment_size: u64) -> Self {
        Self {
            fragment_count,
            fragment_size,
            ..Self::default()
        }
    }

    pub fn excluding(mut self, servers: impl IntoIterator<Item = String>) -> Self {
        self.exclude.extend(servers);
        self
    }

    pub fn avoiding_domains(mut self, domains: impl IntoIterator<Item = String>) -> Self {
        self.avoid_domains.extend(domains);
        self
    }

    pub fn degraded(mut self, min_spread: usize) -> Self {
        self.allow_degraded = true;
        self.min_spread = min_spread;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAssignment {
    /// Fragment index within the request
    pub index: usize,
    pub server_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlacementPlanner {
    config: PlacementConfig,
}

impl PlacementPlanner {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Assign each of `constraints.fragment_count` fragments to a server
    pub fn place(
        &self,
        constraints: &PlacementConstraints,
        servers: &[ServerInfo],
    ) -> Result<Vec<ServerAssignment>, PlacementError> {
        let needed = constraints.fragment_count;
        if needed == 0 {
            return Ok(Vec::new());
        }

        let required = constraints.fragment_size.saturating_add(self.config.reserve_bytes);
        let candidates: Vec<&ServerInfo> = servers
            .iter()
            .filter(|s| s.accepts_fragments())
            .filter(|s| !constraints.exclude.contains(&s.name))
            .filter(|s| s.free_space >= required)
            .collect();

        let ordered = spread_order(&candidates, &constraints.avoid_domains);

        if ordered.len() >= needed {
            let assignments: Vec<ServerAssignment> = ordered
                .iter()
                .take(needed)
                .enumerate()
                .map(|(index, s)| ServerAssignment {
                    index,
                    server_name: s.name.clone(),
                })
                .collect();
            debug!(fragments = needed, servers = candidates.len(), "Placed fragments");
            return Ok(assignments);
        }

        let degraded = constraints.allow_degraded || self.config.allow_degraded;
        if !degraded || ordered.is_empty() || ordered.len() < constraints.min_spread.max(1) {
            return Err(PlacementError::InsufficientCapacity {
                needed,
                available: ordered.len(),
            });
        }

        // round-robin reuse, skipping servers that cannot hold another copy
        let mut remaining: HashMap<&str, u64> = ordered.iter().map(|s| (s.name.as_str(), s.free_space)).collect();
        let mut assignments = Vec::with_capacity(needed);
        let mut cursor = 0usize;
        let mut misses = 0usize;
        while assignments.len() < needed {
            let server = ordered[cursor % ordered.len()];
            cursor += 1;

            let free = remaining.entry(server.name.as_str()).or_insert(0);
            if *free >= required {
                *free -= constraints.fragment_size;
                assignments.push(ServerAssignment {
                    index: assignments.len(),
                    server_name: server.name.clone(),
                });
                misses = 0;
            } else {
                misses += 1;
                if misses >= ordered.len() {
                    return Err(PlacementError::InsufficientCapacity {
                        needed,
                        available: assignments.len(),
                    });
                }
            }
        }

        debug!(fragments = needed, servers = ordered.len(), "Placed fragments on a degraded cluster");
        Ok(assignments)
    }
}

/// Order servers so consecutive picks spread across failure domains
fn spread_order<'a>(candidates: &[&'a ServerInfo], avoid_domains: &HashSet<String>) -> Vec<&'a ServerInfo> {
    let mut by_domain: BTreeMap<&str, Vec<&'a ServerInfo>> = BTreeMap::new();
    for &server in candidates {
        by_domain.entry(server.failure_domain.as_str()).or_default().push(server);
    }
    for servers in by_domain.values_mut() {
        servers.sort_by(|a, b| b.free_space.cmp(&a.free_space).then_with(|| a.name.cmp(&b.name)));
    }

    let rounds = by_domain.values().map(Vec::len).max().unwrap_or(0);
    let mut ordered = Vec::with_capacity(candidates.len());
    for round in 0..rounds {
        let mut picks: Vec<&'a ServerInfo> = by_domain.values().filter_map(|s| s.get(round).copied()).collect();
        picks.sort_by(|a, b| {
            let a_avoided = avoid_domains.contains(&a.failure_domain);
            let b_avoided = avoid_domains.contains(&b.failure_domain);
            a_avoided
                .cmp(&b_avoided)
                .then_with(|| b.free_space.cmp(&a.free_space))
                .then_with(|| a.name.cmp(&b.name))
        });
        ordered.extend(picks);
    }
    ordered
}
