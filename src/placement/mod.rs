//! Placement Planner - which server receives which fragment

mod planner;

pub use planner::{PlacementConfig, PlacementConstraints, PlacementPlanner, ServerAssignment};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Insufficient capacity: need {needed} server(s), {available} available")]
    InsufficientCapacity { needed: usize, available: usize },
}
