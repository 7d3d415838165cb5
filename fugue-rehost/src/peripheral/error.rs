//! peripheral errors

use thiserror::Error;

use crate::types::StateId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("peripheral `{0}` has no start state {1}")]
    MissingStart(String, StateId),
    #[error("peripheral `{0}` declares state {1} more than once")]
    DuplicateState(String, StateId),
    #[error("peripheral `{0}` has an edge from {1} to unknown state {2}")]
    DanglingEdge(String, StateId, StateId),
    #[error("peripheral `{0}` has state id {1} at or beyond its next id {2}")]
    StaleStateId(String, StateId, StateId),
}
