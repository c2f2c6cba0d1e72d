use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::building::Building;
use crate::types::BuildingId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildingStatus {
    Reserved,
    InProgress,
    Completed,
    Cancelled,
}

impl BuildingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Holds reservation markers and may still receive placements.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BuildingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{building_id} cannot transition from {from} to {to}")]
pub struct InvalidTransition {
    pub building_id: BuildingId,
    pub from: BuildingStatus,
    pub to: BuildingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Repeated request for the terminal state the building is already in.
    AlreadyInState,
}

pub fn is_allowed(from: BuildingStatus, to: BuildingStatus) -> bool {
    use BuildingStatus::*;
    matches!(
        (from, to),
        (Reserved, InProgress) | (Reserved, Cancelled) | (InProgress, Completed) | (InProgress, Cancelled)
    )
}

/// Moves `building` to `to`, applying the status-local effects of the
/// transition. Material movement is the caller's job. A rejected transition
/// leaves the building untouched.
pub fn transition(
    building: &mut Building,
    to: BuildingStatus,
) -> Result<TransitionOutcome, InvalidTransition> {
    let from = building.status;
    if from == to && from.is_terminal() {
        return Ok(TransitionOutcome::AlreadyInState);
    }
    if !is_allowed(from, to) {
        return Err(InvalidTransition {
            building_id: building.id,
            from,
            to,
        });
    }

    building.status = to;
    match to {
        BuildingStatus::Completed => {
            building.progress = 1.0;
            building.reservation_markers.clear();
        }
        BuildingStatus::Cancelled => building.reservation_markers.clear(),
        BuildingStatus::Reserved | BuildingStatus::InProgress => {}
    }
    debug!(building_id = %building.id, from = %from, to = %to, "building_transition");
    Ok(TransitionOutcome::Applied)
}
