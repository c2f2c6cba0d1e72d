use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ledger::MaterialCounts;
use crate::lifecycle::BuildingStatus;
use crate::rotation::Rotation;
use crate::types::{BlueprintId, BuildingId, IntVec3, SettlementId, WorldId};

/// One construction job: a blueprint at an anchor and rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub(crate) id: BuildingId,
    pub(crate) settlement_id: SettlementId,
    pub(crate) world_id: WorldId,
    pub(crate) blueprint_ref: BlueprintId,
    pub(crate) anchor_position: IntVec3,
    pub(crate) rotation: Rotation,
    pub(crate) status: BuildingStatus,
    pub(crate) progress: f32,
    pub(crate) required_materials: MaterialCounts,
    #[serde(default)]
    pub(crate) provided_materials: MaterialCounts,
    /// Rebuilt from the blueprint on restore.
    #[serde(skip)]
    pub(crate) reservation_markers: BTreeSet<IntVec3>,
    #[serde(default)]
    pub(crate) created_tick: u64,
}

impl Building {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: BuildingId,
        settlement_id: SettlementId,
        world_id: WorldId,
        blueprint_ref: BlueprintId,
        anchor_position: IntVec3,
        rotation: Rotation,
        required_materials: MaterialCounts,
        created_tick: u64,
    ) -> Self {
        Self {
            id,
            settlement_id,
            world_id,
            blueprint_ref,
            anchor_position,
            rotation,
            status: BuildingStatus::Reserved,
            progress: 0.0,
            required_materials,
            provided_materials: MaterialCounts::new(),
            reservation_markers: BTreeSet::new(),
            created_tick,
        }
    }

    pub fn id(&self) -> BuildingId {
        self.id
    }

    pub fn settlement_id(&self) -> SettlementId {
        self.settlement_id
    }

    pub fn world_id(&self) -> WorldId {
        self.world_id
    }

    pub fn blueprint_ref(&self) -> &BlueprintId {
        &self.blueprint_ref
    }

    pub fn anchor_position(&self) -> IntVec3 {
        self.anchor_position
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn status(&self) -> BuildingStatus {
        self.status
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn required_materials(&self) -> &MaterialCounts {
        &self.required_materials
    }

    pub fn provided_materials(&self) -> &MaterialCounts {
        &self.provided_materials
    }

    pub fn reservation_markers(&self) -> &BTreeSet<IntVec3> {
        &self.reservation_markers
    }

    pub fn created_tick(&self) -> u64 {
        self.created_tick
    }

    /// Raises progress to `value`, clamped to `[0, 1]`. Never lowers it.
    pub(crate) fn advance_progress(&mut self, value: f32) {
        let clamped = value.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }
}

/// Axis-aligned world bounds of what a building occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    pub min: IntVec3,
    pub max: IntVec3,
    pub occupied: usize,
}

impl Footprint {
    pub fn from_positions(positions: impl IntoIterator<Item = IntVec3>) -> Option<Self> {
        let mut positions = positions.into_iter();
        let first = positions.next()?;
        let mut footprint = Self {
            min: first,
            max: first,
            occupied: 1,
        };
        for position in positions {
            footprint.min = footprint.min.min_components(position);
            footprint.max = footprint.max.max_components(position);
            footprint.occupied += 1;
        }
        Some(footprint)
    }
}

/// Emitted once when a building completes; suitable for external logging
/// or persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub building_id: BuildingId,
    pub settlement_id: SettlementId,
    pub world_id: WorldId,
    pub blueprint_ref: BlueprintId,
    pub materials_used: MaterialCounts,
    pub footprint: Option<Footprint>,
    pub completed_tick: u64,
}
