use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::building::{Building, CompletionRecord, Footprint};
use crate::config::ConstructionConfig;
use crate::lifecycle::{transition, BuildingStatus, InvalidTransition, TransitionOutcome};
use crate::queue::{PlacementOutcome, PlacementQueue, RevertSummary};
use crate::types::{BuildingId, ContentState, IntVec3, WorldId};
use crate::world::WorldAccess;

/// Why a construction request was refused before any building existed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementRejection {
    #[error("rotation must be 0, 90, 180 or 270 degrees, got {degrees}")]
    UnsupportedRotation { degrees: i32 },
    #[error("footprint spans y {lowest}..={highest}, outside build height {min_y}..={max_y}")]
    OutsideBuildHeight {
        lowest: i32,
        highest: i32,
        min_y: i32,
        max_y: i32,
    },
    #[error("footprint at anchor {anchor} leaves the world coordinate range")]
    OutsideWorld { anchor: IntVec3 },
    #[error("blueprint has nothing to build")]
    EmptyBlueprint,
    #[error("footprint overlaps {other} at {position}")]
    Overlap { position: IntVec3, other: BuildingId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub admit_interval_ticks: u32,
    pub placements_per_tick: u32,
    pub global_placements_per_tick: Option<u32>,
    pub max_deferrals: Option<u32>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ConstructionConfig::default())
    }
}

impl From<&ConstructionConfig> for SchedulerSettings {
    fn from(config: &ConstructionConfig) -> Self {
        Self {
            admit_interval_ticks: config.admit_interval_ticks.max(1),
            placements_per_tick: config.placements_per_tick.max(1),
            global_placements_per_tick: config.global_placements_per_tick,
            max_deferrals: config.max_deferrals,
        }
    }
}

/// Presentation-facing event for one attempted entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementFeedback {
    pub building_id: BuildingId,
    pub position: IntVec3,
    pub content: ContentState,
    pub outcome: PlacementOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub admitted: bool,
    pub feedback: Vec<PlacementFeedback>,
    pub completed: Vec<CompletionRecord>,
    /// Queues dropped because their building left IN_PROGRESS.
    pub discarded: Vec<BuildingId>,
}

impl TickReport {
    pub fn placed_count(&self) -> usize {
        self.feedback
            .iter()
            .filter(|event| event.outcome == PlacementOutcome::Placed)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelReport {
    pub previous_status: BuildingStatus,
    pub already_cancelled: bool,
    pub reverted: Option<RevertSummary>,
}

/// Construction state private to one world: its buildings, their queues
/// and the positions they reserve.
#[derive(Debug)]
pub struct ConstructionScheduler {
    world_id: WorldId,
    settings: SchedulerSettings,
    buildings: BTreeMap<BuildingId, Building>,
    queues: BTreeMap<BuildingId, PlacementQueue>,
    reservations: HashMap<IntVec3, BuildingId>,
    round_robin_offset: usize,
}

impl ConstructionScheduler {
    pub fn new(world_id: WorldId, settings: SchedulerSettings) -> Self {
        Self {
            world_id,
            settings,
            buildings: BTreeMap::new(),
            queues: BTreeMap::new(),
            reservations: HashMap::new(),
            round_robin_offset: 0,
        }
    }

    pub fn world_id(&self) -> WorldId {
        self.world_id
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.settings
    }

    pub fn building(&self, id: BuildingId) -> Option<&Building> {
        self.buildings.get(&id)
    }

    pub(crate) fn building_mut(&mut self, id: BuildingId) -> Option<&mut Building> {
        self.buildings.get_mut(&id)
    }

    pub fn buildings(&self) -> impl Iterator<Item = &Building> + '_ {
        self.buildings.values()
    }

    pub fn queue(&self, id: BuildingId) -> Option<&PlacementQueue> {
        self.queues.get(&id)
    }

    pub fn active_queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn active_building_ids(&self) -> Vec<BuildingId> {
        self.buildings
            .values()
            .filter(|building| building.status.is_active())
            .map(|building| building.id)
            .collect()
    }

    pub fn reserved_by(&self, position: IntVec3) -> Option<BuildingId> {
        self.reservations.get(&position).copied()
    }

    pub fn find_overlap(&self, footprint: &[IntVec3]) -> Option<PlacementRejection> {
        footprint.iter().find_map(|position| {
            self.reservations
                .get(position)
                .map(|other| PlacementRejection::Overlap {
                    position: *position,
                    other: *other,
                })
        })
    }

    /// Adds a building and claims its reservation markers. Nothing is
    /// recorded if any marker is already claimed by another building.
    pub fn register(&mut self, building: Building) -> Result<(), PlacementRejection> {
        let conflict = building.reservation_markers.iter().find_map(|position| {
            self.reservations
                .get(position)
                .filter(|other| **other != building.id)
                .map(|other| PlacementRejection::Overlap {
                    position: *position,
                    other: *other,
                })
        });
        if let Some(conflict) = conflict {
            return Err(conflict);
        }
        for position in &building.reservation_markers {
            self.reservations.insert(*position, building.id);
        }
        debug!(
            world_id = %self.world_id,
            building_id = %building.id,
            markers = building.reservation_markers.len(),
            "building_registered"
        );
        self.buildings.insert(building.id, building);
        Ok(())
    }

    /// RESERVED -> IN_PROGRESS with `queue` attached. Materials must already
    /// be consumed.
    pub fn begin(
        &mut self,
        id: BuildingId,
        queue: PlacementQueue,
    ) -> Result<(), SchedulerError> {
        let building = self
            .buildings
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownBuilding { building_id: id })?;
        transition(building, BuildingStatus::InProgress)?;
        building.advance_progress(queue.progress());
        self.queues.insert(id, queue);
        Ok(())
    }

    /// Re-attaches an IN_PROGRESS building loaded from a save. A building
    /// already known to this scheduler is left as is.
    pub(crate) fn restore(&mut self, building: Building, queue: Option<PlacementQueue>) -> bool {
        if self.buildings.contains_key(&building.id) {
            return false;
        }
        let id = building.id;
        for position in &building.reservation_markers {
            self.reservations.entry(*position).or_insert(id);
        }
        self.buildings.insert(id, building);
        if let Some(queue) = queue {
            self.queues.insert(id, queue);
        }
        true
    }

    /// Forgets a building entirely, releasing its markers. Only used for a
    /// reservation whose start failed inside a single request.
    pub(crate) fn unregister(&mut self, id: BuildingId) -> Option<Building> {
        let building = self.buildings.remove(&id)?;
        self.queues.remove(&id);
        self.release_markers(id, building.reservation_markers.iter().copied());
        Some(building)
    }

    /// Cancels a building. Its queue is gone before this returns, so no
    /// further placement can happen for it. Material return is the
    /// caller's job.
    pub fn cancel(
        &mut self,
        id: BuildingId,
        world: Option<&mut dyn WorldAccess>,
        revert_placed: bool,
    ) -> Result<CancelReport, SchedulerError> {
        let building = self
            .buildings
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownBuilding { building_id: id })?;
        let previous_status = building.status;
        let markers = building.reservation_markers.clone();
        let outcome = transition(building, BuildingStatus::Cancelled)?;
        if outcome == TransitionOutcome::AlreadyInState {
            return Ok(CancelReport {
                previous_status,
                already_cancelled: true,
                reverted: None,
            });
        }

        self.release_markers(id, markers.iter().copied());
        let mut queue = self.queues.remove(&id);
        let reverted = match (revert_placed, world, queue.as_mut()) {
            (true, Some(world), Some(queue)) => Some(queue.revert_placed(world)),
            (true, None, Some(_)) => {
                warn!(building_id = %id, "cancel_revert_requested_without_world");
                None
            }
            _ => None,
        };
        info!(
            world_id = %self.world_id,
            building_id = %id,
            from = %previous_status,
            placed_discarded = queue.as_ref().map_or(0, |queue| queue.consumed_count()),
            restored = reverted.map_or(0, |summary| summary.restored),
            "construction_cancelled"
        );
        Ok(CancelReport {
            previous_status,
            already_cancelled: false,
            reverted,
        })
    }

    /// Runs one world tick. Only every Nth tick drains queues.
    pub fn tick(&mut self, world: &mut dyn WorldAccess, tick: u64) -> TickReport {
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };
        if tick % u64::from(self.settings.admit_interval_ticks) != 0 {
            return report;
        }
        report.admitted = true;

        let stale = self
            .queues
            .keys()
            .filter(|id| {
                self.buildings
                    .get(*id)
                    .map_or(true, |building| building.status != BuildingStatus::InProgress)
            })
            .copied()
            .collect::<Vec<_>>();
        for id in stale {
            self.queues.remove(&id);
            debug!(building_id = %id, "queue_discarded_inactive_building");
            report.discarded.push(id);
        }

        let mut order = self.queues.keys().copied().collect::<Vec<_>>();
        if !order.is_empty() && self.settings.global_placements_per_tick.is_some() {
            let offset = self.round_robin_offset % order.len();
            order.rotate_left(offset);
            self.round_robin_offset = self.round_robin_offset.wrapping_add(1);
        }
        let mut global_budget = self.settings.global_placements_per_tick.unwrap_or(u32::MAX);

        for id in order {
            if global_budget == 0 {
                break;
            }
            let (Some(queue), Some(building)) =
                (self.queues.get_mut(&id), self.buildings.get_mut(&id))
            else {
                continue;
            };

            let mut budget = self.settings.placements_per_tick;
            while budget > 0 && global_budget > 0 {
                let Some(attempt) = queue.place_next(world, self.settings.max_deferrals) else {
                    break;
                };
                budget -= 1;
                global_budget -= 1;
                log_attempt(id, &attempt.position, &attempt.content, &attempt.outcome);
                let deferred = matches!(attempt.outcome, PlacementOutcome::Deferred { .. });
                report.feedback.push(PlacementFeedback {
                    building_id: id,
                    position: attempt.position,
                    content: attempt.content,
                    outcome: attempt.outcome,
                });
                if deferred {
                    break;
                }
            }
            building.advance_progress(queue.progress());
        }

        let drained = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.is_drained())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in drained {
            self.queues.remove(&id);
            if let Some(record) = self.complete(id, tick) {
                report.completed.push(record);
            }
        }
        report
    }

    fn complete(&mut self, id: BuildingId, tick: u64) -> Option<CompletionRecord> {
        let building = self.buildings.get_mut(&id)?;
        let markers = building.reservation_markers.clone();
        if let Err(error) = transition(building, BuildingStatus::Completed) {
            warn!(building_id = %id, error = %error, "construction_completion_rejected");
            return None;
        }
        let record = CompletionRecord {
            building_id: id,
            settlement_id: building.settlement_id,
            world_id: building.world_id,
            blueprint_ref: building.blueprint_ref.clone(),
            materials_used: building.provided_materials.clone(),
            footprint: Footprint::from_positions(markers.iter().copied()),
            completed_tick: tick,
        };
        self.release_markers(id, markers.into_iter());
        info!(
            world_id = %self.world_id,
            building_id = %id,
            blueprint = %record.blueprint_ref,
            tick,
            "construction_completed"
        );
        Some(record)
    }

    fn release_markers(&mut self, id: BuildingId, markers: impl Iterator<Item = IntVec3>) {
        for position in markers {
            if self.reservations.get(&position) == Some(&id) {
                self.reservations.remove(&position);
            }
        }
    }

    pub(crate) fn into_buildings(self) -> impl Iterator<Item = Building> {
        self.buildings.into_values()
    }
}

fn log_attempt(id: BuildingId, position: &IntVec3, content: &ContentState, outcome: &PlacementOutcome) {
    match outcome {
        PlacementOutcome::Placed => {
            debug!(building_id = %id, position = %position, content = %content, "placement_applied")
        }
        PlacementOutcome::SkippedVoid => {
            debug!(building_id = %id, position = %position, "placement_skipped_void")
        }
        PlacementOutcome::Deferred { attempts } => debug!(
            building_id = %id,
            position = %position,
            attempts,
            "placement_deferred_chunk_unavailable"
        ),
        PlacementOutcome::Blocked { existing } => warn!(
            building_id = %id,
            position = %position,
            content = %content,
            existing = %existing,
            "placement_blocked_incompatible_content"
        ),
        PlacementOutcome::Abandoned { attempts } => warn!(
            building_id = %id,
            position = %position,
            content = %content,
            attempts,
            "placement_abandoned_after_deferrals"
        ),
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{building_id} is not registered with this scheduler")]
    UnknownBuilding { building_id: BuildingId },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// One scheduler per world, created on first use and torn down explicitly.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    schedulers: BTreeMap<WorldId, ConstructionScheduler>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_world(
        &mut self,
        world_id: WorldId,
        settings: SchedulerSettings,
    ) -> &mut ConstructionScheduler {
        self.schedulers.entry(world_id).or_insert_with(|| {
            info!(world_id = %world_id, "construction_scheduler_created");
            ConstructionScheduler::new(world_id, settings)
        })
    }

    pub fn get(&self, world_id: WorldId) -> Option<&ConstructionScheduler> {
        self.schedulers.get(&world_id)
    }

    pub fn get_mut(&mut self, world_id: WorldId) -> Option<&mut ConstructionScheduler> {
        self.schedulers.get_mut(&world_id)
    }

    pub fn remove(&mut self, world_id: WorldId) -> Option<ConstructionScheduler> {
        let removed = self.schedulers.remove(&world_id);
        if removed.is_some() {
            info!(world_id = %world_id, "construction_scheduler_removed");
        }
        removed
    }

    pub fn world_ids(&self) -> Vec<WorldId> {
        self.schedulers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstructionScheduler> + '_ {
        self.schedulers.values()
    }
}
