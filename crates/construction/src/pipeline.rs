use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::blueprint::{Blueprint, BlueprintError, BlueprintLibrary};
use crate::building::Building;
use crate::config::ConstructionConfig;
use crate::ledger::{InsufficientMaterials, MaterialLedger, MaterialStore, SharedMaterialStore};
use crate::lifecycle::{transition, BuildingStatus, InvalidTransition};
use crate::persist::{BuildingBook, BUILDING_BOOK_VERSION};
use crate::queue::PlacementQueue;
use crate::rotation::Rotation;
use crate::scheduler::{
    CancelReport, PlacementRejection, SchedulerError, SchedulerRegistry, SchedulerSettings,
    TickReport,
};
use crate::types::{BlueprintId, BuildingId, IntVec3, SettlementId, WorldId};
use crate::world::WorldAccess;

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error(transparent)]
    InsufficientMaterials(#[from] InsufficientMaterials),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("invalid placement: {reason}")]
    InvalidPlacement { reason: PlacementRejection },
    #[error("unknown building {building_id}")]
    UnknownBuilding { building_id: BuildingId },
    #[error("unknown settlement {settlement_id}")]
    UnknownSettlement { settlement_id: SettlementId },
}

impl From<PlacementRejection> for ConstructionError {
    fn from(reason: PlacementRejection) -> Self {
        Self::InvalidPlacement { reason }
    }
}

impl From<SchedulerError> for ConstructionError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::UnknownBuilding { building_id } => Self::UnknownBuilding { building_id },
            SchedulerError::Transition(error) => Self::InvalidTransition(error),
        }
    }
}

/// A confirmed placement from the input layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructionRequest {
    pub blueprint_ref: BlueprintId,
    pub anchor_position: IntVec3,
    /// Checked against the four supported rotations.
    #[serde(rename = "rotation")]
    pub rotation_degrees: i32,
    pub settlement_ref: SettlementId,
    #[serde(default)]
    pub world_id: WorldId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub already_present: usize,
    pub resumed_queues: usize,
    pub entries_already_built: usize,
    pub unresolved: usize,
}

/// Entry point for everything outside the core: requests, cancellation,
/// ticks, and persistence of Building records.
#[derive(Debug)]
pub struct ConstructionPipeline {
    config: ConstructionConfig,
    settings: SchedulerSettings,
    library: BlueprintLibrary,
    ledger: MaterialLedger,
    settlements: BTreeMap<SettlementId, SharedMaterialStore>,
    schedulers: SchedulerRegistry,
    building_worlds: HashMap<BuildingId, WorldId>,
    /// Records of buildings whose world was unloaded, and of unresolved
    /// records cancelled before they could resume.
    archived: BTreeMap<BuildingId, Building>,
    /// Restored records whose blueprint could not be placed yet. Every
    /// restore pass for their world retries them.
    unresolved: BTreeMap<BuildingId, Building>,
    next_building_id: u64,
    current_tick: u64,
}

impl ConstructionPipeline {
    pub fn new(config: ConstructionConfig, library: BlueprintLibrary, ledger: MaterialLedger) -> Self {
        let settings = SchedulerSettings::from(&config);
        Self {
            config,
            settings,
            library,
            ledger,
            settlements: BTreeMap::new(),
            schedulers: SchedulerRegistry::new(),
            building_worlds: HashMap::new(),
            archived: BTreeMap::new(),
            unresolved: BTreeMap::new(),
            next_building_id: 1,
            current_tick: 0,
        }
    }

    pub fn config(&self) -> &ConstructionConfig {
        &self.config
    }

    pub fn ledger(&self) -> &MaterialLedger {
        &self.ledger
    }

    pub fn library(&self) -> &BlueprintLibrary {
        &self.library
    }

    pub fn schedulers(&self) -> &SchedulerRegistry {
        &self.schedulers
    }

    /// Registers a settlement's store. Returns the handle so other
    /// subsystems can share it.
    pub fn add_settlement(&mut self, id: SettlementId, store: MaterialStore) -> SharedMaterialStore {
        let shared = SharedMaterialStore::new(store);
        self.settlements.insert(id, shared.clone());
        shared
    }

    pub fn attach_settlement(&mut self, id: SettlementId, store: SharedMaterialStore) {
        self.settlements.insert(id, store);
    }

    pub fn settlement_store(&self, id: SettlementId) -> Option<&SharedMaterialStore> {
        self.settlements.get(&id)
    }

    pub fn load_blueprint(&mut self, id: &BlueprintId) -> Result<Arc<Blueprint>, BlueprintError> {
        self.library.load(id)
    }

    pub fn force_reload_blueprint(
        &mut self,
        id: &BlueprintId,
    ) -> Result<Arc<Blueprint>, BlueprintError> {
        self.library.force_reload(id)
    }

    /// Reserves and starts in one step. On any failure no building exists
    /// afterwards and the settlement store is unchanged.
    pub fn request_construction(
        &mut self,
        request: &ConstructionRequest,
    ) -> Result<BuildingId, ConstructionError> {
        let id = self.reserve_construction(request)?;
        if let Err(error) = self.start_construction(id) {
            self.discard_reservation(id);
            info!(
                blueprint = %request.blueprint_ref,
                settlement = %request.settlement_ref,
                error = %error,
                "construction_request_rejected"
            );
            return Err(error);
        }
        Ok(id)
    }

    /// Validates the request and claims the footprint. No materials move.
    pub fn reserve_construction(
        &mut self,
        request: &ConstructionRequest,
    ) -> Result<BuildingId, ConstructionError> {
        let rotation = Rotation::from_degrees(request.rotation_degrees).ok_or(
            PlacementRejection::UnsupportedRotation {
                degrees: request.rotation_degrees,
            },
        )?;
        if !self.settlements.contains_key(&request.settlement_ref) {
            return Err(ConstructionError::UnknownSettlement {
                settlement_id: request.settlement_ref,
            });
        }
        let blueprint = self.library.load(&request.blueprint_ref)?;
        if !blueprint.fits_at(request.anchor_position, rotation) {
            return Err(PlacementRejection::OutsideWorld {
                anchor: request.anchor_position,
            }
            .into());
        }
        let footprint = blueprint.footprint(request.anchor_position, rotation);
        self.check_build_height(&footprint)?;

        let id = BuildingId(self.next_building_id);
        let mut building = Building::new(
            id,
            request.settlement_ref,
            request.world_id,
            request.blueprint_ref.clone(),
            request.anchor_position,
            rotation,
            self.ledger.compute_requirements(&blueprint),
            self.current_tick,
        );
        building.reservation_markers = footprint.into_iter().collect();

        self.schedulers
            .ensure_world(request.world_id, self.settings)
            .register(building)?;
        self.next_building_id += 1;
        self.building_worlds.insert(id, request.world_id);
        info!(
            building_id = %id,
            blueprint = %request.blueprint_ref,
            anchor = %request.anchor_position,
            rotation = %rotation,
            world_id = %request.world_id,
            "construction_reserved"
        );
        Ok(id)
    }

    /// RESERVED -> IN_PROGRESS: consumes materials and queues the placements.
    pub fn start_construction(&mut self, id: BuildingId) -> Result<(), ConstructionError> {
        let world_id = self.world_of(id)?;
        let (blueprint_ref, settlement_id, anchor, rotation, status) = {
            let building = self.scheduled_building(world_id, id)?;
            (
                building.blueprint_ref.clone(),
                building.settlement_id,
                building.anchor_position,
                building.rotation,
                building.status,
            )
        };
        if status != BuildingStatus::Reserved {
            return Err(InvalidTransition {
                building_id: id,
                from: status,
                to: BuildingStatus::InProgress,
            }
            .into());
        }
        let store = self
            .settlements
            .get(&settlement_id)
            .cloned()
            .ok_or(ConstructionError::UnknownSettlement { settlement_id })?;
        let blueprint = self.library.load(&blueprint_ref)?;
        let queue = PlacementQueue::from_blueprint(&blueprint, anchor, rotation);

        let ledger = &self.ledger;
        let scheduler = self
            .schedulers
            .get_mut(world_id)
            .ok_or(ConstructionError::UnknownBuilding { building_id: id })?;
        let building = scheduler
            .building_mut(id)
            .ok_or(ConstructionError::UnknownBuilding { building_id: id })?;
        store.with_store(|store| ledger.consume(building, store))?;

        if let Err(error) = scheduler.begin(id, queue) {
            if let Some(building) = scheduler.building_mut(id) {
                store.with_store(|store| ledger.return_to_store(building, store));
            }
            return Err(error.into());
        }
        info!(
            building_id = %id,
            blueprint = %blueprint_ref,
            settlement = %settlement_id,
            entries = blueprint.units().len(),
            "construction_started"
        );
        Ok(())
    }

    /// Cancels a building before completion. The queue is removed at once;
    /// provided materials go back to the settlement store in full. `world`
    /// is only needed when placed content is reverted.
    pub fn cancel_construction(
        &mut self,
        id: BuildingId,
        world: Option<&mut dyn WorldAccess>,
    ) -> Result<CancelReport, ConstructionError> {
        if let Some(mut building) = self.unresolved.remove(&id) {
            let previous_status = building.status;
            if let Err(error) = transition(&mut building, BuildingStatus::Cancelled) {
                self.unresolved.insert(id, building);
                return Err(error.into());
            }
            refund_to_settlement(&self.ledger, &self.settlements, &mut building);
            self.archived.insert(id, building);
            return Ok(CancelReport {
                previous_status,
                already_cancelled: false,
                reverted: None,
            });
        }
        if let Some(archived) = self.archived.get_mut(&id) {
            let previous_status = archived.status;
            transition(archived, BuildingStatus::Cancelled)?;
            let already_cancelled = !previous_status.is_active();
            if !already_cancelled {
                refund_to_settlement(&self.ledger, &self.settlements, archived);
            }
            return Ok(CancelReport {
                previous_status,
                already_cancelled,
                reverted: None,
            });
        }

        let world_id = self.world_of(id)?;
        let ledger = &self.ledger;
        let settlements = &self.settlements;
        let scheduler = self
            .schedulers
            .get_mut(world_id)
            .ok_or(ConstructionError::UnknownBuilding { building_id: id })?;
        let report = scheduler.cancel(id, world, self.config.revert_on_cancel)?;
        if report.already_cancelled {
            return Ok(report);
        }

        let building = scheduler
            .building_mut(id)
            .ok_or(ConstructionError::UnknownBuilding { building_id: id })?;
        refund_to_settlement(ledger, settlements, building);
        Ok(report)
    }

    /// Advances one world by a tick. Worlds without construction get an
    /// empty report.
    pub fn tick_world(
        &mut self,
        world_id: WorldId,
        world: &mut dyn WorldAccess,
        tick: u64,
    ) -> TickReport {
        self.current_tick = self.current_tick.max(tick);
        match self.schedulers.get_mut(world_id) {
            Some(scheduler) => scheduler.tick(world, tick),
            None => TickReport {
                tick,
                ..TickReport::default()
            },
        }
    }

    pub fn building(&self, id: BuildingId) -> Option<&Building> {
        if let Some(detached) = self.archived.get(&id).or_else(|| self.unresolved.get(&id)) {
            return Some(detached);
        }
        let world_id = self.building_worlds.get(&id)?;
        self.schedulers.get(*world_id)?.building(id)
    }

    /// All known buildings, ordered by id.
    pub fn buildings(&self) -> Vec<&Building> {
        let mut all = self
            .schedulers
            .iter()
            .flat_map(|scheduler| scheduler.buildings())
            .chain(self.archived.values())
            .chain(self.unresolved.values())
            .collect::<Vec<_>>();
        all.sort_by_key(|building| building.id);
        all
    }

    /// Active buildings the schedulers are driving. Unresolved restored
    /// records are counted by [`ConstructionPipeline::unresolved_count`].
    pub fn active_count(&self) -> usize {
        self.schedulers
            .iter()
            .flat_map(|scheduler| scheduler.buildings())
            .filter(|building| building.status.is_active())
            .count()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    /// Tears down a world's scheduler. Active buildings there, unresolved
    /// ones included, are cancelled with their materials returned; all
    /// records are kept.
    pub fn unload_world(&mut self, world_id: WorldId) -> Vec<BuildingId> {
        let mut active = self
            .schedulers
            .get(world_id)
            .map(|scheduler| scheduler.active_building_ids())
            .unwrap_or_default();
        active.extend(
            self.unresolved
                .values()
                .filter(|building| building.world_id == world_id)
                .map(|building| building.id),
        );
        let mut cancelled = Vec::with_capacity(active.len());
        for id in active {
            match self.cancel_construction(id, None) {
                Ok(_) => cancelled.push(id),
                Err(error) => warn!(building_id = %id, error = %error, "unload_cancel_failed"),
            }
        }
        if let Some(scheduler) = self.schedulers.remove(world_id) {
            for building in scheduler.into_buildings() {
                self.building_worlds.remove(&building.id);
                self.archived.insert(building.id, building);
            }
        }
        info!(world_id = %world_id, cancelled = cancelled.len(), "construction_world_unloaded");
        cancelled
    }

    pub fn snapshot_buildings(&self) -> BuildingBook {
        BuildingBook {
            save_version: BUILDING_BOOK_VERSION,
            next_building_id: self.next_building_id,
            buildings: self.buildings().into_iter().cloned().collect(),
        }
    }

    /// Re-attaches persisted buildings that belong to `world_id`.
    ///
    /// In-progress buildings get a fresh queue from their blueprint; leading
    /// entries the world already holds are counted as built. Buildings this
    /// pipeline already knows are skipped, so the pass can run repeatedly
    /// while chunks stream in. Records whose blueprint cannot be placed stay
    /// unresolved, keep their materials, and are retried by later passes.
    pub fn restore_buildings(
        &mut self,
        book: &BuildingBook,
        world_id: WorldId,
        world: &dyn WorldAccess,
    ) -> RestoreSummary {
        self.next_building_id = self.next_building_id.max(book.next_building_id);
        let mut summary = RestoreSummary::default();

        let mut candidates = BTreeMap::<BuildingId, Building>::new();
        for saved in book.buildings.iter().filter(|b| b.world_id == world_id) {
            let known = self.building_worlds.contains_key(&saved.id)
                || self.archived.contains_key(&saved.id)
                || self.unresolved.contains_key(&saved.id);
            if known {
                if !self.unresolved.contains_key(&saved.id) {
                    summary.already_present += 1;
                }
                continue;
            }
            candidates.insert(saved.id, saved.clone());
        }
        let retries = self
            .unresolved
            .values()
            .filter(|building| building.world_id == world_id)
            .map(|building| building.id)
            .collect::<Vec<_>>();
        for id in retries {
            if let Some(building) = self.unresolved.remove(&id) {
                candidates.insert(id, building);
            }
        }

        for (id, mut building) in candidates {
            let mut queue = None;

            if building.status.is_active() {
                let blueprint = match self.library.load(&building.blueprint_ref) {
                    Ok(blueprint) => blueprint,
                    Err(error) => {
                        warn!(
                            building_id = %id,
                            blueprint = %building.blueprint_ref,
                            error = %error,
                            "restore_blueprint_unavailable"
                        );
                        self.unresolved.insert(id, building);
                        summary.unresolved += 1;
                        continue;
                    }
                };
                if !blueprint.fits_at(building.anchor_position, building.rotation) {
                    warn!(
                        building_id = %id,
                        anchor = %building.anchor_position,
                        "restore_footprint_outside_world"
                    );
                    self.unresolved.insert(id, building);
                    summary.unresolved += 1;
                    continue;
                }
                building.reservation_markers = blueprint
                    .footprint(building.anchor_position, building.rotation)
                    .into_iter()
                    .collect();
                if building.status == BuildingStatus::InProgress {
                    let mut resumed = PlacementQueue::from_blueprint(
                        &blueprint,
                        building.anchor_position,
                        building.rotation,
                    );
                    summary.entries_already_built += resumed.skip_satisfied_prefix(world);
                    building.advance_progress(resumed.progress());
                    summary.resumed_queues += 1;
                    queue = Some(resumed);
                }
            }

            let scheduler = self.schedulers.ensure_world(world_id, self.settings);
            if scheduler.restore(building, queue) {
                self.building_worlds.insert(id, world_id);
                summary.restored += 1;
            } else {
                summary.already_present += 1;
            }
        }

        info!(
            world_id = %world_id,
            restored = summary.restored,
            already_present = summary.already_present,
            resumed_queues = summary.resumed_queues,
            entries_already_built = summary.entries_already_built,
            unresolved = summary.unresolved,
            "construction_restore_pass"
        );
        summary
    }

    fn discard_reservation(&mut self, id: BuildingId) {
        if let Some(world_id) = self.building_worlds.remove(&id) {
            if let Some(scheduler) = self.schedulers.get_mut(world_id) {
                scheduler.unregister(id);
            }
        }
    }

    fn world_of(&self, id: BuildingId) -> Result<WorldId, ConstructionError> {
        self.building_worlds
            .get(&id)
            .copied()
            .ok_or(ConstructionError::UnknownBuilding { building_id: id })
    }

    fn scheduled_building(
        &self,
        world_id: WorldId,
        id: BuildingId,
    ) -> Result<&Building, ConstructionError> {
        self.schedulers
            .get(world_id)
            .and_then(|scheduler| scheduler.building(id))
            .ok_or(ConstructionError::UnknownBuilding { building_id: id })
    }

    fn check_build_height(&self, footprint: &[IntVec3]) -> Result<(), PlacementRejection> {
        let Some(lowest) = footprint.iter().map(|position| position.y).min() else {
            return Err(PlacementRejection::EmptyBlueprint);
        };
        let highest = footprint
            .iter()
            .map(|position| position.y)
            .max()
            .unwrap_or(lowest);
        if lowest < self.config.min_build_y || highest > self.config.max_build_y {
            return Err(PlacementRejection::OutsideBuildHeight {
                lowest,
                highest,
                min_y: self.config.min_build_y,
                max_y: self.config.max_build_y,
            });
        }
        Ok(())
    }
}

/// Returns what `building` holds to its settlement. Without a registered
/// settlement the materials stay on the record.
fn refund_to_settlement(
    ledger: &MaterialLedger,
    settlements: &BTreeMap<SettlementId, SharedMaterialStore>,
    building: &mut Building,
) {
    match settlements.get(&building.settlement_id) {
        Some(store) => {
            store.with_store(|store| ledger.return_to_store(building, store));
        }
        None => warn!(
            building_id = %building.id,
            settlement = %building.settlement_id,
            "cancel_settlement_missing_materials_kept"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{
        encode_blueprint, BlueprintSource, BlueprintUnit, MemorySource, ValidationLimits,
    };
    use crate::catalog::MaterialCatalog;
    use crate::ledger::MaterialCounts;
    use crate::persist::{encode_building_book, parse_building_book};
    use crate::queue::PlacementOutcome;
    use crate::types::{ContentState, ResourceKind};
    use crate::world::VoxelWorld;

    const HOME: SettlementId = SettlementId(1);

    struct Fixture {
        pipeline: ConstructionPipeline,
        source: MemorySource,
        world: VoxelWorld,
        tick: u64,
    }

    impl Fixture {
        fn new(config: ConstructionConfig) -> Self {
            let source = MemorySource::new();
            let library = BlueprintLibrary::new(source.clone(), ValidationLimits::default());
            let ledger = MaterialLedger::new(MaterialCatalog::passthrough());
            Self {
                pipeline: ConstructionPipeline::new(config, library, ledger),
                source,
                world: VoxelWorld::fully_loaded(),
                tick: 0,
            }
        }

        fn every_tick() -> Self {
            Self::new(ConstructionConfig {
                admit_interval_ticks: 1,
                ..ConstructionConfig::default()
            })
        }

        fn add_blueprint(&self, id: &str, dimensions: IntVec3, units: Vec<BlueprintUnit>) {
            let blueprint = Blueprint::from_units(
                BlueprintId::new(id),
                dimensions,
                units,
                String::new(),
                ValidationLimits::default(),
            )
            .expect("fixture blueprint");
            self.source
                .insert(BlueprintId::new(id), encode_blueprint(&blueprint).expect("encode"));
        }

        fn add_column(&self, id: &str, kind: &str, height: i32) {
            let units = (0..height)
                .map(|y| BlueprintUnit::new(IntVec3::new(0, y, 0), ContentState::new(kind)))
                .collect();
            self.add_blueprint(id, IntVec3::new(1, height, 1), units);
        }

        fn tick(&mut self) -> TickReport {
            self.tick += 1;
            self.pipeline
                .tick_world(WorldId(0), &mut self.world, self.tick)
        }

        fn stock(&self, resource: &str) -> u32 {
            self.pipeline
                .settlement_store(HOME)
                .expect("settlement")
                .snapshot()
                .quantity(&ResourceKind::new(resource))
        }
    }

    fn pipeline_over(source: &MemorySource, config: &ConstructionConfig) -> ConstructionPipeline {
        ConstructionPipeline::new(
            config.clone(),
            BlueprintLibrary::new(source.clone(), ValidationLimits::default()),
            MaterialLedger::new(MaterialCatalog::passthrough()),
        )
    }

    fn request(blueprint: &str, anchor: IntVec3, rotation: i32) -> ConstructionRequest {
        ConstructionRequest {
            blueprint_ref: BlueprintId::new(blueprint),
            anchor_position: anchor,
            rotation_degrees: rotation,
            settlement_ref: HOME,
            world_id: WorldId(0),
        }
    }

    #[test]
    fn minimal_wall_builds_bottom_up_and_completes() {
        let mut fx = Fixture::new(ConstructionConfig::default());
        fx.add_column("wall", "cobblestone", 2);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("cobblestone", 2));

        let id = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(10, 64, 10), 0))
            .expect("request");
        assert_eq!(
            fx.pipeline.building(id).expect("building").status(),
            BuildingStatus::InProgress
        );

        let mut placed = Vec::new();
        let mut completed = Vec::new();
        for _ in 0..12 {
            let report = fx.tick();
            placed.extend(
                report
                    .feedback
                    .iter()
                    .filter(|event| event.outcome == PlacementOutcome::Placed)
                    .map(|event| event.position),
            );
            completed.extend(report.completed);
        }

        assert_eq!(
            placed,
            vec![IntVec3::new(10, 64, 10), IntVec3::new(10, 65, 10)]
        );
        let building = fx.pipeline.building(id).expect("building");
        assert_eq!(building.progress(), 1.0);
        assert_eq!(building.status(), BuildingStatus::Completed);
        assert_eq!(completed.len(), 1);
        assert_eq!(
            completed[0].materials_used.get(&ResourceKind::new("cobblestone")),
            Some(&2)
        );
        assert_eq!(fx.stock("cobblestone"), 0);
    }

    #[test]
    fn insufficient_funds_create_nothing() {
        let mut fx = Fixture::every_tick();
        let units = (0..64)
            .map(|i| {
                BlueprintUnit::new(
                    IntVec3::new(i % 4, i / 16, (i / 4) % 4),
                    ContentState::new("brick"),
                )
            })
            .collect();
        fx.add_blueprint("tower", IntVec3::new(4, 4, 4), units);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("brick", 32));

        let error = fx
            .pipeline
            .request_construction(&request("tower", IntVec3::new(0, 64, 0), 0))
            .expect_err("too expensive");
        match error {
            ConstructionError::InsufficientMaterials(shortfall) => {
                assert_eq!(shortfall.shortfalls[0].required, 64);
                assert_eq!(shortfall.shortfalls[0].available, 32);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(fx.stock("brick"), 32);
        assert!(fx.pipeline.buildings().is_empty());
        assert!(fx
            .pipeline
            .schedulers()
            .get(WorldId(0))
            .and_then(|scheduler| scheduler.reserved_by(IntVec3::new(0, 64, 0)))
            .is_none());
    }

    #[test]
    fn directional_unit_faces_east_after_quarter_turn() {
        let mut fx = Fixture::every_tick();
        fx.add_blueprint(
            "kiln",
            IntVec3::new(1, 1, 1),
            vec![BlueprintUnit::new(
                IntVec3::ZERO,
                ContentState::new("furnace").with_property("facing", "north"),
            )],
        );
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("furnace", 1));

        fx.pipeline
            .request_construction(&request("kiln", IntVec3::new(5, 70, 5), 90))
            .expect("request");
        fx.tick();

        let placed = fx.world.content_at(IntVec3::new(5, 70, 5));
        assert_eq!(placed.property("facing"), Some("east"));
    }

    #[test]
    fn cancel_mid_construction_stops_placements_and_returns_materials() {
        let mut fx = Fixture::every_tick();
        fx.add_column("chimney", "brick", 10);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("brick", 15));

        let id = fx
            .pipeline
            .request_construction(&request("chimney", IntVec3::new(0, 64, 0), 0))
            .expect("request");
        assert_eq!(fx.stock("brick"), 5);
        for _ in 0..4 {
            fx.tick();
        }
        assert_eq!(fx.world.occupied_count(), 4);

        let report = fx
            .pipeline
            .cancel_construction(id, Some(&mut fx.world))
            .expect("cancel");
        assert_eq!(report.previous_status, BuildingStatus::InProgress);
        let building = fx.pipeline.building(id).expect("record kept");
        assert_eq!(building.status(), BuildingStatus::Cancelled);
        assert!(building.provided_materials().is_empty());
        assert!(building.reservation_markers().is_empty());
        assert_eq!(fx.stock("brick"), 15);

        for _ in 0..10 {
            assert!(fx.tick().feedback.is_empty());
        }
        assert_eq!(fx.world.occupied_count(), 4);

        // A repeated cancel returns nothing a second time.
        let again = fx.pipeline.cancel_construction(id, None).expect("repeat");
        assert!(again.already_cancelled);
        assert_eq!(fx.stock("brick"), 15);
    }

    #[test]
    fn revert_on_cancel_restores_the_world() {
        let mut fx = Fixture::new(ConstructionConfig {
            admit_interval_ticks: 1,
            revert_on_cancel: true,
            ..ConstructionConfig::default()
        });
        fx.add_column("post", "log", 5);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("log", 5));
        let id = fx
            .pipeline
            .request_construction(&request("post", IntVec3::new(0, 64, 0), 0))
            .expect("request");
        fx.tick();
        fx.tick();

        let report = fx
            .pipeline
            .cancel_construction(id, Some(&mut fx.world))
            .expect("cancel");
        assert_eq!(report.reverted.map(|summary| summary.restored), Some(2));
        assert_eq!(fx.world.occupied_count(), 0);
        assert_eq!(fx.stock("log"), 5);
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_one() {
        let mut fx = Fixture::every_tick();
        fx.add_blueprint(
            "hut",
            IntVec3::new(2, 2, 1),
            vec![
                BlueprintUnit::new(IntVec3::new(0, 0, 0), ContentState::new("planks")),
                BlueprintUnit::new(IntVec3::new(1, 0, 0), ContentState::new("air")),
                BlueprintUnit::new(IntVec3::new(0, 1, 0), ContentState::new("planks")),
                BlueprintUnit::new(IntVec3::new(1, 1, 0), ContentState::new("planks")),
            ],
        );
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("planks", 3));
        let id = fx
            .pipeline
            .request_construction(&request("hut", IntVec3::new(0, 64, 0), 180))
            .expect("request");

        let mut samples = vec![fx.pipeline.building(id).expect("building").progress()];
        for _ in 0..6 {
            fx.tick();
            samples.push(fx.pipeline.building(id).expect("building").progress());
        }
        assert!(samples.windows(2).all(|pair| pair[0] <= pair[1]), "{samples:?}");
        assert_eq!(samples.last().copied(), Some(1.0));
        assert_eq!(samples[1], 0.25);
    }

    #[test]
    fn starting_twice_debits_once() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 3);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 10));

        let id = fx
            .pipeline
            .reserve_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("reserve");
        assert_eq!(fx.stock("stone"), 10);
        fx.pipeline.start_construction(id).expect("start");
        let error = fx.pipeline.start_construction(id).expect_err("second start");
        assert!(matches!(error, ConstructionError::InvalidTransition(_)));
        assert_eq!(fx.stock("stone"), 7);
    }

    #[test]
    fn reserved_building_can_be_cancelled_without_material_movement() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 2);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 2));
        let id = fx
            .pipeline
            .reserve_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("reserve");

        let report = fx.pipeline.cancel_construction(id, None).expect("cancel");
        assert_eq!(report.previous_status, BuildingStatus::Reserved);
        assert_eq!(fx.stock("stone"), 2);

        // Footprint is free again.
        fx.pipeline
            .request_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("footprint released");
    }

    #[test]
    fn invalid_placements_are_rejected_before_any_building_exists() {
        let mut fx = Fixture::new(ConstructionConfig {
            max_build_y: 100,
            ..ConstructionConfig::default()
        });
        fx.add_column("wall", "stone", 4);
        fx.add_blueprint(
            "ghost",
            IntVec3::new(1, 1, 1),
            vec![BlueprintUnit::new(IntVec3::ZERO, ContentState::new("air"))],
        );
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 100));

        let cases = [
            (request("wall", IntVec3::new(0, 64, 0), 45), "rotation"),
            (request("wall", IntVec3::new(0, 98, 0), 0), "build height"),
            (request("ghost", IntVec3::new(0, 64, 0), 0), "nothing to build"),
        ];
        for (bad, expected) in cases {
            let error = fx.pipeline.request_construction(&bad).expect_err(expected);
            assert!(
                matches!(error, ConstructionError::InvalidPlacement { .. }),
                "{expected}: {error}"
            );
            assert!(error.to_string().contains(expected), "{error}");
        }
        assert!(fx.pipeline.buildings().is_empty());
        assert_eq!(fx.stock("stone"), 100);

        let mut unknown = request("wall", IntVec3::new(0, 64, 0), 0);
        unknown.settlement_ref = SettlementId(99);
        assert!(matches!(
            fx.pipeline.request_construction(&unknown),
            Err(ConstructionError::UnknownSettlement { .. })
        ));
        assert!(matches!(
            fx.pipeline
                .request_construction(&request("missing", IntVec3::new(0, 64, 0), 0)),
            Err(ConstructionError::Blueprint(BlueprintError::NotFound { .. }))
        ));
    }

    #[test]
    fn overlapping_footprints_are_rejected() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 3);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 10));
        let first = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("first");

        let error = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(0, 66, 0), 0))
            .expect_err("overlap");
        match error {
            ConstructionError::InvalidPlacement {
                reason: PlacementRejection::Overlap { position, other },
            } => {
                assert_eq!(position, IntVec3::new(0, 66, 0));
                assert_eq!(other, first);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(fx.stock("stone"), 7);
    }

    #[test]
    fn unloading_a_world_cancels_and_refunds() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 3);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 3));
        let id = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("request");
        fx.tick();

        assert_eq!(fx.pipeline.unload_world(WorldId(0)), vec![id]);
        assert_eq!(fx.stock("stone"), 3);
        assert!(fx.pipeline.schedulers().get(WorldId(0)).is_none());
        assert_eq!(
            fx.pipeline.building(id).map(Building::status),
            Some(BuildingStatus::Cancelled)
        );
        assert!(fx.tick().feedback.is_empty());
    }

    #[test]
    fn restore_resumes_from_world_state_and_is_idempotent() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 5);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 5));
        let id = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("request");
        fx.tick();
        fx.tick();

        let raw = encode_building_book(&fx.pipeline.snapshot_buildings()).expect("encode");
        let book = parse_building_book(&raw).expect("parse");
        let saved = book.buildings.first().expect("saved building");
        assert_eq!(saved.progress(), 0.4);
        assert!(saved.reservation_markers().is_empty());

        let library = BlueprintLibrary::new(fx.source.clone(), ValidationLimits::default());
        let mut restored = ConstructionPipeline::new(
            fx.pipeline.config().clone(),
            library,
            MaterialLedger::new(MaterialCatalog::passthrough()),
        );
        restored.add_settlement(HOME, MaterialStore::new());

        let first = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(first.restored, 1);
        assert_eq!(first.resumed_queues, 1);
        assert_eq!(first.entries_already_built, 2);
        let second = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(second.restored, 0);
        assert_eq!(second.already_present, 1);

        let scheduler = restored.schedulers().get(WorldId(0)).expect("scheduler");
        assert_eq!(scheduler.active_queue_count(), 1);
        assert_eq!(scheduler.reserved_by(IntVec3::new(0, 68, 0)), Some(id));

        let mut completed = 0;
        for tick in 3..=5 {
            completed += restored
                .tick_world(WorldId(0), &mut fx.world, tick)
                .completed
                .len();
        }
        assert_eq!(completed, 1);
        assert_eq!(fx.world.occupied_count(), 5);
        let building = restored.building(id).expect("building");
        assert_eq!(building.status(), BuildingStatus::Completed);
        let mut expected = MaterialCounts::new();
        expected.insert(ResourceKind::new("stone"), 5);
        assert_eq!(building.provided_materials(), &expected);

        // New ids never collide with restored ones.
        fx.add_column("post", "stone", 1);
        restored.add_settlement(HOME, MaterialStore::new().with("stone", 1));
        let next = restored
            .request_construction(&request("post", IntVec3::new(9, 64, 9), 0))
            .expect("new request");
        assert!(next.0 > id.0);
    }

    #[test]
    fn anchor_past_the_coordinate_range_is_rejected() {
        let mut fx = Fixture::every_tick();
        let units = (0..3)
            .map(|x| BlueprintUnit::new(IntVec3::new(x, 0, 0), ContentState::new("stone")))
            .collect();
        fx.add_blueprint("wall", IntVec3::new(3, 1, 1), units);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 3));
        let edge = IntVec3::new(i32::MAX - 1, 64, 0);

        let error = fx
            .pipeline
            .request_construction(&request("wall", edge, 0))
            .expect_err("runs off the coordinate range");
        assert!(
            matches!(
                error,
                ConstructionError::InvalidPlacement {
                    reason: PlacementRejection::OutsideWorld { anchor }
                } if anchor == edge
            ),
            "{error}"
        );
        assert_eq!(fx.stock("stone"), 3);
        assert!(fx.pipeline.buildings().is_empty());

        // Turned around, the same anchor extends toward smaller x and fits.
        let id = fx
            .pipeline
            .request_construction(&request("wall", edge, 180))
            .expect("fits when rotated");
        for _ in 0..3 {
            fx.tick();
        }
        assert_eq!(
            fx.pipeline.building(id).map(Building::status),
            Some(BuildingStatus::Completed)
        );
        assert_eq!(fx.world.occupied_count(), 3);
        assert_eq!(fx.stock("stone"), 0);
    }

    #[test]
    fn cancelling_an_unresolved_restore_returns_its_materials() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 5);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 5));
        let id = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("request");
        let book = fx.pipeline.snapshot_buildings();

        let mut restored = pipeline_over(&MemorySource::new(), fx.pipeline.config());
        let store = restored.add_settlement(HOME, MaterialStore::new());
        let summary = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.restored, 0);
        assert_eq!(restored.unresolved_count(), 1);
        assert_eq!(restored.active_count(), 0);
        assert_eq!(
            restored.building(id).map(Building::status),
            Some(BuildingStatus::InProgress)
        );

        let report = restored.cancel_construction(id, None).expect("cancel");
        assert_eq!(report.previous_status, BuildingStatus::InProgress);
        assert!(!report.already_cancelled);
        assert_eq!(store.snapshot().quantity(&ResourceKind::new("stone")), 5);
        let building = restored.building(id).expect("building");
        assert_eq!(building.status(), BuildingStatus::Cancelled);
        assert!(building.provided_materials().is_empty());
        assert_eq!(restored.unresolved_count(), 0);

        let raw = encode_building_book(&restored.snapshot_buildings()).expect("encode");
        parse_building_book(&raw).expect("cancelled record loads again");

        let again = restored.cancel_construction(id, None).expect("repeat cancel");
        assert!(again.already_cancelled);
        assert_eq!(store.snapshot().quantity(&ResourceKind::new("stone")), 5);
    }

    #[test]
    fn unresolved_restore_resumes_once_its_blueprint_appears() {
        let mut fx = Fixture::every_tick();
        fx.add_column("wall", "stone", 5);
        fx.pipeline
            .add_settlement(HOME, MaterialStore::new().with("stone", 5));
        let id = fx
            .pipeline
            .request_construction(&request("wall", IntVec3::new(0, 64, 0), 0))
            .expect("request");
        fx.tick();
        fx.tick();
        let book = fx.pipeline.snapshot_buildings();

        let source = MemorySource::new();
        let mut restored = pipeline_over(&source, fx.pipeline.config());
        restored.add_settlement(HOME, MaterialStore::new());
        let first = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(first.unresolved, 1);
        let still_missing = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(still_missing.unresolved, 1);
        assert_eq!(still_missing.already_present, 0);

        let wall = BlueprintId::new("wall");
        source.insert(wall.clone(), fx.source.read(&wall).expect("fixture bytes"));
        let resumed = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(resumed.restored, 1);
        assert_eq!(resumed.resumed_queues, 1);
        assert_eq!(resumed.entries_already_built, 2);
        assert_eq!(resumed.unresolved, 0);
        assert_eq!(restored.unresolved_count(), 0);
        assert_eq!(restored.active_count(), 1);

        let settled = restored.restore_buildings(&book, WorldId(0), &fx.world);
        assert_eq!(settled.already_present, 1);
        assert_eq!(settled.restored, 0);

        for tick in 3..=5 {
            restored.tick_world(WorldId(0), &mut fx.world, tick);
        }
        assert_eq!(
            restored.building(id).map(Building::status),
            Some(BuildingStatus::Completed)
        );
        assert_eq!(fx.world.occupied_count(), 5);
    }

    #[test]
    fn request_json_uses_rotation_degrees() {
        let request: ConstructionRequest = serde_json::from_str(
            r#"{ "blueprint_ref": "houses/hut", "anchor_position": { "x": 1, "y": 64, "z": -3 },
                 "rotation": 270, "settlement_ref": 4 }"#,
        )
        .expect("parse");
        assert_eq!(request.rotation_degrees, 270);
        assert_eq!(request.world_id, WorldId(0));
        assert_eq!(request.settlement_ref, SettlementId(4));
    }
}
