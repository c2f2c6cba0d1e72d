use std::collections::BTreeMap;
use std::process::ExitCode;
use std::thread;
use std::time::Instant;

use construction::{
    save_building_book, BuildingId, ConstructionPipeline, PersistError, PlacementOutcome,
    TickReport, VoxelWorld, WorldId,
};
use thiserror::Error;
use tracing::{error, info, warn};

use super::bootstrap::{AppWiring, LoopConfig};
use super::orders::Scenario;

#[derive(Debug, Error)]
pub(crate) enum HostError {
    #[error("failed to save buildings: {0}")]
    Save(#[from] PersistError),
}

/// Totals over a whole run, logged on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunSummary {
    pub(crate) ticks: u64,
    pub(crate) orders_accepted: usize,
    pub(crate) orders_rejected: usize,
    pub(crate) placed: usize,
    pub(crate) blocked: usize,
    pub(crate) abandoned: usize,
    pub(crate) deferred: usize,
    pub(crate) completed: usize,
    pub(crate) cancelled: usize,
    pub(crate) hit_tick_limit: bool,
}

impl RunSummary {
    fn record(&mut self, report: &TickReport) {
        for event in &report.feedback {
            match event.outcome {
                PlacementOutcome::Placed => self.placed += 1,
                PlacementOutcome::Blocked { .. } => self.blocked += 1,
                PlacementOutcome::Abandoned { .. } => self.abandoned += 1,
                PlacementOutcome::Deferred { .. } => self.deferred += 1,
                PlacementOutcome::SkippedVoid => {}
            }
        }
        self.completed += report.completed.len();
    }
}

pub(crate) fn run(app: AppWiring) -> ExitCode {
    match run_host(app) {
        Ok(summary) => {
            info!(
                ticks = summary.ticks,
                orders_accepted = summary.orders_accepted,
                orders_rejected = summary.orders_rejected,
                placed = summary.placed,
                blocked = summary.blocked,
                abandoned = summary.abandoned,
                completed = summary.completed,
                cancelled = summary.cancelled,
                hit_tick_limit = summary.hit_tick_limit,
                "shutdown"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "host_failed");
            ExitCode::FAILURE
        }
    }
}

pub(crate) fn run_host(app: AppWiring) -> Result<RunSummary, HostError> {
    let AppWiring {
        paths,
        loop_config,
        mut pipeline,
        scenario,
        resume,
    } = app;
    let mut host = Host::new(&scenario);

    if let Some(book) = resume {
        for world_id in book
            .buildings
            .iter()
            .map(|building| building.world_id())
            .collect::<std::collections::BTreeSet<_>>()
        {
            let world = host.world_mut(world_id);
            pipeline.restore_buildings(&book, world_id, &*world);
        }
    }

    info!(
        target_tps = loop_config.target_tps,
        max_ticks = loop_config.max_ticks,
        realtime = loop_config.realtime,
        "loop_config"
    );
    let summary = host.run(&mut pipeline, &scenario, &loop_config);

    let save = paths.buildings_save();
    save_building_book(&save, &pipeline.snapshot_buildings())?;
    info!(
        path = %save.display(),
        unresolved = pipeline.unresolved_count(),
        "buildings_saved"
    );
    Ok(summary)
}

struct Host {
    worlds: BTreeMap<WorldId, VoxelWorld>,
    streamed: Vec<WorldId>,
    /// Scenario order index to the building it produced.
    issued: BTreeMap<usize, BuildingId>,
}

impl Host {
    fn new(scenario: &Scenario) -> Self {
        Self {
            worlds: BTreeMap::new(),
            streamed: scenario.streamed_worlds.clone(),
            issued: BTreeMap::new(),
        }
    }

    fn world_mut(&mut self, world_id: WorldId) -> &mut VoxelWorld {
        let streamed = self.streamed.contains(&world_id);
        self.worlds.entry(world_id).or_insert_with(|| {
            if streamed {
                VoxelWorld::new()
            } else {
                VoxelWorld::fully_loaded()
            }
        })
    }

    fn run(
        &mut self,
        pipeline: &mut ConstructionPipeline,
        scenario: &Scenario,
        loop_config: &LoopConfig,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let last_scripted_tick = scenario.last_scripted_tick();
        let tick_duration = loop_config.tick_duration();
        let summary_interval = loop_config.summary_interval_ticks.max(1);
        let mut next_deadline = Instant::now();

        for tick in 1..=loop_config.max_ticks {
            summary.ticks = tick;

            for load in scenario.area_loads.iter().filter(|load| load.at_tick == tick) {
                self.world_mut(load.world_id).load_area(load.from, load.to);
                info!(world_id = %load.world_id, from = %load.from, to = %load.to, "area_loaded");
            }
            self.issue_orders(pipeline, scenario, tick, &mut summary);
            self.apply_cancellations(pipeline, scenario, tick, &mut summary);

            let world_ids = pipeline.schedulers().world_ids();
            for world_id in world_ids {
                let report = pipeline.tick_world(world_id, self.world_mut(world_id), tick);
                summary.record(&report);
            }

            if tick % summary_interval == 0 {
                info!(
                    tick,
                    active = pipeline.active_count(),
                    placed = summary.placed,
                    completed = summary.completed,
                    "construction_summary"
                );
            }

            if tick >= last_scripted_tick && pipeline.active_count() == 0 {
                return summary;
            }

            if loop_config.realtime {
                next_deadline += tick_duration;
                let now = Instant::now();
                if next_deadline > now {
                    thread::sleep(next_deadline - now);
                } else {
                    next_deadline = now;
                }
            }
        }

        warn!(
            max_ticks = loop_config.max_ticks,
            active = pipeline.active_count(),
            "tick_limit_reached"
        );
        summary.hit_tick_limit = true;
        summary
    }

    fn issue_orders(
        &mut self,
        pipeline: &mut ConstructionPipeline,
        scenario: &Scenario,
        tick: u64,
        summary: &mut RunSummary,
    ) {
        // Orders scripted for tick 0 go out with the first tick.
        let due = scenario
            .orders
            .iter()
            .enumerate()
            .filter(|(_, order)| order.at_tick.max(1) == tick);
        for (index, order) in due {
            match pipeline.request_construction(&order.request) {
                Ok(id) => {
                    self.issued.insert(index, id);
                    summary.orders_accepted += 1;
                }
                Err(error) => {
                    warn!(
                        order = index,
                        blueprint = %order.request.blueprint_ref,
                        error = %error,
                        "order_rejected"
                    );
                    summary.orders_rejected += 1;
                }
            }
        }
    }

    fn apply_cancellations(
        &mut self,
        pipeline: &mut ConstructionPipeline,
        scenario: &Scenario,
        tick: u64,
        summary: &mut RunSummary,
    ) {
        for (index, order) in scenario.orders.iter().enumerate() {
            if order.cancel_at_tick.map(|at| at.max(1)) != Some(tick) {
                continue;
            }
            let Some(id) = self.issued.get(&index).copied() else {
                continue;
            };
            if pipeline
                .building(id)
                .map_or(true, |building| building.status().is_terminal())
            {
                info!(order = index, building_id = %id, "cancel_skipped_already_settled");
                continue;
            }
            let world = self.world_mut(order.request.world_id);
            match pipeline.cancel_construction(id, Some(world)) {
                Ok(report) if !report.already_cancelled => summary.cancelled += 1,
                Ok(_) => {}
                Err(error) => warn!(order = index, building_id = %id, error = %error, "cancel_failed"),
            }
        }
    }
}
