use tracing::{debug, warn};

use crate::blueprint::Blueprint;
use crate::rotation::Rotation;
use crate::types::{ContentState, ExtraData, IntVec3};
use crate::world::WorldAccess;

/// One resolved world mutation. Extra data is an owned copy, so later edits
/// to the source blueprint never reach an in-flight queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementEntry {
    pub world_position: IntVec3,
    pub content: ContentState,
    pub extra_data: ExtraData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    Placed,
    SkippedVoid,
    /// Target chunk not loaded; the entry stays at the head of the queue.
    Deferred { attempts: u32 },
    /// Target already holds different non-void content.
    Blocked { existing: ContentState },
    /// Deferred past the configured bound and given up on.
    Abandoned { attempts: u32 },
}

impl PlacementOutcome {
    pub fn advances_queue(&self) -> bool {
        !matches!(self, Self::Deferred { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Placed => "placed",
            Self::SkippedVoid => "skipped_void",
            Self::Deferred { .. } => "deferred",
            Self::Blocked { .. } => "blocked",
            Self::Abandoned { .. } => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacementAttempt {
    pub position: IntVec3,
    pub content: ContentState,
    pub outcome: PlacementOutcome,
}

#[derive(Debug, Clone)]
struct PlacedRecord {
    position: IntVec3,
    placed: ContentState,
    previous: ContentState,
    previous_extra: ExtraData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevertSummary {
    pub restored: usize,
    pub skipped_unloaded: usize,
    pub skipped_changed: usize,
}

/// Ordered placements for one building, drained strictly front to back.
#[derive(Debug, Clone)]
pub struct PlacementQueue {
    entries: Vec<PlacementEntry>,
    cursor: usize,
    head_deferrals: u32,
    placed: Vec<PlacedRecord>,
}

impl PlacementQueue {
    pub fn from_blueprint(blueprint: &Blueprint, anchor: IntVec3, rotation: Rotation) -> Self {
        let entries = blueprint
            .resolve(anchor, rotation)
            .into_iter()
            .map(|unit| PlacementEntry {
                world_position: unit.world_position,
                content: unit.content,
                extra_data: unit.extra_data,
            })
            .collect();
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: Vec<PlacementEntry>) -> Self {
        Self {
            entries,
            cursor: 0,
            head_deferrals: 0,
            placed: Vec::new(),
        }
    }

    pub fn total_count(&self) -> usize {
        self.entries.len()
    }

    pub fn consumed_count(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.cursor
    }

    pub fn is_drained(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    pub fn peek(&self) -> Option<&PlacementEntry> {
        self.entries.get(self.cursor)
    }

    /// Entries placed so far by this queue, in placement order.
    pub fn placed_positions(&self) -> impl Iterator<Item = IntVec3> + '_ {
        self.placed.iter().map(|record| record.position)
    }

    /// `consumed / total`; an empty queue is complete.
    pub fn progress(&self) -> f32 {
        if self.entries.is_empty() {
            return 1.0;
        }
        self.cursor as f32 / self.entries.len() as f32
    }

    /// Attempts the head entry. Returns `None` once drained.
    pub fn place_next(
        &mut self,
        world: &mut dyn WorldAccess,
        max_deferrals: Option<u32>,
    ) -> Option<PlacementAttempt> {
        let entry = self.entries.get(self.cursor)?;
        let position = entry.world_position;
        let content = entry.content.clone();

        let outcome = if content.is_void() {
            PlacementOutcome::SkippedVoid
        } else if !world.is_loaded(position) {
            let attempts = self.head_deferrals.saturating_add(1);
            if max_deferrals.is_some_and(|bound| attempts > bound) {
                PlacementOutcome::Abandoned { attempts }
            } else {
                PlacementOutcome::Deferred { attempts }
            }
        } else {
            let existing = world.content_at(position);
            if !existing.is_void() && existing != content {
                PlacementOutcome::Blocked { existing }
            } else {
                let previous_extra = world.extra_data_at(position);
                world.place(position, content.clone(), entry.extra_data.clone());
                self.placed.push(PlacedRecord {
                    position,
                    placed: content.clone(),
                    previous: existing,
                    previous_extra,
                });
                PlacementOutcome::Placed
            }
        };

        if let PlacementOutcome::Deferred { attempts } = outcome {
            self.head_deferrals = attempts;
        } else {
            self.cursor += 1;
            self.head_deferrals = 0;
        }

        Some(PlacementAttempt {
            position,
            content,
            outcome,
        })
    }

    /// Advances past the leading entries the world already satisfies. Used
    /// after a load, where placements from before the save are not recorded.
    pub(crate) fn skip_satisfied_prefix(&mut self, world: &dyn WorldAccess) -> usize {
        let start = self.cursor;
        while let Some(entry) = self.entries.get(self.cursor) {
            let satisfied = entry.content.is_void()
                || (world.is_loaded(entry.world_position)
                    && world.content_at(entry.world_position) == entry.content);
            if !satisfied {
                break;
            }
            self.cursor += 1;
        }
        self.cursor - start
    }

    /// Restores what this queue overwrote, newest first. Cells that are not
    /// loaded or that no longer hold what was placed are left alone.
    pub fn revert_placed(&mut self, world: &mut dyn WorldAccess) -> RevertSummary {
        let mut summary = RevertSummary::default();
        while let Some(record) = self.placed.pop() {
            if !world.is_loaded(record.position) {
                warn!(position = %record.position, "revert_skipped_unloaded_chunk");
                summary.skipped_unloaded += 1;
                continue;
            }
            if world.content_at(record.position) != record.placed {
                debug!(position = %record.position, "revert_skipped_changed_content");
                summary.skipped_changed += 1;
                continue;
            }
            world.place(record.position, record.previous, record.previous_extra);
            summary.restored += 1;
        }
        summary
    }
}
