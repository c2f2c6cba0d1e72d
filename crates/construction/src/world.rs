use std::collections::{HashMap, HashSet};

use crate::types::{ContentState, ExtraData, IntVec3};

/// Horizontal edge length of a loadable world column.
pub const CHUNK_SIZE: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn containing(position: IntVec3) -> Self {
        Self {
            x: position.x.div_euclid(CHUNK_SIZE),
            z: position.z.div_euclid(CHUNK_SIZE),
        }
    }
}

/// The slice of world state the construction core reads and writes. The
/// host guarantees a single writer per world at a time.
pub trait WorldAccess {
    fn is_loaded(&self, position: IntVec3) -> bool;

    /// Current content; void where nothing is stored.
    fn content_at(&self, position: IntVec3) -> ContentState;

    fn extra_data_at(&self, position: IntVec3) -> ExtraData;

    /// Replaces whatever is at `position`. Writing void content clears it.
    fn place(&mut self, position: IntVec3, content: ContentState, extra_data: ExtraData);
}

/// Sparse in-memory world used by the headless host and by tests.
#[derive(Debug, Clone, Default)]
pub struct VoxelWorld {
    cells: HashMap<IntVec3, (ContentState, ExtraData)>,
    loaded_chunks: HashSet<ChunkPos>,
    all_loaded: bool,
    writes: u64,
}

impl VoxelWorld {
    /// Nothing loaded; chunks must be loaded explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fully_loaded() -> Self {
        Self {
            all_loaded: true,
            ..Self::default()
        }
    }

    pub fn load_chunk(&mut self, chunk: ChunkPos) {
        self.loaded_chunks.insert(chunk);
    }

    /// Also leaves fully-loaded mode; only explicitly loaded chunks stay.
    pub fn unload_chunk(&mut self, chunk: ChunkPos) {
        self.all_loaded = false;
        self.loaded_chunks.remove(&chunk);
    }

    /// Loads every chunk touched by the box between two corners.
    pub fn load_area(&mut self, corner_a: IntVec3, corner_b: IntVec3) {
        let min = ChunkPos::containing(corner_a.min_components(corner_b));
        let max = ChunkPos::containing(corner_a.max_components(corner_b));
        for x in min.x..=max.x {
            for z in min.z..=max.z {
                self.loaded_chunks.insert(ChunkPos { x, z });
            }
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.len()
    }

    /// Total calls to [`WorldAccess::place`].
    pub fn write_count(&self) -> u64 {
        self.writes
    }
}

impl WorldAccess for VoxelWorld {
    fn is_loaded(&self, position: IntVec3) -> bool {
        self.all_loaded || self.loaded_chunks.contains(&ChunkPos::containing(position))
    }

    fn content_at(&self, position: IntVec3) -> ContentState {
        self.cells
            .get(&position)
            .map(|(content, _)| content.clone())
            .unwrap_or_else(ContentState::void)
    }

    fn extra_data_at(&self, position: IntVec3) -> ExtraData {
        self.cells
            .get(&position)
            .map(|(_, extra)| extra.clone())
            .unwrap_or_default()
    }

    fn place(&mut self, position: IntVec3, content: ContentState, extra_data: ExtraData) {
        self.writes = self.writes.saturating_add(1);
        if content.is_void() {
            self.cells.remove(&position);
        } else {
            self.cells.insert(position, (content, extra_data));
        }
    }
}
