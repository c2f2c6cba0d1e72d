mod atomic_io;
pub mod blueprint;
pub mod building;
pub mod catalog;
pub mod config;
pub mod ledger;
pub mod lifecycle;
pub mod persist;
pub mod pipeline;
pub mod queue;
pub mod rotation;
pub mod scheduler;
pub mod types;
pub mod world;

pub use blueprint::{
    decode_blueprint, encode_blueprint, write_blueprint_file, Blueprint, BlueprintError,
    BlueprintLibrary, BlueprintSource, BlueprintUnit, DirectorySource, MemorySource,
    ResolvedUnit, ValidationLimits, BLUEPRINT_FILE_EXTENSION, BLUEPRINT_FORMAT_VERSION,
    DEFAULT_MAX_EXTENT,
};
pub use building::{Building, CompletionRecord, Footprint};
pub use catalog::{CatalogError, CatalogErrorCode, MaterialCatalog, MaterialMapping, SourceLocation};
pub use config::{ConfigError, ConstructionConfig};
pub use ledger::{
    InsufficientMaterials, MaterialCounts, MaterialLedger, MaterialStore, SharedMaterialStore,
    Shortfall,
};
pub use lifecycle::{transition, BuildingStatus, InvalidTransition, TransitionOutcome};
pub use persist::{
    encode_building_book, load_building_book, parse_building_book, save_building_book,
    BuildingBook, PersistError, BUILDING_BOOK_VERSION,
};
pub use pipeline::{ConstructionError, ConstructionPipeline, ConstructionRequest, RestoreSummary};
pub use queue::{PlacementAttempt, PlacementEntry, PlacementOutcome, PlacementQueue, RevertSummary};
pub use rotation::{rotate_orientation, rotate_position, Facing, Rotation, StairShape};
pub use scheduler::{
    CancelReport, ConstructionScheduler, PlacementFeedback, PlacementRejection, SchedulerError,
    SchedulerRegistry, SchedulerSettings, TickReport,
};
pub use types::{
    BlueprintId, BuildingId, ContentState, ExtraData, IntVec3, ResourceKind, SettlementId,
    TagValue, WorldId, VOID_KINDS,
};
pub use world::{ChunkPos, VoxelWorld, WorldAccess, CHUNK_SIZE};
