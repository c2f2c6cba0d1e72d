mod format;
mod library;

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::rotation::{rotate_orientation, rotate_position, Rotation};
use crate::types::{BlueprintId, ContentState, ExtraData, IntVec3};

pub use format::{
    decode_blueprint, encode_blueprint, write_blueprint_file, BLUEPRINT_FILE_EXTENSION,
    BLUEPRINT_FORMAT_VERSION,
};
pub use library::{BlueprintLibrary, BlueprintSource, DirectorySource, MemorySource};

pub const DEFAULT_MAX_EXTENT: i32 = 128;

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("blueprint {identifier} not found at {path}")]
    NotFound {
        identifier: BlueprintId,
        path: PathBuf,
    },
    #[error("failed to read blueprint {identifier} from {path}: {source}")]
    Io {
        identifier: BlueprintId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("blueprint {identifier} is malformed: {message}")]
    Malformed {
        identifier: BlueprintId,
        message: String,
    },
    #[error("blueprint {identifier} has a unit at {position} outside dimensions {dimensions}")]
    OutOfBoundsUnit {
        identifier: BlueprintId,
        position: IntVec3,
        dimensions: IntVec3,
    },
    #[error("blueprint {identifier} has more than one unit at {position}")]
    DuplicateUnit {
        identifier: BlueprintId,
        position: IntVec3,
    },
}

impl BlueprintError {
    pub fn identifier(&self) -> &BlueprintId {
        match self {
            Self::NotFound { identifier, .. }
            | Self::Io { identifier, .. }
            | Self::Malformed { identifier, .. }
            | Self::OutOfBoundsUnit { identifier, .. }
            | Self::DuplicateUnit { identifier, .. } => identifier,
        }
    }

    /// Structural or validation failure of the resource itself, as opposed
    /// to the resource being unreachable.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. } | Self::OutOfBoundsUnit { .. } | Self::DuplicateUnit { .. }
        )
    }

    pub(crate) fn malformed(identifier: &BlueprintId, message: impl Into<String>) -> Self {
        Self::Malformed {
            identifier: identifier.clone(),
            message: message.into(),
        }
    }
}

/// Soft limits applied while validating a freshly parsed blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_extent: i32,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_extent: DEFAULT_MAX_EXTENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlueprintUnit {
    pub position: IntVec3,
    pub content: ContentState,
    pub extra_data: ExtraData,
}

impl BlueprintUnit {
    pub fn new(position: IntVec3, content: ContentState) -> Self {
        Self {
            position,
            content,
            extra_data: ExtraData::new(),
        }
    }
}

/// A unit transformed into world space for a given anchor and rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUnit {
    pub world_position: IntVec3,
    pub content: ContentState,
    pub extra_data: ExtraData,
}

/// Immutable, validated prefabricated structure.
#[derive(Debug, Clone)]
pub struct Blueprint {
    id: BlueprintId,
    dimensions: IntVec3,
    units: Vec<BlueprintUnit>,
    build_order: Vec<usize>,
    materials: BTreeMap<String, u32>,
    source_hash: String,
}

impl Blueprint {
    /// Validates `units` against `dimensions` and fixes the build order.
    /// Any hard violation rejects the whole blueprint.
    pub fn from_units(
        id: BlueprintId,
        dimensions: IntVec3,
        units: Vec<BlueprintUnit>,
        source_hash: String,
        limits: ValidationLimits,
    ) -> Result<Self, BlueprintError> {
        let Some(volume) = dimensions.volume() else {
            return Err(BlueprintError::malformed(
                &id,
                format!("dimensions must be positive, got {dimensions}"),
            ));
        };
        if dimensions.x > limits.max_extent
            || dimensions.y > limits.max_extent
            || dimensions.z > limits.max_extent
        {
            warn!(
                blueprint = %id,
                dimensions = %dimensions,
                max_extent = limits.max_extent,
                "blueprint_oversized"
            );
        }
        if units.len() as u64 > volume {
            warn!(
                blueprint = %id,
                unit_count = units.len(),
                volume,
                "blueprint_unit_count_exceeds_volume"
            );
        }

        let mut seen = HashSet::<IntVec3>::with_capacity(units.len());
        for unit in &units {
            if !unit.position.within(dimensions) {
                return Err(BlueprintError::OutOfBoundsUnit {
                    identifier: id,
                    position: unit.position,
                    dimensions,
                });
            }
            if !seen.insert(unit.position) {
                return Err(BlueprintError::DuplicateUnit {
                    identifier: id,
                    position: unit.position,
                });
            }
        }

        let mut build_order = (0..units.len()).collect::<Vec<_>>();
        build_order.sort_by_key(|&idx| {
            let pos = units[idx].position;
            (pos.y, pos.x, pos.z)
        });

        let mut materials = BTreeMap::<String, u32>::new();
        for unit in units.iter().filter(|unit| !unit.content.is_void()) {
            let count = materials.entry(unit.content.kind.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }

        Ok(Self {
            id,
            dimensions,
            units,
            build_order,
            materials,
            source_hash,
        })
    }

    pub fn id(&self) -> &BlueprintId {
        &self.id
    }

    pub fn dimensions(&self) -> IntVec3 {
        self.dimensions
    }

    /// Units in source order.
    pub fn units(&self) -> &[BlueprintUnit] {
        &self.units
    }

    /// Units bottom layer first; within a layer by x, then z.
    pub fn units_in_build_order(&self) -> impl Iterator<Item = &BlueprintUnit> + '_ {
        self.build_order.iter().map(move |&idx| &self.units[idx])
    }

    /// Content kind to count, void units excluded.
    pub fn materials(&self) -> &BTreeMap<String, u32> {
        &self.materials
    }

    /// Lowercase hex SHA-256 of the resource bytes this blueprint was parsed from.
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn non_void_count(&self) -> usize {
        self.materials.values().map(|count| *count as usize).sum()
    }

    /// Units in build order, rotated around the local origin and translated
    /// to `anchor`. Extra data is cloned per unit.
    pub fn resolve(&self, anchor: IntVec3, rotation: Rotation) -> Vec<ResolvedUnit> {
        self.units_in_build_order()
            .map(|unit| ResolvedUnit {
                world_position: anchor.offset(rotate_position(unit.position, rotation)),
                content: rotate_orientation(&unit.content, rotation),
                extra_data: unit.extra_data.clone(),
            })
            .collect()
    }

    /// True when every unit, void ones included, lands inside the `i32`
    /// coordinate range for this pose.
    pub fn fits_at(&self, anchor: IntVec3, rotation: Rotation) -> bool {
        self.units.iter().all(|unit| {
            anchor
                .checked_offset(rotate_position(unit.position, rotation))
                .is_some()
        })
    }

    /// World positions of the non-void units for a given pose.
    pub fn footprint(&self, anchor: IntVec3, rotation: Rotation) -> Vec<IntVec3> {
        self.units_in_build_order()
            .filter(|unit| !unit.content.is_void())
            .map(|unit| anchor.offset(rotate_position(unit.position, rotation)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TagValue;

    fn unit(x: i32, y: i32, z: i32, kind: &str) -> BlueprintUnit {
        BlueprintUnit::new(IntVec3::new(x, y, z), ContentState::new(kind))
    }

    fn build(dimensions: IntVec3, units: Vec<BlueprintUnit>) -> Result<Blueprint, BlueprintError> {
        Blueprint::from_units(
            BlueprintId::new("test/hut"),
            dimensions,
            units,
            String::new(),
            ValidationLimits::default(),
        )
    }

    #[test]
    fn build_order_is_bottom_up_regardless_of_source_order() {
        let blueprint = build(
            IntVec3::new(2, 3, 2),
            vec![
                unit(1, 2, 0, "planks"),
                unit(0, 0, 1, "cobblestone"),
                unit(1, 1, 1, "planks"),
                unit(0, 0, 0, "cobblestone"),
                unit(1, 0, 0, "cobblestone"),
            ],
        )
        .expect("valid");

        let order = blueprint
            .units_in_build_order()
            .map(|unit| unit.position)
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                IntVec3::new(0, 0, 0),
                IntVec3::new(0, 0, 1),
                IntVec3::new(1, 0, 0),
                IntVec3::new(1, 1, 1),
                IntVec3::new(1, 2, 0),
            ]
        );
    }

    #[test]
    fn out_of_bounds_unit_fails_whole_load() {
        let error = build(
            IntVec3::new(2, 2, 2),
            vec![unit(0, 0, 0, "stone"), unit(0, 2, 0, "stone")],
        )
        .expect_err("out of bounds");
        assert!(matches!(
            error,
            BlueprintError::OutOfBoundsUnit { position, .. } if position == IntVec3::new(0, 2, 0)
        ));
        assert!(error.is_malformed());
    }

    #[test]
    fn negative_position_is_out_of_bounds() {
        let error = build(IntVec3::new(2, 2, 2), vec![unit(-1, 0, 0, "stone")])
            .expect_err("negative");
        assert!(matches!(error, BlueprintError::OutOfBoundsUnit { .. }));
    }

    #[test]
    fn duplicate_positions_are_rejected() {
        let error = build(
            IntVec3::new(2, 2, 2),
            vec![unit(1, 1, 1, "stone"), unit(1, 1, 1, "dirt")],
        )
        .expect_err("duplicate");
        assert!(matches!(error, BlueprintError::DuplicateUnit { .. }));
    }

    #[test]
    fn non_positive_dimensions_are_malformed() {
        let error = build(IntVec3::new(0, 1, 1), Vec::new()).expect_err("zero width");
        assert!(matches!(error, BlueprintError::Malformed { .. }));
    }

    #[test]
    fn oversized_blueprint_is_accepted() {
        let blueprint = Blueprint::from_units(
            BlueprintId::new("big"),
            IntVec3::new(200, 1, 1),
            vec![unit(150, 0, 0, "stone")],
            String::new(),
            ValidationLimits { max_extent: 64 },
        )
        .expect("oversized is only a warning");
        assert_eq!(blueprint.dimensions().x, 200);
    }

    #[test]
    fn materials_exclude_void_units() {
        let blueprint = build(
            IntVec3::new(3, 1, 1),
            vec![
                unit(0, 0, 0, "planks"),
                unit(1, 0, 0, "air"),
                unit(2, 0, 0, "planks"),
            ],
        )
        .expect("valid");
        assert_eq!(blueprint.materials().get("planks"), Some(&2));
        assert!(!blueprint.materials().contains_key("air"));
        assert_eq!(blueprint.non_void_count(), 2);
    }

    #[test]
    fn rotation_preserves_layer_order() {
        let blueprint = build(
            IntVec3::new(3, 3, 3),
            vec![
                unit(2, 2, 2, "a"),
                unit(0, 1, 2, "b"),
                unit(1, 0, 0, "c"),
                unit(2, 0, 1, "d"),
                unit(0, 2, 0, "e"),
            ],
        )
        .expect("valid");
        let source_layers = blueprint
            .units_in_build_order()
            .map(|unit| unit.position.y)
            .collect::<Vec<_>>();
        for rotation in Rotation::ALL {
            let resolved = blueprint.resolve(IntVec3::ZERO, rotation);
            let layers = resolved
                .iter()
                .map(|unit| unit.world_position.y)
                .collect::<Vec<_>>();
            assert_eq!(layers, source_layers, "rotation {rotation}");
            assert!(layers.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn resolve_translates_rotates_and_copies_extra_data() {
        let mut chest = BlueprintUnit::new(
            IntVec3::new(0, 0, 1),
            ContentState::new("chest").with_property("facing", "north"),
        );
        chest
            .extra_data
            .insert("loot".to_string(), TagValue::String("bread".to_string()));
        let blueprint = build(IntVec3::new(1, 1, 2), vec![chest]).expect("valid");

        let resolved = blueprint.resolve(IntVec3::new(10, 64, 10), Rotation::Clockwise90);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].world_position, IntVec3::new(9, 64, 10));
        assert_eq!(resolved[0].content.property("facing"), Some("east"));
        assert_eq!(
            resolved[0].extra_data.get("loot"),
            Some(&TagValue::String("bread".to_string()))
        );
    }

    #[test]
    fn fits_at_checks_every_unit_against_the_coordinate_range() {
        let blueprint = build(
            IntVec3::new(3, 1, 1),
            vec![unit(0, 0, 0, "stone"), unit(1, 0, 0, "stone"), unit(2, 0, 0, "air")],
        )
        .expect("valid");
        let near_max = IntVec3::new(i32::MAX - 1, 64, 0);
        assert!(!blueprint.fits_at(near_max, Rotation::None));
        assert!(blueprint.fits_at(near_max, Rotation::Clockwise180));
        assert!(!blueprint.fits_at(IntVec3::new(i32::MIN + 1, 64, 0), Rotation::Clockwise180));
        assert!(blueprint.fits_at(IntVec3::new(10, 64, 10), Rotation::Clockwise90));
    }
}
