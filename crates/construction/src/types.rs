use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Content kinds that describe empty space rather than something to build.
pub const VOID_KINDS: [&str; 3] = ["air", "void", "structure_void"];

/// Integer grid position. Y is the vertical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntVec3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl IntVec3 {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Saturates at the `i32` range. Use [`IntVec3::checked_offset`] where an
    /// overflow has to be refused.
    pub fn offset(self, other: Self) -> Self {
        Self {
            x: self.x.saturating_add(other.x),
            y: self.y.saturating_add(other.y),
            z: self.z.saturating_add(other.z),
        }
    }

    pub fn checked_offset(self, other: Self) -> Option<Self> {
        Some(Self {
            x: self.x.checked_add(other.x)?,
            y: self.y.checked_add(other.y)?,
            z: self.z.checked_add(other.z)?,
        })
    }

    pub fn min_components(self, other: Self) -> Self {
        Self {
            x: self.x.min(other.x),
            y: self.y.min(other.y),
            z: self.z.min(other.z),
        }
    }

    pub fn max_components(self, other: Self) -> Self {
        Self {
            x: self.x.max(other.x),
            y: self.y.max(other.y),
            z: self.z.max(other.z),
        }
    }

    /// Product of the components when read as box dimensions. `None` if any
    /// component is not positive.
    pub fn volume(self) -> Option<u64> {
        if self.x <= 0 || self.y <= 0 || self.z <= 0 {
            return None;
        }
        Some(self.x as u64 * self.y as u64 * self.z as u64)
    }

    /// True when every component lies in `[0, dimensions)`.
    pub fn within(self, dimensions: Self) -> bool {
        (0..dimensions.x).contains(&self.x)
            && (0..dimensions.y).contains(&self.y)
            && (0..dimensions.z).contains(&self.z)
    }
}

impl fmt::Display for IntVec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildingId(pub u64);

impl fmt::Display for BuildingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "building#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettlementId(pub u64);

impl fmt::Display for SettlementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "settlement#{}", self.0)
    }
}

/// World or dimension. `WorldId(0)` is the default world.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorldId(pub u32);

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}

/// Resource identifier of a blueprint, e.g. `houses/small_hut`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlueprintId(pub String);

impl BlueprintId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlueprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlueprintId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A storable resource in a settlement's material store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(pub String);

impl ResourceKind {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What occupies one unit of space: a content kind plus string-valued
/// state properties (`facing`, `half`, `shape`, `axis`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentState {
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ContentState {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn void() -> Self {
        Self::new(VOID_KINDS[0])
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_void(&self) -> bool {
        VOID_KINDS.contains(&self.kind.as_str())
    }
}

impl fmt::Display for ContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        if self.properties.is_empty() {
            return Ok(());
        }
        f.write_str("[")?;
        for (idx, (key, value)) in self.properties.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("]")
    }
}

/// Tagged value carried in a unit's extra data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    Byte(i8),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    List(Vec<TagValue>),
    Compound(BTreeMap<String, TagValue>),
}

/// Per-unit payload written alongside content (inventories, sign text, ...).
/// Always owned; queue entries hold their own copy.
pub type ExtraData = BTreeMap<String, TagValue>;
