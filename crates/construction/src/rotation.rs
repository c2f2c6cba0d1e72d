use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ContentState, IntVec3};

const FACING_PROPERTY: &str = "facing";
const SHAPE_PROPERTY: &str = "shape";
const AXIS_PROPERTY: &str = "axis";

/// Clockwise quarter turns around the vertical axis, viewed from above.
/// Serialized as degrees; only 0, 90, 180 and 270 deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Clockwise180,
    Clockwise270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [
        Rotation::None,
        Rotation::Clockwise90,
        Rotation::Clockwise180,
        Rotation::Clockwise270,
    ];

    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Self::None),
            90 => Some(Self::Clockwise90),
            180 => Some(Self::Clockwise180),
            270 => Some(Self::Clockwise270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        u16::from(self.quarter_turns()) * 90
    }

    pub fn quarter_turns(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Clockwise90 => 1,
            Self::Clockwise180 => 2,
            Self::Clockwise270 => 3,
        }
    }

    pub fn from_quarter_turns(turns: u8) -> Self {
        Self::ALL[usize::from(turns % 4)]
    }

    /// Rotation equivalent to applying `self` and then `other`.
    pub fn then(self, other: Self) -> Self {
        Self::from_quarter_turns(self.quarter_turns() + other.quarter_turns())
    }

    pub fn inverse(self) -> Self {
        Self::from_quarter_turns(4 - self.quarter_turns())
    }

    fn is_odd(self) -> bool {
        self.quarter_turns() % 2 == 1
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_degrees(i32::from(value))
            .ok_or_else(|| format!("rotation must be 0, 90, 180 or 270 degrees, got {value}"))
    }
}

impl From<Rotation> for u16 {
    fn from(value: Rotation) -> Self {
        value.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}deg", self.degrees())
    }
}

/// Horizontal facing. North is -Z, east is +X.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    North,
    East,
    South,
    West,
}

impl Facing {
    const CLOCKWISE: [Facing; 4] = [Facing::North, Facing::East, Facing::South, Facing::West];

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "north" => Some(Self::North),
            "east" => Some(Self::East),
            "south" => Some(Self::South),
            "west" => Some(Self::West),
            _ => None,
        }
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Self::North => "north",
            Self::East => "east",
            Self::South => "south",
            Self::West => "west",
        }
    }

    pub fn rotated(self, rotation: Rotation) -> Self {
        let index = Self::CLOCKWISE
            .iter()
            .position(|facing| *facing == self)
            .unwrap_or(0);
        Self::CLOCKWISE[(index + usize::from(rotation.quarter_turns())) % 4]
    }
}

/// Corner shape of stair-like content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StairShape {
    Straight,
    InnerLeft,
    InnerRight,
    OuterLeft,
    OuterRight,
}

impl StairShape {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "straight" => Some(Self::Straight),
            "inner_left" => Some(Self::InnerLeft),
            "inner_right" => Some(Self::InnerRight),
            "outer_left" => Some(Self::OuterLeft),
            "outer_right" => Some(Self::OuterRight),
            _ => None,
        }
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Self::Straight => "straight",
            Self::InnerLeft => "inner_left",
            Self::InnerRight => "inner_right",
            Self::OuterLeft => "outer_left",
            Self::OuterRight => "outer_right",
        }
    }

    /// Left and right swap on odd quarter turns; even turns keep the shape.
    pub fn rotated(self, rotation: Rotation) -> Self {
        if !rotation.is_odd() {
            return self;
        }
        match self {
            Self::Straight => Self::Straight,
            Self::InnerLeft => Self::InnerRight,
            Self::InnerRight => Self::InnerLeft,
            Self::OuterLeft => Self::OuterRight,
            Self::OuterRight => Self::OuterLeft,
        }
    }
}

/// Rotates a local position around the vertical axis through the local
/// origin. Y is never changed.
pub fn rotate_position(position: IntVec3, rotation: Rotation) -> IntVec3 {
    let IntVec3 { x, y, z } = position;
    match rotation {
        Rotation::None => position,
        Rotation::Clockwise90 => IntVec3::new(-z, y, x),
        Rotation::Clockwise180 => IntVec3::new(-x, y, -z),
        Rotation::Clockwise270 => IntVec3::new(z, y, -x),
    }
}

/// Re-maps directional state carried by `content`. `half` and anything
/// unrecognized pass through untouched.
pub fn rotate_orientation(content: &ContentState, rotation: Rotation) -> ContentState {
    let mut rotated = content.clone();
    if rotation == Rotation::None {
        return rotated;
    }

    if let Some(facing) = content.property(FACING_PROPERTY).and_then(Facing::from_token) {
        rotated.properties.insert(
            FACING_PROPERTY.to_string(),
            facing.rotated(rotation).as_token().to_string(),
        );
    }
    if let Some(shape) = content.property(SHAPE_PROPERTY).and_then(StairShape::from_token) {
        rotated.properties.insert(
            SHAPE_PROPERTY.to_string(),
            shape.rotated(rotation).as_token().to_string(),
        );
    }
    if rotation.is_odd() {
        let swapped = match content.property(AXIS_PROPERTY) {
            Some("x") => Some("z"),
            Some("z") => Some("x"),
            _ => None,
        };
        if let Some(axis) = swapped {
            rotated
                .properties
                .insert(AXIS_PROPERTY.to_string(), axis.to_string());
        }
    }
    rotated
}
