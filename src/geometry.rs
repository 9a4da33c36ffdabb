//! Where things are on the track.
//!
//! The controller never builds geometry itself; it asks a [`TrackGeometry`]
//! where a given distance along the path lies, where the end plate is, and
//! where the reward tiles sit. [`StraightTrack`] is a plain corridor used by
//! the binaries and the tests when no scene is attached.

use crate::config::TrackConfig;
use crate::reward_gate::{Side, TILES_PER_SIDE};

use std::fmt::{self, Display};

/// A point in the scene.
#[derive(Debug, PartialEq, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    /// Shorthand constructor.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// The path the subject travels along, queried but never mutated.
pub trait TrackGeometry {
    /// The point `distance` units along the path. Distances past the end wrap
    /// around to the start.
    fn position_at_distance(&self, distance: f64) -> Position;

    /// The last point of the path, where the end plate sits.
    fn terminal_position(&self) -> Position;

    /// How many points define the path.
    fn point_count(&self) -> usize;

    /// Where reward tile `index` on wall `side` is, if the track has one.
    fn reward_tile_position(&self, side: Side, index: usize) -> Option<Position>;
}

/// A straight corridor along +z, starting at the origin, with a row of wall
/// tiles on either side.
#[derive(Debug, Clone)]
pub struct StraightTrack {
    config: TrackConfig,
}

impl StraightTrack {
    /// Lay out a corridor from its config.
    pub fn new(config: TrackConfig) -> Self {
        Self { config }
    }
}

impl Default for StraightTrack {
    fn default() -> Self {
        Self::new(TrackConfig::default())
    }
}

impl TrackGeometry for StraightTrack {
    fn position_at_distance(&self, distance: f64) -> Position {
        let length = self.config.length;
        let along = distance.rem_euclid(length);
        // Landing exactly on a whole lap means the end, not the start.
        let along = if along == 0.0 && distance > 0.0 {
            length
        } else {
            along
        };
        Position::new(0.0, 0.0, along)
    }

    fn terminal_position(&self) -> Position {
        Position::new(0.0, 0.0, self.config.length)
    }

    fn point_count(&self) -> usize {
        self.config.point_count
    }

    fn reward_tile_position(&self, side: Side, index: usize) -> Option<Position> {
        if index >= TILES_PER_SIDE {
            return None;
        }
        let z = self.config.first_tile_offset + index as f64 * self.config.tile_spacing;
        if z > self.config.length {
            return None;
        }
        let x = match side {
            Side::Left => -self.config.wall_offset,
            Side::Right => self.config.wall_offset,
        };
        Some(Position::new(x, 0.0, z))
    }
}
