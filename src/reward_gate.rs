//! Decides when the subject has earned a reward.
//!
//! Each wall of the corridor carries [`TILES_PER_SIDE`] tiles, any of which
//! the operator can mark as a reward tile. A reward tile pays out once the
//! subject has stayed within the proximity threshold of it for the dwell
//! duration without interruption, and then stays spent until the next lap.
//!
//! Both walls keep a single dwell timer each, shared by all of that wall's
//! tiles. On the reference tracks tiles are far enough apart that only one of
//! them can be in range at a time; two tiles in range on the same wall would
//! share (and restart) one timer.

use crate::config::ControllerConfig;

use log::{debug, info};

/// Number of wall tiles on each side of the corridor.
pub const TILES_PER_SIDE: usize = 13;

/// A wall of the corridor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Left-hand wall, seen from the start.
    Left,
    /// Right-hand wall, seen from the start.
    Right,
}

impl Side {
    /// Both walls, in evaluation order.
    pub const ALL: [Side; 2] = [Side::Left, Side::Right];

    fn idx(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

/// A reward that has just been earned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerReward {
    /// Wall of the tile that paid out.
    pub side: Side,
    /// Index of the tile that paid out.
    pub tile: usize,
}

/// Per-tile armed/spent bookkeeping plus the per-wall dwell timers.
#[derive(Debug, Clone)]
pub struct RewardGate {
    proximity_threshold: f64,
    dwell_secs: f64,
    enabled: bool,
    reward_tiles: [[bool; TILES_PER_SIDE]; 2],
    armed: [[bool; TILES_PER_SIDE]; 2],
    dwell_started: [Option<f64>; 2],
}

impl RewardGate {
    /// A gate with no reward tiles, reward mode off and every tile armed.
    pub fn new(proximity_threshold: f64, dwell_secs: f64) -> Self {
        Self {
            proximity_threshold,
            dwell_secs,
            enabled: false,
            reward_tiles: [[false; TILES_PER_SIDE]; 2],
            armed: [[true; TILES_PER_SIDE]; 2],
            dwell_started: [None; 2],
        }
    }

    /// A gate using the thresholds from `config`.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.proximity_threshold, config.dwell_secs)
    }

    /// Turns reward mode on or off. Turning it off stops any running timers.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.clear_timers();
        }
        self.enabled = enabled;
    }

    /// Stops both walls' dwell timers. Any dwell has to start over.
    pub fn clear_timers(&mut self) {
        self.dwell_started = [None; 2];
    }

    /// True while reward mode is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Marks tile `index` on `side` as a reward tile or a plain one. Returns
    /// `false` if there is no such tile.
    pub fn set_reward_tile(&mut self, side: Side, index: usize, reward: bool) -> bool {
        match self.reward_tiles[side.idx()].get_mut(index) {
            Some(slot) => {
                *slot = reward;
                true
            }
            None => false,
        }
    }

    /// True if tile `index` on `side` is a reward tile.
    pub fn is_reward_tile(&self, side: Side, index: usize) -> bool {
        self.reward_tiles[side.idx()]
            .get(index)
            .copied()
            .unwrap_or(false)
    }

    /// Indices of the reward tiles on `side`.
    pub fn reward_tiles(&self, side: Side) -> impl Iterator<Item = usize> + '_ {
        self.reward_tiles[side.idx()]
            .iter()
            .enumerate()
            .filter(|(_, &reward)| reward)
            .map(|(i, _)| i)
    }

    /// True if tile `index` on `side` can still pay out this lap.
    pub fn is_armed(&self, side: Side, index: usize) -> bool {
        self.armed[side.idx()].get(index).copied().unwrap_or(false)
    }

    /// When the dwell timer for `side` started, if it is running.
    pub fn dwell_started(&self, side: Side) -> Option<f64> {
        self.dwell_started[side.idx()]
    }

    /// One dwell step for a single tile at time `now`.
    ///
    /// Within the proximity threshold the side's timer starts (or keeps
    /// running); once it has run for the dwell duration the tile is spent, the
    /// timer cleared and a trigger returned. Out of range, or on a spent tile,
    /// the timer is cleared so that dwell has to start over.
    pub fn evaluate(
        &mut self,
        side: Side,
        tile: usize,
        distance_to_tile: f64,
        now: f64,
    ) -> Option<TriggerReward> {
        let s = side.idx();
        if !self.is_armed(side, tile) || distance_to_tile >= self.proximity_threshold {
            self.dwell_started[s] = None;
            return None;
        }

        match self.dwell_started[s] {
            None => {
                debug!("Dwell started at {:?} tile {} ({:.3})", side, tile, now);
                self.dwell_started[s] = Some(now);
                None
            }
            Some(start) if now - start >= self.dwell_secs => {
                info!("Reward earned at {:?} tile {}", side, tile);
                self.armed[s][tile] = false;
                self.dwell_started[s] = None;
                Some(TriggerReward { side, tile })
            }
            Some(_) => None,
        }
    }

    /// Evaluates every armed reward tile on `side` for one tick, given the
    /// subject's distance to each tile as `(index, distance)` pairs.
    ///
    /// The side's timer follows the nearest armed reward tile; it is only
    /// cleared once all of the side's tiles have been considered and none of
    /// them is in range.
    pub fn evaluate_side<I>(&mut self, side: Side, tile_distances: I, now: f64) -> Option<TriggerReward>
    where
        I: IntoIterator<Item = (usize, f64)>,
    {
        if !self.enabled {
            self.dwell_started[side.idx()] = None;
            return None;
        }

        let nearest = tile_distances
            .into_iter()
            .filter(|&(tile, _)| self.is_reward_tile(side, tile) && self.is_armed(side, tile))
            .min_by(|(_, a), (_, b)| a.total_cmp(b));

        match nearest {
            Some((tile, distance)) => self.evaluate(side, tile, distance, now),
            None => {
                self.dwell_started[side.idx()] = None;
                None
            }
        }
    }

    /// Re-arms every tile on both walls. Called once per lap.
    pub fn reset_lap(&mut self) {
        self.armed = [[true; TILES_PER_SIDE]; 2];
    }
}
