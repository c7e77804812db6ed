//! Slippy-tile addressing and grouping of requested tiles into mosaics.
//!
//! Requested tiles are partitioned into 4-connected groups so that each group
//! can be stitched into a single canvas. Groups above a size cap are cut into
//! square chunks of the group's bounding box to bound per-canvas memory.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fmt;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Integer `(x, y)` tile address at zoom level `z`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl TileCoord {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Edge-sharing neighbors at the same zoom level (N, S, E, W).
    pub fn neighbors(self) -> impl Iterator<Item = TileCoord> {
        let Self { x, y, z } = self;
        [
            y.checked_sub(1).map(|y| TileCoord::new(x, y, z)),
            y.checked_add(1).map(|y| TileCoord::new(x, y, z)),
            x.checked_add(1).map(|x| TileCoord::new(x, y, z)),
            x.checked_sub(1).map(|x| TileCoord::new(x, y, z)),
        ]
        .into_iter()
        .flatten()
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Inclusive tile-space bounding box of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileBounds {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileBounds {
    pub fn width_tiles(&self) -> usize {
        (self.max_x - self.min_x) as usize + 1
    }

    pub fn height_tiles(&self) -> usize {
        (self.max_y - self.min_y) as usize + 1
    }

    /// Offset of `tile` from the top-left corner, in tiles.
    pub fn offset_of(&self, tile: TileCoord) -> (usize, usize) {
        debug_assert!(self.contains(tile));
        ((tile.x - self.min_x) as usize, (tile.y - self.min_y) as usize)
    }

    pub fn contains(&self, tile: TileCoord) -> bool {
        (self.min_x..=self.max_x).contains(&tile.x) && (self.min_y..=self.max_y).contains(&tile.y)
    }
}

/// Non-empty ordered set of tiles processed as one canvas.
///
/// Groups built by [`group_tiles`] are 4-connected. Chunks produced by
/// [`split_if_oversized`] only guarantee that they lie inside one block of
/// the parent's bounding box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileGroup {
    tiles: Vec<TileCoord>,
}

impl TileGroup {
    pub fn new(tiles: Vec<TileCoord>) -> Self {
        assert!(!tiles.is_empty(), "TileGroup must not be empty");
        Self { tiles }
    }

    #[inline]
    pub fn tiles(&self) -> &[TileCoord] {
        &self.tiles
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn bounds(&self) -> TileBounds {
        let first = self.tiles[0];
        self.tiles.iter().fold(
            TileBounds {
                min_x: first.x,
                min_y: first.y,
                max_x: first.x,
                max_y: first.y,
            },
            |b, t| TileBounds {
                min_x: b.min_x.min(t.x),
                min_y: b.min_y.min(t.y),
                max_x: b.max_x.max(t.x),
                max_y: b.max_y.max(t.y),
            },
        )
    }

    /// Short identifier used in logs and debug file names.
    pub fn label(&self, index: usize) -> String {
        let bounds = self.bounds();
        format!("group_{}_coords_{}_{}", index, bounds.min_x, bounds.min_y)
    }
}

impl<'a> IntoIterator for &'a TileGroup {
    type Item = &'a TileCoord;
    type IntoIter = std::slice::Iter<'a, TileCoord>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}

/// Partitions `tiles` into 4-connected components.
///
/// Seeds are taken in input order, so the group order follows the first
/// appearance of each component; membership does not depend on order.
/// Duplicate coordinates are collapsed.
pub fn group_tiles(tiles: &[TileCoord]) -> Vec<TileGroup> {
    let tile_set: HashSet<TileCoord> = tiles.iter().copied().collect();
    let mut visited: HashSet<TileCoord> = HashSet::with_capacity(tile_set.len());
    let mut queue = VecDeque::new();
    let mut groups = Vec::new();

    for &seed in tiles {
        if !visited.insert(seed) {
            continue;
        }
        queue.push_back(seed);

        let mut members = Vec::new();
        while let Some(tile) = queue.pop_front() {
            members.push(tile);
            for neighbor in tile.neighbors() {
                if tile_set.contains(&neighbor) && visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        groups.push(TileGroup::new(members));
    }

    groups
}

/// Cuts `group` into `chunk_side x chunk_side` blocks of its bounding box when it
/// holds more than `max_tile_count` tiles.
///
/// Blocks are visited row-major from the top-left corner; each keeps only the
/// tiles of `group` inside it and empty blocks are dropped, so every tile lands
/// in exactly one chunk.
pub fn split_if_oversized(
    group: &TileGroup,
    max_tile_count: usize,
    chunk_side: usize,
) -> Result<Vec<TileGroup>> {
    if chunk_side == 0 {
        return Err(Error::invalid_config("chunk side must be at least 1 tile"));
    }
    if group.len() <= max_tile_count {
        return Ok(vec![group.clone()]);
    }

    let bounds = group.bounds();
    let present: HashSet<TileCoord> = group.tiles().iter().copied().collect();
    let z = group.tiles()[0].z;
    let side = chunk_side as u64;
    let mut chunks = Vec::new();

    let mut block_y = bounds.min_y as u64;
    while block_y <= bounds.max_y as u64 {
        let mut block_x = bounds.min_x as u64;
        while block_x <= bounds.max_x as u64 {
            let mut members = Vec::new();
            let y_end = (block_y + side).min(bounds.max_y as u64 + 1);
            let x_end = (block_x + side).min(bounds.max_x as u64 + 1);
            for y in block_y..y_end {
                for x in block_x..x_end {
                    let tile = TileCoord::new(x as u32, y as u32, z);
                    if present.contains(&tile) {
                        members.push(tile);
                    }
                }
            }
            if !members.is_empty() {
                chunks.push(TileGroup::new(members));
            }
            block_x += side;
        }
        block_y += side;
    }

    Ok(chunks)
}

/// Groups `tiles` and chunks every oversized group.
pub fn plan_chunks(
    tiles: &[TileCoord],
    max_tile_count: usize,
    chunk_side: usize,
) -> Result<Vec<TileGroup>> {
    let groups = group_tiles(tiles);
    let mut chunks = Vec::with_capacity(groups.len());
    for group in &groups {
        let parts = split_if_oversized(group, max_tile_count, chunk_side)?;
        if parts.len() > 1 {
            tracing::info!(
                tiles = group.len(),
                chunks = parts.len(),
                "Group is too large, chunking into {}x{} grids",
                chunk_side,
                chunk_side
            );
        }
        chunks.extend(parts);
    }
    tracing::info!(
        groups = groups.len(),
        chunks = chunks.len(),
        "Planned processing chunks"
    );
    Ok(chunks)
}
