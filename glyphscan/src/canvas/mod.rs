//! Stitching tiles of a group into one canvas and cutting it back apart.


use common::Buffer2;
use tracing::warn;

use crate::source::TileSource;
use crate::tile::{TileBounds, TileCoord, TileGroup};

/// Pixel geometry of a group's canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasLayout {
    pub bounds: TileBounds,
    /// Pixel side of one tile at this resolution.
    pub tile_size: usize,
}

impl CanvasLayout {
    pub fn new(group: &TileGroup, tile_size: usize) -> Self {
        Self {
            bounds: group.bounds(),
            tile_size,
        }
    }

    pub fn width(&self) -> usize {
        self.bounds.width_tiles() * self.tile_size
    }

    pub fn height(&self) -> usize {
        self.bounds.height_tiles() * self.tile_size
    }

    /// Top-left pixel of `coord` inside the canvas.
    pub fn tile_origin(&self, coord: TileCoord) -> (usize, usize) {
        let (dx, dy) = self.bounds.offset_of(coord);
        (dx * self.tile_size, dy * self.tile_size)
    }

    /// The same layout at a different per-tile resolution.
    pub fn scaled(&self, tile_size: usize) -> Self {
        Self {
            bounds: self.bounds,
            tile_size,
        }
    }
}

/// Pastes every tile of `group` into a zero-filled canvas.
///
/// Tiles the source does not have, cannot read, or returns at the wrong size
/// are logged and left blank.
pub fn build<P>(group: &TileGroup, source: &dyn TileSource<P>, tile_size: usize) -> Buffer2<P>
where
    P: Clone + Default,
{
    let layout = CanvasLayout::new(group, tile_size);
    let mut canvas = Buffer2::new_default(layout.width(), layout.height());

    for &coord in group {
        let tile = match source.lookup(coord) {
            Ok(Some(tile)) => tile,
            Ok(None) => {
                warn!(tile = %coord, "Source tile not found, leaving blank");
                continue;
            }
            Err(err) => {
                warn!(tile = %coord, error = %err, "Failed to read source tile, leaving blank");
                continue;
            }
        };

        if tile.width() != tile_size || tile.height() != tile_size {
            warn!(
                tile = %coord,
                width = tile.width(),
                height = tile.height(),
                "Source tile has unexpected size {}x{}, leaving blank",
                tile.width(),
                tile.height()
            );
            continue;
        }

        let (x, y) = layout.tile_origin(coord);
        canvas.blit(&tile, x, y);
    }

    canvas
}

/// Cuts `canvas` back into per-tile rasters, in group order.
///
/// Works at whatever resolution the canvas holds: the per-tile side is the
/// canvas width divided by the group's width in tiles.
pub fn slice<T: Clone>(canvas: &Buffer2<T>, group: &TileGroup) -> Vec<(TileCoord, Buffer2<T>)> {
    let layout = layout_of(canvas, group);
    group
        .tiles()
        .iter()
        .map(|&coord| {
            let (x, y) = layout.tile_origin(coord);
            (coord, canvas.crop(x, y, layout.tile_size, layout.tile_size))
        })
        .collect()
}

/// Recovers the layout of a canvas built for `group`.
///
/// Panics if the canvas is not an exact per-tile multiple of the group's bounds.
pub fn layout_of<T>(canvas: &Buffer2<T>, group: &TileGroup) -> CanvasLayout {
    let bounds = group.bounds();
    let tile_size = canvas.width() / bounds.width_tiles();
    assert!(
        canvas.width() == tile_size * bounds.width_tiles()
            && canvas.height() == tile_size * bounds.height_tiles(),
        "{}x{} canvas does not match a {}x{} tile group",
        canvas.width(),
        canvas.height(),
        bounds.width_tiles(),
        bounds.height_tiles()
    );
    CanvasLayout { bounds, tile_size }
}
