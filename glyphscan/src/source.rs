//! Tile raster lookup.

use std::path::{Path, PathBuf};

use common::Buffer2;
use hashbrown::HashMap;

use crate::error::Result;
use crate::raster::{self, Rgb};
use crate::tile::TileCoord;

/// File extensions tried, in order, when resolving a satellite tile.
pub const TILE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

/// Resolves a tile coordinate to its pixel data.
///
/// `Ok(None)` means the tile does not exist; `Err` means it exists but could not
/// be read. Callers stitching canvases treat both as a blank tile.
pub trait TileSource<P>: Send + Sync {
    fn lookup(&self, coord: TileCoord) -> Result<Option<Buffer2<P>>>;
}

impl<P> TileSource<P> for HashMap<TileCoord, Buffer2<P>>
where
    P: Clone + Send + Sync,
{
    fn lookup(&self, coord: TileCoord) -> Result<Option<Buffer2<P>>> {
        Ok(self.get(&coord).cloned())
    }
}

/// Satellite tiles stored as `{root}/{z}/{x}/{y}.{ext}`.
#[derive(Debug, Clone)]
pub struct DirectoryTileSource {
    root: PathBuf,
    tile_size: usize,
}

impl DirectoryTileSource {
    pub fn new(root: impl Into<PathBuf>, tile_size: usize) -> Self {
        Self {
            root: root.into(),
            tile_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First existing file for `coord` in [`TILE_EXTENSIONS`] order.
    pub fn locate(&self, coord: TileCoord) -> Option<PathBuf> {
        let folder = self
            .root
            .join(coord.z.to_string())
            .join(coord.x.to_string());
        TILE_EXTENSIONS
            .iter()
            .map(|ext| folder.join(format!("{}.{}", coord.y, ext)))
            .find(|path| path.is_file())
    }
}

impl TileSource<Rgb> for DirectoryTileSource {
    fn lookup(&self, coord: TileCoord) -> Result<Option<Buffer2<Rgb>>> {
        match self.locate(coord) {
            Some(path) => raster::load_rgb(&path, self.tile_size).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    fn write_tile(root: &Path, coord: TileCoord, ext: &str, color: Rgb) {
        let dir = root.join(coord.z.to_string()).join(coord.x.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        RgbImage::from_pixel(4, 4, image::Rgb(color))
            .save(dir.join(format!("{}.{}", coord.y, ext)))
            .unwrap();
    }

    #[test]
    fn missing_tile_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryTileSource::new(dir.path(), 4);
        assert!(source.lookup(TileCoord::new(1, 2, 17)).unwrap().is_none());
    }

    #[test]
    fn png_wins_over_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(5, 9, 17);
        write_tile(dir.path(), coord, "jpg", [0, 0, 0]);
        write_tile(dir.path(), coord, "png", [200, 100, 50]);

        let source = DirectoryTileSource::new(dir.path(), 4);
        assert_eq!(
            source.locate(coord).unwrap(),
            dir.path().join("17").join("5").join("9.png")
        );
        let tile = source.lookup(coord).unwrap().unwrap();
        assert_eq!(tile[(0, 0)], [200, 100, 50]);
    }

    #[test]
    fn falls_back_to_later_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(5, 9, 17);
        write_tile(dir.path(), coord, "tif", [1, 2, 3]);

        let source = DirectoryTileSource::new(dir.path(), 2);
        let tile = source.lookup(coord).unwrap().unwrap();
        assert_eq!((tile.width(), tile.height()), (2, 2));
    }

    #[test]
    fn map_source_clones_entries() {
        let coord = TileCoord::new(0, 0, 17);
        let mut map = HashMap::new();
        map.insert(coord, Buffer2::new_filled(2, 2, 9u8));

        assert_eq!(map.lookup(coord).unwrap().unwrap()[(1, 1)], 9);
        assert!(map.lookup(TileCoord::new(1, 0, 17)).unwrap().is_none());
    }
}
