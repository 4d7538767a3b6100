// ============================================================================
// TILES - sparse square partitions of the mask (checkpoints, rollback patches)
// ============================================================================

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::{DirtyRect, MaskBuffer};

/// Default tile edge in pixels.
pub const TILE_SIZE: u32 = 64;

/// Bookkeeping bytes charged per stored tile on top of its pixels.
const TILE_OVERHEAD: usize = 8;

/// One square tile of mask data.  Edge tiles are clipped to the mask, so
/// `width`/`height` can be smaller than the tile size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub tile_x: u32,
    pub tile_y: u32,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Tile {
    pub fn memory_bytes(&self) -> usize {
        self.data.len() + TILE_OVERHEAD
    }

    /// Pixel rectangle this tile covers, given the tile edge.
    pub fn rect(&self, tile_size: u32) -> DirtyRect {
        let x = self.tile_x * tile_size;
        let y = self.tile_y * tile_size;
        DirtyRect::new(x, y, x + self.width, y + self.height)
    }
}

/// Number of tile columns and rows covering a `width`×`height` mask.
#[inline]
pub fn tile_grid(width: u32, height: u32, tile_size: u32) -> (u32, u32) {
    let ts = tile_size.max(1);
    (width.div_ceil(ts), height.div_ceil(ts))
}

/// Copy the pixels of tile `(tx, ty)` out of the mask.
pub fn copy_tile(mask: &MaskBuffer, tx: u32, ty: u32, tile_size: u32) -> Tile {
    let ts = tile_size.max(1);
    let x0 = tx * ts;
    let y0 = ty * ts;
    let w = ts.min(mask.width.saturating_sub(x0));
    let h = ts.min(mask.height.saturating_sub(y0));

    let mut data = Vec::with_capacity((w * h) as usize);
    let stride = mask.width as usize;
    for y in y0..y0 + h {
        let start = y as usize * stride + x0 as usize;
        data.extend_from_slice(&mask.data[start..start + w as usize]);
    }
    Tile {
        tile_x: tx,
        tile_y: ty,
        width: w,
        height: h,
        data,
    }
}

/// Write a tile back into the mask.  Tiles that do not fit are clipped.
pub fn write_tile(mask: &mut MaskBuffer, tile: &Tile, tile_size: u32) {
    let ts = tile_size.max(1);
    let x0 = tile.tile_x * ts;
    let y0 = tile.tile_y * ts;
    if x0 >= mask.width || y0 >= mask.height {
        return;
    }
    let w = tile.width.min(mask.width - x0) as usize;
    let h = tile.height.min(mask.height - y0);
    let stride = mask.width as usize;
    for row in 0..h {
        let src = row as usize * tile.width as usize;
        if src + w > tile.data.len() {
            break;
        }
        let dst = (y0 + row) as usize * stride + x0 as usize;
        mask.data[dst..dst + w].copy_from_slice(&tile.data[src..src + w]);
    }
}

/// Partition the mask into square tiles and keep only those holding at least
/// one non-zero pixel.  Rows of tiles are scanned in parallel.
pub fn extract_tiles(mask: &MaskBuffer, tile_size: u32) -> Vec<Tile> {
    let ts = tile_size.max(1);
    let (cols, rows) = tile_grid(mask.width, mask.height, ts);
    (0..rows)
        .into_par_iter()
        .flat_map_iter(|ty| {
            (0..cols).filter_map(move |tx| {
                if tile_is_empty(mask, tx, ty, ts) {
                    None
                } else {
                    Some(copy_tile(mask, tx, ty, ts))
                }
            })
        })
        .collect()
}

/// True when every pixel under tile `(tx, ty)` is zero.
pub fn tile_is_empty(mask: &MaskBuffer, tx: u32, ty: u32, tile_size: u32) -> bool {
    let x0 = tx * tile_size;
    let y0 = ty * tile_size;
    let w = tile_size.min(mask.width.saturating_sub(x0)) as usize;
    let h = tile_size.min(mask.height.saturating_sub(y0));
    let stride = mask.width as usize;
    (y0..y0 + h).all(|y| {
        let start = y as usize * stride + x0 as usize;
        mask.data[start..start + w].iter().all(|&v| v == 0)
    })
}

/// Rebuild a mask from sparse tiles: everything not covered is zero.
pub fn restore_tiles(mask: &mut MaskBuffer, tiles: &[Tile], tile_size: u32) {
    mask.data.fill(0);
    for tile in tiles {
        write_tile(mask, tile, tile_size);
    }
}

pub fn tiles_memory(tiles: &[Tile]) -> usize {
    tiles.iter().map(Tile::memory_bytes).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with(width: u32, height: u32, on: &[(u32, u32)]) -> MaskBuffer {
        let mut m = MaskBuffer::new(width, height);
        for &(x, y) in on {
            m.data[(y * width + x) as usize] = 255;
        }
        m
    }

    #[test]
    fn test_empty_mask_has_no_tiles() {
        let m = MaskBuffer::new(130, 70);
        assert!(extract_tiles(&m, 64).is_empty());
    }

    #[test]
    fn test_sparse_tiles_roundtrip() {
        let m = mask_with(130, 70, &[(1, 1), (129, 69), (70, 10)]);
        let tiles = extract_tiles(&m, 64);
        assert_eq!(tiles.len(), 3);

        // Bottom-right tile is clipped to 2×6
        let corner = tiles
            .iter()
            .find(|t| t.tile_x == 2 && t.tile_y == 1)
            .expect("corner tile");
        assert_eq!((corner.width, corner.height), (2, 6));

        let mut restored = mask_with(130, 70, &[(5, 5), (6, 6)]);
        restore_tiles(&mut restored, &tiles, 64);
        assert_eq!(restored, m);
    }

    #[test]
    fn test_copy_and_write_tile() {
        let src = mask_with(20, 20, &[(3, 3), (9, 9)]);
        let tile = copy_tile(&src, 0, 0, 8);
        assert_eq!(tile.data.len(), 64);

        let mut dst = MaskBuffer::new(20, 20);
        write_tile(&mut dst, &tile, 8);
        assert_eq!(dst.get(3, 3), Some(255));
        // (9, 9) belongs to tile (1, 1)
        assert_eq!(dst.get(9, 9), Some(0));
    }

    #[test]
    fn test_tile_grid() {
        assert_eq!(tile_grid(64, 64, 64), (1, 1));
        assert_eq!(tile_grid(65, 1, 64), (2, 1));
        assert_eq!(tile_grid(1, 1, 64), (1, 1));
    }
}
