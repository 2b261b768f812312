//! Tile coordinates and map bounds at the leaf zoom level

use serde::{Deserialize, Serialize};

/// A single tile position at some zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The tile one zoom level up that contains this tile.
    pub fn parent(&self) -> TileCoord {
        TileCoord {
            x: self.x.div_euclid(2),
            y: self.y.div_euclid(2),
        }
    }

    /// The 3x3 footprint centered on this tile, unclipped.
    pub fn footprint3(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (-1..=1).flat_map(move |dy| {
            (-1..=1).map(move |dx| TileCoord::new(self.x + dx, self.y + dy))
        })
    }

    /// The 3x3 footprint centered on this tile, clipped to `bounds`.
    pub fn footprint3_clipped(&self, bounds: MapBounds) -> Vec<TileCoord> {
        self.footprint3().filter(|t| bounds.contains(*t)).collect()
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Map dimensions at the leaf zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapBounds {
    pub width: i32,
    pub height: i32,
}

impl MapBounds {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, tile: TileCoord) -> bool {
        tile.x >= 0 && tile.x < self.width && tile.y >= 0 && tile.y < self.height
    }
}
