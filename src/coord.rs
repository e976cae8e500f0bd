//! Slippy-map tile coordinate math.
//!
//! Provides the tile → geographic footprint conversion used by layer
//! admission: a request is only routed to a layer when the tile's
//! lon/lat footprint intersects at least one of the layer's configured
//! bounding boxes.

use serde::Serialize;
use std::f64::consts::PI;

/// Web Mercator valid latitude range
pub const MIN_LAT: f64 = -85.05112878;
pub const MAX_LAT: f64 = 85.05112878;

/// Valid longitude range
pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// A geographic bounding box in degrees.
///
/// `west`/`east` are longitudes, `south`/`north` are latitudes. Used both
/// for layer admission policies and for tile footprints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoBounds {
    /// Western longitude (degrees)
    pub west: f64,
    /// Southern latitude (degrees)
    pub south: f64,
    /// Eastern longitude (degrees)
    pub east: f64,
    /// Northern latitude (degrees)
    pub north: f64,
}

impl GeoBounds {
    /// Creates a bounding box from west/south/east/north degrees.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// The whole-world Web Mercator extent.
    pub fn world() -> Self {
        Self::new(MIN_LON, MIN_LAT, MAX_LON, MAX_LAT)
    }

    /// Returns true if this box and `other` overlap.
    ///
    /// Touching edges count as an intersection, matching the inclusive
    /// treatment of tile edges at bbox boundaries.
    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }
}

/// Converts tile coordinates to the longitude/latitude of the tile's
/// northwest corner.
#[inline]
pub fn tile_to_lon_lat(z: u8, x: u32, y: u32) -> (f64, f64) {
    let n = 2.0_f64.powi(z as i32);
    let lon = x as f64 / n * 360.0 - 180.0;
    let lat_rad = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan();
    (lon, lat_rad * 180.0 / PI)
}

/// Returns the geographic footprint of a tile.
///
/// The footprint spans from the tile's northwest corner to the northwest
/// corner of the diagonal neighbor, i.e. the standard slippy-map tile
/// extent at the given zoom.
pub fn tile_bounds(z: u8, x: u32, y: u32) -> GeoBounds {
    let (west, north) = tile_to_lon_lat(z, x, y);
    let (east, south) = tile_to_lon_lat(z, x + 1, y + 1);
    GeoBounds {
        west,
        south,
        east,
        north,
    }
}
