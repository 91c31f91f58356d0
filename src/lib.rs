//! Tiled **runtime** nav-mesh storage & queries for 3D worlds in [Bevy].
//!
//! Takes in serialized nav-mesh tiles (produced offline or by your own
//! generation pipeline through [builder::build_tile_data]), keeps them
//! linked into one walkable surface as tiles are streamed in and out, and
//! answers path and spatial queries over it: A* polygon paths, funnelled
//! straight paths, constrained surface movement, walkability raycasts and
//! wall-distance queries.
//!
//! ## Quick-start:
//! 1. Create a [tiles::TiledNavMesh] with [NavMeshParams] matching your
//!    world's tiling, or [tiles::TiledNavMesh::new_single_tile] for a single
//!    pre-built tile.
//! 2. Install tiles with [tiles::TiledNavMesh::add_tile]. Neighbouring
//!    tiles connect to each other automatically; removing a tile with
//!    [tiles::TiledNavMesh::remove_tile] unlinks it again.
//! 3. Create a [query::NavMeshQuery] over the mesh and locate polygons with
//!    [query::NavMeshQuery::find_nearest_poly].
//! 4. Call [query::NavMeshQuery::find_path] and feed the corridor to
//!    [query::NavMeshQuery::find_straight_path] to get world-space
//!    waypoints.
//!
//! *To share the mesh with systems and async tasks, wrap it in the
//! [NavMesh] resource and take the lock for reading while querying; each
//! [query::NavMeshQuery] owns its own search state, so one mesh can serve
//! several readers at once.*
//!
//! [Bevy]: https://crates.io/crates/bevy

use std::sync::{Arc, RwLock};

use bevy::prelude::{Resource, Vec3};

pub mod builder;
mod math;
pub mod nodes;
pub mod query;
pub mod refs;
pub mod tiles;

/// Maximum number of vertices per navigation polygon.
pub const VERTICES_PER_POLYGON: usize = 6;

/// Number of distinct area ids, and the size of a filter's cost table.
pub const MAX_AREAS: usize = 64;

/// Capacity and layout of a [tiles::TiledNavMesh].
///
/// The tile and polygon capacities decide how the 32 bits of a
/// [refs::PolyRef] are split, so they cannot change after the mesh is
/// created.
#[derive(Debug, Clone)]
pub struct NavMeshParams {
    /// World-space origin of tile (0, 0).
    pub origin: Vec3,
    /// Size of each tile along the X axis.
    pub tile_width: f32,
    /// Size of each tile along the Z axis.
    pub tile_height: f32,
    pub max_tiles: u32,
    pub max_polys_per_tile: u32,
}

impl NavMeshParams {
    pub fn new(origin: Vec3, tile_width: f32, tile_height: f32) -> NavMeshParams {
        NavMeshParams {
            origin,
            tile_width,
            tile_height,
            max_tiles: 128,
            max_polys_per_tile: 1024,
        }
    }

    /// Setter for [`NavMeshParams::max_tiles`]
    pub fn with_max_tiles(mut self, max_tiles: u32) -> Self {
        self.max_tiles = max_tiles;

        self
    }

    /// Setter for [`NavMeshParams::max_polys_per_tile`]
    pub fn with_max_polys_per_tile(mut self, max_polys_per_tile: u32) -> Self {
        self.max_polys_per_tile = max_polys_per_tile;

        self
    }
}

/// Decides which polygons a query may use and how expensive each area is
/// to cross.
///
/// A polygon passes when it shares at least one flag with `include_flags`
/// and none with `exclude_flags`.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub include_flags: u16,
    pub exclude_flags: u16,
    area_costs: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> QueryFilter {
        QueryFilter {
            include_flags: 0xffff,
            exclude_flags: 0,
            area_costs: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    #[inline]
    pub fn passes(&self, flags: u16) -> bool {
        (flags & self.include_flags) != 0 && (flags & self.exclude_flags) == 0
    }

    #[inline]
    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_costs[area as usize % MAX_AREAS]
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if (area as usize) < MAX_AREAS {
            self.area_costs[area as usize] = cost;
        }
    }

    /// Setter for [`QueryFilter::include_flags`]
    pub fn with_include_flags(mut self, include_flags: u16) -> Self {
        self.include_flags = include_flags;

        self
    }

    /// Setter for [`QueryFilter::exclude_flags`]
    pub fn with_exclude_flags(mut self, exclude_flags: u16) -> Self {
        self.exclude_flags = exclude_flags;

        self
    }
}

/// Wrapper around the nav-mesh for sharing it between systems and tasks.
///
/// The underlying [tiles::TiledNavMesh] must be retrieved using
/// [NavMesh::get] and locked for reading or writing.
#[derive(Resource)]
pub struct NavMesh(Arc<RwLock<tiles::TiledNavMesh>>);

impl NavMesh {
    pub fn new(mesh: tiles::TiledNavMesh) -> NavMesh {
        NavMesh(Arc::new(RwLock::new(mesh)))
    }

    pub fn get(&self) -> Arc<RwLock<tiles::TiledNavMesh>> {
        self.0.clone()
    }
}
