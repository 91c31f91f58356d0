//! Queries over the nav-mesh: nearest-polygon lookups, A* path search,
//! funnelled straight paths, constrained surface motion, walkability
//! raycasts and radius queries.
//!
//! A [NavMeshQuery] borrows the [TiledNavMesh] it searches and owns all of
//! its search state, so several queries over one mesh can run side by side
//! as long as the mesh itself is not mutated.

use bevy::prelude::Vec3;
use smallvec::SmallVec;
use thiserror::Error;

use crate::math::{
    closest_height_point_triangle, distance_pt_poly_edges_sqr, distance_pt_seg_sqr_2d,
    intersect_seg_seg_2d, intersect_segment_poly_2d, next_pow2, overlap_poly_poly_2d,
    point_in_polygon, triangle_area_2d, vequal,
};
use crate::nodes::{NodeIndex, NodePool, NodeQueue, MAX_STATES_PER_NODE, NODE_CLOSED, NODE_OPEN};
use crate::refs::PolyRef;
use crate::tiles::{MeshTile, Poly, PolyType, TiledNavMesh, EXT_LINK, NULL_LINK};
use crate::{QueryFilter, VERTICES_PER_POLYGON};

/// Scale applied to the A* heuristic; slightly below one so the estimate
/// stays admissible through float roundoff.
pub const HEURISTIC_SCALE: f32 = 0.999;

/// The vertex is the start position of the straight path.
pub const STRAIGHTPATH_START: u8 = 0x01;
/// The vertex is the end position of the straight path.
pub const STRAIGHTPATH_END: u8 = 0x02;
/// The vertex is the start of an off-mesh connection.
pub const STRAIGHTPATH_OFFMESH_CONNECTION: u8 = 0x04;

/// Add a vertex at every polygon crossing where the area changes.
pub const STRAIGHTPATH_AREA_CROSSINGS: u32 = 0x01;
/// Add a vertex at every polygon crossing.
pub const STRAIGHTPATH_ALL_CROSSINGS: u32 = 0x02;

const MAX_MOVE_STACK: usize = 48;
const MAX_NEIGHBOURS_PER_EDGE: usize = 8;

/// Errors returned by [NavMeshQuery] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("polygon handle does not resolve")]
    InvalidPolyRef,
    #[error("query input is malformed")]
    InvalidParam,
    #[error("polygon detail data is inconsistent")]
    BadDetailMesh,
    #[error("position is not over the polygon")]
    PointNotOverPolygon,
    #[error("the search node pool is exhausted")]
    OutOfNodes,
    #[error("no finished sliced path query to finalize")]
    QueryNotReady,
}

/// A polygon corridor produced by the path searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolyPath {
    pub polys: Vec<PolyRef>,
    /// The goal was unreachable; the corridor ends at the polygon nearest
    /// to it.
    pub partial: bool,
    /// The corridor was clipped to the requested maximum length.
    pub truncated: bool,
    /// The node pool filled up during the search, so parts of the graph
    /// were not considered.
    pub out_of_nodes: bool,
}

impl PolyPath {
    fn single(r: PolyRef) -> PolyPath {
        PolyPath {
            polys: vec![r],
            partial: false,
            truncated: false,
            out_of_nodes: false,
        }
    }
}

/// One vertex of a funnelled straight path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    /// Combination of the `STRAIGHTPATH_*` vertex flags.
    pub flags: u8,
    /// Polygon entered at this vertex; null for the end point.
    pub poly: PolyRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StraightPath {
    pub points: Vec<StraightPathPoint>,
    pub truncated: bool,
}

/// Result of [NavMeshQuery::move_along_surface].
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceMove {
    pub result_pos: Vec3,
    /// Polygons crossed from the start to the result position.
    pub visited: Vec<PolyRef>,
}

/// Result of [NavMeshQuery::raycast].
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment; `f32::INFINITY` when the end was
    /// reached without hitting a wall.
    pub t: f32,
    pub hit_normal: Vec3,
    /// Polygons visited along the ray.
    pub path: Vec<PolyRef>,
}

/// Result of [NavMeshQuery::find_distance_to_wall].
#[derive(Debug, Clone, PartialEq)]
pub struct WallHit {
    pub distance: f32,
    pub hit_pos: Vec3,
    pub hit_normal: Vec3,
}

/// Polygons collected by the Dijkstra disk and shape queries, parallel
/// arrays in visit order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolysAround {
    pub refs: Vec<PolyRef>,
    /// Parent of each polygon in the expansion; null for the first entry.
    pub parents: Vec<PolyRef>,
    pub costs: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalNeighbourhood {
    pub refs: Vec<PolyRef>,
    pub parents: Vec<PolyRef>,
}

/// A wall or portal piece of a polygon boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallSegment {
    pub start: Vec3,
    pub end: Vec3,
    /// Neighbour behind this piece; null for solid walls.
    pub poly: PolyRef,
}

/// State of the incremental path search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicedPathStatus {
    InProgress,
    Ready,
    Failed,
}

struct SlicedQuery {
    status: SlicedPathStatus,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: QueryFilter,
    last_best: Option<NodeIndex>,
    last_best_cost: f32,
    out_of_nodes: bool,
}

/// Query engine over a [TiledNavMesh].
pub struct NavMeshQuery<'m> {
    mesh: &'m TiledNavMesh,
    node_pool: NodePool,
    /// Small pool for the short-range surface queries; they never need the
    /// full search capacity.
    tiny_node_pool: NodePool,
    open_list: NodeQueue,
    sliced: Option<SlicedQuery>,
}

impl<'m> NavMeshQuery<'m> {
    /// `max_nodes` bounds how much of the graph one search may touch.
    pub fn new(mesh: &'m TiledNavMesh, max_nodes: usize) -> NavMeshQuery<'m> {
        let hash_size = next_pow2((max_nodes / 4).max(1) as u32) as usize;
        NavMeshQuery {
            mesh,
            node_pool: NodePool::new(max_nodes, hash_size),
            tiny_node_pool: NodePool::new(64, 32),
            open_list: NodeQueue::new(max_nodes),
            sliced: None,
        }
    }

    pub fn mesh(&self) -> &'m TiledNavMesh {
        self.mesh
    }

    // --- Point queries ------------------------------------------------------

    /// Closest point on the polygon surface, using its height detail.
    pub fn closest_point_on_poly(&self, r: PolyRef, pos: Vec3) -> Result<Vec3, QueryError> {
        let (tile, ip) = self
            .mesh
            .tile_by_poly_ref(r)
            .ok_or(QueryError::InvalidPolyRef)?;
        tile.closest_point_on_poly(ip, pos)
            .ok_or(QueryError::BadDetailMesh)
    }

    /// Closest point on the polygon boundary in 2D; the height of `pos` is
    /// kept. Cheaper than [closest_point_on_poly](Self::closest_point_on_poly).
    pub fn closest_point_on_poly_boundary(
        &self,
        r: PolyRef,
        pos: Vec3,
    ) -> Result<Vec3, QueryError> {
        let (tile, poly) = self
            .mesh
            .tile_and_poly_by_ref(r)
            .ok_or(QueryError::InvalidPolyRef)?;

        let mut verts = [Vec3::ZERO; VERTICES_PER_POLYGON];
        let nv = tile.poly_verts_into(poly, &mut verts);

        let mut edge_dist = [0.0f32; VERTICES_PER_POLYGON];
        let mut edge_t = [0.0f32; VERTICES_PER_POLYGON];
        let inside = distance_pt_poly_edges_sqr(pos, &verts[..nv], &mut edge_dist, &mut edge_t);

        if inside {
            return Ok(pos);
        }

        // Snap to the nearest edge.
        let mut dmin = f32::MAX;
        let mut imin = 0;
        for i in 0..nv {
            if edge_dist[i] < dmin {
                dmin = edge_dist[i];
                imin = i;
            }
        }
        let va = verts[imin];
        let vb = verts[(imin + 1) % nv];
        Ok(va.lerp(vb, edge_t[imin]))
    }

    /// Height of the polygon surface under `pos`.
    pub fn poly_height(&self, r: PolyRef, pos: Vec3) -> Result<f32, QueryError> {
        let (tile, ip) = self
            .mesh
            .tile_by_poly_ref(r)
            .ok_or(QueryError::InvalidPolyRef)?;
        let poly = &tile.polys[ip];

        if poly.poly_type() == PolyType::OffMeshConnection {
            let v0 = tile.verts[poly.verts[0] as usize];
            let v1 = tile.verts[poly.verts[1] as usize];
            let d0 = pos.distance(v0);
            let d1 = pos.distance(v1);
            let u = d0 / (d0 + d1);
            return Ok(v0.y + (v1.y - v0.y) * u);
        }

        let pd = &tile.detail_meshes[ip];
        for j in 0..pd.tri_count as usize {
            let t = tile
                .detail_tris
                .get(pd.tri_base as usize + j)
                .ok_or(QueryError::BadDetailMesh)?;
            let mut v = [Vec3::ZERO; 3];
            for k in 0..3 {
                v[k] = tile
                    .detail_vertex(poly, pd, t[k])
                    .ok_or(QueryError::BadDetailMesh)?;
            }
            if let Some(h) = closest_height_point_triangle(pos, v[0], v[1], v[2]) {
                return Ok(h);
            }
        }

        Err(QueryError::PointNotOverPolygon)
    }

    /// Nearest polygon to `center` inside the search box, with the closest
    /// point on it.
    pub fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let polys = self.query_polygons(center, half_extents, filter, 128);

        let mut nearest = None;
        let mut nearest_dist_sqr = f32::MAX;
        for r in polys {
            let Ok(closest) = self.closest_point_on_poly(r, center) else {
                continue;
            };
            let d = center.distance_squared(closest);
            if d < nearest_dist_sqr {
                nearest_dist_sqr = d;
                nearest = Some((r, closest));
            }
        }
        nearest
    }

    /// Collects up to `max_polys` polygons overlapping the search box.
    pub fn query_polygons(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
        max_polys: usize,
    ) -> Vec<PolyRef> {
        let bmin = center - half_extents;
        let bmax = center + half_extents;

        let (minx, miny) = self.mesh.calc_tile_loc(bmin);
        let (maxx, maxy) = self.mesh.calc_tile_loc(bmax);

        let mut out = vec![PolyRef::NULL; max_polys];
        let mut n = 0;
        for y in miny..=maxy {
            for x in minx..=maxx {
                let Some(tile_ref) = self.mesh.tile_ref_at(x, y) else {
                    continue;
                };
                let Some(tile) = self.mesh.tile_by_ref(tile_ref) else {
                    continue;
                };
                let base = PolyRef(tile_ref.0);
                n += tile.query_polygons(base, bmin, bmax, filter, &mut out[n..]);
                if n >= max_polys {
                    out.truncate(max_polys);
                    return out;
                }
            }
        }
        out.truncate(n);
        out
    }

    // --- A* path search -----------------------------------------------------

    /// A* search over the polygon graph from `start_ref` to `end_ref`, using
    /// portal-edge midpoints as the cost metric.
    ///
    /// When the goal is unreachable the result is marked `partial` and ends
    /// at the reachable polygon nearest to it.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<PolyPath, QueryError> {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("find_path").entered();

        let mesh = self.mesh;
        if max_path == 0 {
            return Err(QueryError::InvalidParam);
        }
        if !mesh.is_valid_poly_ref(start_ref) || !mesh.is_valid_poly_ref(end_ref) {
            return Err(QueryError::InvalidPolyRef);
        }
        if start_ref == end_ref {
            return Ok(PolyPath::single(start_ref));
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self
            .node_pool
            .get_node(start_ref, 0)
            .ok_or(QueryError::OutOfNodes)?;
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = start_pos;
            start.cost = 0.0;
            start.total = start_pos.distance(end_pos) * HEURISTIC_SCALE;
            start.flags = NODE_OPEN;
        }
        self.open_list
            .push(self.node_pool.node(start_idx).total, start_idx);

        let mut last_best = start_idx;
        let mut last_best_cost = self.node_pool.node(start_idx).total;
        let mut out_of_nodes = false;

        while let Some(best_idx) = self.open_list.pop() {
            {
                let best = self.node_pool.node_mut(best_idx);
                best.flags &= !NODE_OPEN;
                best.flags |= NODE_CLOSED;
            }

            let (best_ref, best_cost) = {
                let best = self.node_pool.node(best_idx);
                (best.id, best.cost)
            };
            if best_ref == end_ref {
                last_best = best_idx;
                break;
            }

            // The ref was validated when its node entered the pool.
            let Some((best_tile, best_poly)) = mesh.tile_and_poly_by_ref(best_ref) else {
                continue;
            };

            let parent_idx = self.node_pool.node(best_idx).parent;
            let parent_ref = parent_idx
                .map(|p| self.node_pool.node(p).id)
                .unwrap_or(PolyRef::NULL);

            let previous_edge_mid = if parent_ref.is_null() {
                start_pos
            } else {
                mesh.tile_and_poly_by_ref(parent_ref)
                    .and_then(|(pt, pp)| {
                        edge_mid_point(parent_ref, pp, pt, best_ref, best_poly, best_tile)
                    })
                    .unwrap_or(start_pos)
            };

            let mut li = best_poly.first_link;
            while li != NULL_LINK {
                let link = &best_tile.links[li as usize];
                let neighbour_ref = link.target;
                li = link.next;

                // Skip invalid ids and do not expand back to where we came
                // from.
                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let Some((neighbour_tile, neighbour_poly)) =
                    mesh.tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if !filter.passes(neighbour_poly.flags) {
                    continue;
                }

                let Some(edge_mid) = edge_mid_point(
                    best_ref,
                    best_poly,
                    best_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };

                // The final step is costed all the way to the end position.
                let (cost, heuristic) = if neighbour_ref == end_ref {
                    (
                        best_cost
                            + previous_edge_mid.distance(edge_mid)
                                * filter.area_cost(best_poly.area())
                            + edge_mid.distance(end_pos) * filter.area_cost(neighbour_poly.area()),
                        0.0,
                    )
                } else {
                    (
                        best_cost
                            + previous_edge_mid.distance(edge_mid)
                                * filter.area_cost(best_poly.area()),
                        edge_mid.distance(end_pos) * HEURISTIC_SCALE,
                    )
                };
                let total = cost + heuristic;

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    out_of_nodes = true;
                    continue;
                };
                let node = self.node_pool.node_mut(neighbour_idx);
                if (node.flags & (NODE_OPEN | NODE_CLOSED)) != 0 && total >= node.total {
                    continue;
                }

                node.flags &= !NODE_CLOSED;
                node.parent = Some(best_idx);
                node.cost = cost;
                node.total = total;
                node.pos = edge_mid;
                let was_open = (node.flags & NODE_OPEN) != 0;
                node.flags |= NODE_OPEN;

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = neighbour_idx;
                }

                if was_open {
                    self.open_list.modify(neighbour_idx, total);
                } else {
                    self.open_list.push(total, neighbour_idx);
                }
            }
        }

        let partial = self.node_pool.node(last_best).id != end_ref;
        let (polys, truncated) = collect_path(&self.node_pool, last_best, max_path);

        Ok(PolyPath {
            polys,
            partial,
            truncated,
            out_of_nodes,
        })
    }

    // --- Sliced path search -------------------------------------------------

    /// Starts an incremental path search; drive it with
    /// [update_sliced_find_path](Self::update_sliced_find_path). Starting a
    /// new sliced query abandons the previous one.
    pub fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> SlicedPathStatus {
        let mut query = SlicedQuery {
            status: SlicedPathStatus::Failed,
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter: filter.clone(),
            last_best: None,
            last_best_cost: 0.0,
            out_of_nodes: false,
        };

        if !self.mesh.is_valid_poly_ref(start_ref) || !self.mesh.is_valid_poly_ref(end_ref) {
            self.sliced = Some(query);
            return SlicedPathStatus::Failed;
        }

        if start_ref == end_ref {
            query.status = SlicedPathStatus::Ready;
            self.sliced = Some(query);
            return SlicedPathStatus::Ready;
        }

        self.node_pool.clear();
        self.open_list.clear();

        let Some(start_idx) = self.node_pool.get_node(start_ref, 0) else {
            self.sliced = Some(query);
            return SlicedPathStatus::Failed;
        };
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = start_pos;
            start.cost = 0.0;
            start.total = start_pos.distance(end_pos) * HEURISTIC_SCALE;
            start.flags = NODE_OPEN;
        }
        self.open_list
            .push(self.node_pool.node(start_idx).total, start_idx);

        query.status = SlicedPathStatus::InProgress;
        query.last_best = Some(start_idx);
        query.last_best_cost = self.node_pool.node(start_idx).total;
        self.sliced = Some(query);
        SlicedPathStatus::InProgress
    }

    /// Runs up to `max_iter` node expansions, returning the query status
    /// and the number of iterations performed.
    pub fn update_sliced_find_path(&mut self, max_iter: usize) -> (SlicedPathStatus, usize) {
        let mesh = self.mesh;
        let Some(query) = self.sliced.as_mut() else {
            return (SlicedPathStatus::Failed, 0);
        };
        if query.status != SlicedPathStatus::InProgress {
            return (query.status, 0);
        }

        // The mesh may have changed since the last slice.
        if !mesh.is_valid_poly_ref(query.start_ref) || !mesh.is_valid_poly_ref(query.end_ref) {
            query.status = SlicedPathStatus::Failed;
            return (SlicedPathStatus::Failed, 0);
        }

        let mut iter = 0;
        while iter < max_iter {
            let Some(best_idx) = self.open_list.pop() else {
                break;
            };
            iter += 1;

            {
                let best = self.node_pool.node_mut(best_idx);
                best.flags &= !NODE_OPEN;
                best.flags |= NODE_CLOSED;
            }

            let (best_ref, best_cost) = {
                let best = self.node_pool.node(best_idx);
                (best.id, best.cost)
            };
            if best_ref == query.end_ref {
                query.last_best = Some(best_idx);
                query.status = SlicedPathStatus::Ready;
                return (SlicedPathStatus::Ready, iter);
            }

            let Some((best_tile, best_poly)) = mesh.tile_and_poly_by_ref(best_ref) else {
                // The polygon disappeared during the sliced query.
                query.status = SlicedPathStatus::Failed;
                return (SlicedPathStatus::Failed, iter);
            };

            let parent_idx = self.node_pool.node(best_idx).parent;
            let parent_ref = parent_idx
                .map(|p| self.node_pool.node(p).id)
                .unwrap_or(PolyRef::NULL);

            let previous_edge_mid = if parent_ref.is_null() {
                query.start_pos
            } else {
                let Some((parent_tile, parent_poly)) = mesh.tile_and_poly_by_ref(parent_ref)
                else {
                    query.status = SlicedPathStatus::Failed;
                    return (SlicedPathStatus::Failed, iter);
                };
                edge_mid_point(
                    parent_ref,
                    parent_poly,
                    parent_tile,
                    best_ref,
                    best_poly,
                    best_tile,
                )
                .unwrap_or(query.start_pos)
            };

            let mut li = best_poly.first_link;
            while li != NULL_LINK {
                let link = &best_tile.links[li as usize];
                let neighbour_ref = link.target;
                li = link.next;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let Some((neighbour_tile, neighbour_poly)) =
                    mesh.tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if !query.filter.passes(neighbour_poly.flags) {
                    continue;
                }

                let Some(edge_mid) = edge_mid_point(
                    best_ref,
                    best_poly,
                    best_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };

                let (cost, heuristic) = if neighbour_ref == query.end_ref {
                    (
                        best_cost
                            + previous_edge_mid.distance(edge_mid)
                                * query.filter.area_cost(best_poly.area())
                            + edge_mid.distance(query.end_pos)
                                * query.filter.area_cost(neighbour_poly.area()),
                        0.0,
                    )
                } else {
                    (
                        best_cost
                            + previous_edge_mid.distance(edge_mid)
                                * query.filter.area_cost(best_poly.area()),
                        edge_mid.distance(query.end_pos) * HEURISTIC_SCALE,
                    )
                };
                let total = cost + heuristic;

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    query.out_of_nodes = true;
                    continue;
                };
                let node = self.node_pool.node_mut(neighbour_idx);
                if (node.flags & (NODE_OPEN | NODE_CLOSED)) != 0 && total >= node.total {
                    continue;
                }

                node.flags &= !NODE_CLOSED;
                node.parent = Some(best_idx);
                node.cost = cost;
                node.total = total;
                node.pos = edge_mid;
                let was_open = (node.flags & NODE_OPEN) != 0;
                node.flags |= NODE_OPEN;

                if heuristic < query.last_best_cost {
                    query.last_best_cost = heuristic;
                    query.last_best = Some(neighbour_idx);
                }

                if was_open {
                    self.open_list.modify(neighbour_idx, total);
                } else {
                    self.open_list.push(total, neighbour_idx);
                }
            }
        }

        if self.open_list.is_empty() {
            query.status = SlicedPathStatus::Ready;
        }
        (query.status, iter)
    }

    /// Finishes the sliced query and extracts the corridor found so far.
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> Result<PolyPath, QueryError> {
        let query = self.sliced.take().ok_or(QueryError::QueryNotReady)?;
        if query.status != SlicedPathStatus::Ready {
            return Err(QueryError::QueryNotReady);
        }

        if query.start_ref == query.end_ref {
            return Ok(PolyPath::single(query.start_ref));
        }

        let last_best = query.last_best.ok_or(QueryError::QueryNotReady)?;
        let partial = self.node_pool.node(last_best).id != query.end_ref;
        let (polys, truncated) = collect_path(&self.node_pool, last_best, max_path);

        Ok(PolyPath {
            polys,
            partial,
            truncated,
            out_of_nodes: query.out_of_nodes,
        })
    }

    /// Finishes the sliced query, truncating at the furthest visited
    /// polygon that also appears on `existing`, so a replan can splice onto
    /// its previous path.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> Result<PolyPath, QueryError> {
        if existing.is_empty() {
            self.sliced = None;
            return Err(QueryError::InvalidParam);
        }
        let query = self.sliced.take().ok_or(QueryError::QueryNotReady)?;
        if query.status == SlicedPathStatus::Failed {
            return Err(QueryError::QueryNotReady);
        }

        if query.start_ref == query.end_ref {
            return Ok(PolyPath::single(query.start_ref));
        }

        // Find the furthest polygon of the old path that this search
        // visited.
        let mut node = None;
        for &r in existing.iter().rev() {
            if let Some(idx) = self.node_pool.find_node(r, 0) {
                node = Some(idx);
                break;
            }
        }
        let (node, fallback) = match node {
            Some(idx) => (idx, false),
            None => (query.last_best.ok_or(QueryError::QueryNotReady)?, true),
        };

        let (polys, truncated) = collect_path(&self.node_pool, node, max_path);
        Ok(PolyPath {
            polys,
            partial: fallback || self.node_pool.node(node).id != query.end_ref,
            truncated,
            out_of_nodes: query.out_of_nodes,
        })
    }

    // --- Straight path ------------------------------------------------------

    fn append_portals(
        &self,
        start_idx: usize,
        end_idx: usize,
        end_pos: Vec3,
        path: &[PolyRef],
        points: &mut Vec<StraightPathPoint>,
        max_points: usize,
        options: u32,
    ) -> Result<bool, QueryError> {
        let start_pos = points
            .last()
            .map(|p| p.pos)
            .ok_or(QueryError::InvalidParam)?;

        for i in start_idx..end_idx {
            let from = path[i];
            let to = path[i + 1];
            let (from_tile, from_poly) = self
                .mesh
                .tile_and_poly_by_ref(from)
                .ok_or(QueryError::InvalidPolyRef)?;
            let (to_tile, to_poly) = self
                .mesh
                .tile_and_poly_by_ref(to)
                .ok_or(QueryError::InvalidPolyRef)?;

            let Some((left, right)) =
                portal_points(from, from_poly, from_tile, to, to_poly, to_tile)
            else {
                break;
            };

            if (options & STRAIGHTPATH_AREA_CROSSINGS) != 0 && from_poly.area() == to_poly.area()
            {
                // Only area boundaries are of interest.
                continue;
            }

            if let Some((_, t)) = intersect_seg_seg_2d(start_pos, end_pos, left, right) {
                let pt = left.lerp(right, t);
                if !append_vertex(points, pt, 0, path[i + 1], max_points) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Funnels the polygon corridor into the list of waypoints a follower
    /// actually has to steer through.
    ///
    /// `options` selects additional crossing vertices
    /// ([STRAIGHTPATH_AREA_CROSSINGS], [STRAIGHTPATH_ALL_CROSSINGS]).
    pub fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
        options: u32,
    ) -> Result<StraightPath, QueryError> {
        if path.is_empty() || path[0].is_null() || max_points == 0 {
            return Err(QueryError::InvalidParam);
        }
        let crossings =
            (options & (STRAIGHTPATH_AREA_CROSSINGS | STRAIGHTPATH_ALL_CROSSINGS)) != 0;

        let closest_start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let mut closest_end = self.closest_point_on_poly_boundary(path[path.len() - 1], end_pos)?;

        let mut points = Vec::with_capacity(path.len().min(max_points));
        if !append_vertex(
            &mut points,
            closest_start,
            STRAIGHTPATH_START,
            path[0],
            max_points,
        ) {
            return Ok(StraightPath {
                points,
                truncated: true,
            });
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut apex_index = 0usize;
            let mut left_index = 0usize;
            let mut right_index = 0usize;

            let mut left_poly_type = PolyType::Ground;
            let mut right_poly_type = PolyType::Ground;

            let mut left_poly_ref = path[0];
            let mut right_poly_ref = path[0];

            let mut i = 0usize;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    match self.portal_points_refs(path[i], path[i + 1]) {
                        Some((left, right, _, to_type)) => (left, right, to_type),
                        None => {
                            // The corridor is broken; clamp the end onto the
                            // last reachable polygon and finish there.
                            closest_end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            if crossings {
                                self.append_portals(
                                    apex_index,
                                    i,
                                    closest_end,
                                    path,
                                    &mut points,
                                    max_points,
                                    options,
                                )?;
                            }
                            append_vertex(&mut points, closest_end, 0, path[i], max_points);
                            return Ok(StraightPath {
                                truncated: points.len() >= max_points,
                                points,
                            });
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };

                if i + 1 < path.len() && i == 0 {
                    // If starting really close to the portal, advance.
                    let (dist_sqr, _) = distance_pt_seg_sqr_2d(portal_apex, left, right);
                    if dist_sqr < 0.001 * 0.001 {
                        i += 1;
                        continue;
                    }
                }

                // Right vertex.
                if triangle_area_2d(portal_apex, portal_right, right) <= 0.0 {
                    if vequal(portal_apex, portal_right)
                        || triangle_area_2d(portal_apex, portal_left, right) > 0.0
                    {
                        portal_right = right;
                        right_poly_ref = if i + 1 < path.len() {
                            path[i + 1]
                        } else {
                            PolyRef::NULL
                        };
                        right_poly_type = to_type;
                        right_index = i;
                    } else {
                        // The funnel closed on the left side: emit its
                        // endpoint as the next apex.
                        if crossings
                            && !self.append_portals(
                                apex_index,
                                left_index,
                                portal_left,
                                path,
                                &mut points,
                                max_points,
                                options,
                            )?
                        {
                            return Ok(StraightPath {
                                points,
                                truncated: true,
                            });
                        }

                        portal_apex = portal_left;
                        apex_index = left_index;

                        let flags = if left_poly_ref.is_null() {
                            STRAIGHTPATH_END
                        } else if left_poly_type == PolyType::OffMeshConnection {
                            STRAIGHTPATH_OFFMESH_CONNECTION
                        } else {
                            0
                        };
                        if !append_vertex(&mut points, portal_apex, flags, left_poly_ref, max_points)
                        {
                            return Ok(StraightPath {
                                points,
                                truncated: flags != STRAIGHTPATH_END,
                            });
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex.
                if triangle_area_2d(portal_apex, portal_left, left) >= 0.0 {
                    if vequal(portal_apex, portal_left)
                        || triangle_area_2d(portal_apex, portal_right, left) < 0.0
                    {
                        portal_left = left;
                        left_poly_ref = if i + 1 < path.len() {
                            path[i + 1]
                        } else {
                            PolyRef::NULL
                        };
                        left_poly_type = to_type;
                        left_index = i;
                    } else {
                        if crossings
                            && !self.append_portals(
                                apex_index,
                                right_index,
                                portal_right,
                                path,
                                &mut points,
                                max_points,
                                options,
                            )?
                        {
                            return Ok(StraightPath {
                                points,
                                truncated: true,
                            });
                        }

                        portal_apex = portal_right;
                        apex_index = right_index;

                        let flags = if right_poly_ref.is_null() {
                            STRAIGHTPATH_END
                        } else if right_poly_type == PolyType::OffMeshConnection {
                            STRAIGHTPATH_OFFMESH_CONNECTION
                        } else {
                            0
                        };
                        if !append_vertex(
                            &mut points,
                            portal_apex,
                            flags,
                            right_poly_ref,
                            max_points,
                        ) {
                            return Ok(StraightPath {
                                points,
                                truncated: flags != STRAIGHTPATH_END,
                            });
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }

            // Portal crossings along the final straight segment.
            if crossings
                && !self.append_portals(
                    apex_index,
                    path.len() - 1,
                    closest_end,
                    path,
                    &mut points,
                    max_points,
                    options,
                )?
            {
                return Ok(StraightPath {
                    points,
                    truncated: true,
                });
            }
        }

        append_vertex(
            &mut points,
            closest_end,
            STRAIGHTPATH_END,
            PolyRef::NULL,
            max_points,
        );

        Ok(StraightPath {
            points,
            truncated: false,
        })
    }

    // --- Surface motion -----------------------------------------------------

    /// Slides from `start_pos` toward `end_pos` across connected polygons,
    /// constrained to the mesh surface. The result height is not corrected;
    /// follow up with [poly_height](Self::poly_height).
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<SurfaceMove, QueryError> {
        let mesh = self.mesh;
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(QueryError::InvalidPolyRef);
        }

        self.tiny_node_pool.clear();

        let mut stack: SmallVec<[NodeIndex; MAX_MOVE_STACK]> = SmallVec::new();
        let start_idx = self
            .tiny_node_pool
            .get_node(start_ref, 0)
            .ok_or(QueryError::OutOfNodes)?;
        self.tiny_node_pool.node_mut(start_idx).flags = NODE_CLOSED;
        stack.push(start_idx);

        let mut best_pos = start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = None;

        // The walk is constrained to a disk spanning the movement.
        let search_pos = start_pos.lerp(end_pos, 0.5);
        let search_rad_sqr = {
            let r = start_pos.distance(end_pos) / 2.0 + 0.001;
            r * r
        };

        let mut verts = [Vec3::ZERO; VERTICES_PER_POLYGON];

        while !stack.is_empty() {
            let cur_idx = stack.remove(0);
            let cur_ref = self.tiny_node_pool.node(cur_idx).id;
            let Some((cur_tile, cur_poly)) = mesh.tile_and_poly_by_ref(cur_ref) else {
                continue;
            };

            let nverts = cur_tile.poly_verts_into(cur_poly, &mut verts);

            if point_in_polygon(end_pos, &verts[..nverts]) {
                best_node = Some(cur_idx);
                best_pos = end_pos;
                break;
            }

            // Visit neighbours or slide along wall edges.
            let mut j = nverts - 1;
            for i in 0..nverts {
                let mut neis: SmallVec<[PolyRef; MAX_NEIGHBOURS_PER_EDGE]> = SmallVec::new();

                if (cur_poly.neis[j] & EXT_LINK) != 0 {
                    // Tile border; collect the links crossing this edge.
                    let mut li = cur_poly.first_link;
                    while li != NULL_LINK {
                        let link = &cur_tile.links[li as usize];
                        li = link.next;
                        if link.edge as usize != j || link.target.is_null() {
                            continue;
                        }
                        let Some(flags) = mesh.poly_flags(link.target) else {
                            continue;
                        };
                        if filter.passes(flags) && neis.len() < MAX_NEIGHBOURS_PER_EDGE {
                            neis.push(link.target);
                        }
                    }
                } else if cur_poly.neis[j] != 0 {
                    let idx = (cur_poly.neis[j] - 1) as u32;
                    if filter.passes(cur_tile.polys[idx as usize].flags) {
                        // Internal edge, encode the neighbour id.
                        let (salt, it, _) = mesh.codec().decode(cur_ref);
                        neis.push(mesh.codec().encode(salt, it, idx));
                    }
                }

                if neis.is_empty() {
                    // Wall edge: candidate for the constrained result.
                    let vj = verts[j];
                    let vi = verts[i];
                    let (dist_sqr, tseg) = distance_pt_seg_sqr_2d(end_pos, vj, vi);
                    if dist_sqr < best_dist {
                        best_pos = vj.lerp(vi, tseg);
                        best_dist = dist_sqr;
                        best_node = Some(cur_idx);
                    }
                } else {
                    for nei in neis {
                        let Some(nei_idx) = self.tiny_node_pool.get_node(nei, 0) else {
                            continue;
                        };
                        if (self.tiny_node_pool.node(nei_idx).flags & NODE_CLOSED) != 0 {
                            continue;
                        }

                        // Skip links that leave the search disk.
                        let vj = verts[j];
                        let vi = verts[i];
                        let (dist_sqr, _) = distance_pt_seg_sqr_2d(search_pos, vj, vi);
                        if dist_sqr > search_rad_sqr {
                            continue;
                        }

                        if stack.len() < MAX_MOVE_STACK {
                            let node = self.tiny_node_pool.node_mut(nei_idx);
                            node.parent = Some(cur_idx);
                            node.flags |= NODE_CLOSED;
                            stack.push(nei_idx);
                        }
                    }
                }
                j = i;
            }
        }

        let mut visited = Vec::new();
        if let Some(best) = best_node {
            let mut cur = Some(best);
            while let Some(idx) = cur {
                let node = self.tiny_node_pool.node(idx);
                visited.push(node.id);
                cur = node.parent;
            }
            visited.reverse();
            visited.truncate(max_visited);
        }

        Ok(SurfaceMove {
            result_pos: best_pos,
            visited,
        })
    }

    // --- Raycast ------------------------------------------------------------

    /// Walks polygons along the 2D segment from `start_pos` toward
    /// `end_pos`, stopping at the first wall.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit, QueryError> {
        let mesh = self.mesh;
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(QueryError::InvalidPolyRef);
        }

        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: Vec3::ZERO,
            path: Vec::new(),
        };
        let mut verts = [Vec3::ZERO; VERTICES_PER_POLYGON];
        let mut cur_ref = start_ref;

        while !cur_ref.is_null() {
            let Some((tile, poly)) = mesh.tile_and_poly_by_ref(cur_ref) else {
                break;
            };
            let nv = tile.poly_verts_into(poly, &mut verts);

            let Some((_, tmax, _, seg_max)) =
                intersect_segment_poly_2d(start_pos, end_pos, &verts[..nv])
            else {
                // Could not hit the polygon, keep the old t and report hit.
                return Ok(hit);
            };

            if tmax > hit.t {
                hit.t = tmax;
            }

            if hit.path.len() < max_path {
                hit.path.push(cur_ref);
            }

            if seg_max == -1 {
                // The segment ends inside this polygon.
                hit.t = f32::INFINITY;
                return Ok(hit);
            }

            // Follow the link crossing the exit edge.
            let mut next_ref = PolyRef::NULL;
            let mut li = poly.first_link;
            while li != NULL_LINK {
                let link = &tile.links[li as usize];
                li = link.next;

                if link.edge as i32 != seg_max {
                    continue;
                }

                let Some((_, next_poly)) = mesh.tile_and_poly_by_ref(link.target) else {
                    continue;
                };
                // Off-mesh connections are never entered by a ray.
                if next_poly.poly_type() == PolyType::OffMeshConnection {
                    continue;
                }
                if !filter.passes(next_poly.flags) {
                    continue;
                }

                if link.side == 0xff {
                    next_ref = link.target;
                    break;
                }

                // Boundary link covering the whole edge.
                if link.bmin == 0 && link.bmax == 255 {
                    next_ref = link.target;
                    break;
                }

                // Partial boundary link: accept only if the crossing point
                // lies inside its covered sub-range.
                let v0 = verts[link.edge as usize];
                let v1 = verts[(link.edge as usize + 1) % nv];
                let s = 1.0 / 255.0;
                if link.side == 0 || link.side == 4 {
                    let mut lmin = v0.z + (v1.z - v0.z) * (link.bmin as f32 * s);
                    let mut lmax = v0.z + (v1.z - v0.z) * (link.bmax as f32 * s);
                    if lmin > lmax {
                        core::mem::swap(&mut lmin, &mut lmax);
                    }
                    let z = start_pos.z + (end_pos.z - start_pos.z) * tmax;
                    if z >= lmin && z <= lmax {
                        next_ref = link.target;
                        break;
                    }
                } else if link.side == 2 || link.side == 6 {
                    let mut lmin = v0.x + (v1.x - v0.x) * (link.bmin as f32 * s);
                    let mut lmax = v0.x + (v1.x - v0.x) * (link.bmax as f32 * s);
                    if lmin > lmax {
                        core::mem::swap(&mut lmin, &mut lmax);
                    }
                    let x = start_pos.x + (end_pos.x - start_pos.x) * tmax;
                    if x >= lmin && x <= lmax {
                        next_ref = link.target;
                        break;
                    }
                }
            }

            if next_ref.is_null() {
                // No neighbour: the exit edge is a wall.
                let a = seg_max as usize;
                let b = if a + 1 < nv { a + 1 } else { 0 };
                let va = verts[a];
                let vb = verts[b];
                let dx = vb.x - va.x;
                let dz = vb.z - va.z;
                hit.hit_normal = Vec3::new(dz, 0.0, -dx).normalize_or_zero();
                return Ok(hit);
            }

            cur_ref = next_ref;
        }

        Ok(hit)
    }

    // --- Dijkstra queries ---------------------------------------------------

    /// Distance from `center_pos` to the nearest wall reachable within
    /// `max_radius`, with the hit point and the normal pointing away from
    /// the wall.
    pub fn find_distance_to_wall(
        &mut self,
        center_ref: PolyRef,
        center_pos: Vec3,
        max_radius: f32,
        filter: &QueryFilter,
    ) -> Result<WallHit, QueryError> {
        let mesh = self.mesh;
        if !mesh.is_valid_poly_ref(center_ref) {
            return Err(QueryError::InvalidPolyRef);
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self
            .node_pool
            .get_node(center_ref, 0)
            .ok_or(QueryError::OutOfNodes)?;
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = center_pos;
            start.cost = 0.0;
            start.total = 0.0;
            start.flags = NODE_OPEN;
        }
        self.open_list.push(0.0, start_idx);

        let mut radius_sqr = max_radius * max_radius;
        let mut hit_pos = center_pos;
        let mut hit_found = false;

        while let Some(best_idx) = self.open_list.pop() {
            {
                let best = self.node_pool.node_mut(best_idx);
                best.flags &= !NODE_OPEN;
                best.flags |= NODE_CLOSED;
            }

            let (best_ref, best_total) = {
                let best = self.node_pool.node(best_idx);
                (best.id, best.total)
            };
            let Some((best_tile, best_poly)) = mesh.tile_and_poly_by_ref(best_ref) else {
                continue;
            };

            let parent_ref = self
                .node_pool
                .node(best_idx)
                .parent
                .map(|p| self.node_pool.node(p).id)
                .unwrap_or(PolyRef::NULL);

            let previous_edge_mid = if parent_ref.is_null() {
                center_pos
            } else {
                mesh.tile_and_poly_by_ref(parent_ref)
                    .and_then(|(pt, pp)| {
                        edge_mid_point(parent_ref, pp, pt, best_ref, best_poly, best_tile)
                    })
                    .unwrap_or(center_pos)
            };

            // Hit test the solid edges of this polygon.
            let nv = best_poly.vert_count as usize;
            let mut j = nv - 1;
            for i in 0..nv {
                let solid = if (best_poly.neis[j] & EXT_LINK) != 0 {
                    // Tile border; solid unless a link crosses this edge.
                    let mut solid = true;
                    let mut li = best_poly.first_link;
                    while li != NULL_LINK {
                        let link = &best_tile.links[li as usize];
                        if link.edge as usize == j {
                            if !link.target.is_null() {
                                if let Some(flags) = mesh.poly_flags(link.target) {
                                    if filter.passes(flags) {
                                        solid = false;
                                    }
                                }
                            }
                            break;
                        }
                        li = link.next;
                    }
                    solid
                } else if best_poly.neis[j] != 0
                    && filter.passes(best_tile.polys[(best_poly.neis[j] - 1) as usize].flags)
                {
                    false
                } else {
                    true
                };

                if solid {
                    let vj = best_tile.verts[best_poly.verts[j] as usize];
                    let vi = best_tile.verts[best_poly.verts[i] as usize];
                    let (dist_sqr, tseg) = distance_pt_seg_sqr_2d(center_pos, vj, vi);
                    if dist_sqr <= radius_sqr {
                        // Closer wall found; shrink the search radius.
                        radius_sqr = dist_sqr;
                        hit_pos = vj.lerp(vi, tseg);
                        hit_found = true;
                    }
                }
                j = i;
            }

            let mut li = best_poly.first_link;
            while li != NULL_LINK {
                let link = &best_tile.links[li as usize];
                let neighbour_ref = link.target;
                let link_edge = link.edge;
                li = link.next;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }
                // Off-mesh endpoint links carry no traversable edge.
                if link_edge == 0xff {
                    continue;
                }

                let va = best_tile.verts[best_poly.verts[link_edge as usize] as usize];
                let vb = best_tile.verts[best_poly.verts[(link_edge as usize + 1) % nv] as usize];
                let (dist_sqr, _) = distance_pt_seg_sqr_2d(center_pos, va, vb);
                if dist_sqr > radius_sqr {
                    continue;
                }

                let Some((neighbour_tile, neighbour_poly)) =
                    mesh.tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if neighbour_poly.poly_type() == PolyType::OffMeshConnection {
                    continue;
                }
                if !filter.passes(neighbour_poly.flags) {
                    continue;
                }

                let Some(edge_mid) = edge_mid_point(
                    best_ref,
                    best_poly,
                    best_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };
                let total = best_total + previous_edge_mid.distance(edge_mid);

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    continue;
                };
                let node = self.node_pool.node_mut(neighbour_idx);
                if (node.flags & (NODE_OPEN | NODE_CLOSED)) != 0 && total > node.total {
                    continue;
                }

                node.flags &= !NODE_CLOSED;
                node.parent = Some(best_idx);
                node.total = total;
                node.pos = edge_mid;
                let was_open = (node.flags & NODE_OPEN) != 0;
                node.flags |= NODE_OPEN;

                if was_open {
                    self.open_list.modify(neighbour_idx, total);
                } else {
                    self.open_list.push(total, neighbour_idx);
                }
            }
        }

        let hit_normal = if hit_found {
            (center_pos - hit_pos).normalize_or_zero()
        } else {
            Vec3::ZERO
        };

        Ok(WallHit {
            distance: radius_sqr.sqrt(),
            hit_pos,
            hit_normal,
        })
    }

    /// Collects the polygons reachable from `center_ref` whose connecting
    /// portal touches the disk.
    pub fn find_polys_around_circle(
        &mut self,
        center_ref: PolyRef,
        center_pos: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<PolysAround, QueryError> {
        self.find_polys_around(center_ref, center_pos, filter, max_result, |va, vb| {
            let (dist_sqr, _) = distance_pt_seg_sqr_2d(center_pos, va, vb);
            dist_sqr <= radius * radius
        })
    }

    /// Collects the polygons reachable from `center_ref` whose connecting
    /// portal crosses the convex shape.
    pub fn find_polys_around_shape(
        &mut self,
        center_ref: PolyRef,
        shape: &[Vec3],
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<PolysAround, QueryError> {
        if shape.len() < 3 {
            return Err(QueryError::InvalidParam);
        }
        let center = shape.iter().copied().sum::<Vec3>() / shape.len() as f32;
        self.find_polys_around(center_ref, center, filter, max_result, |va, vb| {
            match intersect_segment_poly_2d(va, vb, shape) {
                Some((tmin, tmax, _, _)) => tmin <= 1.0 && tmax >= 0.0,
                None => false,
            }
        })
    }

    /// Dijkstra expansion from `center_ref`, emitting every polygon whose
    /// entry portal satisfies `portal_accepts`.
    fn find_polys_around(
        &mut self,
        center_ref: PolyRef,
        center_pos: Vec3,
        filter: &QueryFilter,
        max_result: usize,
        portal_accepts: impl Fn(Vec3, Vec3) -> bool,
    ) -> Result<PolysAround, QueryError> {
        let mesh = self.mesh;
        if !mesh.is_valid_poly_ref(center_ref) {
            return Err(QueryError::InvalidPolyRef);
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self
            .node_pool
            .get_node(center_ref, 0)
            .ok_or(QueryError::OutOfNodes)?;
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = center_pos;
            start.cost = 0.0;
            start.total = 0.0;
            start.flags = NODE_OPEN;
        }
        self.open_list.push(0.0, start_idx);

        let mut result = PolysAround::default();
        if max_result > 0 {
            result.refs.push(center_ref);
            result.parents.push(PolyRef::NULL);
            result.costs.push(0.0);
        }

        while let Some(best_idx) = self.open_list.pop() {
            {
                let best = self.node_pool.node_mut(best_idx);
                best.flags &= !NODE_OPEN;
                best.flags |= NODE_CLOSED;
            }

            let (best_ref, best_total) = {
                let best = self.node_pool.node(best_idx);
                (best.id, best.total)
            };
            let Some((best_tile, best_poly)) = mesh.tile_and_poly_by_ref(best_ref) else {
                continue;
            };

            let parent_ref = self
                .node_pool
                .node(best_idx)
                .parent
                .map(|p| self.node_pool.node(p).id)
                .unwrap_or(PolyRef::NULL);

            let previous_edge_mid = if parent_ref.is_null() {
                center_pos
            } else {
                mesh.tile_and_poly_by_ref(parent_ref)
                    .and_then(|(pt, pp)| {
                        edge_mid_point(parent_ref, pp, pt, best_ref, best_poly, best_tile)
                    })
                    .unwrap_or(center_pos)
            };

            let mut li = best_poly.first_link;
            while li != NULL_LINK {
                let link = &best_tile.links[li as usize];
                let neighbour_ref = link.target;
                li = link.next;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let Some((neighbour_tile, neighbour_poly)) =
                    mesh.tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if !filter.passes(neighbour_poly.flags) {
                    continue;
                }

                let Some((va, vb)) = portal_points(
                    best_ref,
                    best_poly,
                    best_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };
                if !portal_accepts(va, vb) {
                    continue;
                }

                let edge_mid = va.lerp(vb, 0.5);
                let total = best_total + previous_edge_mid.distance(edge_mid);

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    continue;
                };
                let node = self.node_pool.node_mut(neighbour_idx);
                if (node.flags & (NODE_OPEN | NODE_CLOSED)) != 0 && total > node.total {
                    continue;
                }

                node.flags &= !NODE_CLOSED;
                node.parent = Some(best_idx);
                node.total = total;
                node.pos = edge_mid;
                let was_open = (node.flags & NODE_OPEN) != 0;
                node.flags |= NODE_OPEN;

                if was_open {
                    self.open_list.modify(neighbour_idx, total);
                } else {
                    if result.refs.len() < max_result {
                        result.refs.push(neighbour_ref);
                        result.parents.push(best_ref);
                        result.costs.push(total);
                    }
                    self.open_list.push(total, neighbour_idx);
                }
            }
        }

        Ok(result)
    }

    /// Non-overlapping flood of polygons around `center_ref`, for local
    /// obstacle queries. Polygons whose 2D footprint overlaps an already
    /// accepted polygon are skipped, except direct neighbours.
    pub fn find_local_neighbourhood(
        &mut self,
        center_ref: PolyRef,
        center_pos: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<LocalNeighbourhood, QueryError> {
        let mesh = self.mesh;
        if !mesh.is_valid_poly_ref(center_ref) {
            return Err(QueryError::InvalidPolyRef);
        }

        self.tiny_node_pool.clear();

        let mut stack: SmallVec<[NodeIndex; MAX_MOVE_STACK]> = SmallVec::new();
        let start_idx = self
            .tiny_node_pool
            .get_node(center_ref, 0)
            .ok_or(QueryError::OutOfNodes)?;
        self.tiny_node_pool.node_mut(start_idx).flags = NODE_CLOSED;
        stack.push(start_idx);

        let radius_sqr = radius * radius;

        let mut pa = [Vec3::ZERO; VERTICES_PER_POLYGON];
        let mut pb = [Vec3::ZERO; VERTICES_PER_POLYGON];

        let mut result = LocalNeighbourhood::default();
        if max_result > 0 {
            result.refs.push(center_ref);
            result.parents.push(PolyRef::NULL);
        }

        while !stack.is_empty() {
            let cur_idx = stack.remove(0);
            let cur_ref = self.tiny_node_pool.node(cur_idx).id;
            let Some((cur_tile, cur_poly)) = mesh.tile_and_poly_by_ref(cur_ref) else {
                continue;
            };

            let mut li = cur_poly.first_link;
            while li != NULL_LINK {
                let link = &cur_tile.links[li as usize];
                let neighbour_ref = link.target;
                li = link.next;

                if neighbour_ref.is_null() {
                    continue;
                }
                let Some(neighbour_idx) = self.tiny_node_pool.get_node(neighbour_ref, 0) else {
                    continue;
                };
                if (self.tiny_node_pool.node(neighbour_idx).flags & NODE_CLOSED) != 0 {
                    continue;
                }

                let Some((neighbour_tile, neighbour_poly)) =
                    mesh.tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if neighbour_poly.poly_type() == PolyType::OffMeshConnection {
                    continue;
                }
                if !filter.passes(neighbour_poly.flags) {
                    continue;
                }

                let Some((va, vb)) = portal_points(
                    cur_ref,
                    cur_poly,
                    cur_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };
                let (dist_sqr, _) = distance_pt_seg_sqr_2d(center_pos, va, vb);
                if dist_sqr > radius_sqr {
                    continue;
                }

                // Mark visited before the overlap test so a failing
                // candidate is not retried from another polygon.
                {
                    let node = self.tiny_node_pool.node_mut(neighbour_idx);
                    node.flags |= NODE_CLOSED;
                    node.parent = Some(cur_idx);
                }

                let npa = neighbour_tile.poly_verts_into(neighbour_poly, &mut pa);

                let mut overlap = false;
                for &past_ref in &result.refs {
                    // Connected polygons do not overlap.
                    let mut connected = false;
                    let mut ci = cur_poly.first_link;
                    while ci != NULL_LINK {
                        let clink = &cur_tile.links[ci as usize];
                        if clink.target == past_ref {
                            connected = true;
                            break;
                        }
                        ci = clink.next;
                    }
                    if connected {
                        continue;
                    }

                    let Some((past_tile, past_poly)) = mesh.tile_and_poly_by_ref(past_ref) else {
                        continue;
                    };
                    let npb = past_tile.poly_verts_into(past_poly, &mut pb);

                    if overlap_poly_poly_2d(&pa[..npa], &pb[..npb]) {
                        overlap = true;
                        break;
                    }
                }
                if overlap {
                    continue;
                }

                if result.refs.len() < max_result {
                    result.refs.push(neighbour_ref);
                    result.parents.push(cur_ref);
                }
                if stack.len() < MAX_MOVE_STACK {
                    stack.push(neighbour_idx);
                }
            }
        }

        Ok(result)
    }

    // --- Wall segments ------------------------------------------------------

    /// Boundary pieces of one polygon: solid walls, and, when
    /// `store_portals` is set, the portal pieces with their neighbour refs.
    pub fn get_poly_wall_segments(
        &self,
        r: PolyRef,
        filter: &QueryFilter,
        store_portals: bool,
    ) -> Result<Vec<WallSegment>, QueryError> {
        let mesh = self.mesh;
        let (tile, poly) = mesh
            .tile_and_poly_by_ref(r)
            .ok_or(QueryError::InvalidPolyRef)?;

        let mut segments = Vec::new();
        let nv = poly.vert_count as usize;
        let base = {
            let (salt, it, _) = mesh.codec().decode(r);
            mesh.codec().encode(salt, it, 0)
        };

        let mut j = nv - 1;
        for i in 0..nv {
            let vj = tile.verts[poly.verts[j] as usize];
            let vi = tile.verts[poly.verts[i] as usize];

            if (poly.neis[j] & EXT_LINK) != 0 {
                // Tile border: the covering links carve the edge into
                // portal and wall intervals.
                let mut ints: SmallVec<[SegInterval; 16]> = SmallVec::new();
                let mut li = poly.first_link;
                while li != NULL_LINK {
                    let link = &tile.links[li as usize];
                    li = link.next;
                    if link.edge as usize != j || link.target.is_null() {
                        continue;
                    }
                    let Some(flags) = mesh.poly_flags(link.target) else {
                        continue;
                    };
                    if filter.passes(flags) {
                        insert_interval(
                            &mut ints,
                            link.bmin as i32,
                            link.bmax as i32,
                            link.target,
                        );
                    }
                }

                // Sentinels bound the gap walk.
                insert_interval(&mut ints, -1, 0, PolyRef::NULL);
                insert_interval(&mut ints, 255, 256, PolyRef::NULL);

                for k in 1..ints.len() {
                    // Portal piece.
                    if store_portals && !ints[k].target.is_null() {
                        let tmin = ints[k].tmin as f32 / 255.0;
                        let tmax = ints[k].tmax as f32 / 255.0;
                        segments.push(WallSegment {
                            start: vj.lerp(vi, tmin),
                            end: vj.lerp(vi, tmax),
                            poly: ints[k].target,
                        });
                    }
                    // Wall piece between the openings.
                    let imin = ints[k - 1].tmax;
                    let imax = ints[k].tmin;
                    if imin == imax {
                        continue;
                    }
                    if imin == 0 && imax == 255 {
                        segments.push(WallSegment {
                            start: vj,
                            end: vi,
                            poly: PolyRef::NULL,
                        });
                    } else {
                        segments.push(WallSegment {
                            start: vj.lerp(vi, imin as f32 / 255.0),
                            end: vj.lerp(vi, imax as f32 / 255.0),
                            poly: PolyRef::NULL,
                        });
                    }
                }
            } else {
                // Internal edge or wall.
                let mut neighbour = PolyRef::NULL;
                if poly.neis[j] != 0 {
                    let idx = (poly.neis[j] - 1) as u32;
                    if filter.passes(tile.polys[idx as usize].flags) {
                        neighbour = PolyRef(base.0 | idx);
                    }
                }
                if !neighbour.is_null() && !store_portals {
                    j = i;
                    continue;
                }

                segments.push(WallSegment {
                    start: vj,
                    end: vi,
                    poly: neighbour,
                });
            }
            j = i;
        }

        Ok(segments)
    }

    // --- Miscellaneous ------------------------------------------------------

    /// Endpoints of an off-mesh connection polygon, ordered for travel away
    /// from `prev_ref`.
    pub fn off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> Result<(Vec3, Vec3), QueryError> {
        let (tile, poly) = self
            .mesh
            .tile_and_poly_by_ref(poly_ref)
            .ok_or(QueryError::InvalidPolyRef)?;
        if poly.poly_type() != PolyType::OffMeshConnection {
            return Err(QueryError::InvalidParam);
        }

        // The link on edge 0 tells which endpoint touches the previous
        // polygon.
        let mut idx0 = 0;
        let mut idx1 = 1;
        let mut li = poly.first_link;
        while li != NULL_LINK {
            let link = &tile.links[li as usize];
            if link.edge == 0 {
                if link.target != prev_ref {
                    idx0 = 1;
                    idx1 = 0;
                }
                break;
            }
            li = link.next;
        }

        Ok((
            tile.verts[poly.verts[idx0] as usize],
            tile.verts[poly.verts[idx1] as usize],
        ))
    }

    /// Whether the polygon was expanded by the most recent search on the
    /// main node pool.
    pub fn is_in_closed_list(&self, r: PolyRef) -> bool {
        let mut nodes = [0 as NodeIndex; MAX_STATES_PER_NODE as usize];
        let n = self.node_pool.find_nodes(r, &mut nodes);
        nodes[..n]
            .iter()
            .any(|&i| (self.node_pool.node(i).flags & NODE_CLOSED) != 0)
    }

    fn portal_points_refs(
        &self,
        from: PolyRef,
        to: PolyRef,
    ) -> Option<(Vec3, Vec3, PolyType, PolyType)> {
        let (from_tile, from_poly) = self.mesh.tile_and_poly_by_ref(from)?;
        let (to_tile, to_poly) = self.mesh.tile_and_poly_by_ref(to)?;
        let (left, right) = portal_points(from, from_poly, from_tile, to, to_poly, to_tile)?;
        Some((left, right, from_poly.poly_type(), to_poly.poly_type()))
    }
}

#[derive(Clone, Copy)]
struct SegInterval {
    target: PolyRef,
    tmin: i32,
    tmax: i32,
}

fn insert_interval(ints: &mut SmallVec<[SegInterval; 16]>, tmin: i32, tmax: i32, target: PolyRef) {
    let idx = ints
        .iter()
        .position(|it| tmax <= it.tmin)
        .unwrap_or(ints.len());
    ints.insert(idx, SegInterval { target, tmin, tmax });
}

/// Appends a funnel vertex, collapsing duplicates onto the previous one.
/// Returns whether the caller should keep going.
fn append_vertex(
    points: &mut Vec<StraightPathPoint>,
    pos: Vec3,
    flags: u8,
    poly: PolyRef,
    max_points: usize,
) -> bool {
    if let Some(last) = points.last_mut() {
        if vequal(last.pos, pos) {
            // Duplicate vertex: keep it but refresh its annotation.
            last.flags = flags;
            last.poly = poly;
            return true;
        }
    }
    points.push(StraightPathPoint { pos, flags, poly });
    flags != STRAIGHTPATH_END && points.len() < max_points
}

/// Walks the parent chain from `end` back to the search origin, returning
/// the corridor in start-to-end order, clipped to `max_path` entries from
/// the start.
fn collect_path(pool: &NodePool, end: NodeIndex, max_path: usize) -> (Vec<PolyRef>, bool) {
    let mut polys = Vec::new();
    let mut cur = Some(end);
    while let Some(i) = cur {
        let node = pool.node(i);
        polys.push(node.id);
        cur = node.parent;
    }
    polys.reverse();
    let truncated = polys.len() > max_path;
    if truncated {
        polys.truncate(max_path);
    }
    (polys, truncated)
}

/// Portal between two polygons: the shared edge, clipped to the link's
/// sub-range at tile boundaries. Off-mesh connections collapse the portal
/// to their endpoint vertex.
fn portal_points(
    from: PolyRef,
    from_poly: &Poly,
    from_tile: &MeshTile,
    to: PolyRef,
    to_poly: &Poly,
    to_tile: &MeshTile,
) -> Option<(Vec3, Vec3)> {
    // Find the link that points to the 'to' polygon.
    let mut link = None;
    let mut li = from_poly.first_link;
    while li != NULL_LINK {
        let l = &from_tile.links[li as usize];
        if l.target == to {
            link = Some(l);
            break;
        }
        li = l.next;
    }
    let link = link?;

    if from_poly.poly_type() == PolyType::OffMeshConnection {
        let v = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
        return Some((v, v));
    }

    if to_poly.poly_type() == PolyType::OffMeshConnection {
        let mut li = to_poly.first_link;
        while li != NULL_LINK {
            let l = &to_tile.links[li as usize];
            if l.target == from {
                let v = to_tile.verts[to_poly.verts[l.edge as usize] as usize];
                return Some((v, v));
            }
            li = l.next;
        }
        return None;
    }

    let v0 = from_poly.verts[link.edge as usize] as usize;
    let v1 = from_poly.verts[(link.edge as usize + 1) % from_poly.vert_count as usize] as usize;
    let a = from_tile.verts[v0];
    let b = from_tile.verts[v1];

    // Boundary links may cover only a sub-range of the edge.
    if link.side != 0xff && (link.bmin != 0 || link.bmax != 255) {
        let s = 1.0 / 255.0;
        return Some((a.lerp(b, link.bmin as f32 * s), a.lerp(b, link.bmax as f32 * s)));
    }

    Some((a, b))
}

fn edge_mid_point(
    from: PolyRef,
    from_poly: &Poly,
    from_tile: &MeshTile,
    to: PolyRef,
    to_poly: &Poly,
    to_tile: &MeshTile,
) -> Option<Vec3> {
    let (left, right) = portal_points(from, from_poly, from_tile, to, to_poly, to_tile)?;
    Some((left + right) * 0.5)
}
