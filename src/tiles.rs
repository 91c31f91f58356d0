//! Tile storage: the serialized tile format, the decoded in-memory tile,
//! and the tile store that owns every live tile and keeps the polygon graph
//! linked as tiles come and go.
//!
//! A tile arrives as one contiguous byte buffer laid out as
//!
//! ```text
//! | header | verts | polys | links | detailMeshes | detailVerts | detailTris | bvTree | offMeshCons |
//! ```
//!
//! with every region little-endian and padded to a 4-byte boundary. The
//! store validates and decodes the buffer at [TiledNavMesh::add_tile] and
//! keeps the original buffer around so [TiledNavMesh::remove_tile] can hand
//! it back to the caller.

use bevy::log::warn;
use bevy::prelude::Vec3;
use thiserror::Error;
use zerocopy::{F32, FromBytes, I32, LE, U16, U32};
use zerocopy_derive::{Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::math::{
    calc_slab_end_points, next_pow2, overlap_boxes, overlap_quantized_boxes, overlap_slabs,
};
use crate::refs::{PolyRef, PolyRefCodec, TileRef};
use crate::{NavMeshParams, QueryFilter, VERTICES_PER_POLYGON};

/// `'D' 'N' 'A' 'V'` packed big-endian; the first word of every tile blob.
pub const NAVMESH_MAGIC: i32 =
    ('D' as i32) << 24 | ('N' as i32) << 16 | ('A' as i32) << 8 | ('V' as i32);
/// Tile format version. A mismatch rejects the blob.
pub const NAVMESH_VERSION: i32 = 4;

/// `'D' 'N' 'M' 'S'`; the first word of a tile state snapshot.
pub const NAVMESH_STATE_MAGIC: i32 =
    ('D' as i32) << 24 | ('N' as i32) << 16 | ('M' as i32) << 8 | ('S' as i32);
pub const NAVMESH_STATE_VERSION: i32 = 1;

/// Neighbour edge code marker: the low bits carry the boundary side.
pub const EXT_LINK: u16 = 0x8000;
/// End of a link chain / empty free list.
pub const NULL_LINK: u32 = u32::MAX;
/// Off-mesh connection can be traversed both ways.
pub const OFFMESH_CON_BIDIR: u8 = 1;

const NULL_SLOT: u32 = u32::MAX;

const TILE_HASH_H1: u32 = 0x8da6b343;
const TILE_HASH_H2: u32 = 0xd8163841;

#[inline]
pub(crate) fn opposite_side(side: u8) -> u8 {
    (side + 4) & 0x7
}

#[inline]
fn align4(x: usize) -> usize {
    (x + 3) & !3
}

#[inline]
fn compute_tile_hash(x: i32, y: i32, mask: u32) -> usize {
    let n = TILE_HASH_H1
        .wrapping_mul(x as u32)
        .wrapping_add(TILE_HASH_H2.wrapping_mul(y as u32));
    (n & mask) as usize
}

/// Failures of the tile store and the tile wire format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileError {
    #[error("buffer does not start with the nav-mesh magic")]
    WrongMagic,
    #[error("tile data version {0} is not supported (expected {NAVMESH_VERSION})")]
    WrongVersion(i32),
    #[error("tile data buffer is truncated")]
    TruncatedData,
    #[error("nav-mesh parameters leave fewer than 10 salt bits")]
    InvalidParams,
    #[error("tile build input is malformed")]
    InvalidInput,
    #[error("a tile already occupies grid location ({0}, {1})")]
    TileAlreadyExists(i32, i32),
    #[error("all tile slots are in use")]
    OutOfTiles,
    #[error("the tile slot named by the restore ref is not free")]
    SlotNotFree,
    #[error("handle does not resolve to a live tile or polygon")]
    InvalidRef,
    #[error("state buffer does not match this tile")]
    StateRefMismatch,
}

// --- Wire format -----------------------------------------------------------

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct WireTileHeader {
    pub magic: I32<LE>,
    pub version: I32<LE>,
    pub x: I32<LE>,
    pub y: I32<LE>,
    pub user_id: U32<LE>,
    pub poly_count: U32<LE>,
    pub vert_count: U32<LE>,
    pub max_link_count: U32<LE>,
    pub detail_mesh_count: U32<LE>,
    pub detail_vert_count: U32<LE>,
    pub detail_tri_count: U32<LE>,
    pub bv_node_count: U32<LE>,
    pub off_mesh_con_count: U32<LE>,
    pub off_mesh_base: U32<LE>,
    pub walkable_height: F32<LE>,
    pub walkable_radius: F32<LE>,
    pub walkable_climb: F32<LE>,
    pub bmin: [F32<LE>; 3],
    pub bmax: [F32<LE>; 3],
    pub bv_quant_factor: F32<LE>,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct WirePoly {
    pub first_link: U32<LE>,
    pub verts: [U16<LE>; VERTICES_PER_POLYGON],
    pub neis: [U16<LE>; VERTICES_PER_POLYGON],
    pub flags: U16<LE>,
    pub vert_count: u8,
    pub area_and_type: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
pub(crate) struct WireLink {
    pub target: U32<LE>,
    pub next: U32<LE>,
    pub edge: u8,
    pub side: u8,
    pub bmin: u8,
    pub bmax: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct WirePolyDetail {
    pub vert_base: U16<LE>,
    pub vert_count: U16<LE>,
    pub tri_base: U16<LE>,
    pub tri_count: U16<LE>,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct WireBvNode {
    pub bmin: [U16<LE>; 3],
    pub bmax: [U16<LE>; 3],
    pub i: I32<LE>,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct WireOffMeshConnection {
    pub pos: [F32<LE>; 6],
    pub rad: F32<LE>,
    pub poly: U16<LE>,
    pub flags: u8,
    pub side: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct WireTileState {
    magic: I32<LE>,
    version: I32<LE>,
    tile_ref: U32<LE>,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct WirePolyState {
    flags: U16<LE>,
    area: u8,
    pad: u8,
}

// --- Decoded tile ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolyType {
    /// Regular walkable polygon.
    Ground,
    /// Degenerate two-vertex polygon standing in for an off-mesh connection.
    OffMeshConnection,
}

/// One navigation polygon: up to six vertices, per-edge neighbour codes and
/// the head of its link chain.
#[derive(Debug, Clone)]
pub struct Poly {
    pub first_link: u32,
    pub verts: [u16; VERTICES_PER_POLYGON],
    /// Per-edge neighbour code: 0 = none, `1..=n` = in-tile polygon index
    /// plus one, `EXT_LINK | side` = portal on the tile boundary.
    pub neis: [u16; VERTICES_PER_POLYGON],
    pub flags: u16,
    pub vert_count: u8,
    area_and_type: u8,
}

impl Poly {
    #[inline]
    pub fn area(&self) -> u8 {
        self.area_and_type & 0x3f
    }

    #[inline]
    pub fn set_area(&mut self, area: u8) {
        self.area_and_type = (self.area_and_type & 0xc0) | (area & 0x3f);
    }

    #[inline]
    pub fn poly_type(&self) -> PolyType {
        if (self.area_and_type >> 6) == 1 {
            PolyType::OffMeshConnection
        } else {
            PolyType::Ground
        }
    }

    #[inline]
    pub(crate) fn pack_area_and_type(area: u8, poly_type: PolyType) -> u8 {
        let t = match poly_type {
            PolyType::Ground => 0u8,
            PolyType::OffMeshConnection => 1u8,
        };
        (t << 6) | (area & 0x3f)
    }
}

/// One directed edge of the polygon graph, an entry in the tile's link pool.
#[derive(Debug, Clone)]
pub struct Link {
    pub target: PolyRef,
    pub next: u32,
    /// Edge of the owning polygon this link leaves through; `0xff` for
    /// off-mesh endpoints.
    pub edge: u8,
    /// Boundary side for portal links, `0xff` for in-tile links.
    pub side: u8,
    /// Portal sub-range over the edge, normalized to 0..255.
    pub bmin: u8,
    pub bmax: u8,
}

impl Link {
    fn empty() -> Link {
        Link {
            target: PolyRef::NULL,
            next: NULL_LINK,
            edge: 0,
            side: 0,
            bmin: 0,
            bmax: 0,
        }
    }
}

/// Per-polygon slice of the detail triangle soup.
#[derive(Debug, Clone, Copy)]
pub struct PolyDetail {
    pub vert_base: u16,
    pub vert_count: u16,
    pub tri_base: u16,
    pub tri_count: u16,
}

/// Bounding-volume node: leaves carry a polygon index in `i`, interior
/// nodes carry the negated escape offset for stackless traversal.
#[derive(Debug, Clone, Copy)]
pub struct BvNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    pub i: i32,
}

#[derive(Debug, Clone)]
pub struct OffMeshConnection {
    /// Both endpoint locations; `pos[0]` is the entry side.
    pub pos: [Vec3; 2],
    pub rad: f32,
    /// Index of the off-mesh polygon standing in for this connection.
    pub poly: u16,
    pub flags: u8,
    /// Boundary side the far endpoint leaves through, `0xff` when it stays
    /// in this tile.
    pub side: u8,
}

/// Decoded tile header fields that stay relevant after the counts have
/// become array lengths.
#[derive(Debug, Clone)]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub user_id: u32,
    pub off_mesh_base: u32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub bv_quant_factor: f32,
}

/// A live tile: decoded arrays plus the original serialized buffer.
pub struct MeshTile {
    pub header: TileHeader,
    pub verts: Vec<Vec3>,
    pub polys: Vec<Poly>,
    pub links: Vec<Link>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<Vec3>,
    /// Detail triangles; the fourth byte packs per-edge boundary flags.
    pub detail_tris: Vec<[u8; 4]>,
    pub bv_tree: Vec<BvNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
    pub(crate) links_free_list: u32,
    data: Vec<u8>,
}

impl MeshTile {
    /// Validates and decodes a serialized tile, keeping ownership of the
    /// buffer.
    pub fn decode(data: Vec<u8>) -> Result<MeshTile, TileError> {
        let (header, _) =
            WireTileHeader::ref_from_prefix(&data[..]).map_err(|_| TileError::TruncatedData)?;
        if header.magic.get() != NAVMESH_MAGIC {
            return Err(TileError::WrongMagic);
        }
        if header.version.get() != NAVMESH_VERSION {
            return Err(TileError::WrongVersion(header.version.get()));
        }

        let poly_count = header.poly_count.get() as usize;
        let vert_count = header.vert_count.get() as usize;
        let max_link_count = header.max_link_count.get() as usize;
        let detail_mesh_count = header.detail_mesh_count.get() as usize;
        let detail_vert_count = header.detail_vert_count.get() as usize;
        let detail_tri_count = header.detail_tri_count.get() as usize;
        let bv_node_count = header.bv_node_count.get() as usize;
        let off_mesh_con_count = header.off_mesh_con_count.get() as usize;

        let decoded_header = TileHeader {
            x: header.x.get(),
            y: header.y.get(),
            user_id: header.user_id.get(),
            off_mesh_base: header.off_mesh_base.get(),
            walkable_height: header.walkable_height.get(),
            walkable_radius: header.walkable_radius.get(),
            walkable_climb: header.walkable_climb.get(),
            bmin: Vec3::from_array(header.bmin.map(|v| v.get())),
            bmax: Vec3::from_array(header.bmax.map(|v| v.get())),
            bv_quant_factor: header.bv_quant_factor.get(),
        };

        let rest = &data[align4(core::mem::size_of::<WireTileHeader>())..];

        let (wire_verts, rest) = <[F32<LE>]>::ref_from_prefix_with_elems(rest, vert_count * 3)
            .map_err(|_| TileError::TruncatedData)?;
        let (wire_polys, rest) = <[WirePoly]>::ref_from_prefix_with_elems(rest, poly_count)
            .map_err(|_| TileError::TruncatedData)?;
        let (_wire_links, rest) = <[WireLink]>::ref_from_prefix_with_elems(rest, max_link_count)
            .map_err(|_| TileError::TruncatedData)?;
        let (wire_details, rest) =
            <[WirePolyDetail]>::ref_from_prefix_with_elems(rest, detail_mesh_count)
                .map_err(|_| TileError::TruncatedData)?;
        let (wire_detail_verts, rest) =
            <[F32<LE>]>::ref_from_prefix_with_elems(rest, detail_vert_count * 3)
                .map_err(|_| TileError::TruncatedData)?;
        let (wire_detail_tris, rest) =
            <[u8]>::ref_from_prefix_with_elems(rest, detail_tri_count * 4)
                .map_err(|_| TileError::TruncatedData)?;
        let (wire_bv, rest) = <[WireBvNode]>::ref_from_prefix_with_elems(rest, bv_node_count)
            .map_err(|_| TileError::TruncatedData)?;
        let (wire_cons, _rest) =
            <[WireOffMeshConnection]>::ref_from_prefix_with_elems(rest, off_mesh_con_count)
                .map_err(|_| TileError::TruncatedData)?;

        let verts: Vec<Vec3> = wire_verts
            .chunks_exact(3)
            .map(|c| Vec3::new(c[0].get(), c[1].get(), c[2].get()))
            .collect();
        let polys: Vec<Poly> = wire_polys
            .iter()
            .map(|p| Poly {
                first_link: NULL_LINK,
                verts: p.verts.map(|v| v.get()),
                neis: p.neis.map(|v| v.get()),
                flags: p.flags.get(),
                vert_count: p.vert_count,
                area_and_type: p.area_and_type,
            })
            .collect();
        let detail_meshes: Vec<PolyDetail> = wire_details
            .iter()
            .map(|d| PolyDetail {
                vert_base: d.vert_base.get(),
                vert_count: d.vert_count.get(),
                tri_base: d.tri_base.get(),
                tri_count: d.tri_count.get(),
            })
            .collect();
        let detail_verts: Vec<Vec3> = wire_detail_verts
            .chunks_exact(3)
            .map(|c| Vec3::new(c[0].get(), c[1].get(), c[2].get()))
            .collect();
        let detail_tris: Vec<[u8; 4]> = wire_detail_tris
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        let bv_tree: Vec<BvNode> = wire_bv
            .iter()
            .map(|n| BvNode {
                bmin: n.bmin.map(|v| v.get()),
                bmax: n.bmax.map(|v| v.get()),
                i: n.i.get(),
            })
            .collect();
        let off_mesh_cons: Vec<OffMeshConnection> = wire_cons
            .iter()
            .map(|c| OffMeshConnection {
                pos: [
                    Vec3::new(c.pos[0].get(), c.pos[1].get(), c.pos[2].get()),
                    Vec3::new(c.pos[3].get(), c.pos[4].get(), c.pos[5].get()),
                ],
                rad: c.rad.get(),
                poly: c.poly.get(),
                flags: c.flags,
                side: c.side,
            })
            .collect();

        // The link pool is runtime state; the serialized region only
        // reserves its space. Thread the whole pool onto the free list.
        let mut links = vec![Link::empty(); max_link_count];
        for i in 0..max_link_count.saturating_sub(1) {
            links[i].next = (i + 1) as u32;
        }
        let links_free_list = if max_link_count > 0 { 0 } else { NULL_LINK };

        Ok(MeshTile {
            header: decoded_header,
            verts,
            polys,
            links,
            detail_meshes,
            detail_verts,
            detail_tris,
            bv_tree,
            off_mesh_cons,
            links_free_list,
            data,
        })
    }

    pub(crate) fn alloc_link(&mut self) -> u32 {
        if self.links_free_list == NULL_LINK {
            return NULL_LINK;
        }
        let link = self.links_free_list;
        self.links_free_list = self.links[link as usize].next;
        link
    }

    pub(crate) fn free_link(&mut self, link: u32) {
        self.links[link as usize].next = self.links_free_list;
        self.links_free_list = link;
    }

    /// Copies the polygon's corner positions into `out`, returning the count.
    pub(crate) fn poly_verts_into(&self, poly: &Poly, out: &mut [Vec3]) -> usize {
        let nv = poly.vert_count as usize;
        for i in 0..nv {
            out[i] = self.verts[poly.verts[i] as usize];
        }
        nv
    }

    /// Closest point on the polygon surface, using the detail triangles for
    /// ground polygons and endpoint interpolation for off-mesh ones.
    ///
    /// `None` when a detail triangle indexes outside the tile's data.
    pub fn closest_point_on_poly(&self, ip: usize, pos: Vec3) -> Option<Vec3> {
        let poly = &self.polys[ip];

        if poly.poly_type() == PolyType::OffMeshConnection {
            let v0 = self.verts[poly.verts[0] as usize];
            let v1 = self.verts[poly.verts[1] as usize];
            let d0 = pos.distance(v0);
            let d1 = pos.distance(v1);
            let u = d0 / (d0 + d1);
            return Some(v0.lerp(v1, u));
        }

        let pd = &self.detail_meshes[ip];
        let mut closest = pos;
        let mut closest_dist_sqr = f32::MAX;
        for j in 0..pd.tri_count as usize {
            let t = self.detail_tris.get(pd.tri_base as usize + j)?;
            let mut v = [Vec3::ZERO; 3];
            for k in 0..3 {
                v[k] = self.detail_vertex(poly, pd, t[k])?;
            }
            let pt = crate::math::closest_pt_point_triangle(pos, v[0], v[1], v[2]);
            let d = pos.distance_squared(pt);
            if d < closest_dist_sqr {
                closest = pt;
                closest_dist_sqr = d;
            }
        }
        Some(closest)
    }

    /// Resolves a detail-triangle index: small indices name polygon corners,
    /// larger ones the detail vertex array.
    pub(crate) fn detail_vertex(&self, poly: &Poly, pd: &PolyDetail, index: u8) -> Option<Vec3> {
        if index < poly.vert_count {
            Some(self.verts[poly.verts[index as usize] as usize])
        } else {
            self.detail_verts
                .get(pd.vert_base as usize + (index - poly.vert_count) as usize)
                .copied()
        }
    }

    /// Collects polygons whose bounds overlap the query box, walking the BV
    /// tree when the tile has one.
    pub(crate) fn query_polygons(
        &self,
        base: PolyRef,
        qmin: Vec3,
        qmax: Vec3,
        filter: &QueryFilter,
        polys: &mut [PolyRef],
    ) -> usize {
        let mut n = 0;
        if !self.bv_tree.is_empty() {
            let tbmin = self.header.bmin;
            let tbmax = self.header.bmax;
            let qfac = self.header.bv_quant_factor;

            // Quantize the query box into tile-local BV space.
            let minx = qmin.x.clamp(tbmin.x, tbmax.x) - tbmin.x;
            let miny = qmin.y.clamp(tbmin.y, tbmax.y) - tbmin.y;
            let minz = qmin.z.clamp(tbmin.z, tbmax.z) - tbmin.z;
            let maxx = qmax.x.clamp(tbmin.x, tbmax.x) - tbmin.x;
            let maxy = qmax.y.clamp(tbmin.y, tbmax.y) - tbmin.y;
            let maxz = qmax.z.clamp(tbmin.z, tbmax.z) - tbmin.z;
            let bmin = [
                (qfac * minx) as u16 & 0xfffe,
                (qfac * miny) as u16 & 0xfffe,
                (qfac * minz) as u16 & 0xfffe,
            ];
            let bmax = [
                (qfac * maxx + 1.0) as u16 | 1,
                (qfac * maxy + 1.0) as u16 | 1,
                (qfac * maxz + 1.0) as u16 | 1,
            ];

            let mut i = 0usize;
            while i < self.bv_tree.len() {
                let node = &self.bv_tree[i];
                let overlap = overlap_quantized_boxes(bmin, bmax, node.bmin, node.bmax);
                let is_leaf = node.i >= 0;

                if is_leaf && overlap {
                    let poly = &self.polys[node.i as usize];
                    if filter.passes(poly.flags) && n < polys.len() {
                        polys[n] = PolyRef(base.0 | node.i as u32);
                        n += 1;
                    }
                }

                if overlap || is_leaf {
                    i += 1;
                } else {
                    i += (-node.i) as usize;
                }
            }
        } else {
            for (i, poly) in self.polys.iter().enumerate() {
                let mut bmin = self.verts[poly.verts[0] as usize];
                let mut bmax = bmin;
                for j in 1..poly.vert_count as usize {
                    let v = self.verts[poly.verts[j] as usize];
                    bmin = bmin.min(v);
                    bmax = bmax.max(v);
                }
                if overlap_boxes(qmin, qmax, bmin, bmax)
                    && filter.passes(poly.flags)
                    && n < polys.len()
                {
                    polys[n] = PolyRef(base.0 | i as u32);
                    n += 1;
                }
            }
        }
        n
    }

    /// Nearest polygon to `center` within `half_extents`, with the closest
    /// surface point on it.
    pub(crate) fn find_nearest_poly(
        &self,
        base: PolyRef,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let mut polys = [PolyRef::NULL; 128];
        let n = self.query_polygons(
            base,
            center - half_extents,
            center + half_extents,
            filter,
            &mut polys,
        );

        let mut nearest = None;
        let mut nearest_dist_sqr = f32::MAX;
        for &r in &polys[..n] {
            let ip = (r.0 & !base.0) as usize;
            let Some(closest) = self.closest_point_on_poly(ip, center) else {
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
}

// --- Tile store ------------------------------------------------------------

struct TileSlot {
    salt: u32,
    /// Chains free slots on the free list and occupied slots inside their
    /// position-hash bucket.
    next: u32,
    tile: Option<MeshTile>,
}

/// The tiled navigation mesh: a fixed-capacity arena of tiles addressed by
/// grid location, with the polygon graph kept linked across tile
/// boundaries.
pub struct TiledNavMesh {
    params: NavMeshParams,
    tiles: Vec<TileSlot>,
    pos_lookup: Vec<u32>,
    lut_mask: u32,
    next_free: u32,
    codec: PolyRefCodec,
}

impl TiledNavMesh {
    pub fn new(params: NavMeshParams) -> Result<TiledNavMesh, TileError> {
        let codec = PolyRefCodec::new(params.max_tiles, params.max_polys_per_tile)
            .ok_or(TileError::InvalidParams)?;

        let lut_size = next_pow2(params.max_tiles / 4).max(1);
        let max_tiles = params.max_tiles as usize;

        let mut tiles = Vec::with_capacity(max_tiles);
        for i in 0..max_tiles {
            tiles.push(TileSlot {
                salt: 1,
                next: if i + 1 < max_tiles {
                    (i + 1) as u32
                } else {
                    NULL_SLOT
                },
                tile: None,
            });
        }

        Ok(TiledNavMesh {
            params,
            tiles,
            pos_lookup: vec![NULL_SLOT; lut_size as usize],
            lut_mask: lut_size - 1,
            next_free: if max_tiles > 0 { 0 } else { NULL_SLOT },
            codec,
        })
    }

    /// Convenience for the single-tile case: derives the store parameters
    /// from the blob header and installs the tile.
    pub fn new_single_tile(data: Vec<u8>) -> Result<TiledNavMesh, TileError> {
        let (header, _) =
            WireTileHeader::ref_from_prefix(&data[..]).map_err(|_| TileError::TruncatedData)?;
        if header.magic.get() != NAVMESH_MAGIC {
            return Err(TileError::WrongMagic);
        }
        if header.version.get() != NAVMESH_VERSION {
            return Err(TileError::WrongVersion(header.version.get()));
        }

        let bmin = Vec3::from_array(header.bmin.map(|v| v.get()));
        let bmax = Vec3::from_array(header.bmax.map(|v| v.get()));
        let params = NavMeshParams {
            origin: bmin,
            tile_width: bmax.x - bmin.x,
            tile_height: bmax.z - bmin.z,
            max_tiles: 1,
            max_polys_per_tile: header.poly_count.get().max(1),
        };

        let mut mesh = TiledNavMesh::new(params)?;
        mesh.add_tile(data, None)?;
        Ok(mesh)
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn codec(&self) -> &PolyRefCodec {
        &self.codec
    }

    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Installs a serialized tile.
    ///
    /// Passing the tile's previous [TileRef] as `last_ref` revives the same
    /// slot with the same salt, so refs serialized before a remove keep
    /// resolving.
    pub fn add_tile(
        &mut self,
        data: Vec<u8>,
        last_ref: Option<TileRef>,
    ) -> Result<TileRef, TileError> {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("add_tile").entered();

        let tile = MeshTile::decode(data)?;
        let (x, y) = (tile.header.x, tile.header.y);

        if self.tile_index_at(x, y).is_some() {
            return Err(TileError::TileAlreadyExists(x, y));
        }

        let slot_index = match last_ref {
            None => {
                let idx = self.next_free;
                if idx == NULL_SLOT {
                    return Err(TileError::OutOfTiles);
                }
                self.next_free = self.tiles[idx as usize].next;
                idx as usize
            }
            Some(last_ref) => {
                // Revive the slot the ref names, keeping its salt.
                let target = self.codec.decode_tile(PolyRef(last_ref.0));
                if target >= self.tiles.len() as u32 {
                    return Err(TileError::InvalidRef);
                }
                let mut prev = NULL_SLOT;
                let mut cur = self.next_free;
                while cur != NULL_SLOT && cur != target {
                    prev = cur;
                    cur = self.tiles[cur as usize].next;
                }
                if cur != target {
                    return Err(TileError::SlotNotFree);
                }
                if prev == NULL_SLOT {
                    self.next_free = self.tiles[cur as usize].next;
                } else {
                    self.tiles[prev as usize].next = self.tiles[cur as usize].next;
                }
                self.tiles[cur as usize].salt = self.codec.decode_salt(PolyRef(last_ref.0));
                cur as usize
            }
        };

        let h = compute_tile_hash(x, y, self.lut_mask);
        let slot = &mut self.tiles[slot_index];
        slot.next = self.pos_lookup[h];
        slot.tile = Some(tile);
        self.pos_lookup[h] = slot_index as u32;

        self.connect_int_links(slot_index);
        self.connect_int_off_mesh_links(slot_index);

        for side in 0..8u8 {
            if let Some(nei) = self.neighbour_tile_index(x, y, side) {
                self.connect_ext_links(slot_index, nei, side);
                self.connect_ext_links(nei, slot_index, opposite_side(side));
                self.connect_ext_off_mesh_links(slot_index, nei, side);
                self.connect_ext_off_mesh_links(nei, slot_index, opposite_side(side));
            }
        }

        Ok(self.tile_ref_at_index(slot_index))
    }

    /// Removes a tile, unlinking its neighbours, and returns the serialized
    /// buffer it was installed from. The slot's salt advances so stale refs
    /// stop resolving.
    pub fn remove_tile(&mut self, r: TileRef) -> Result<Vec<u8>, TileError> {
        if r.is_null() {
            return Err(TileError::InvalidRef);
        }
        let tile_index = self.codec.decode_tile(PolyRef(r.0)) as usize;
        let tile_salt = self.codec.decode_salt(PolyRef(r.0));
        if tile_index >= self.tiles.len() {
            return Err(TileError::InvalidRef);
        }
        if self.tiles[tile_index].salt != tile_salt || self.tiles[tile_index].tile.is_none() {
            return Err(TileError::InvalidRef);
        }

        let (x, y) = {
            let t = self.tiles[tile_index].tile.as_ref().unwrap();
            (t.header.x, t.header.y)
        };

        // Remove from the position hash.
        let h = compute_tile_hash(x, y, self.lut_mask);
        let mut prev = NULL_SLOT;
        let mut cur = self.pos_lookup[h];
        while cur != NULL_SLOT {
            if cur as usize == tile_index {
                let next = self.tiles[cur as usize].next;
                if prev == NULL_SLOT {
                    self.pos_lookup[h] = next;
                } else {
                    self.tiles[prev as usize].next = next;
                }
                break;
            }
            prev = cur;
            cur = self.tiles[cur as usize].next;
        }

        // Drop the neighbours' links into this tile.
        for side in 0..8u8 {
            if let Some(nei) = self.neighbour_tile_index(x, y, side) {
                self.unconnect_ext_links(nei, opposite_side(side));
            }
        }

        let slot = &mut self.tiles[tile_index];
        let tile = slot.tile.take().unwrap();
        slot.salt = slot.salt.wrapping_add(1);
        slot.next = self.next_free;
        self.next_free = tile_index as u32;

        Ok(tile.data)
    }

    // --- Lookups -----------------------------------------------------------

    fn tile_index_at(&self, x: i32, y: i32) -> Option<usize> {
        let h = compute_tile_hash(x, y, self.lut_mask);
        let mut cur = self.pos_lookup[h];
        while cur != NULL_SLOT {
            let slot = &self.tiles[cur as usize];
            if let Some(tile) = &slot.tile {
                if tile.header.x == x && tile.header.y == y {
                    return Some(cur as usize);
                }
            }
            cur = slot.next;
        }
        None
    }

    fn neighbour_tile_index(&self, x: i32, y: i32, side: u8) -> Option<usize> {
        let (nx, ny) = match side {
            0 => (x + 1, y),
            1 => (x + 1, y + 1),
            2 => (x, y + 1),
            3 => (x - 1, y + 1),
            4 => (x - 1, y),
            5 => (x - 1, y - 1),
            6 => (x, y - 1),
            _ => (x + 1, y - 1),
        };
        self.tile_index_at(nx, ny)
    }

    pub fn tile_at(&self, x: i32, y: i32) -> Option<&MeshTile> {
        self.tile_index_at(x, y)
            .and_then(|i| self.tiles[i].tile.as_ref())
    }

    pub fn tile_ref_at(&self, x: i32, y: i32) -> Option<TileRef> {
        self.tile_index_at(x, y).map(|i| self.tile_ref_at_index(i))
    }

    /// Ref of a live tile obtained from this store.
    pub fn tile_ref(&self, tile: &MeshTile) -> Option<TileRef> {
        self.tile_ref_at(tile.header.x, tile.header.y)
    }

    fn tile_ref_at_index(&self, index: usize) -> TileRef {
        TileRef(self.codec.encode(self.tiles[index].salt, index as u32, 0).0)
    }

    pub fn tile_by_ref(&self, r: TileRef) -> Option<&MeshTile> {
        if r.is_null() {
            return None;
        }
        let index = self.codec.decode_tile(PolyRef(r.0)) as usize;
        let salt = self.codec.decode_salt(PolyRef(r.0));
        let slot = self.tiles.get(index)?;
        if slot.salt != salt {
            return None;
        }
        slot.tile.as_ref()
    }

    /// Base ref of a tile: the poly ref of its polygon 0.
    pub(crate) fn poly_ref_base(&self, tile_index: usize) -> PolyRef {
        self.codec
            .encode(self.tiles[tile_index].salt, tile_index as u32, 0)
    }

    /// Resolves a polygon ref, validating salt and bounds.
    pub fn tile_and_poly_by_ref(&self, r: PolyRef) -> Option<(&MeshTile, &Poly)> {
        if r.is_null() {
            return None;
        }
        let (salt, it, ip) = self.codec.decode(r);
        let slot = self.tiles.get(it as usize)?;
        if slot.salt != salt {
            return None;
        }
        let tile = slot.tile.as_ref()?;
        let poly = tile.polys.get(ip as usize)?;
        Some((tile, poly))
    }

    pub fn is_valid_poly_ref(&self, r: PolyRef) -> bool {
        self.tile_and_poly_by_ref(r).is_some()
    }

    /// Tile containing the polygon `r`, plus the polygon's index.
    pub fn tile_by_poly_ref(&self, r: PolyRef) -> Option<(&MeshTile, usize)> {
        if r.is_null() {
            return None;
        }
        let (salt, it, ip) = self.codec.decode(r);
        let slot = self.tiles.get(it as usize)?;
        if slot.salt != salt {
            return None;
        }
        let tile = slot.tile.as_ref()?;
        if ip as usize >= tile.polys.len() {
            return None;
        }
        Some((tile, ip as usize))
    }

    /// Grid location containing `pos`.
    pub fn calc_tile_loc(&self, pos: Vec3) -> (i32, i32) {
        (
            ((pos.x - self.params.origin.x) / self.params.tile_width).floor() as i32,
            ((pos.z - self.params.origin.z) / self.params.tile_height).floor() as i32,
        )
    }

    pub(crate) fn find_nearest_poly_in_tile(
        &self,
        tile_index: usize,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let base = self.poly_ref_base(tile_index);
        self.tiles[tile_index]
            .tile
            .as_ref()?
            .find_nearest_poly(base, center, half_extents, filter)
    }

    // --- Polygon attributes -------------------------------------------------

    pub fn set_poly_flags(&mut self, r: PolyRef, flags: u16) -> Result<(), TileError> {
        let (it, ip) = self.resolve_mut(r)?;
        self.tiles[it].tile.as_mut().unwrap().polys[ip].flags = flags;
        Ok(())
    }

    pub fn poly_flags(&self, r: PolyRef) -> Option<u16> {
        self.tile_and_poly_by_ref(r).map(|(_, p)| p.flags)
    }

    pub fn set_poly_area(&mut self, r: PolyRef, area: u8) -> Result<(), TileError> {
        let (it, ip) = self.resolve_mut(r)?;
        self.tiles[it].tile.as_mut().unwrap().polys[ip].set_area(area);
        Ok(())
    }

    pub fn poly_area(&self, r: PolyRef) -> Option<u8> {
        self.tile_and_poly_by_ref(r).map(|(_, p)| p.area())
    }

    fn resolve_mut(&mut self, r: PolyRef) -> Result<(usize, usize), TileError> {
        if r.is_null() {
            return Err(TileError::InvalidRef);
        }
        let (salt, it, ip) = self.codec.decode(r);
        let slot = self.tiles.get(it as usize).ok_or(TileError::InvalidRef)?;
        if slot.salt != salt {
            return Err(TileError::InvalidRef);
        }
        let tile = slot.tile.as_ref().ok_or(TileError::InvalidRef)?;
        if ip as usize >= tile.polys.len() {
            return Err(TileError::InvalidRef);
        }
        Ok((it as usize, ip as usize))
    }

    // --- Tile state snapshots ----------------------------------------------

    /// Bytes needed to snapshot a tile's mutable polygon state.
    pub fn tile_state_size(&self, r: TileRef) -> Option<usize> {
        let tile = self.tile_by_ref(r)?;
        Some(
            align4(core::mem::size_of::<WireTileState>())
                + align4(core::mem::size_of::<WirePolyState>() * tile.polys.len()),
        )
    }

    /// Serializes per-polygon `(flags, area)` so tile data can be re-added
    /// later and restored to its annotated state.
    pub fn store_tile_state(&self, r: TileRef) -> Result<Vec<u8>, TileError> {
        let tile = self.tile_by_ref(r).ok_or(TileError::InvalidRef)?;

        let header = WireTileState {
            magic: I32::new(NAVMESH_STATE_MAGIC),
            version: I32::new(NAVMESH_STATE_VERSION),
            tile_ref: U32::new(r.0),
        };

        let mut out = Vec::with_capacity(
            align4(core::mem::size_of::<WireTileState>())
                + core::mem::size_of::<WirePolyState>() * tile.polys.len(),
        );
        out.extend_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        for poly in &tile.polys {
            let state = WirePolyState {
                flags: U16::new(poly.flags),
                area: poly.area(),
                pad: 0,
            };
            out.extend_from_slice(zerocopy::IntoBytes::as_bytes(&state));
        }
        Ok(out)
    }

    /// Restores a snapshot taken by [store_tile_state](Self::store_tile_state).
    /// Refuses snapshots whose stored ref no longer names this tile (the
    /// slot was reused in between).
    pub fn restore_tile_state(&mut self, r: TileRef, data: &[u8]) -> Result<(), TileError> {
        let (header, rest) =
            WireTileState::ref_from_prefix(data).map_err(|_| TileError::TruncatedData)?;
        if header.magic.get() != NAVMESH_STATE_MAGIC {
            return Err(TileError::WrongMagic);
        }
        if header.version.get() != NAVMESH_STATE_VERSION {
            return Err(TileError::WrongVersion(header.version.get()));
        }
        if header.tile_ref.get() != r.0 {
            return Err(TileError::StateRefMismatch);
        }

        let tile_index = {
            if self.tile_by_ref(r).is_none() {
                return Err(TileError::InvalidRef);
            }
            self.codec.decode_tile(PolyRef(r.0)) as usize
        };
        let tile = self.tiles[tile_index].tile.as_mut().unwrap();

        let (states, _) = <[WirePolyState]>::ref_from_prefix_with_elems(rest, tile.polys.len())
            .map_err(|_| TileError::TruncatedData)?;
        for (poly, state) in tile.polys.iter_mut().zip(states) {
            poly.flags = state.flags.get();
            poly.set_area(state.area);
        }
        Ok(())
    }

    // --- Link building ------------------------------------------------------

    fn tile_pair_mut(&mut self, a: usize, b: usize) -> (&mut MeshTile, &mut MeshTile) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.tiles.split_at_mut(b);
            (lo[a].tile.as_mut().unwrap(), hi[0].tile.as_mut().unwrap())
        } else {
            let (lo, hi) = self.tiles.split_at_mut(a);
            (hi[0].tile.as_mut().unwrap(), lo[b].tile.as_mut().unwrap())
        }
    }

    /// Wires every in-tile neighbour code into the link pool. Links are
    /// allocated in reverse edge order so each chain reads in ascending
    /// edge order.
    fn connect_int_links(&mut self, tile_index: usize) {
        let base = self.poly_ref_base(tile_index);
        let tile = self.tiles[tile_index].tile.as_mut().unwrap();

        for i in 0..tile.polys.len() {
            tile.polys[i].first_link = NULL_LINK;
            if tile.polys[i].poly_type() == PolyType::OffMeshConnection {
                continue;
            }

            let vert_count = tile.polys[i].vert_count as usize;
            let neis = tile.polys[i].neis;
            for j in (0..vert_count).rev() {
                if neis[j] == 0 || (neis[j] & EXT_LINK) != 0 {
                    continue;
                }
                let idx = tile.alloc_link();
                if idx == NULL_LINK {
                    warn!(
                        "tile ({}, {}) ran out of links while wiring internal edges",
                        tile.header.x, tile.header.y
                    );
                    continue;
                }
                let next = tile.polys[i].first_link;
                tile.links[idx as usize] = Link {
                    target: PolyRef(base.0 | (neis[j] - 1) as u32),
                    next,
                    edge: j as u8,
                    side: 0xff,
                    bmin: 0,
                    bmax: 0,
                };
                tile.polys[i].first_link = idx;
            }
        }
    }

    /// Connects off-mesh endpoints that land inside their own tile, snapping
    /// the endpoint vertices onto the nav-mesh surface.
    fn connect_int_off_mesh_links(&mut self, tile_index: usize) {
        let base = self.poly_ref_base(tile_index);
        let filter = QueryFilter::default();

        let con_count = self.tiles[tile_index]
            .tile
            .as_ref()
            .map_or(0, |t| t.off_mesh_cons.len());

        for ci in 0..con_count {
            let (con_poly, con_rad, con_side, con_flags, endpoints, climb) = {
                let tile = self.tiles[tile_index].tile.as_ref().unwrap();
                let con = &tile.off_mesh_cons[ci];
                (
                    con.poly as usize,
                    con.rad,
                    con.side,
                    con.flags,
                    con.pos,
                    tile.header.walkable_climb,
                )
            };
            let half_extents = Vec3::new(con_rad, climb, con_rad);

            for j in 0..2usize {
                let side = if j == 0 { 0xff } else { con_side };
                if side != 0xff {
                    // The far endpoint leaves the tile; handled when the
                    // neighbour is linked.
                    continue;
                }

                let p = endpoints[j];
                let Some((nearest_ref, nearest_pt)) =
                    self.find_nearest_poly_in_tile(tile_index, p, half_extents, &filter)
                else {
                    continue;
                };
                let dx = nearest_pt.x - p.x;
                let dz = nearest_pt.z - p.z;
                if dx * dx + dz * dz > con_rad * con_rad {
                    continue;
                }

                let land_poly = self.codec.decode_poly(nearest_ref) as usize;
                let tile = self.tiles[tile_index].tile.as_mut().unwrap();

                // Snap the connection vertex onto the surface.
                let vert = tile.polys[con_poly].verts[j] as usize;
                tile.verts[vert] = nearest_pt;

                // Off-mesh polygon to landing polygon.
                let idx = tile.alloc_link();
                if idx != NULL_LINK {
                    let next = tile.polys[con_poly].first_link;
                    tile.links[idx as usize] = Link {
                        target: nearest_ref,
                        next,
                        edge: j as u8,
                        side: 0xff,
                        bmin: 0,
                        bmax: 0,
                    };
                    tile.polys[con_poly].first_link = idx;
                }

                // Entry endpoints always link back; exits only when the
                // connection is bidirectional.
                if j == 0 || (con_flags & OFFMESH_CON_BIDIR) != 0 {
                    let idx = tile.alloc_link();
                    if idx != NULL_LINK {
                        let next = tile.polys[land_poly].first_link;
                        tile.links[idx as usize] = Link {
                            target: PolyRef(base.0 | con_poly as u32),
                            next,
                            edge: 0xff,
                            side: 0xff,
                            bmin: 0,
                            bmax: 0,
                        };
                        tile.polys[land_poly].first_link = idx;
                    }
                }
            }
        }
    }

    /// Builds portal links from `tile_index`'s `side` boundary into the
    /// neighbouring tile by matching colinear boundary edges.
    fn connect_ext_links(&mut self, tile_index: usize, target_index: usize, side: u8) {
        let target_base = self.poly_ref_base(target_index);
        let (tile, target) = self.tile_pair_mut(tile_index, target_index);

        let m = EXT_LINK | side as u16;
        for i in 0..tile.polys.len() {
            let vert_count = tile.polys[i].vert_count as usize;
            for j in 0..vert_count {
                if tile.polys[i].neis[j] != m {
                    continue;
                }

                let va = tile.verts[tile.polys[i].verts[j] as usize];
                let vb = tile.verts[tile.polys[i].verts[(j + 1) % vert_count] as usize];
                let mut nei = [PolyRef::NULL; 4];
                let mut neia = [0.0f32; 4 * 2];
                let nnei = find_connecting_polys(
                    va,
                    vb,
                    target,
                    target_base,
                    opposite_side(side),
                    &mut nei,
                    &mut neia,
                );

                for k in 0..nnei {
                    let idx = tile.alloc_link();
                    if idx == NULL_LINK {
                        warn!(
                            "tile ({}, {}) ran out of links while wiring side {side}",
                            tile.header.x, tile.header.y
                        );
                        continue;
                    }
                    // Compress the covered sub-range of the edge to a byte,
                    // rounding outward so short portals keep connectivity.
                    let (lmin, lmax) = if side == 0 || side == 4 {
                        (va.z.min(vb.z), va.z.max(vb.z))
                    } else {
                        (va.x.min(vb.x), va.x.max(vb.x))
                    };
                    let tmin = ((neia[k * 2] - lmin) / (lmax - lmin)).clamp(0.0, 1.0);
                    let tmax = ((neia[k * 2 + 1] - lmin) / (lmax - lmin)).clamp(0.0, 1.0);
                    let next = tile.polys[i].first_link;
                    tile.links[idx as usize] = Link {
                        target: nei[k],
                        next,
                        edge: j as u8,
                        side,
                        bmin: (tmin * 255.0).floor() as u8,
                        bmax: (tmax * 255.0).ceil().min(255.0) as u8,
                    };
                    tile.polys[i].first_link = idx;
                }
            }
        }
    }

    /// Connects off-mesh connections in the target tile whose far endpoint
    /// lands in `tile_index`.
    fn connect_ext_off_mesh_links(&mut self, tile_index: usize, target_index: usize, side: u8) {
        let opp = opposite_side(side);
        let filter = QueryFilter::default();
        let target_base = self.poly_ref_base(target_index);

        let con_count = self.tiles[target_index]
            .tile
            .as_ref()
            .map_or(0, |t| t.off_mesh_cons.len());

        for ci in 0..con_count {
            let (con_poly, con_rad, con_side, con_flags, endpoint) = {
                let target = self.tiles[target_index].tile.as_ref().unwrap();
                let con = &target.off_mesh_cons[ci];
                (con.poly as usize, con.rad, con.side, con.flags, con.pos[1])
            };
            if con_side != opp {
                continue;
            }

            let climb = self.tiles[tile_index]
                .tile
                .as_ref()
                .unwrap()
                .header
                .walkable_climb;
            let half_extents = Vec3::new(con_rad, climb, con_rad);
            let Some((nearest_ref, nearest_pt)) =
                self.find_nearest_poly_in_tile(tile_index, endpoint, half_extents, &filter)
            else {
                continue;
            };
            let dx = nearest_pt.x - endpoint.x;
            let dz = nearest_pt.z - endpoint.z;
            if dx * dx + dz * dz > con_rad * con_rad {
                continue;
            }

            let land_poly = self.codec.decode_poly(nearest_ref) as usize;
            let (tile, target) = self.tile_pair_mut(tile_index, target_index);

            // Snap the landing vertex of the off-mesh polygon.
            let vert = target.polys[con_poly].verts[1] as usize;
            target.verts[vert] = nearest_pt;

            // Off-mesh polygon to the landing polygon in this tile.
            let idx = target.alloc_link();
            if idx != NULL_LINK {
                let next = target.polys[con_poly].first_link;
                target.links[idx as usize] = Link {
                    target: nearest_ref,
                    next,
                    edge: 1,
                    side: opp,
                    bmin: 0,
                    bmax: 0,
                };
                target.polys[con_poly].first_link = idx;
            }

            // Landing polygon back to the off-mesh polygon when traversable
            // in that direction.
            if (con_flags & OFFMESH_CON_BIDIR) != 0 {
                let idx = tile.alloc_link();
                if idx != NULL_LINK {
                    let next = tile.polys[land_poly].first_link;
                    tile.links[idx as usize] = Link {
                        target: PolyRef(target_base.0 | con_poly as u32),
                        next,
                        edge: 0xff,
                        side,
                        bmin: 0,
                        bmax: 0,
                    };
                    tile.polys[land_poly].first_link = idx;
                }
            }
        }
    }

    /// Excises every link leaving `tile_index` through `side`, returning
    /// the entries to the free list.
    fn unconnect_ext_links(&mut self, tile_index: usize, side: u8) {
        let tile = self.tiles[tile_index].tile.as_mut().unwrap();

        for i in 0..tile.polys.len() {
            let mut j = tile.polys[i].first_link;
            let mut pj = NULL_LINK;
            while j != NULL_LINK {
                if tile.links[j as usize].side == side {
                    let nj = tile.links[j as usize].next;
                    if pj == NULL_LINK {
                        tile.polys[i].first_link = nj;
                    } else {
                        tile.links[pj as usize].next = nj;
                    }
                    tile.free_link(j);
                    j = nj;
                } else {
                    pj = j;
                    j = tile.links[j as usize].next;
                }
            }
        }
    }
}

/// Scans the target tile's `side` boundary for edges whose slab overlaps
/// `va -> vb`, collecting their refs and covered ranges.
fn find_connecting_polys(
    va: Vec3,
    vb: Vec3,
    target: &MeshTile,
    target_base: PolyRef,
    side: u8,
    con: &mut [PolyRef; 4],
    conarea: &mut [f32; 8],
) -> usize {
    let (amin, amax) = calc_slab_end_points(va, vb, side);
    let m = EXT_LINK | side as u16;
    let mut n = 0;

    for (i, poly) in target.polys.iter().enumerate() {
        let nv = poly.vert_count as usize;
        for j in 0..nv {
            if poly.neis[j] != m {
                continue;
            }
            let vc = target.verts[poly.verts[j] as usize];
            let vd = target.verts[poly.verts[(j + 1) % nv] as usize];
            let (bmin, bmax) = calc_slab_end_points(vc, vd, side);

            if !overlap_slabs(amin, amax, bmin, bmax, 0.01, target.header.walkable_climb) {
                continue;
            }

            if n < con.len() {
                conarea[n * 2] = amin[0].max(bmin[0]);
                conarea[n * 2 + 1] = amax[0].min(bmax[0]);
                con[n] = PolyRef(target_base.0 | i as u32);
                n += 1;
            }
            break;
        }
    }
    n
}
