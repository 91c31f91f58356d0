//! Serializes authored polygon meshes into the tile wire format.
//!
//! This is the producer side of the tile contract: mesh tooling hands over
//! world-space vertices, convex polygons with neighbour edge codes, and
//! off-mesh connections, and gets back the byte buffer that
//! [crate::tiles::TiledNavMesh::add_tile] consumes. Off-mesh connections are
//! turned into degenerate two-vertex polygons appended after the ground
//! polygons, and an optional bounding-volume tree is packed for fast
//! polygon queries.

use bevy::prelude::Vec3;
use zerocopy::{F32, I32, IntoBytes, LE, U16, U32};

use crate::tiles::{
    Poly, PolyType, TileError, WireBvNode, WireLink, WireOffMeshConnection, WirePoly,
    WirePolyDetail, WireTileHeader, EXT_LINK, NAVMESH_MAGIC, NAVMESH_VERSION, OFFMESH_CON_BIDIR,
};
use crate::VERTICES_PER_POLYGON;

/// One authored convex polygon.
#[derive(Debug, Clone)]
pub struct PolyInput {
    /// Vertex indices, counter-ordered so the interior lies to the left of
    /// each directed edge on the XZ-plane. At most six.
    pub verts: Vec<u16>,
    /// Neighbour code per edge: 0 = wall, `1..=n` = in-tile polygon index
    /// plus one, `EXT_LINK | side` = tile-boundary portal.
    pub neis: Vec<u16>,
    pub flags: u16,
    pub area: u8,
}

/// Optional height detail for one polygon.
#[derive(Debug, Clone, Default)]
pub struct PolyDetailInput {
    pub verts: Vec<Vec3>,
    /// Triangles indexing polygon corners first, then `verts`; the fourth
    /// byte carries the packed edge-boundary flags.
    pub tris: Vec<[u8; 4]>,
}

#[derive(Debug, Clone)]
pub struct OffMeshConnectionInput {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub bidirectional: bool,
    pub flags: u16,
    pub area: u8,
}

/// Everything needed to serialize one tile.
#[derive(Debug, Clone)]
pub struct TileDataInput {
    pub verts: Vec<Vec3>,
    pub polys: Vec<PolyInput>,
    /// Per-polygon detail, parallel to `polys`. When absent each polygon is
    /// fanned into flat triangles.
    pub detail: Option<Vec<PolyDetailInput>>,
    pub off_mesh_connections: Vec<OffMeshConnectionInput>,
    pub tile_x: i32,
    pub tile_y: i32,
    pub user_id: u32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Quantization granularity of the BV tree.
    pub cell_size: f32,
    pub build_bv_tree: bool,
}

impl TileDataInput {
    pub fn new(verts: Vec<Vec3>, polys: Vec<PolyInput>, bmin: Vec3, bmax: Vec3) -> TileDataInput {
        TileDataInput {
            verts,
            polys,
            detail: None,
            off_mesh_connections: Vec::new(),
            tile_x: 0,
            tile_y: 0,
            user_id: 0,
            bmin,
            bmax,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            cell_size: 0.1,
            build_bv_tree: true,
        }
    }
}

/// Which boundary side a point lies beyond, or `0xff` when it is inside.
fn classify_off_mesh_point(pt: Vec3, bmin: Vec3, bmax: Vec3) -> u8 {
    const XP: u8 = 1 << 0;
    const ZP: u8 = 1 << 1;
    const XM: u8 = 1 << 2;
    const ZM: u8 = 1 << 3;

    let mut outcode = 0u8;
    if pt.x >= bmax.x {
        outcode |= XP;
    }
    if pt.z >= bmax.z {
        outcode |= ZP;
    }
    if pt.x < bmin.x {
        outcode |= XM;
    }
    if pt.z < bmin.z {
        outcode |= ZM;
    }

    match outcode {
        x if x == XP => 0,
        x if x == XP | ZP => 1,
        x if x == ZP => 2,
        x if x == XM | ZP => 3,
        x if x == XM => 4,
        x if x == XM | ZM => 5,
        x if x == ZM => 6,
        x if x == XP | ZM => 7,
        _ => 0xff,
    }
}

struct BvItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    i: i32,
}

fn subdivide(items: &mut [BvItem], imin: usize, imax: usize, nodes: &mut Vec<WireBvNode>) {
    let inum = imax - imin;
    let icur = nodes.len();

    if inum == 1 {
        let it = &items[imin];
        nodes.push(WireBvNode {
            bmin: it.bmin.map(U16::new),
            bmax: it.bmax.map(U16::new),
            i: I32::new(it.i),
        });
        return;
    }

    // Bounds of the whole range.
    let mut bmin = items[imin].bmin;
    let mut bmax = items[imin].bmax;
    for it in &items[imin + 1..imax] {
        for k in 0..3 {
            bmin[k] = bmin[k].min(it.bmin[k]);
            bmax[k] = bmax[k].max(it.bmax[k]);
        }
    }

    // Split along the longest axis.
    let ext = [
        bmax[0] - bmin[0],
        bmax[1] - bmin[1],
        bmax[2] - bmin[2],
    ];
    let axis = if ext[1] > ext[0] && ext[1] > ext[2] {
        1
    } else if ext[2] > ext[0] {
        2
    } else {
        0
    };
    items[imin..imax].sort_by_key(|it| it.bmin[axis]);

    nodes.push(WireBvNode {
        bmin: bmin.map(U16::new),
        bmax: bmax.map(U16::new),
        i: I32::new(0),
    });

    let isplit = imin + inum / 2;
    subdivide(items, imin, isplit, nodes);
    subdivide(items, isplit, imax, nodes);

    let iescape = (nodes.len() - icur) as i32;
    nodes[icur].i = I32::new(-iescape);
}

fn build_bv_tree(input: &TileDataInput, quant_factor: f32) -> Vec<WireBvNode> {
    let mut items: Vec<BvItem> = input
        .polys
        .iter()
        .enumerate()
        .map(|(i, poly)| {
            let mut pmin = input.verts[poly.verts[0] as usize];
            let mut pmax = pmin;
            for &v in &poly.verts[1..] {
                let v = input.verts[v as usize];
                pmin = pmin.min(v);
                pmax = pmax.max(v);
            }
            let q = |v: Vec3| {
                [
                    ((v.x - input.bmin.x).max(0.0) * quant_factor) as u16,
                    ((v.y - input.bmin.y).max(0.0) * quant_factor) as u16,
                    ((v.z - input.bmin.z).max(0.0) * quant_factor) as u16,
                ]
            };
            BvItem {
                bmin: q(pmin),
                bmax: q(pmax),
                i: i as i32,
            }
        })
        .collect();

    let mut nodes = Vec::with_capacity(input.polys.len() * 2);
    if !items.is_empty() {
        let len = items.len();
        subdivide(&mut items, 0, len, &mut nodes);
    }
    nodes
}

/// Serializes the input into a tile blob.
pub fn build_tile_data(input: &TileDataInput) -> Result<Vec<u8>, TileError> {
    for poly in &input.polys {
        let nv = poly.verts.len();
        if nv < 3 || nv > VERTICES_PER_POLYGON || poly.neis.len() != nv {
            return Err(TileError::InvalidInput);
        }
        if poly.verts.iter().any(|&v| v as usize >= input.verts.len()) {
            return Err(TileError::InvalidInput);
        }
    }
    if let Some(detail) = &input.detail {
        if detail.len() != input.polys.len() {
            return Err(TileError::InvalidInput);
        }
    }

    // Only connections whose entry point is inside the tile are stored; the
    // exit side is recorded so cross-tile linking knows where to look.
    let stored_cons: Vec<(&OffMeshConnectionInput, u8)> = input
        .off_mesh_connections
        .iter()
        .filter(|con| classify_off_mesh_point(con.start, input.bmin, input.bmax) == 0xff)
        .map(|con| (con, classify_off_mesh_point(con.end, input.bmin, input.bmax)))
        .collect();

    let ground_poly_count = input.polys.len();
    let tot_poly_count = ground_poly_count + stored_cons.len();
    let tot_vert_count = input.verts.len() + stored_cons.len() * 2;

    let mut edge_count = 0usize;
    let mut portal_count = 0usize;
    for poly in &input.polys {
        edge_count += poly.verts.len();
        portal_count += poly.neis.iter().filter(|&&n| (n & EXT_LINK) != 0).count();
    }
    let max_link_count = edge_count + portal_count * 2 + stored_cons.len() * 4;

    // Vertices: authored mesh first, then one pair per stored connection.
    let mut wire_verts: Vec<F32<LE>> = Vec::with_capacity(tot_vert_count * 3);
    let push_vert = |v: Vec3, out: &mut Vec<F32<LE>>| {
        out.push(F32::new(v.x));
        out.push(F32::new(v.y));
        out.push(F32::new(v.z));
    };
    for &v in &input.verts {
        push_vert(v, &mut wire_verts);
    }
    for (con, _) in &stored_cons {
        push_vert(con.start, &mut wire_verts);
        push_vert(con.end, &mut wire_verts);
    }

    // Polygons: ground polygons, then the off-mesh stand-ins.
    let mut wire_polys: Vec<WirePoly> = Vec::with_capacity(tot_poly_count);
    for poly in &input.polys {
        let mut verts = [U16::new(0); VERTICES_PER_POLYGON];
        let mut neis = [U16::new(0); VERTICES_PER_POLYGON];
        for (i, (&v, &n)) in poly.verts.iter().zip(&poly.neis).enumerate() {
            verts[i] = U16::new(v);
            neis[i] = U16::new(n);
        }
        wire_polys.push(WirePoly {
            first_link: U32::new(u32::MAX),
            verts,
            neis,
            flags: U16::new(poly.flags),
            vert_count: poly.verts.len() as u8,
            area_and_type: Poly::pack_area_and_type(poly.area, PolyType::Ground),
        });
    }
    for (i, (con, _)) in stored_cons.iter().enumerate() {
        let base = (input.verts.len() + i * 2) as u16;
        let mut verts = [U16::new(0); VERTICES_PER_POLYGON];
        verts[0] = U16::new(base);
        verts[1] = U16::new(base + 1);
        wire_polys.push(WirePoly {
            first_link: U32::new(u32::MAX),
            verts,
            neis: [U16::new(0); VERTICES_PER_POLYGON],
            flags: U16::new(con.flags),
            vert_count: 2,
            area_and_type: Poly::pack_area_and_type(con.area, PolyType::OffMeshConnection),
        });
    }

    // Detail meshes: either the supplied refinement or a flat fan per
    // polygon. Off-mesh stand-ins carry empty entries to keep the array
    // parallel to the polygons.
    let mut wire_details: Vec<WirePolyDetail> = Vec::with_capacity(tot_poly_count);
    let mut wire_detail_verts: Vec<F32<LE>> = Vec::new();
    let mut wire_detail_tris: Vec<u8> = Vec::new();
    match &input.detail {
        Some(detail) => {
            let mut vert_base = 0u16;
            let mut tri_base = 0u16;
            for d in detail {
                wire_details.push(WirePolyDetail {
                    vert_base: U16::new(vert_base),
                    vert_count: U16::new(d.verts.len() as u16),
                    tri_base: U16::new(tri_base),
                    tri_count: U16::new(d.tris.len() as u16),
                });
                for &v in &d.verts {
                    push_vert(v, &mut wire_detail_verts);
                }
                for t in &d.tris {
                    wire_detail_tris.extend_from_slice(t);
                }
                vert_base += d.verts.len() as u16;
                tri_base += d.tris.len() as u16;
            }
        }
        None => {
            let mut tri_base = 0u16;
            for poly in &input.polys {
                let nv = poly.verts.len();
                wire_details.push(WirePolyDetail {
                    vert_base: U16::new(0),
                    vert_count: U16::new(0),
                    tri_base: U16::new(tri_base),
                    tri_count: U16::new((nv - 2) as u16),
                });
                for j in 2..nv {
                    // Fan triangle (0, j-1, j); mark which edges lie on the
                    // polygon boundary.
                    let mut flags = 1u8 << 2;
                    if j == 2 {
                        flags |= 1;
                    }
                    if j == nv - 1 {
                        flags |= 1 << 4;
                    }
                    wire_detail_tris.extend_from_slice(&[0, (j - 1) as u8, j as u8, flags]);
                }
                tri_base += (nv - 2) as u16;
            }
        }
    }
    for _ in &stored_cons {
        wire_details.push(WirePolyDetail {
            vert_base: U16::new(0),
            vert_count: U16::new(0),
            tri_base: U16::new(0),
            tri_count: U16::new(0),
        });
    }

    let quant_factor = 1.0 / input.cell_size;
    let wire_bv = if input.build_bv_tree {
        build_bv_tree(input, quant_factor)
    } else {
        Vec::new()
    };

    let wire_cons: Vec<WireOffMeshConnection> = stored_cons
        .iter()
        .enumerate()
        .map(|(i, (con, end_side))| WireOffMeshConnection {
            pos: [
                F32::new(con.start.x),
                F32::new(con.start.y),
                F32::new(con.start.z),
                F32::new(con.end.x),
                F32::new(con.end.y),
                F32::new(con.end.z),
            ],
            rad: F32::new(con.radius),
            poly: U16::new((ground_poly_count + i) as u16),
            flags: if con.bidirectional {
                OFFMESH_CON_BIDIR
            } else {
                0
            },
            side: *end_side,
        })
        .collect();

    let wire_links = vec![
        WireLink {
            target: U32::new(0),
            next: U32::new(0),
            edge: 0,
            side: 0,
            bmin: 0,
            bmax: 0,
        };
        max_link_count
    ];

    let header = WireTileHeader {
        magic: I32::new(NAVMESH_MAGIC),
        version: I32::new(NAVMESH_VERSION),
        x: I32::new(input.tile_x),
        y: I32::new(input.tile_y),
        user_id: U32::new(input.user_id),
        poly_count: U32::new(tot_poly_count as u32),
        vert_count: U32::new(tot_vert_count as u32),
        max_link_count: U32::new(max_link_count as u32),
        detail_mesh_count: U32::new(wire_details.len() as u32),
        detail_vert_count: U32::new((wire_detail_verts.len() / 3) as u32),
        detail_tri_count: U32::new((wire_detail_tris.len() / 4) as u32),
        bv_node_count: U32::new(wire_bv.len() as u32),
        off_mesh_con_count: U32::new(wire_cons.len() as u32),
        off_mesh_base: U32::new(ground_poly_count as u32),
        walkable_height: F32::new(input.walkable_height),
        walkable_radius: F32::new(input.walkable_radius),
        walkable_climb: F32::new(input.walkable_climb),
        bmin: [
            F32::new(input.bmin.x),
            F32::new(input.bmin.y),
            F32::new(input.bmin.z),
        ],
        bmax: [
            F32::new(input.bmax.x),
            F32::new(input.bmax.y),
            F32::new(input.bmax.z),
        ],
        bv_quant_factor: F32::new(quant_factor),
    };

    let mut out = Vec::new();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(wire_verts.as_slice().as_bytes());
    out.extend_from_slice(wire_polys.as_slice().as_bytes());
    out.extend_from_slice(wire_links.as_slice().as_bytes());
    out.extend_from_slice(wire_details.as_slice().as_bytes());
    out.extend_from_slice(wire_detail_verts.as_slice().as_bytes());
    out.extend_from_slice(wire_detail_tris.as_slice().as_bytes());
    out.extend_from_slice(wire_bv.as_slice().as_bytes());
    out.extend_from_slice(wire_cons.as_slice().as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::MeshTile;

    fn square_tile_input() -> TileDataInput {
        // Two triangles covering a flat 2x2 square.
        TileDataInput::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
                Vec3::new(2.0, 0.0, 2.0),
                Vec3::new(2.0, 0.0, 0.0),
            ],
            vec![
                PolyInput {
                    verts: vec![0, 1, 2],
                    neis: vec![0, 0, 2],
                    flags: 1,
                    area: 0,
                },
                PolyInput {
                    verts: vec![0, 2, 3],
                    neis: vec![1, 0, 0],
                    flags: 1,
                    area: 0,
                },
            ],
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(2.0, 1.0, 2.0),
        )
    }

    #[test]
    fn blob_round_trips_through_decode() {
        let data = build_tile_data(&square_tile_input()).unwrap();
        let tile = MeshTile::decode(data).unwrap();

        assert_eq!(tile.polys.len(), 2);
        assert_eq!(tile.verts.len(), 4);
        assert_eq!(tile.detail_meshes.len(), 2);
        assert_eq!(tile.detail_tris.len(), 2);
        assert!(!tile.bv_tree.is_empty());
        assert_eq!(tile.polys[0].neis[2], 2);
        assert_eq!(tile.polys[0].vert_count, 3);
    }

    #[test]
    fn rejects_degenerate_polys() {
        let mut input = square_tile_input();
        input.polys[0].verts = vec![0, 1];
        input.polys[0].neis = vec![0, 0];
        assert_eq!(build_tile_data(&input), Err(TileError::InvalidInput));

        let mut input = square_tile_input();
        input.polys[0].verts = vec![0, 1, 9];
        assert_eq!(build_tile_data(&input), Err(TileError::InvalidInput));
    }

    #[test]
    fn off_mesh_connection_becomes_trailing_poly() {
        let mut input = square_tile_input();
        input.off_mesh_connections.push(OffMeshConnectionInput {
            start: Vec3::new(0.5, 0.0, 0.5),
            end: Vec3::new(1.5, 0.0, 1.5),
            radius: 0.5,
            bidirectional: true,
            flags: 1,
            area: 0,
        });
        // A connection starting outside the tile is dropped.
        input.off_mesh_connections.push(OffMeshConnectionInput {
            start: Vec3::new(9.0, 0.0, 9.0),
            end: Vec3::new(1.0, 0.0, 1.0),
            radius: 0.5,
            bidirectional: false,
            flags: 1,
            area: 0,
        });

        let data = build_tile_data(&input).unwrap();
        let tile = MeshTile::decode(data).unwrap();

        assert_eq!(tile.off_mesh_cons.len(), 1);
        assert_eq!(tile.polys.len(), 3);
        assert_eq!(tile.header.off_mesh_base, 2);
        assert_eq!(tile.polys[2].poly_type(), PolyType::OffMeshConnection);
        assert_eq!(tile.off_mesh_cons[0].poly, 2);
        assert_eq!(tile.off_mesh_cons[0].side, 0xff);
    }
}
