use bevy::prelude::Vec3;

use tiled_navmesh::{
    builder::{build_tile_data, OffMeshConnectionInput, PolyInput, TileDataInput},
    query::{
        NavMeshQuery, SlicedPathStatus, STRAIGHTPATH_END, STRAIGHTPATH_OFFMESH_CONNECTION,
        STRAIGHTPATH_START,
    },
    refs::PolyRef,
    tiles::{TileError, TiledNavMesh, EXT_LINK, NULL_LINK},
    NavMeshParams, QueryFilter,
};

const GROUND: u16 = 1;
const WATER: u16 = 2;

/// One 6x2 tile split into three 2x2 squares along X: P0 - P1 - P2.
///
/// Vertices are ordered so the polygon interior lies to the left of each
/// directed edge on the XZ-plane.
fn corridor_input() -> TileDataInput {
    TileDataInput::new(
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(4.0, 0.0, 2.0),
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(6.0, 0.0, 2.0),
            Vec3::new(6.0, 0.0, 0.0),
        ],
        vec![
            PolyInput {
                verts: vec![0, 1, 2, 3],
                neis: vec![0, 0, 2, 0],
                flags: GROUND,
                area: 0,
            },
            PolyInput {
                verts: vec![3, 2, 4, 5],
                neis: vec![1, 0, 3, 0],
                flags: GROUND,
                area: 0,
            },
            PolyInput {
                verts: vec![5, 4, 6, 7],
                neis: vec![2, 0, 0, 0],
                flags: GROUND,
                area: 0,
            },
        ],
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(6.0, 1.0, 2.0),
    )
}

fn corridor_mesh() -> (TiledNavMesh, [PolyRef; 3]) {
    let params = NavMeshParams::new(Vec3::ZERO, 6.0, 2.0)
        .with_max_tiles(4)
        .with_max_polys_per_tile(16);
    let mut mesh = TiledNavMesh::new(params).unwrap();
    let tile_ref = mesh
        .add_tile(build_tile_data(&corridor_input()).unwrap(), None)
        .unwrap();
    let base = tile_ref.0;
    (
        mesh,
        [PolyRef(base), PolyRef(base | 1), PolyRef(base | 2)],
    )
}

/// A single 2x2 square polygon whose `ext_side` edge carries a boundary
/// portal code. `x0` is the tile's west world coordinate.
fn square_tile_input(tile_x: i32, x0: f32, ext_sides: &[(usize, u8)]) -> TileDataInput {
    let mut neis = vec![0u16; 4];
    for &(edge, side) in ext_sides {
        neis[edge] = EXT_LINK | side as u16;
    }
    let mut input = TileDataInput::new(
        vec![
            Vec3::new(x0, 0.0, 0.0),
            Vec3::new(x0, 0.0, 2.0),
            Vec3::new(x0 + 2.0, 0.0, 2.0),
            Vec3::new(x0 + 2.0, 0.0, 0.0),
        ],
        vec![PolyInput {
            verts: vec![0, 1, 2, 3],
            neis,
            flags: GROUND,
            area: 0,
        }],
        Vec3::new(x0, -1.0, 0.0),
        Vec3::new(x0 + 2.0, 1.0, 2.0),
    );
    input.tile_x = tile_x;
    input
}

fn two_tile_mesh(add_left_first: bool) -> (TiledNavMesh, PolyRef, PolyRef) {
    let params = NavMeshParams::new(Vec3::ZERO, 2.0, 2.0)
        .with_max_tiles(4)
        .with_max_polys_per_tile(16);
    let mut mesh = TiledNavMesh::new(params).unwrap();

    // The left tile's east edge faces side 0, the right tile's west edge
    // side 4.
    let left = build_tile_data(&square_tile_input(0, 0.0, &[(2, 0)])).unwrap();
    let right = build_tile_data(&square_tile_input(1, 2.0, &[(0, 4)])).unwrap();

    let (left_ref, right_ref) = if add_left_first {
        (
            mesh.add_tile(left, None).unwrap(),
            mesh.add_tile(right, None).unwrap(),
        )
    } else {
        let r = mesh.add_tile(right, None).unwrap();
        (mesh.add_tile(left, None).unwrap(), r)
    };

    (mesh, PolyRef(left_ref.0), PolyRef(right_ref.0))
}

fn links_of(mesh: &TiledNavMesh, r: PolyRef) -> Vec<(PolyRef, u8, u8, u8)> {
    let (tile, poly) = mesh.tile_and_poly_by_ref(r).unwrap();
    let mut out = Vec::new();
    let mut li = poly.first_link;
    while li != NULL_LINK {
        let link = &tile.links[li as usize];
        out.push((link.target, link.side, link.bmin, link.bmax));
        li = link.next;
    }
    out
}

#[test]
fn trivial_path_and_straight_path() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let start = Vec3::new(1.0, 0.0, 1.0);
    let end = Vec3::new(5.0, 0.0, 1.0);

    let found = query
        .find_nearest_poly(start, Vec3::new(0.5, 1.0, 0.5), &filter)
        .unwrap();
    assert_eq!(found.0, p0);

    let path = query.find_path(p0, p2, start, end, &filter, 16).unwrap();
    assert_eq!(path.polys, vec![p0, p1, p2]);
    assert!(!path.partial);

    // A straight corridor funnels to just the two endpoints.
    let straight = query
        .find_straight_path(start, end, &path.polys, 16, 0)
        .unwrap();
    assert_eq!(straight.points.len(), 2);
    assert_eq!(straight.points[0].flags, STRAIGHTPATH_START);
    assert!(straight.points[0].pos.abs_diff_eq(start, 1e-4));
    assert_eq!(straight.points[1].flags, STRAIGHTPATH_END);
    assert!(straight.points[1].pos.abs_diff_eq(end, 1e-4));
}

#[test]
fn path_to_self_is_identity() {
    let (mesh, [p0, _, _]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let pos = Vec3::new(1.0, 0.0, 1.0);
    let path = query.find_path(p0, p0, pos, pos, &filter, 16).unwrap();
    assert_eq!(path.polys, vec![p0]);
    assert!(!path.partial);
}

#[test]
fn filtered_polygon_splits_the_corridor() {
    let (mut mesh, [p0, p1, p2]) = corridor_mesh();
    mesh.set_poly_flags(p1, WATER).unwrap();

    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default().with_exclude_flags(WATER);

    let path = query
        .find_path(
            p0,
            p2,
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(5.0, 0.0, 1.0),
            &filter,
            16,
        )
        .unwrap();
    assert!(path.partial);
    assert_eq!(path.polys, vec![p0]);
}

#[test]
fn portal_linking_is_symmetric_in_either_add_order() {
    for add_left_first in [true, false] {
        let (mesh, left, right) = two_tile_mesh(add_left_first);

        let left_links = links_of(&mesh, left);
        let right_links = links_of(&mesh, right);

        // One full-width portal each way.
        assert_eq!(left_links, vec![(right, 0, 0, 255)]);
        assert_eq!(right_links, vec![(left, 4, 0, 255)]);
    }
}

#[test]
fn removing_a_tile_unlinks_its_neighbours() {
    let (mut mesh, left, right) = two_tile_mesh(true);

    let right_tile_ref = mesh.tile_ref_at(1, 0).unwrap();
    let data = mesh.remove_tile(right_tile_ref).unwrap();
    assert!(!data.is_empty());

    assert!(!mesh.is_valid_poly_ref(right));
    assert_eq!(links_of(&mesh, left), vec![]);

    // Re-adding restores the connection.
    mesh.add_tile(data, None).unwrap();
    let left_links = links_of(&mesh, left);
    assert_eq!(left_links.len(), 1);
    assert_eq!(left_links[0].1, 0);
}

#[test]
fn stale_refs_do_not_resolve_after_slot_reuse() {
    let (mut mesh, left, _) = two_tile_mesh(true);

    let tile_ref = mesh.tile_ref_at(0, 0).unwrap();
    let data = mesh.remove_tile(tile_ref).unwrap();
    assert!(!mesh.is_valid_poly_ref(left));

    // The slot comes back with a fresh salt, so the old refs stay dead.
    let new_tile_ref = mesh.add_tile(data, None).unwrap();
    assert_ne!(new_tile_ref, tile_ref);
    assert!(!mesh.is_valid_poly_ref(left));
    assert!(mesh.tile_by_ref(tile_ref).is_none());

    // Re-adding through the old ref revives the old handles instead.
    let data = mesh.remove_tile(new_tile_ref).unwrap();
    let revived = mesh.add_tile(data, Some(tile_ref)).unwrap();
    assert_eq!(revived, tile_ref);
    assert!(mesh.is_valid_poly_ref(left));
}

#[test]
fn reviving_an_occupied_slot_fails() {
    let (mut mesh, _, _) = two_tile_mesh(true);
    let occupied = mesh.tile_ref_at(1, 0).unwrap();

    let data = build_tile_data(&square_tile_input(2, 4.0, &[])).unwrap();
    assert_eq!(
        mesh.add_tile(data, Some(occupied)),
        Err(TileError::SlotNotFree)
    );
}

#[test]
fn raycast_hits_walls_and_passes_portals() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    // Cast against the north wall of P0.
    let hit = query
        .raycast(
            p0,
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 3.0),
            &filter,
            16,
        )
        .unwrap();
    assert!((hit.t - 0.5).abs() < 1e-4);
    assert!(hit.hit_normal.abs_diff_eq(Vec3::new(0.0, 0.0, -1.0), 1e-4));
    assert_eq!(hit.path, vec![p0]);

    // A ray fully inside a polygon never hits.
    let hit = query
        .raycast(
            p0,
            Vec3::new(0.5, 0.0, 1.0),
            Vec3::new(1.5, 0.0, 1.0),
            &filter,
            16,
        )
        .unwrap();
    assert_eq!(hit.t, f32::INFINITY);
    assert_eq!(hit.path, vec![p0]);

    // Crossing the whole corridor walks every polygon to the east wall.
    let hit = query
        .raycast(
            p0,
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(7.0, 0.0, 1.0),
            &filter,
            16,
        )
        .unwrap();
    assert!((hit.t - 5.0 / 6.0).abs() < 1e-4);
    assert_eq!(hit.path, vec![p0, p1, p2]);
}

#[test]
fn sliced_path_matches_find_path() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let start = Vec3::new(1.0, 0.0, 1.0);
    let end = Vec3::new(5.0, 0.0, 1.0);
    let reference = query.find_path(p0, p2, start, end, &filter, 16).unwrap();

    assert_eq!(
        query.init_sliced_find_path(p0, p2, start, end, &filter),
        SlicedPathStatus::InProgress
    );
    // Drive the search one expansion at a time.
    loop {
        let (status, iters) = query.update_sliced_find_path(1);
        match status {
            SlicedPathStatus::InProgress => assert_eq!(iters, 1),
            SlicedPathStatus::Ready => break,
            SlicedPathStatus::Failed => panic!("sliced query failed"),
        }
    }
    let sliced = query.finalize_sliced_find_path(16).unwrap();
    assert_eq!(sliced, reference);
    let _ = p1;
}

#[test]
fn sliced_path_fails_when_a_tile_disappears() {
    let (mut mesh, left, right) = two_tile_mesh(true);

    let right_tile = mesh.tile_ref_at(1, 0).unwrap();
    mesh.remove_tile(right_tile).unwrap();

    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();
    query.init_sliced_find_path(
        left,
        right,
        Vec3::new(1.0, 0.0, 1.0),
        Vec3::new(3.0, 0.0, 1.0),
        &filter,
    );
    let (status, _) = query.update_sliced_find_path(16);
    assert_eq!(status, SlicedPathStatus::Failed);
    assert!(query.finalize_sliced_find_path(16).is_err());
}

#[test]
fn finalize_partial_reuses_the_existing_path() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    query.init_sliced_find_path(
        p0,
        p2,
        Vec3::new(1.0, 0.0, 1.0),
        Vec3::new(5.0, 0.0, 1.0),
        &filter,
    );
    while query.update_sliced_find_path(4).0 == SlicedPathStatus::InProgress {}

    let path = query
        .finalize_sliced_find_path_partial(&[p0, p1], 16)
        .unwrap();
    assert_eq!(path.polys, vec![p0, p1]);
}

#[test]
fn move_along_surface_crosses_and_slides() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let start = Vec3::new(1.0, 0.0, 1.0);

    // No movement visits only the start polygon.
    let still = query
        .move_along_surface(p0, start, start, &filter, 16)
        .unwrap();
    assert_eq!(still.result_pos, start);
    assert_eq!(still.visited, vec![p0]);

    // A clear move across the corridor reaches the target.
    let end = Vec3::new(5.0, 0.0, 1.0);
    let moved = query
        .move_along_surface(p0, start, end, &filter, 16)
        .unwrap();
    assert!(moved.result_pos.abs_diff_eq(end, 1e-4));
    assert_eq!(moved.visited, vec![p0, p1, p2]);

    // Walking into a wall slides along it.
    let blocked = query
        .move_along_surface(p0, start, Vec3::new(1.0, 0.0, 4.0), &filter, 16)
        .unwrap();
    assert!(blocked.result_pos.z <= 2.0 + 1e-3);
    assert!((blocked.result_pos.x - 1.0).abs() < 1e-3);
    assert_eq!(blocked.visited, vec![p0]);
}

#[test]
fn distance_to_wall_in_corridor() {
    let (mesh, [_, p1, _]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    // The centre of the corridor is one unit from the long walls.
    let hit = query
        .find_distance_to_wall(p1, Vec3::new(3.0, 0.0, 1.0), 10.0, &filter)
        .unwrap();
    assert!((hit.distance - 1.0).abs() < 1e-3);
    assert!(hit.hit_normal.length() > 0.9);

    // Nothing within a small radius.
    let hit = query
        .find_distance_to_wall(p1, Vec3::new(3.0, 0.0, 1.0), 0.5, &filter)
        .unwrap();
    assert!((hit.distance - 0.5).abs() < 1e-3);
}

#[test]
fn polys_around_circle_respects_the_radius() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let center = Vec3::new(3.0, 0.0, 1.0);

    // Portals at x=2 and x=4 are one unit away.
    let result = query
        .find_polys_around_circle(p1, center, 1.2, &filter, 16)
        .unwrap();
    assert_eq!(result.refs.len(), 3);
    assert!(result.refs.contains(&p0));
    assert!(result.refs.contains(&p2));
    assert_eq!(result.parents[0], PolyRef::NULL);
    assert_eq!(result.costs[0], 0.0);

    let result = query
        .find_polys_around_circle(p1, center, 0.5, &filter, 16)
        .unwrap();
    assert_eq!(result.refs, vec![p1]);
}

#[test]
fn polys_around_shape_crosses_one_portal() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    // A box straddling the P0/P1 portal at x=2.
    let shape = [
        Vec3::new(1.5, 0.0, 0.5),
        Vec3::new(1.5, 0.0, 1.5),
        Vec3::new(2.5, 0.0, 1.5),
        Vec3::new(2.5, 0.0, 0.5),
    ];
    let result = query
        .find_polys_around_shape(p0, &shape, &filter, 16)
        .unwrap();
    assert!(result.refs.contains(&p0));
    assert!(result.refs.contains(&p1));
    assert!(!result.refs.contains(&p2));
}

#[test]
fn local_neighbourhood_collects_the_corridor() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let mut query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let result = query
        .find_local_neighbourhood(p1, Vec3::new(3.0, 0.0, 1.0), 10.0, &filter, 16)
        .unwrap();
    assert_eq!(result.refs.len(), 3);
    assert!(result.refs.contains(&p0));
    assert!(result.refs.contains(&p2));
}

#[test]
fn wall_segments_with_and_without_portals() {
    let (mesh, [p0, p1, p2]) = corridor_mesh();
    let query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    // P1 has two solid walls and two internal portals.
    let walls = query.get_poly_wall_segments(p1, &filter, false).unwrap();
    assert_eq!(walls.len(), 2);
    assert!(walls.iter().all(|s| s.poly.is_null()));

    let all = query.get_poly_wall_segments(p1, &filter, true).unwrap();
    assert_eq!(all.len(), 4);
    let portals: Vec<PolyRef> = all
        .iter()
        .filter(|s| !s.poly.is_null())
        .map(|s| s.poly)
        .collect();
    assert!(portals.contains(&p0));
    assert!(portals.contains(&p2));
}

#[test]
fn boundary_wall_segments_follow_the_filter() {
    let (mut mesh, left, right) = two_tile_mesh(true);

    {
        let query = NavMeshQuery::new(&mesh, 256);
        let filter = QueryFilter::default();
        let segs = query.get_poly_wall_segments(left, &filter, true).unwrap();
        // Three walls plus the full-width portal to the right tile.
        assert_eq!(segs.iter().filter(|s| s.poly.is_null()).count(), 3);
        assert_eq!(segs.iter().filter(|s| s.poly == right).count(), 1);
    }

    // Excluding the neighbour turns the shared edge into a wall.
    mesh.set_poly_flags(right, WATER).unwrap();
    let query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default().with_exclude_flags(WATER);
    let segs = query.get_poly_wall_segments(left, &filter, true).unwrap();
    assert_eq!(segs.len(), 4);
    assert!(segs.iter().all(|s| s.poly.is_null()));
}

#[test]
fn tile_state_snapshot_round_trips() {
    let (mut mesh, [_, p1, _]) = corridor_mesh();
    let tile_ref = mesh.tile_ref_at(0, 0).unwrap();

    let snapshot = mesh.store_tile_state(tile_ref).unwrap();
    assert_eq!(snapshot.len(), mesh.tile_state_size(tile_ref).unwrap());

    mesh.set_poly_flags(p1, WATER).unwrap();
    mesh.set_poly_area(p1, 7).unwrap();
    assert_eq!(mesh.poly_flags(p1), Some(WATER));
    assert_eq!(mesh.poly_area(p1), Some(7));

    mesh.restore_tile_state(tile_ref, &snapshot).unwrap();
    assert_eq!(mesh.poly_flags(p1), Some(GROUND));
    assert_eq!(mesh.poly_area(p1), Some(0));
}

#[test]
fn stale_tile_state_snapshot_is_rejected() {
    let (mut mesh, _) = corridor_mesh();
    let tile_ref = mesh.tile_ref_at(0, 0).unwrap();
    let snapshot = mesh.store_tile_state(tile_ref).unwrap();

    // After a remove + re-add cycle the ref has a new salt, so the old
    // snapshot no longer applies.
    let data = mesh.remove_tile(tile_ref).unwrap();
    let new_ref = mesh.add_tile(data, None).unwrap();
    assert_eq!(
        mesh.restore_tile_state(new_ref, &snapshot),
        Err(TileError::StateRefMismatch)
    );
}

#[test]
fn nearest_poly_with_zero_extents_needs_containment() {
    let (mesh, [p0, _, _]) = corridor_mesh();
    let query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();

    let inside = query.find_nearest_poly(Vec3::new(1.0, 0.0, 1.0), Vec3::ZERO, &filter);
    assert_eq!(inside.map(|(r, _)| r), Some(p0));

    let outside = query.find_nearest_poly(Vec3::new(-5.0, 0.0, 1.0), Vec3::ZERO, &filter);
    assert!(outside.is_none());
}

#[test]
fn point_queries_on_the_surface() {
    let (mesh, [p0, _, _]) = corridor_mesh();
    let query = NavMeshQuery::new(&mesh, 256);

    let h = query.poly_height(p0, Vec3::new(1.0, 5.0, 1.0)).unwrap();
    assert!(h.abs() < 1e-5);

    // Inside in 2D the point comes back untouched, height included.
    let inside = query
        .closest_point_on_poly_boundary(p0, Vec3::new(1.0, 3.0, 1.0))
        .unwrap();
    assert!(inside.abs_diff_eq(Vec3::new(1.0, 3.0, 1.0), 1e-4));

    // Outside it snaps onto the nearest boundary edge.
    let snapped = query
        .closest_point_on_poly_boundary(p0, Vec3::new(-1.0, 3.0, 1.0))
        .unwrap();
    assert!(snapped.abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), 1e-4));

    // Closest point on the surface drops onto the detail mesh.
    let closest = query
        .closest_point_on_poly(p0, Vec3::new(1.0, 3.0, 1.0))
        .unwrap();
    assert!(closest.abs_diff_eq(Vec3::new(1.0, 0.0, 1.0), 1e-4));
}

#[test]
fn off_mesh_connection_is_linked_and_funnelled() {
    let mut input = corridor_input();
    input.off_mesh_connections.push(OffMeshConnectionInput {
        start: Vec3::new(1.5, 0.0, 1.5),
        end: Vec3::new(5.0, 0.0, 1.0),
        radius: 0.5,
        bidirectional: true,
        flags: GROUND,
        area: 0,
    });

    let params = NavMeshParams::new(Vec3::ZERO, 6.0, 2.0)
        .with_max_tiles(4)
        .with_max_polys_per_tile(16);
    let mut mesh = TiledNavMesh::new(params).unwrap();
    let tile_ref = mesh
        .add_tile(build_tile_data(&input).unwrap(), None)
        .unwrap();
    let p0 = PolyRef(tile_ref.0);
    let p2 = PolyRef(tile_ref.0 | 2);
    let om = PolyRef(tile_ref.0 | 3);

    // Both endpoints linked, both directions.
    let om_links = links_of(&mesh, om);
    assert_eq!(om_links.len(), 2);
    assert!(om_links.iter().any(|l| l.0 == p0));
    assert!(om_links.iter().any(|l| l.0 == p2));
    assert!(links_of(&mesh, p0).iter().any(|l| l.0 == om));
    assert!(links_of(&mesh, p2).iter().any(|l| l.0 == om));

    let query = NavMeshQuery::new(&mesh, 256);
    let (entry, exit) = query
        .off_mesh_connection_poly_end_points(p0, om)
        .unwrap();
    assert!(entry.abs_diff_eq(Vec3::new(1.5, 0.0, 1.5), 1e-4));
    assert!(exit.abs_diff_eq(Vec3::new(5.0, 0.0, 1.0), 1e-4));

    // Travelling the connection shows up as an off-mesh vertex in the
    // straight path.
    let straight = query
        .find_straight_path(
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(5.0, 0.0, 1.0),
            &[p0, om, p2],
            16,
            0,
        )
        .unwrap();
    assert!(straight
        .points
        .iter()
        .any(|p| p.flags == STRAIGHTPATH_OFFMESH_CONNECTION && p.poly == om));
    assert_eq!(straight.points.last().unwrap().flags, STRAIGHTPATH_END);
}

#[test]
fn query_polygons_works_without_a_bv_tree() {
    let mut input = corridor_input();
    input.build_bv_tree = false;

    let params = NavMeshParams::new(Vec3::ZERO, 6.0, 2.0)
        .with_max_tiles(4)
        .with_max_polys_per_tile(16);
    let mut mesh = TiledNavMesh::new(params).unwrap();
    mesh.add_tile(build_tile_data(&input).unwrap(), None)
        .unwrap();

    let query = NavMeshQuery::new(&mesh, 256);
    let filter = QueryFilter::default();
    let polys = query.query_polygons(Vec3::new(3.0, 0.0, 1.0), Vec3::new(3.0, 1.0, 1.0), &filter, 16);
    assert_eq!(polys.len(), 3);
}

#[test]
fn area_costs_steer_the_search() {
    // A 4x4 square split into four 2x2 quads; the two northern quads are
    // cheap, the southern route is made expensive.
    //
    //   P1 P3
    //   P0 P2
    let input = TileDataInput::new(
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(4.0, 0.0, 2.0),
            Vec3::new(4.0, 0.0, 4.0),
        ],
        vec![
            // P0: south-west quad.
            PolyInput {
                verts: vec![0, 1, 4, 3],
                neis: vec![0, 2, 3, 0],
                flags: GROUND,
                area: 1,
            },
            // P1: north-west quad.
            PolyInput {
                verts: vec![1, 2, 5, 4],
                neis: vec![0, 0, 4, 1],
                flags: GROUND,
                area: 0,
            },
            // P2: south-east quad.
            PolyInput {
                verts: vec![3, 4, 7, 6],
                neis: vec![1, 4, 0, 0],
                flags: GROUND,
                area: 1,
            },
            // P3: north-east quad.
            PolyInput {
                verts: vec![4, 5, 8, 7],
                neis: vec![2, 0, 0, 3],
                flags: GROUND,
                area: 0,
            },
        ],
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(4.0, 1.0, 4.0),
    );

    let params = NavMeshParams::new(Vec3::ZERO, 4.0, 4.0)
        .with_max_tiles(2)
        .with_max_polys_per_tile(16);
    let mut mesh = TiledNavMesh::new(params).unwrap();
    let tile_ref = mesh
        .add_tile(build_tile_data(&input).unwrap(), None)
        .unwrap();
    let p0 = PolyRef(tile_ref.0);
    let p1 = PolyRef(tile_ref.0 | 1);
    let p3 = PolyRef(tile_ref.0 | 3);

    let mut query = NavMeshQuery::new(&mesh, 256);
    let mut filter = QueryFilter::default();
    filter.set_area_cost(1, 20.0);

    let start = Vec3::new(0.5, 0.0, 0.5);
    let end = Vec3::new(3.5, 0.0, 3.5);
    let path = query.find_path(p0, p3, start, end, &filter, 16).unwrap();
    // The cheap route detours through the northern quads.
    assert_eq!(path.polys, vec![p0, p1, p3]);
}
