//! Polygon and tile handles.
//!
//! A [PolyRef] packs `(salt, tile index, polygon index)` into 32 bits. The
//! field widths are not fixed: they are derived from the navmesh capacity at
//! init, so refs are only meaningful against the navmesh that produced them.
//! The tile index is stored offset by one, reserving the all-zero ref as the
//! null handle.

use crate::math::{ilog2, next_pow2};

/// Opaque handle to a polygon within a [crate::tiles::TiledNavMesh].
///
/// `PolyRef::NULL` (zero) never resolves. A ref with a stale salt stops
/// resolving once its tile slot has been reused.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolyRef(pub u32);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque handle to a tile: a [PolyRef] with a zero polygon index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRef(pub u32);

impl TileRef {
    pub const NULL: TileRef = TileRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Bitfield layout for encoding and decoding handles.
///
/// Widths are chosen at navmesh init from `max_tiles` and
/// `max_polys_per_tile`; whatever is left of the 32 bits becomes the salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolyRefCodec {
    salt_bits: u32,
    tile_bits: u32,
    poly_bits: u32,
}

impl PolyRefCodec {
    /// Derives field widths from the navmesh capacity. Returns `None` when
    /// fewer than 10 bits would remain for the salt.
    pub fn new(max_tiles: u32, max_polys_per_tile: u32) -> Option<PolyRefCodec> {
        let tile_bits = ilog2(next_pow2(max_tiles)).max(1);
        let poly_bits = ilog2(next_pow2(max_polys_per_tile)).max(1);
        let salt_bits = 32u32.checked_sub(tile_bits + poly_bits)?;
        if salt_bits < 10 {
            return None;
        }
        Some(PolyRefCodec {
            salt_bits,
            tile_bits,
            poly_bits,
        })
    }

    #[inline]
    pub fn encode(&self, salt: u32, tile: u32, poly: u32) -> PolyRef {
        PolyRef((salt << (self.poly_bits + self.tile_bits)) | ((tile + 1) << self.poly_bits) | poly)
    }

    /// Inverse of [encode](Self::encode). A null ref decodes to a tile index
    /// that no lookup accepts.
    #[inline]
    pub fn decode(&self, r: PolyRef) -> (u32, u32, u32) {
        (self.decode_salt(r), self.decode_tile(r), self.decode_poly(r))
    }

    #[inline]
    pub fn decode_salt(&self, r: PolyRef) -> u32 {
        (r.0 >> (self.poly_bits + self.tile_bits)) & ((1 << self.salt_bits) - 1)
    }

    #[inline]
    pub fn decode_tile(&self, r: PolyRef) -> u32 {
        ((r.0 >> self.poly_bits).wrapping_sub(1)) & ((1 << self.tile_bits) - 1)
    }

    #[inline]
    pub fn decode_poly(&self, r: PolyRef) -> u32 {
        r.0 & ((1 << self.poly_bits) - 1)
    }

    #[inline]
    pub fn max_salt(&self) -> u32 {
        (1 << self.salt_bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_narrow_salt() {
        // 16 tile bits + 12 poly bits leaves only 4 bits of salt.
        assert!(PolyRefCodec::new(1 << 16, 1 << 12).is_none());
        assert!(PolyRefCodec::new(64, 1 << 12).is_some());
    }

    #[test]
    fn round_trips_all_fields() {
        let codec = PolyRefCodec::new(32, 1024).unwrap();
        for salt in [0u32, 1, 7, 1000] {
            for tile in [0u32, 1, 13, 31] {
                for poly in [0u32, 1, 500, 1023] {
                    let r = codec.encode(salt & codec.max_salt(), tile, poly);
                    assert_eq!(
                        codec.decode(r),
                        (salt & codec.max_salt(), tile, poly),
                        "ref {r:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn null_ref_never_matches_a_tile() {
        let codec = PolyRefCodec::new(20, 1024).unwrap();
        let (salt, tile, poly) = codec.decode(PolyRef::NULL);
        // The +1 offset wraps the null ref past every valid tile index.
        assert!(tile >= 20);
        assert_eq!(salt, 0);
        assert_eq!(poly, 0);
    }
}
