//! Voxel coordinates, chunk snapshots and block family registrations.

use serde::{Deserialize, Serialize};

pub const CHUNK_POWER_X: i32 = 5;
pub const CHUNK_POWER_Y: i32 = 6;
pub const CHUNK_POWER_Z: i32 = 5;

/// Chunk dimensions in blocks: 32 x 64 x 32.
pub const CHUNK_SIZE: [i32; 3] = [1 << CHUNK_POWER_X, 1 << CHUNK_POWER_Y, 1 << CHUNK_POWER_Z];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn distance_squared(&self, other: &ChunkPos) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        let dz = (self.z - other.z) as i64;
        dx * dx + dy * dy + dz * dz
    }

    /// The chunk containing a continuous world position. Positions are rounded
    /// to the nearest block first, with halves rounding away from zero.
    pub fn containing(position: [f32; 3]) -> Self {
        let block = |v: f32| if v.is_finite() { v.round() as i32 } else { 0 };
        BlockPos::new(block(position[0]), block(position[1]), block(position[2])).chunk()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn chunk(&self) -> ChunkPos {
        ChunkPos::new(
            self.x >> CHUNK_POWER_X,
            self.y >> CHUNK_POWER_Y,
            self.z >> CHUNK_POWER_Z,
        )
    }
}

/// Serialized contents of one chunk, opaque to the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub pos: ChunkPos,
    pub data: Vec<u8>,
}

/// Block families registered on the server since the client joined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFamilyRegistration {
    pub block_uris: Vec<String>,
    pub block_ids: Vec<u16>,
}

impl BlockFamilyRegistration {
    pub fn is_empty(&self) -> bool {
        self.block_uris.is_empty()
    }

    pub fn push(&mut self, uri: impl Into<String>, id: u16) {
        self.block_uris.push(uri.into());
        self.block_ids.push(id);
    }

    /// Pairs uris with ids; `None` if the two lists disagree in length.
    pub fn entries(&self) -> Option<Vec<(&str, u16)>> {
        if self.block_uris.len() != self.block_ids.len() {
            return None;
        }
        Some(
            self.block_uris
                .iter()
                .map(String::as_str)
                .zip(self.block_ids.iter().copied())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_to_chunk() {
        assert_eq!(BlockPos::new(0, 0, 0).chunk(), ChunkPos::new(0, 0, 0));
        assert_eq!(BlockPos::new(31, 63, 31).chunk(), ChunkPos::new(0, 0, 0));
        assert_eq!(BlockPos::new(32, 64, 32).chunk(), ChunkPos::new(1, 1, 1));
        assert_eq!(BlockPos::new(-1, -1, -33).chunk(), ChunkPos::new(-1, -1, -2));
    }

    #[test]
    fn test_containing_rounds_half_up() {
        assert_eq!(ChunkPos::containing([31.4, 0.0, 0.0]), ChunkPos::new(0, 0, 0));
        assert_eq!(ChunkPos::containing([31.5, 0.0, 0.0]), ChunkPos::new(1, 0, 0));
        assert_eq!(ChunkPos::containing([f32::NAN, 70.0, -0.6]), ChunkPos::new(0, 1, -1));
    }

    #[test]
    fn test_distance_squared() {
        let a = ChunkPos::new(0, 0, 0);
        assert_eq!(a.distance_squared(&ChunkPos::new(1, 2, -2)), 9);
    }

    #[test]
    fn test_family_registration_entries() {
        let mut reg = BlockFamilyRegistration::default();
        reg.push("core:stone", 4);
        assert_eq!(reg.entries(), Some(vec![("core:stone", 4)]));

        reg.block_ids.push(9);
        assert_eq!(reg.entries(), None);
    }
}
