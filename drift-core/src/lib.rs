//! Shared data model for the drift synchronization engine: device
//! identities, version vectors, file metadata and content blocks.

pub mod blocks;
pub mod device;
pub mod fileinfo;
pub mod vector;

pub use blocks::{
    BLOCK_SIZE, VerifyError, block_diff, blocks_equal, hash_blocks, hash_file, verify_buffer,
};
pub use device::{DeviceId, ShortId};
pub use fileinfo::{BlockInfo, FLAG_NO_PERMS, FileInfo, FileKind, PERM_MASK};
pub use vector::{Vector, VectorOrdering};
