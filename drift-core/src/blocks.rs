use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::LazyLock;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fileinfo::BlockInfo;

/// Global content block size. Files are hashed and transferred in chunks
/// of this many bytes; the final block of a file may be shorter.
pub const BLOCK_SIZE: usize = 128 * 1024;

static ZERO_BLOCK_HASH: LazyLock<Vec<u8>> =
    LazyLock::new(|| Sha256::digest(vec![0u8; BLOCK_SIZE]).to_vec());

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("block size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u32, actual: usize },
    #[error("block hash mismatch")]
    HashMismatch { observed: Vec<u8> },
}

/// The SHA-256 of `size` zero bytes.
pub fn zero_hash(size: u32) -> Vec<u8> {
    if size as usize == BLOCK_SIZE {
        return ZERO_BLOCK_HASH.clone();
    }
    Sha256::digest(vec![0u8; size as usize]).to_vec()
}

/// Hash the reader's content into [`BLOCK_SIZE`] blocks with offsets
/// filled in. An empty input yields an empty block list.
pub fn hash_blocks<R: Read>(mut reader: R) -> io::Result<Vec<BlockInfo>> {
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut offset = 0u64;

    loop {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        blocks.push(BlockInfo {
            offset,
            size: filled as u32,
            hash: Sha256::digest(&buf[..filled]).to_vec(),
        });
        offset += filled as u64;

        if filled < BLOCK_SIZE {
            break;
        }
    }

    Ok(blocks)
}

pub fn hash_file(path: &Path) -> io::Result<Vec<BlockInfo>> {
    hash_blocks(File::open(path)?)
}

/// Hash a byte slice as file content. Used for symlinks, whose content is
/// the target text.
pub fn hash_bytes(content: &[u8]) -> Vec<BlockInfo> {
    // Reading from a slice cannot fail.
    hash_blocks(content).unwrap_or_default()
}

/// Check that `buf` is the content the block describes. On a hash
/// mismatch the observed hash is returned so callers can repair stale
/// block indexes.
pub fn verify_buffer(buf: &[u8], block: &BlockInfo) -> Result<(), VerifyError> {
    if buf.len() != block.size as usize {
        return Err(VerifyError::SizeMismatch {
            expected: block.size,
            actual: buf.len(),
        });
    }
    let observed = Sha256::digest(buf).to_vec();
    if observed != block.hash {
        return Err(VerifyError::HashMismatch { observed });
    }
    Ok(())
}

/// True iff both lists describe identical content: same length and the
/// same hash at every position.
pub fn blocks_equal(a: &[BlockInfo], b: &[BlockInfo]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.hash == y.hash)
}

/// Split `want` into the blocks missing from `have` and the indices of
/// the ones already present there. Matching is by content hash alone, so
/// a block that moved position still counts as present.
pub fn block_diff(have: &[BlockInfo], want: &[BlockInfo]) -> (Vec<BlockInfo>, Vec<u32>) {
    let existing: HashSet<&[u8]> = have.iter().map(|b| b.hash.as_slice()).collect();
    let mut need = Vec::new();
    let mut reused = Vec::new();
    for (i, block) in want.iter().enumerate() {
        if existing.contains(block.hash.as_slice()) {
            reused.push(i as u32);
        } else {
            need.push(block.clone());
        }
    }
    (need, reused)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_into_block_sized_chunks() {
        let content = vec![7u8; BLOCK_SIZE + 10];
        let blocks = hash_blocks(&content[..]).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].size as usize, BLOCK_SIZE);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].size, 10);
        assert_eq!(blocks[1].offset, BLOCK_SIZE as u64);
    }

    #[test]
    fn empty_input_yields_no_blocks() {
        assert!(hash_blocks(&[][..]).unwrap().is_empty());
    }

    #[test]
    fn verify_accepts_matching_content() {
        let content = b"hello world";
        let blocks = hash_blocks(&content[..]).unwrap();
        assert!(verify_buffer(content, &blocks[0]).is_ok());
    }

    #[test]
    fn verify_reports_observed_hash_on_mismatch() {
        let blocks = hash_blocks(&b"hello"[..]).unwrap();
        let err = verify_buffer(b"jello", &blocks[0]).unwrap_err();
        match err {
            VerifyError::HashMismatch { observed } => {
                assert_eq!(observed, Sha256::digest(b"jello").to_vec());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_wrong_size() {
        let blocks = hash_blocks(&b"hello"[..]).unwrap();
        assert!(matches!(
            verify_buffer(b"hi", &blocks[0]),
            Err(VerifyError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn zero_hash_matches_hashed_zeroes() {
        let blocks = hash_blocks(&vec![0u8; 100][..]).unwrap();
        assert_eq!(blocks[0].hash, zero_hash(100));
        let full = hash_blocks(&vec![0u8; BLOCK_SIZE][..]).unwrap();
        assert_eq!(full[0].hash, zero_hash(BLOCK_SIZE as u32));
    }

    #[test]
    fn block_diff_splits_missing_and_reusable() {
        fn block(offset: u64, content: &[u8]) -> BlockInfo {
            BlockInfo {
                offset,
                size: content.len() as u32,
                hash: Sha256::digest(content).to_vec(),
            }
        }

        let have = vec![block(0, b"one"), block(3, b"two")];
        let want = vec![block(0, b"two"), block(3, b"three"), block(8, b"one")];

        let (need, reused) = block_diff(&have, &want);
        assert_eq!(need, vec![block(3, b"three")]);
        assert_eq!(reused, vec![0, 2]);

        // Nothing on hand means everything is needed.
        let (need, reused) = block_diff(&[], &want);
        assert_eq!(need.len(), 3);
        assert!(reused.is_empty());
    }

    #[test]
    fn blocks_equal_compares_position_wise() {
        let a = hash_blocks(&b"abcdef"[..]).unwrap();
        let b = hash_blocks(&b"abcdef"[..]).unwrap();
        let c = hash_blocks(&b"abcdeg"[..]).unwrap();
        assert!(blocks_equal(&a, &b));
        assert!(!blocks_equal(&a, &c));
        assert!(!blocks_equal(&a, &[]));
    }
}
