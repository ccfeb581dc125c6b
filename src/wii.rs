//! Wii partition sector layout, hash-block reconstruction, and the narrow
//! cryptography surface the reader and writer consume.
//!
//! Partition data in WIA/RVZ is stored decrypted with the per-sector hash
//! blocks stripped. Reproducing the original disc bytes means recomputing
//! the hash tree over a full group of blocks, overriding individual hashes
//! from the stored exception lists, and re-encrypting.

use std::{io, mem::size_of};

use tracing::instrument;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::{HashBytes, KeyBytes},
    format::HashException,
    util::{
        aes::{aes_cbc_decrypt_b2b, aes_cbc_encrypt},
        array_ref, array_ref_mut,
        digest::sha1_hash,
        static_assert,
    },
};

/// Size in bytes of a disc sector. (32 KiB)
pub const SECTOR_SIZE: usize = 0x8000;

/// Size in bytes of the hash block at the start of an encrypted sector.
pub const HASHES_SIZE: usize = 0x400;

/// Size in bytes of the data portion of a sector, excluding hashes.
pub const SECTOR_DATA_SIZE: usize = SECTOR_SIZE - HASHES_SIZE; // 0x7C00

/// Number of blocks (sectors) covered by one hash group.
pub const BLOCKS_PER_GROUP: usize = 64;

/// Size in bytes of one Wii group on disc. (2 MiB)
pub const GROUP_SIZE: usize = SECTOR_SIZE * BLOCKS_PER_GROUP;

/// Size in bytes of one Wii group's decrypted payload, excluding hashes.
pub const GROUP_DATA_SIZE: usize = SECTOR_DATA_SIZE * BLOCKS_PER_GROUP;

/// The hash block at the start of an encrypted Wii sector.
///
/// `h0` hashes cover the sector's own 31 KiB of data in 1 KiB blocks, `h1`
/// covers the 8 sectors of the subgroup, and `h2` the 8 subgroups of the
/// group.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HashBlock {
    /// SHA-1 of each 1 KiB data block in this sector.
    pub h0: [HashBytes; 31],
    _pad0: [u8; 20],
    /// SHA-1 of the `h0` table of each sector in this sector's subgroup.
    pub h1: [HashBytes; 8],
    _pad1: [u8; 32],
    /// SHA-1 of the `h1` table of each subgroup in the group.
    pub h2: [HashBytes; 8],
    _pad2: [u8; 32],
}

static_assert!(size_of::<HashBlock>() == HASHES_SIZE);

/// Number of 1 KiB hash units in a sector's data portion.
const NUM_H0_HASHES: usize = SECTOR_DATA_SIZE / HASHES_SIZE;

/// Computes the hash blocks for one group of decrypted block data.
///
/// `data` holds up to [`GROUP_DATA_SIZE`] bytes of payload; a partial group
/// (at the end of a partition) hashes as if the missing bytes were zero.
#[instrument(skip_all)]
pub fn compute_group_hashes(data: &[u8], hash_blocks: &mut [HashBlock; BLOCKS_PER_GROUP]) {
    let mut sector_buf = [0u8; SECTOR_DATA_SIZE];
    for (sector, block) in hash_blocks.iter_mut().enumerate() {
        *block = HashBlock::new_zeroed();
        let start = sector * SECTOR_DATA_SIZE;
        let len = data.len().saturating_sub(start).min(SECTOR_DATA_SIZE);
        sector_buf[..len].copy_from_slice(&data[start..start + len]);
        sector_buf[len..].fill(0);
        for i in 0..NUM_H0_HASHES {
            block.h0[i] = sha1_hash(array_ref![sector_buf, i * HASHES_SIZE, HASHES_SIZE]);
        }
    }
    // h1: per sector, the hash of its own h0 table; each sector then carries
    // the full table of its subgroup.
    let mut h1 = [[0u8; 20]; BLOCKS_PER_GROUP];
    for (sector, hash) in h1.iter_mut().enumerate() {
        *hash = sha1_hash(hash_blocks[sector].h0.as_bytes());
    }
    let mut h2 = [[0u8; 20]; 8];
    for (subgroup, hash) in h2.iter_mut().enumerate() {
        *hash = sha1_hash(h1[subgroup * 8..subgroup * 8 + 8].as_bytes());
    }
    for (sector, block) in hash_blocks.iter_mut().enumerate() {
        block.h1.copy_from_slice(&h1[sector & !7..(sector & !7) + 8]);
        block.h2 = h2;
    }
}

/// Overwrites recalculated hashes with the stored exception entries.
///
/// `offset` addresses the group's hash area: each sector contributes
/// [`HASHES_SIZE`] bytes, so `offset / 0x400` selects the block and
/// `offset % 0x400` the byte position within it. An override may not span
/// two blocks.
pub fn apply_hash_exceptions(
    exceptions: &[HashException],
    hash_blocks: &mut [HashBlock; BLOCKS_PER_GROUP],
) -> io::Result<()> {
    for exception in exceptions {
        let offset = exception.offset.get() as usize;
        let block_index = offset / HASHES_SIZE;
        let offset_in_block = offset % HASHES_SIZE;
        if block_index >= BLOCKS_PER_GROUP || offset_in_block + size_of::<HashBytes>() > HASHES_SIZE
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Hash exception offset {:#X} out of range", offset),
            ));
        }
        hash_blocks[block_index].as_mut_bytes()
            [offset_in_block..offset_in_block + size_of::<HashBytes>()]
            .copy_from_slice(&exception.hash);
    }
    Ok(())
}

/// Decrypts a group of encrypted sectors into the contiguous payload stream
/// plus the original (decrypted) hash blocks.
///
/// `encrypted` must be a whole number of sectors, at most one group.
#[instrument(skip_all)]
pub fn decrypt_group(
    encrypted: &[u8],
    key: &KeyBytes,
    data_out: &mut [u8],
    hash_blocks: &mut [HashBlock; BLOCKS_PER_GROUP],
) {
    debug_assert_eq!(encrypted.len() % SECTOR_SIZE, 0);
    debug_assert!(encrypted.len() <= GROUP_SIZE);
    debug_assert!(data_out.len() >= encrypted.len() / SECTOR_SIZE * SECTOR_DATA_SIZE);
    for (i, sector) in encrypted.chunks_exact(SECTOR_SIZE).enumerate() {
        aes_cbc_decrypt_b2b(
            key,
            &[0u8; 16],
            &sector[..HASHES_SIZE],
            hash_blocks[i].as_mut_bytes(),
        );
        // Data IV from the encrypted hash block
        let iv = *array_ref![sector, 0x3D0, 16];
        aes_cbc_decrypt_b2b(
            key,
            &iv,
            &sector[HASHES_SIZE..],
            array_ref_mut![data_out, i * SECTOR_DATA_SIZE, SECTOR_DATA_SIZE],
        );
    }
}

/// Assembles and encrypts one sector from its hash block and data portion.
#[instrument(skip_all)]
pub fn encrypt_sector(
    hash_block: &HashBlock,
    data: &[u8; SECTOR_DATA_SIZE],
    key: &KeyBytes,
    out: &mut [u8; SECTOR_SIZE],
) {
    out[..HASHES_SIZE].copy_from_slice(hash_block.as_bytes());
    out[HASHES_SIZE..].copy_from_slice(data);
    aes_cbc_encrypt(key, &[0u8; 16], &mut out[..HASHES_SIZE]);
    // Data IV from the encrypted hash block
    let iv = *array_ref![out, 0x3D0, 16];
    aes_cbc_encrypt(key, &iv, &mut out[HASHES_SIZE..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_tree_shape() {
        let data = vec![0xAAu8; GROUP_DATA_SIZE];
        let mut blocks = <[HashBlock; BLOCKS_PER_GROUP]>::new_zeroed();
        compute_group_hashes(&data, &mut blocks);
        // All sectors contain identical data, so per-sector hashes match.
        assert_eq!(blocks[0].h0, blocks[63].h0);
        assert_eq!(blocks[0].h1, blocks[8].h1);
        assert_eq!(blocks[0].h2, blocks[63].h2);
        assert_eq!(blocks[0].h1[0], sha1_hash(blocks[0].h0.as_bytes()));
        assert_eq!(blocks[0].h2[0], sha1_hash(blocks[0].h1.as_bytes()));
    }

    #[test]
    fn test_apply_hash_exceptions() {
        let mut blocks = <[HashBlock; BLOCKS_PER_GROUP]>::new_zeroed();
        let exception = HashException { offset: 0x400u16.into(), hash: [0xEE; 20] };
        apply_hash_exceptions(&[exception], &mut blocks).unwrap();
        assert_eq!(blocks[1].h0[0], [0xEE; 20]);

        // An override may not span two blocks.
        let exception = HashException { offset: 0x3F8u16.into(), hash: [0xEE; 20] };
        assert!(apply_hash_exceptions(&[exception], &mut blocks).is_err());
    }
}
