//! Test data creation for torrent testing.
//!
//! Provides standardized torrent info and piece data for consistent testing
//! across torrent-related modules.

use sha1::{Digest, Sha1};

use super::{FileEntry, InfoHash, PeerId, TorrentInfo};

/// SHA-1 digest of a piece as stored in `TorrentInfo::piece_hashes`.
pub fn hash_piece(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

/// Creates torrent info for `content` split into `piece_length` pieces.
///
/// Returns the info together with the expected bytes of every piece.
pub fn create_torrent(content: &[u8], piece_length: u32) -> (TorrentInfo, Vec<Vec<u8>>) {
    let pieces: Vec<Vec<u8>> = content
        .chunks(piece_length as usize)
        .map(<[u8]>::to_vec)
        .collect();
    let hashes = pieces.iter().map(|piece| hash_piece(piece)).collect();

    let info = TorrentInfo::new(
        "test.bin",
        vec![FileEntry {
            length: content.len() as u64,
            relative_path: "test.bin".to_string(),
        }],
        piece_length,
        hashes,
        InfoHash::new([7u8; 20]),
        PeerId::new(*b"-UT0001-testpeer0001"),
    )
    .expect("test torrent geometry is valid");

    (info, pieces)
}

/// Creates the 3-piece torrent used across tests: piece length 5, total 13.
pub fn create_small_torrent() -> (TorrentInfo, Vec<Vec<u8>>) {
    create_torrent(b"hello, world!", 5)
}
