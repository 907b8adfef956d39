//! Small helpers shared across the crate.

/// Lower-case hex sha256 of `bytes`.
///
/// Used to identify certificates in logs without printing them.
pub fn sha256_fingerprint(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    data_encoding::HEXLOWER.encode(digest.as_ref())
}
