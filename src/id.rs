//! Random identifiers for nodes and callbacks.

use rand::RngCore;

/// Default number of random bytes in a generated id (32 hex characters).
pub const DEFAULT_ID_BYTES: usize = 16;

/// Generate a lowercase hex id from `bytes` bytes of the thread-local CSPRNG.
///
/// At least one byte is always drawn.
pub fn gen_id(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes.max(1)];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
