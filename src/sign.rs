//! Defines the signature of a stored object, used to derive job names
//! that are stable across redeliveries of the same event.

use base64ct::{Base64UrlUnpadded, Encoding};
use sha1::{Digest, Sha1};

/// The length of a signature, in characters.
pub const SIGNATURE_LEN: usize = 27;

/// Produce a signature for the object at `key` in `bucket`. The
/// signature only uses characters allowed in job names.
pub fn object_signature(bucket: &str, key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bucket.as_bytes());
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    Base64UrlUnpadded::encode_string(&hash)
}
