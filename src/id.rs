//! Sortable event identifiers.
//!
//! Identifiers are built from a time-based (v1) UUID whose fields are
//! reordered most-significant-first: `time_hi_and_version`, `time_mid`,
//! `time_low`, then the clock sequence and node. The result is 32 lowercase
//! hex characters whose lexicographic order follows the timestamp, so a
//! store that orders documents by id orders them chronologically.
//!
//! ```
//! use eventfold_registry::id;
//!
//! let a = id::generate();
//! assert_eq!(a.len(), 32);
//! assert!(a.starts_with('1'));
//! ```

use std::sync::OnceLock;
use uuid::Uuid;

/// Generate a fresh identifier.
///
/// Never fails. Uniqueness within the process comes from the v1 clock
/// sequence; the node id is random per process.
pub fn generate() -> String {
    from_uuid(&Uuid::now_v1(node_id()))
}

/// Rearrange a UUID into the sortable identifier form.
///
/// Pure: the same UUID always yields the same identifier.
///
/// ```
/// use eventfold_registry::id;
/// use uuid::Uuid;
///
/// let uuid = Uuid::parse_str("b373d1a0-b68f-11e7-a33e-8fb9afebf642").unwrap();
/// assert_eq!(id::from_uuid(&uuid), "11e7b68fb373d1a0a33e8fb9afebf642");
/// ```
pub fn from_uuid(uuid: &Uuid) -> String {
    let (time_low, time_mid, time_hi, tail) = uuid.as_fields();
    let mut out = format!("{time_hi:04x}{time_mid:04x}{time_low:08x}");
    for byte in tail {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn node_id() -> &'static [u8; 6] {
    static NODE: OnceLock<[u8; 6]> = OnceLock::new();
    NODE.get_or_init(|| {
        let mut node: [u8; 6] = rand::random();
        // Multicast bit marks a random node id (RFC 4122 §4.5).
        node[0] |= 0x01;
        node
    })
}
