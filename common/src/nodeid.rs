//! Canonical node identity helpers.
//!
//! A mesh node is identified by a 32-bit number; the canonical string form
//! is `!hhhhhhhh` (eight lowercase hex digits). The wire's relay field
//! carries only the low 8 bits of that number.

/// Render a numeric node identifier in the canonical `!hhhhhhhh` form.
pub fn num_to_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse a canonical `!hhhhhhhh` identity back to its numeric form.
///
/// Returns `None` for anything that is not a `!` followed by exactly eight
/// hex digits — in particular for the decimal partial-relay markers stored
/// when an 8-bit relay byte could not be resolved.
pub fn id_to_num(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!')?;
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Whether a stored relay value is a full canonical identity rather than an
/// unresolved partial marker.
pub fn is_full_id(id: &str) -> bool {
    id.starts_with('!')
}

/// Hops a packet travelled: `hop_start - hop_limit`, 0 meaning the packet
/// was heard directly from its source.
pub fn hops_away(hop_start: Option<u32>, hop_limit: Option<u32>) -> Option<u32> {
    match (hop_start, hop_limit) {
        (Some(start), Some(limit)) => Some(start.saturating_sub(limit)),
        _ => None,
    }
}
