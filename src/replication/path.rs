//! Sequence number to replication path mapping.

/// Path fragment for a sequence number: `a/b/c` with each component zero
/// padded to three digits, where `a = n / 1_000_000`, `b = (n / 1000) % 1000`
/// and `c = n % 1000`.
pub fn path_fragment(seqno: u64) -> String {
    format!(
        "{:03}/{:03}/{:03}",
        seqno / 1_000_000,
        (seqno / 1000) % 1000,
        seqno % 1000
    )
}

/// Inverse of [`path_fragment`].
pub fn parse_path_fragment(fragment: &str) -> Option<u64> {
    let mut parts = fragment.split('/');
    let a = parse_component(parts.next()?, false)?;
    let b = parse_component(parts.next()?, true)?;
    let c = parse_component(parts.next()?, true)?;
    if parts.next().is_some() {
        return None;
    }
    a.checked_mul(1_000_000)?
        .checked_add(b * 1000)?
        .checked_add(c)
}

fn parse_component(part: &str, bounded: bool) -> Option<u64> {
    if part.len() < 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if bounded && part.len() != 3 {
        return None;
    }
    part.parse().ok()
}
