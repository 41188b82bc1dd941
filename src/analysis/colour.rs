//! Deterministic per-user colours.

/// Android holo and solarized palettes, in palette order. Names shared by
/// both palettes take the solarized value.
const PALETTE: [&str; 17] = [
    "33b5e5", // light_blue
    "0087ff", // blue
    "aa66cc", // light_purple
    "9933cc", // purple
    "99cc00", // light_green
    "5f8700", // green
    "ffbb33", // light_yellow
    "af8700", // yellow
    "ff4444", // light_red
    "d70000", // red
    "262626", // black
    "626262", // bryellow
    "ffffd7", // brwhite
    "d75f00", // brred
    "af005f", // magenta
    "5f5faf", // brmagenta
    "00afaf", // cyan
];

/// Maps keys (user names) to a stable palette colour.
///
/// The hash is FNV-1a, so the colour of a key never changes between runs or
/// builds. `seed` rotates the palette.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColourScheme {
    seed: u64,
}

impl ColourScheme {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Hex colour (without `#`) for `key`.
    pub fn colour(&self, key: &str) -> &'static str {
        let index = fnv1a(key.as_bytes()).wrapping_add(self.seed) % PALETTE.len() as u64;
        PALETTE[index as usize]
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colour_is_stable() {
        let scheme = ColourScheme::new(0);
        assert_eq!(scheme.colour("mapper"), scheme.colour("mapper"));
        assert_eq!(scheme.colour("mapper"), ColourScheme::new(0).colour("mapper"));
        assert_eq!(scheme.colour("mapper").len(), 6);
    }

    #[test]
    fn test_seed_rotates_palette() {
        let key = "mapper";
        let base = fnv1a(key.as_bytes()) % PALETTE.len() as u64;
        let next = PALETTE[((base + 1) % PALETTE.len() as u64) as usize];
        assert_eq!(ColourScheme::new(1).colour(key), next);
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
