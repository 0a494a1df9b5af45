use rand::{Rng, SeedableRng, rngs::StdRng};

/// Seeds every randomized parser test runs over.
pub(crate) const SEEDS: std::ops::Range<u64> = 0..200;

pub(crate) fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Cut `text` into pieces of 1 to 8 characters, never inside a character.
pub(crate) fn random_split(text: &str, rng: &mut StdRng) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut at = 0;
    while at < chars.len() {
        let len = rng.random_range(1..=(chars.len() - at).min(8));
        pieces.push(chars[at..at + len].iter().collect());
        at += len;
    }
    pieces
}
