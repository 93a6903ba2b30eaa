//! Elephant diffuser used by the legacy CBC encryption methods.
//!
//! A non-keyed bit-mixing pass over the whole sector, run as two phases (A
//! and B) over the sector viewed as little-endian 32-bit words. The decrypt
//! directions below follow the published constants; the encrypt directions
//! are their exact inverses (reverse iteration, wrapping subtraction).

const A_CYCLES: usize = 5;
const B_CYCLES: usize = 3;
const RA: [u32; 4] = [9, 0, 13, 0];
const RB: [u32; 4] = [0, 10, 0, 25];

fn load_words(sector: &[u8]) -> Vec<u32> {
    sector
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn store_words(words: &[u32], sector: &mut [u8]) {
    for (chunk, word) in sector.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

/// Diffuser A, decrypt direction.
pub fn diffuser_a_decrypt(sector: &mut [u8]) {
    debug_assert!(sector.len() % 4 == 0 && sector.len() >= 32);
    let mut d = load_words(sector);
    let n = d.len();
    for _ in 0..A_CYCLES {
        for i in 0..n {
            let mix = d[(i + n - 2) % n] ^ d[(i + n - 5) % n].rotate_left(RA[i % 4]);
            d[i] = d[i].wrapping_add(mix);
        }
    }
    store_words(&d, sector);
}

/// Diffuser A, encrypt direction (inverse of [`diffuser_a_decrypt`]).
pub fn diffuser_a_encrypt(sector: &mut [u8]) {
    debug_assert!(sector.len() % 4 == 0 && sector.len() >= 32);
    let mut d = load_words(sector);
    let n = d.len();
    for _ in 0..A_CYCLES {
        for i in (0..n).rev() {
            let mix = d[(i + n - 2) % n] ^ d[(i + n - 5) % n].rotate_left(RA[i % 4]);
            d[i] = d[i].wrapping_sub(mix);
        }
    }
    store_words(&d, sector);
}

/// Diffuser B, decrypt direction.
pub fn diffuser_b_decrypt(sector: &mut [u8]) {
    debug_assert!(sector.len() % 4 == 0 && sector.len() >= 32);
    let mut d = load_words(sector);
    let n = d.len();
    for _ in 0..B_CYCLES {
        for i in 0..n {
            let mix = d[(i + 2) % n] ^ d[(i + 5) % n].rotate_left(RB[i % 4]);
            d[i] = d[i].wrapping_add(mix);
        }
    }
    store_words(&d, sector);
}

/// Diffuser B, encrypt direction (inverse of [`diffuser_b_decrypt`]).
pub fn diffuser_b_encrypt(sector: &mut [u8]) {
    debug_assert!(sector.len() % 4 == 0 && sector.len() >= 32);
    let mut d = load_words(sector);
    let n = d.len();
    for _ in 0..B_CYCLES {
        for i in (0..n).rev() {
            let mix = d[(i + 2) % n] ^ d[(i + 5) % n].rotate_left(RB[i % 4]);
            d[i] = d[i].wrapping_sub(mix);
        }
    }
    store_words(&d, sector);
}
