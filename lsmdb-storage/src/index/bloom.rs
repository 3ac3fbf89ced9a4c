use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Number of bit probes per key.
pub const BLOOM_HASHES: u32 = 3;

/// Bloom filter over a borrowed or owned bitmap.
///
/// The filter stores 32-bit key hashes. Probe positions are derived by
/// double hashing from the key hash mixed with a per-filter seed, so two
/// pages holding the same keys set different bits.
/// An empty bitmap disables the filter: every probe is a possible hit.
pub struct BloomFilter<B> {
    bits: B,
    seed: u32,
}

impl<B: AsRef<[u8]>> BloomFilter<B> {
    #[inline]
    pub fn new(bits: B, seed: u32) -> Self {
        BloomFilter { bits, seed }
    }

    #[inline]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.bits.as_ref().is_empty()
    }

    /// Returns false only if the hash was never added.
    #[inline]
    pub fn might_contain(&self, hash: u32) -> bool {
        let bits = self.bits.as_ref();
        if bits.is_empty() {
            return true;
        }
        let nbits = bits.len() * 8;
        let (h1, h2) = hash_pair(hash, self.seed);
        (0..BLOOM_HASHES).all(|i| {
            let idx = bit_index(h1, h2, i, nbits);
            bits[idx / 8] & (1 << (idx % 8)) != 0
        })
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BloomFilter<B> {
    #[inline]
    pub fn add(&mut self, hash: u32) {
        let nbits = self.bits.as_ref().len() * 8;
        if nbits == 0 {
            return;
        }
        let (h1, h2) = hash_pair(hash, self.seed);
        let bits = self.bits.as_mut();
        for i in 0..BLOOM_HASHES {
            let idx = bit_index(h1, h2, i, nbits);
            bits[idx / 8] |= 1 << (idx % 8);
        }
    }
}

#[inline]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[inline]
fn hash_pair(hash: u32, seed: u32) -> (u32, u32) {
    let h1 = fmix32(hash ^ seed);
    // odd step never cycles on a short subset of bits.
    let h2 = fmix32(h1.wrapping_add(0x9e37_79b9) ^ seed.rotate_left(16)) | 1;
    (h1, h2)
}

#[inline]
fn bit_index(h1: u32, h2: u32, i: u32, nbits: usize) -> usize {
    h1.wrapping_add(i.wrapping_mul(h2)) as usize % nbits
}

/// Source of per-page bloom seeds, injected at index creation.
pub enum SeedSource {
    Counter(u32),
    Random(ChaCha8Rng),
}

impl SeedSource {
    /// Seeds are consecutive numbers starting from given value.
    #[inline]
    pub fn counter(start: u32) -> Self {
        SeedSource::Counter(start)
    }

    /// Reproducible pseudo-random seeds.
    #[inline]
    pub fn seeded(seed: u64) -> Self {
        SeedSource::Random(ChaCha8Rng::seed_from_u64(seed))
    }

    #[inline]
    pub fn from_entropy() -> Self {
        Self::seeded(rand::random())
    }

    #[inline]
    pub fn next_seed(&mut self) -> u32 {
        match self {
            SeedSource::Counter(n) => {
                let seed = *n;
                *n = n.wrapping_add(1);
                seed
            }
            SeedSource::Random(rng) => rng.next_u32(),
        }
    }
}
