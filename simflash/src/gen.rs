//! Image generation.
//!
//! Test images are random data from a seeded generator, so that a failing
//! test can be reproduced exactly.  The first two words look like a Cortex-M
//! vector table (initial stack pointer, reset handler) pointing into the
//! image's own load address, which is all the bootloader ever looks at.

use anyhow::{bail, Result};
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

pub struct GeneratedImage {
    pub base: u32,
    pub data: Vec<u8>,
}

impl GeneratedImage {
    /// Split into host sized chunks, paired with their load address.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = (u32, &[u8])> {
        let base = self.base;
        self.data
            .chunks(size)
            .enumerate()
            .map(move |(i, c)| (base + (i * size) as u32, c))
    }

    /// The image padded with erased bytes out to a multiple of `align`.
    pub fn padded(&self, align: usize) -> Vec<u8> {
        let mut data = self.data.clone();
        let len = data.len().div_ceil(align) * align;
        data.resize(len, 0xff);
        data
    }
}

pub struct GenBuilder {
    /// Load address.
    base: u32,
    /// Total size of the image.
    size: usize,
    /// Seed for the PRNG
    seed: u64,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            base: 0x0800_4000,
            size: 0x4000,
            seed: 1,
        }
    }
}

impl GenBuilder {
    pub fn base(&mut self, base: u32) -> &mut Self {
        self.base = base;
        self
    }

    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        if self.size < 8 {
            bail!("image of {} bytes cannot hold a vector table", self.size);
        }
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut data = vec![0u8; self.size];
        rng.fill_bytes(&mut data);

        let sp = 0x2000_8000u32;
        let reset = (self.base + 0x101) | 1;
        data[0..4].copy_from_slice(&sp.to_le_bytes());
        data[4..8].copy_from_slice(&reset.to_le_bytes());

        Ok(GeneratedImage {
            base: self.base,
            data,
        })
    }
}

#[cfg(test)]
mod tester {
    use super::GenBuilder;

    #[test]
    fn test_gen() {
        let a = GenBuilder::default().seed(3).build().unwrap();
        let b = GenBuilder::default().seed(3).build().unwrap();
        let c = GenBuilder::default().seed(4).build().unwrap();
        assert_eq!(a.data, b.data);
        assert_ne!(a.data, c.data);
        assert_eq!(a.data.len(), 0x4000);

        let chunks: Vec<_> = a.chunks(0x1800).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].0, 0x0800_7000);
        assert_eq!(chunks[2].1.len(), 0x1000);
    }

    #[test]
    fn padding() {
        let img = GenBuilder::default().size(13).build().unwrap();
        let padded = img.padded(8);
        assert_eq!(padded.len(), 16);
        assert_eq!(&padded[13..], &[0xff, 0xff, 0xff]);
        assert!(GenBuilder::default().size(4).build().is_err());
    }
}
