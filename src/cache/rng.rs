//! xoshiro256++ generator used to pick random eviction candidates.
//!
//! Seeded once per cache instance from the process CSPRNG (`rand::OsRng`);
//! there is no process-wide shared generator state, matching the "no
//! global RNG" design note.

use rand::RngCore;

pub struct Xoshiro256PlusPlus {
    state: [u64; 4],
}

impl Xoshiro256PlusPlus {
    pub fn from_entropy() -> Self {
        let mut seed = [0u64; 4];
        let mut rng = rand::rngs::OsRng;
        for word in seed.iter_mut() {
            *word = rng.next_u64();
        }
        // xoshiro256 requires a non-all-zero seed.
        if seed.iter().all(|&w| w == 0) {
            seed[0] = 0x9E3779B97F4A7C15;
        }
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = rotl(self.state[0].wrapping_add(self.state[3]), 23).wrapping_add(self.state[0]);

        let t = self.state[1] << 17;

        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];

        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);

        result
    }
}

fn rotl(x: u64, k: u32) -> u64 {
    x.rotate_left(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_varying_output() {
        let mut rng = Xoshiro256PlusPlus::from_entropy();
        let a = rng.next_u64();
        let b = rng.next_u64();
        assert_ne!(a, b);
    }
}
