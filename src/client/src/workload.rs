// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Synthetic workload generation: uniform or Zipfian key choice over a
//! keyfile population, a GET/PUT/DEL mix, Poisson inter-arrival times, and
//! optional population dynamism to shift which keys are hot mid-run.

use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyDist {
    Uniform,
    Zipf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dynamism {
    None,
    HotIn,
    Random,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    Del,
}

pub struct NextOperation {
    pub delay_us: u64,
    pub key: Box<[u8]>,
    pub kind: OpKind,
}

/// The parts of the workload shared by every sender thread. The key
/// population mutates under dynamism; the Zipf CDF depends only on the
/// population size, which is stable.
pub struct Workload {
    keys: RwLock<Vec<Box<[u8]>>>,
    zipf_cdf: Vec<f32>,
    value: Box<[u8]>,
    get_ratio: f32,
    put_ratio: f32,
    key_dist: KeyDist,
    dynamism: Dynamism,
    d_nkeys: usize,
    mean_interval_us: f64,
}

impl Workload {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Vec<Box<[u8]>>,
        value_len: usize,
        get_ratio: f32,
        put_ratio: f32,
        key_dist: KeyDist,
        alpha: f32,
        dynamism: Dynamism,
        d_nkeys: usize,
        mean_interval_us: f64,
    ) -> Self {
        let zipf_cdf = if key_dist == KeyDist::Zipf {
            zipf_cdf(keys.len(), alpha)
        } else {
            Vec::new()
        };
        Self {
            keys: RwLock::new(keys),
            zipf_cdf,
            value: vec![b'v'; value_len].into_boxed_slice(),
            get_ratio,
            put_ratio,
            key_dist,
            dynamism,
            d_nkeys,
            mean_interval_us,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn dynamism(&self) -> Dynamism {
        self.dynamism
    }

    /// Shift the key population: `HotIn` rotates tail keys to the front of
    /// the ranking (new hot keys), `Random` swaps ranks at random.
    pub fn change_keys<R: Rng>(&self, rng: &mut R) {
        let mut keys = self.keys.write();
        if keys.is_empty() {
            return;
        }
        match self.dynamism {
            Dynamism::None => {}
            Dynamism::HotIn => {
                for _ in 0..self.d_nkeys.min(keys.len()) {
                    let tail = keys.pop().unwrap();
                    keys.insert(0, tail);
                }
            }
            Dynamism::Random => {
                let hot_span = keys.len().min(10_000);
                for _ in 0..self.d_nkeys {
                    let a = rng.gen_range(0..hot_span);
                    let b = rng.gen_range(0..keys.len());
                    keys.swap(a, b);
                }
            }
        }
    }

    fn pick_key<R: Rng>(&self, rng: &mut R) -> Box<[u8]> {
        let keys = self.keys.read();
        let index = match self.key_dist {
            KeyDist::Uniform => rng.gen_range(0..keys.len()),
            KeyDist::Zipf => {
                let mut random = 0.0f32;
                while random == 0.0 {
                    random = rng.gen();
                }
                self.zipf_cdf.partition_point(|p| *p < random).min(keys.len() - 1)
            }
        };
        keys[index].clone()
    }

    fn pick_op<R: Rng>(&self, rng: &mut R) -> OpKind {
        let choice: f32 = rng.gen();
        if choice < self.get_ratio {
            OpKind::Get
        } else if choice < self.get_ratio + self.put_ratio {
            OpKind::Put
        } else {
            OpKind::Del
        }
    }
}

/// Zipf CDF over ranks 1..=n with skew `alpha`.
fn zipf_cdf(n: usize, alpha: f32) -> Vec<f32> {
    let mut c = 0.0f32;
    for i in 0..n {
        c += 1.0 / ((i + 1) as f32).powf(alpha);
    }
    c = 1.0 / c;
    let mut sum = 0.0f32;
    let mut cdf = Vec::with_capacity(n);
    for i in 0..n {
        sum += c / ((i + 1) as f32).powf(alpha);
        cdf.push(sum);
    }
    cdf
}

/// Per-thread generator: its own rng and Poisson arrival process over the
/// shared workload.
pub struct Generator {
    workload: std::sync::Arc<Workload>,
    rng: SmallRng,
    poisson: Option<Poisson<f64>>,
}

impl Generator {
    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn new(workload: std::sync::Arc<Workload>) -> Self {
        let poisson = if workload.mean_interval_us > 0.0 {
            Poisson::new(workload.mean_interval_us).ok()
        } else {
            None
        };
        Self {
            workload,
            rng: SmallRng::from_entropy(),
            poisson,
        }
    }

    pub fn next_operation(&mut self) -> NextOperation {
        let delay_us = match &self.poisson {
            Some(poisson) => poisson.sample(&mut self.rng) as u64,
            None => 0,
        };
        NextOperation {
            delay_us,
            key: self.workload.pick_key(&mut self.rng),
            kind: self.workload.pick_op(&mut self.rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys(n: usize) -> Vec<Box<[u8]>> {
        (0..n)
            .map(|i| format!("key-{}", i).into_bytes().into_boxed_slice())
            .collect()
    }

    #[test]
    fn zipf_cdf_is_monotonic_and_normalized() {
        let cdf = zipf_cdf(100, 1.0);
        assert!(cdf.windows(2).all(|w| w[0] <= w[1]));
        assert!((cdf.last().unwrap() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn zipf_prefers_low_ranks() {
        let workload = Arc::new(Workload::new(
            keys(1000),
            8,
            1.0,
            0.0,
            KeyDist::Zipf,
            1.2,
            Dynamism::None,
            0,
            0.0,
        ));
        let mut gen = Generator::new(workload);
        let mut head = 0usize;
        for _ in 0..1000 {
            let op = gen.next_operation();
            if op.key.ends_with(b"-0") {
                head += 1;
            }
        }
        // rank 1 carries far more than the uniform 1/1000 share
        assert!(head > 50);
    }

    #[test]
    fn ratios_drive_op_mix() {
        let workload = Arc::new(Workload::new(
            keys(10),
            8,
            0.0,
            1.0,
            KeyDist::Uniform,
            0.0,
            Dynamism::None,
            0,
            0.0,
        ));
        let mut gen = Generator::new(workload);
        for _ in 0..100 {
            assert_eq!(gen.next_operation().kind, OpKind::Put);
        }
    }

    #[test]
    fn hotin_rotates_the_tail_to_the_front() {
        let workload = Workload::new(
            keys(5),
            8,
            1.0,
            0.0,
            KeyDist::Zipf,
            1.0,
            Dynamism::HotIn,
            2,
            0.0,
        );
        let mut rng = SmallRng::seed_from_u64(1);
        workload.change_keys(&mut rng);
        let keys = workload.keys.read();
        assert_eq!(*keys[0], *b"key-3");
        assert_eq!(*keys[1], *b"key-4");
        assert_eq!(*keys[2], *b"key-0");
    }

    #[test]
    fn poisson_delays_track_the_mean() {
        let workload = Arc::new(Workload::new(
            keys(10),
            8,
            1.0,
            0.0,
            KeyDist::Uniform,
            0.0,
            Dynamism::None,
            0,
            100.0,
        ));
        let mut gen = Generator::new(workload);
        let total: u64 = (0..1000).map(|_| gen.next_operation().delay_us).sum();
        let mean = total as f64 / 1000.0;
        assert!(mean > 80.0 && mean < 120.0);
    }
}
