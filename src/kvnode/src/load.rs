// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Rolling request-rate tracker. Each reply carries the number of requests
//! handled within the trailing epoch so the LB can observe per-node load.

use parking_lot::Mutex;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct LoadTracker {
    epoch: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl LoadTracker {
    pub fn new(epoch_us: u64) -> Self {
        Self {
            epoch: Duration::from_micros(epoch_us),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.push_back(now);
        Self::prune(&mut window, now, self.epoch);
    }

    pub fn load(&self) -> u16 {
        let now = Instant::now();
        let mut window = self.window.lock();
        Self::prune(&mut window, now, self.epoch);
        window.len().min(u16::MAX as usize) as u16
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, epoch: Duration) {
        while let Some(first) = window.front() {
            if now.duration_since(*first) > epoch {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_within_the_epoch() {
        let tracker = LoadTracker::new(1_000_000);
        for _ in 0..5 {
            tracker.record();
        }
        assert_eq!(tracker.load(), 5);
    }

    #[test]
    fn old_requests_age_out() {
        let tracker = LoadTracker::new(1);
        tracker.record();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.load(), 0);
    }
}
