use std::collections::VecDeque;

use super::sample::{ImuBias, ImuNoise, ImuSample};

/// Monotone-in-time ring of IMU samples with the noise model and bias
/// estimate that apply to them.
///
/// Samples older than `window` seconds behind the newest one are discarded
/// on insertion.
#[derive(Debug, Clone)]
pub struct ImuQueue {
    pub buf: VecDeque<ImuSample>,
    pub noise: ImuNoise,
    pub bias: ImuBias,
    /// Retention window in seconds.
    pub window: f64,
}

impl ImuQueue {
    pub fn new(noise: ImuNoise) -> Self {
        Self {
            buf: VecDeque::new(),
            noise,
            bias: ImuBias::default(),
            window: 10.0,
        }
    }

    /// Append a sample. Samples that do not advance time are dropped and the
    /// call returns `false`.
    pub fn add(&mut self, sample: ImuSample) -> bool {
        if let Some(last) = self.buf.back() {
            if sample.time <= last.time {
                return false;
            }
        }
        self.buf.push_back(sample);

        let horizon = sample.time - self.window;
        while self.buf.front().is_some_and(|s| s.time < horizon) {
            self.buf.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn at(&self, i: usize) -> &ImuSample {
        &self.buf[i]
    }

    /// Sample `i` with the current bias removed.
    pub fn debiased_at(&self, i: usize) -> ImuSample {
        self.buf[i].debiased(&self.bias)
    }

    /// Index of the first sample with timestamp strictly greater than `t`.
    pub fn find_first_after(&self, t: f64) -> Option<usize> {
        self.buf.iter().position(|s| s.time > t)
    }
}

impl Default for ImuQueue {
    fn default() -> Self {
        Self::new(ImuNoise::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn sample(t: f64) -> ImuSample {
        ImuSample::new(t, Vector3::zeros(), Vector3::zeros())
    }

    #[test]
    fn test_rejects_non_monotone() {
        let mut q = ImuQueue::default();
        assert!(q.add(sample(1.0)));
        assert!(!q.add(sample(1.0)));
        assert!(!q.add(sample(0.5)));
        assert!(q.add(sample(1.5)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_find_first_after() {
        let mut q = ImuQueue::default();
        for i in 0..5 {
            q.add(sample(i as f64));
        }

        assert_eq!(q.find_first_after(-1.0), Some(0));
        assert_eq!(q.find_first_after(1.0), Some(2));
        assert_eq!(q.find_first_after(3.5), Some(4));
        assert_eq!(q.find_first_after(4.0), None);
    }

    #[test]
    fn test_retention_window() {
        let mut q = ImuQueue::default();
        q.window = 2.0;
        for i in 0..10 {
            q.add(sample(i as f64));
        }

        // Newest is t=9, horizon t=7.
        assert!(q.buf.iter().all(|s| s.time >= 7.0));
        assert_eq!(q.len(), 3);
    }
}
