use std::collections::VecDeque;

/// Sliding-window mean for driver steering torque
pub struct TorqueSmoother {
    window: VecDeque<f64>,
    window_size: usize,
    sum: f64,
}

impl TorqueSmoother {
    /// Create a new smoother; a window of 0 behaves like 1 (no smoothing)
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        TorqueSmoother {
            window: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
        }
    }

    /// Push a raw torque sample and return the mean of the current window
    pub fn apply(&mut self, torque: f64) -> f64 {
        self.window.push_back(torque);
        self.sum += torque;

        while self.window.len() > self.window_size {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }

        // Recompute once the window is full to keep float drift bounded
        if self.window.len() == self.window_size {
            self.sum = self.window.iter().sum();
        }

        self.sum / self.window.len() as f64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
