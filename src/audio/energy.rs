use std::collections::VecDeque;

/// Loudness of one analysis chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyFrame {
    /// RMS of the chunk.
    pub rms: f32,
    /// Running mean of the RMS over the last `k` chunks, this one included.
    pub smoothed: f32,
}

/// Calculate RMS (Root Mean Square) energy of normalized samples.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let s = s as f64;
            s * s
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Turns a stream of fixed-size chunks into smoothed loudness values.
#[derive(Debug, Clone)]
pub struct EnergyAnalyzer {
    window: VecDeque<f32>,
    size: usize,
    sum: f64,
}

impl EnergyAnalyzer {
    /// `window` is the number of chunks averaged; zero is treated as one.
    pub fn new(window: usize) -> Self {
        let size = window.max(1);
        Self {
            window: VecDeque::with_capacity(size),
            size,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, chunk: &[f32]) -> EnergyFrame {
        let rms = calculate_rms(chunk);

        if self.window.len() == self.size {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest as f64;
            }
        }
        self.window.push_back(rms);
        self.sum += rms as f64;

        EnergyFrame {
            rms,
            smoothed: (self.sum / self.window.len() as f64).max(0.0) as f32,
        }
    }

    /// Analyze a whole sequence of chunks.
    pub fn analyze<'a, I>(window: usize, chunks: I) -> Vec<EnergyFrame>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut analyzer = Self::new(window);
        chunks.into_iter().map(|c| analyzer.push(c)).collect()
    }
}
