/// Running weighted average
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.avg(), 0.0);
        meter.update(1.0, 1);
        meter.update(4.0, 3);
        assert!((meter.avg() - 3.25).abs() < 1e-12);
        meter.reset();
        assert_eq!(meter.count(), 0);
    }
}
