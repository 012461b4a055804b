/// Exponentially weighted moving average.
///
/// Starts from zero rather than from the first observation, so early
/// readings are damped towards "no pressure".
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ewma {
    alpha: f64,
    value: f64,
}

impl Ewma {
    pub(crate) fn new(alpha: f64) -> Self {
        Self { alpha, value: 0.0 }
    }

    /// `value = alpha * raw + (1 - alpha) * value`
    pub(crate) fn update(&mut self, raw: f64) -> f64 {
        self.value = self.alpha * raw + (1.0 - self.alpha) * self.value;
        self.value
    }

    pub(crate) fn value(&self) -> f64 {
        self.value
    }
}
