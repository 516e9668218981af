use std::f64::consts::TAU;

use nalgebra::Vector2;

use crate::config::FilterParams;

/// Sample period assumed when timestamps do not advance.
const FALLBACK_DT: f64 = 1.0 / 30.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LowPass {
    last: Option<f64>,
}

impl LowPass {
    fn apply(&mut self, value: f64, alpha: f64) -> f64 {
        let out = match self.last {
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
            None => value,
        };
        self.last = Some(out);
        out
    }
}

fn smoothing_factor(cutoff: f64, dt: f64) -> f64 {
    let tau = 1.0 / (TAU * cutoff);
    1.0 / (1.0 + tau / dt)
}

/// One-Euro filter: a low-pass whose cutoff rises with the filtered speed
/// of the signal, so slow motion is smoothed hard and fast motion lags less.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneEuroFilter {
    params: FilterParams,
    value: LowPass,
    derivative: LowPass,
    last_raw: Option<f64>,
    last_time: Option<f64>,
}

impl OneEuroFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            params,
            value: LowPass::default(),
            derivative: LowPass::default(),
            last_raw: None,
            last_time: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.params);
    }

    /// Last filtered value.
    pub fn value(&self) -> Option<f64> {
        self.value.last
    }

    /// Last derivative estimate, in units per second.
    pub fn derivative(&self) -> Option<f64> {
        self.derivative.last
    }

    pub fn filter(&mut self, value: f64, timestamp: f64) -> f64 {
        let (Some(prev_raw), Some(prev_time)) = (self.last_raw, self.last_time) else {
            self.last_raw = Some(value);
            self.last_time = Some(timestamp);
            self.derivative.apply(0.0, 1.0);
            return self.value.apply(value, 1.0);
        };

        let dt = match timestamp - prev_time {
            dt if dt > 0.0 && dt.is_finite() => dt,
            _ => FALLBACK_DT,
        };
        let raw_derivative = (value - prev_raw) / dt;
        let derivative = self
            .derivative
            .apply(raw_derivative, smoothing_factor(self.params.d_cutoff, dt));
        let cutoff = self.params.min_cutoff + self.params.beta * derivative.abs();

        self.last_raw = Some(value);
        self.last_time = Some(timestamp);
        self.value.apply(value, smoothing_factor(cutoff, dt))
    }
}

/// Independent One-Euro filters on both coordinates of a screen point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointFilter {
    x: OneEuroFilter,
    y: OneEuroFilter,
}

impl PointFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            x: OneEuroFilter::new(params),
            y: OneEuroFilter::new(params),
        }
    }

    pub fn filter(&mut self, point: Vector2<f64>, timestamp: f64) -> Vector2<f64> {
        Vector2::new(self.x.filter(point.x, timestamp), self.y.filter(point.y, timestamp))
    }

    pub fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
    }
}
