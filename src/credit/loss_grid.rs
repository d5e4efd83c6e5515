//! Discretized loss axis and the conditional-independence recursion.
//!
//! For a fixed factor realization names are independent, so the distribution of the
//! portfolio loss is built by adding one name at a time:
//!
//! `new[k] = p[k] * stay + sum_b q_b * p[k - s_b]`
//!
//! where each branch `b` (default, prepayment, a recovery node) moves mass by `s_b` grid
//! units with probability `q_b`. Shifts that are not whole numbers of units are split
//! between the two neighbouring nodes in proportion to their distance, which preserves the
//! conditional mean exactly; this split is the only discretization error of the scheme.
//!
//! The working buffer is wide enough for every long shift above the top level and every
//! short shift below zero, so no mass is clamped while names are added. Clamping (negative
//! losses to zero, losses above the top level to the top) happens once in
//! [`RecursionBuffer::fold_into`]. Because convolution commutes, the result does not depend
//! on the order in which names are added.

use crate::core::{CreditError, Result};

/// Shifts closer than this to a whole number of units are treated as exact.
pub const SNAP_TOLERANCE: f64 = 1.0e-9;

/// Loss axis: level `k` represents the amount `k * unit`, for `k` in `0..=top`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossGrid {
    pub unit: f64,
    pub top: usize,
}

impl LossGrid {
    /// `grid_size` equal steps over `[0, total]`.
    pub fn fixed(total: f64, grid_size: usize) -> Result<Self> {
        if grid_size == 0 {
            return Err(CreditError::invalid("loss grid size must be >= 1"));
        }
        if !total.is_finite() || total <= 0.0 {
            return Err(CreditError::invalid(format!(
                "loss grid needs a positive total amount, got {total}"
            )));
        }
        Ok(Self {
            unit: total / grid_size as f64,
            top: grid_size,
        })
    }

    /// Largest unit (at most `max_levels` steps over `[0, total]`) of which every amount
    /// is a whole multiple, if one exists among `min(amounts) / k` for small `k`.
    pub fn aligned(amounts: &[f64], total: f64, max_levels: usize) -> Option<Self> {
        let base = amounts
            .iter()
            .copied()
            .filter(|a| *a > 0.0 && a.is_finite())
            .reduce(f64::min)?;
        if !total.is_finite() || total <= 0.0 {
            return None;
        }
        for k in 1..=256_usize {
            let unit = base / k as f64;
            let levels = total / unit;
            if levels > max_levels as f64 + SNAP_TOLERANCE {
                return None;
            }
            let exact = amounts.iter().all(|&a| {
                let q = a / unit;
                (q - q.round()).abs() <= SNAP_TOLERANCE * q.abs().max(1.0)
            });
            if exact {
                return Some(Self {
                    unit,
                    top: snapped_ceil(levels),
                });
            }
        }
        None
    }

    /// Aligned grid when possible, otherwise the fixed grid.
    pub fn select(amounts: &[f64], total: f64, grid_size: usize, adaptive: bool) -> Result<Self> {
        if adaptive && let Some(grid) = Self::aligned(amounts, total, grid_size) {
            return Ok(grid);
        }
        Self::fixed(total, grid_size)
    }

    /// Number of grid units in `amount`.
    #[inline]
    pub fn units(&self, amount: f64) -> f64 {
        amount / self.unit
    }

    pub fn width(&self) -> usize {
        self.top + 1
    }
}

#[inline]
fn snapped_ceil(x: f64) -> usize {
    let r = x.round();
    if (x - r).abs() <= SNAP_TOLERANCE * x.abs().max(1.0) {
        r.max(0.0) as usize
    } else {
        x.ceil().max(0.0) as usize
    }
}

/// Lower node and weight on the upper node for a shift of `s` units.
#[inline]
pub fn split_shift(s: f64) -> (isize, f64) {
    let lo = s.floor();
    let frac = s - lo;
    if frac <= SNAP_TOLERANCE {
        (lo as isize, 0.0)
    } else if frac >= 1.0 - SNAP_TOLERANCE {
        (lo as isize + 1, 0.0)
    } else {
        (lo as isize, frac)
    }
}

/// Adds `mass` at `units` grid units to `pmf`, splitting between neighbours and clamping
/// into `0..pmf.len()`.
#[inline]
pub fn deposit(pmf: &mut [f64], units: f64, mass: f64) {
    let last = pmf.len() as isize - 1;
    let (k, frac) = split_shift(units);
    let lo = k.clamp(0, last) as usize;
    pmf[lo] += mass * (1.0 - frac);
    if frac > 0.0 {
        let hi = (k + 1).clamp(0, last) as usize;
        pmf[hi] += mass * frac;
    }
}

/// Per-name outcome for one recursion step: probability mass that does not move, plus
/// branches `(probability, shift in units)`.
#[derive(Debug, Clone, Default)]
pub struct NameStep {
    pub stay: f64,
    pub branches: Vec<(f64, f64)>,
}

impl NameStep {
    pub fn clear(&mut self) {
        self.stay = 1.0;
        self.branches.clear();
    }

    /// A deterministic move by `shift` units.
    pub fn certain(&mut self, shift: f64) {
        self.stay = 0.0;
        self.branches.clear();
        self.branches.push((1.0, shift));
    }

    pub fn push(&mut self, prob: f64, shift: f64) {
        if prob > 0.0 {
            self.stay -= prob;
            self.branches.push((prob, shift));
        }
    }
}

/// Scratch state for one recursion; owned by a single worker.
#[derive(Debug, Clone)]
pub struct RecursionBuffer {
    buf: Vec<f64>,
    tmp: Vec<f64>,
    /// Buffer index of level zero.
    offset: usize,
    lo: usize,
    hi: usize,
    prepared: Vec<(f64, isize, f64)>,
}

impl RecursionBuffer {
    /// `below` levels of room under zero and `above` levels over zero.
    pub fn new(below: usize, above: usize) -> Self {
        let len = below + above + 1;
        let mut out = Self {
            buf: vec![0.0; len],
            tmp: vec![0.0; len],
            offset: below,
            lo: below,
            hi: below,
            prepared: Vec::new(),
        };
        out.reset();
        out
    }

    /// Sizes a buffer for names whose absolute shifts are bounded by `max_shifts`
    /// (negative bounds for short names).
    pub fn for_shifts(max_shifts: impl IntoIterator<Item = f64>) -> Self {
        let (mut below, mut above) = (0_usize, 0_usize);
        for s in max_shifts {
            let room = s.abs().ceil() as usize + 1;
            if s < 0.0 {
                below += room;
            } else {
                above += room;
            }
        }
        Self::new(below, above)
    }

    /// Point mass at zero loss.
    pub fn reset(&mut self) {
        self.buf[self.lo..=self.hi].iter_mut().for_each(|v| *v = 0.0);
        self.lo = self.offset;
        self.hi = self.offset;
        self.buf[self.offset] = 1.0;
    }

    /// Convolves the current distribution with one name's outcome.
    pub fn add_name(&mut self, step: &NameStep) {
        if step.branches.is_empty() {
            return;
        }
        let last = self.buf.len() as isize - 1;
        self.prepared.clear();
        let mut min_k = 0_isize;
        let mut max_k = 0_isize;
        for &(q, s) in &step.branches {
            let (k, frac) = split_shift(s);
            min_k = min_k.min(k);
            max_k = max_k.max(if frac > 0.0 { k + 1 } else { k });
            self.prepared.push((q, k, frac));
        }
        let stay = step.stay.max(0.0);

        let new_lo = (self.lo as isize + min_k).clamp(0, last) as usize;
        let new_hi = (self.hi as isize + max_k).clamp(0, last) as usize;
        self.tmp[new_lo..=new_hi].iter_mut().for_each(|v| *v = 0.0);

        for i in self.lo..=self.hi {
            let p = self.buf[i];
            if p == 0.0 {
                continue;
            }
            self.tmp[i] += p * stay;
            for &(q, k, frac) in &self.prepared {
                let mass = p * q;
                let j = (i as isize + k).clamp(0, last) as usize;
                if frac > 0.0 {
                    self.tmp[j] += mass * (1.0 - frac);
                    let j1 = (i as isize + k + 1).clamp(0, last) as usize;
                    self.tmp[j1] += mass * frac;
                } else {
                    self.tmp[j] += mass;
                }
            }
        }

        self.buf[self.lo..=self.hi].iter_mut().for_each(|v| *v = 0.0);
        std::mem::swap(&mut self.buf, &mut self.tmp);
        self.lo = new_lo;
        self.hi = new_hi;
    }

    /// Adds the distribution, folded onto levels `0..=top`, into `out` (length `top + 1`).
    pub fn fold_into(&self, out: &mut [f64]) {
        let top = out.len() as isize - 1;
        for i in self.lo..=self.hi {
            let p = self.buf[i];
            if p != 0.0 {
                let level = (i as isize - self.offset as isize).clamp(0, top) as usize;
                out[level] += p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn default_step(d: f64, shift: f64) -> NameStep {
        let mut s = NameStep::default();
        s.clear();
        s.push(d, shift);
        s
    }

    fn run(steps: &[NameStep], top: usize) -> Vec<f64> {
        let mut buf = RecursionBuffer::for_shifts(
            steps
                .iter()
                .map(|s| s.branches.iter().map(|b| b.1).fold(0.0, |a: f64, b| if b.abs() > a.abs() { b } else { a })),
        );
        buf.reset();
        for s in steps {
            buf.add_name(s);
        }
        let mut out = vec![0.0; top + 1];
        buf.fold_into(&mut out);
        out
    }

    #[test]
    fn aligned_grid_finds_common_unit() {
        let g = LossGrid::aligned(&[0.6, 0.65, 1.2], 10.0, 500).unwrap();
        assert_relative_eq!(g.unit, 0.05, epsilon = 1e-15);
        assert_eq!(g.top, 200);
        assert!(LossGrid::aligned(&[0.6, 0.65], 100.0, 500).is_none());
        let fallback = LossGrid::select(&[0.6, 0.65], 100.0, 500, true).unwrap();
        assert_relative_eq!(fallback.unit, 0.2, epsilon = 1e-15);
    }

    #[test]
    fn binomial_recovered_for_identical_names() {
        let steps = vec![default_step(0.3, 1.0); 4];
        let pmf = run(&steps, 4);
        let expected = [0.2401, 0.4116, 0.2646, 0.0756, 0.0081];
        for (a, b) in pmf.iter().zip(expected) {
            assert_relative_eq!(*a, b, epsilon = 1e-15);
        }
    }

    #[test]
    fn fractional_shifts_preserve_the_mean() {
        let steps = vec![default_step(0.2, 2.5), default_step(0.4, 1.25), default_step(0.1, 3.0)];
        let pmf = run(&steps, 10);
        let mean = pmf.iter().enumerate().map(|(k, p)| k as f64 * p).sum::<f64>();
        assert_relative_eq!(mean, 0.2 * 2.5 + 0.4 * 1.25 + 0.1 * 3.0, epsilon = 1e-14);
        assert_relative_eq!(pmf.iter().sum::<f64>(), 1.0, epsilon = 1e-15);
    }

    #[test]
    fn shorts_are_order_independent_and_never_negative() {
        let long = default_step(0.5, 2.0);
        let short = default_step(0.5, -3.0);
        let a = run(&[long.clone(), short.clone()], 4);
        let b = run(&[short, long], 4);
        assert_eq!(a, b);
        // Outcomes: 0 (0.25), +2 (0.25), -3 (0.25), -1 (0.25).
        assert_relative_eq!(a[0], 0.75, epsilon = 1e-15);
        assert_relative_eq!(a[2], 0.25, epsilon = 1e-15);
    }

    #[test]
    fn mass_beyond_the_top_folds_into_it() {
        let steps = vec![default_step(1.0, 3.4), default_step(1.0, 3.4)];
        let pmf = run(&steps, 6);
        assert_relative_eq!(pmf[6], 1.0, epsilon = 1e-15);
    }

    #[test]
    fn deterministic_shift_is_a_point_mass() {
        let mut step = NameStep::default();
        step.certain(5.0);
        let pmf = run(&[step], 8);
        assert_eq!(pmf[5], 1.0);
    }
}
