// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Candidate receptive-field grids.
//!
//! A grid is the Cartesian product of three 1-D subdivisions (x, y, size). The
//! flat candidate index is row-major over `(x, y, size)`:
//! `index = ix * (ny * ns) + iy * ns + is`. Every place that turns a winning
//! flat index back into coordinates relies on that order.

use crate::error::{FwrfError, FwrfResult};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Range;

const EDGE_EPSILON: f64 = 1e-12;

/// Rule used to place `count` coordinates along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subdivision {
    /// `count` copies of the center.
    Constant { count: usize },
    /// Evenly spaced values. With `right_bound` the values span
    /// `[center, center + width]`; otherwise `count` cells of width
    /// `width / count` are centered on `center` and their midpoints returned.
    Linear { count: usize, right_bound: bool },
    /// Evenly spaced in log space between `start` and `stop`.
    Log { count: usize },
}

impl Subdivision {
    pub fn constant(count: usize) -> Self {
        Subdivision::Constant { count }
    }

    pub fn linear(count: usize) -> Self {
        Subdivision::Linear {
            count,
            right_bound: false,
        }
    }

    pub fn linear_right_bound(count: usize) -> Self {
        Subdivision::Linear {
            count,
            right_bound: true,
        }
    }

    pub fn log(count: usize) -> Self {
        Subdivision::Log { count }
    }

    /// Number of values produced. Degenerate counts collapse to one value.
    pub fn len(&self) -> usize {
        let count = match self {
            Subdivision::Constant { count }
            | Subdivision::Linear { count, .. }
            | Subdivision::Log { count } => *count,
        };
        count.max(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Subdivides one axis. Linear rules read `(center, width)`, the log rule
    /// reads `(start, stop)`.
    pub fn subdivide(&self, a: f32, b: f32) -> Vec<f32> {
        let n = self.len();
        match *self {
            Subdivision::Constant { .. } => vec![a; n],
            Subdivision::Linear { .. } | Subdivision::Log { .. } if n <= 1 => vec![a],
            Subdivision::Linear { right_bound, .. } => {
                let (center, width) = (f64::from(a), f64::from(b));
                let (start, step) = if right_bound {
                    (center, width / (n - 1) as f64)
                } else {
                    let step = width / n as f64;
                    (center + (step - width) / 2.0, step)
                };
                progression(start, step, n)
                    .map(|v| v as f32)
                    .collect()
            }
            Subdivision::Log { .. } => {
                let lstart = (f64::from(a) + EDGE_EPSILON).ln();
                let lstop = (f64::from(b) + EDGE_EPSILON).ln();
                let step = (lstop - lstart) / (n - 1) as f64;
                progression(lstart, step, n)
                    .map(|v| v.exp() as f32)
                    .collect()
            }
        }
    }
}

// Values are generated as `start + k * step` rather than by repeated addition so
// the last value lands on the right edge up to a single rounding.
fn progression(start: f64, step: f64, count: usize) -> impl Iterator<Item = f64> {
    (0..count).map(move |k| start + k as f64 * step)
}

/// Bounding box of the candidate search for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub center_x: f32,
    pub center_y: f32,
    pub center_size: f32,
    pub width_x: f32,
    pub width_y: f32,
    pub width_size: f32,
}

impl ModelSpec {
    pub fn new(center: [f32; 3], width: [f32; 3]) -> Self {
        Self {
            center_x: center[0],
            center_y: center[1],
            center_size: center[2],
            width_x: width[0],
            width_y: width[1],
            width_size: width[2],
        }
    }
}

/// Axis lengths of a candidate grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub nx: usize,
    pub ny: usize,
    pub ns: usize,
}

impl GridShape {
    pub fn new(nx: usize, ny: usize, ns: usize) -> Self {
        Self { nx, ny, ns }
    }

    /// Total candidate count `nx * ny * ns`.
    pub fn count(&self) -> usize {
        self.nx * self.ny * self.ns
    }

    pub fn ravel(&self, ix: usize, iy: usize, is: usize) -> usize {
        ix * (self.ny * self.ns) + iy * self.ns + is
    }

    pub fn unravel(&self, flat: usize) -> FwrfResult<(usize, usize, usize)> {
        if flat >= self.count() {
            return Err(FwrfError::CandidateOutOfRange {
                index: flat,
                candidates: self.count(),
            });
        }
        let plane = self.ny * self.ns;
        Ok((flat / plane, (flat % plane) / self.ns, flat % self.ns))
    }
}

/// Discretised RF parameter space for one or more units.
///
/// A shared grid has a single unit whose candidates are searched by every
/// voxel; a per-unit grid carries one bounding box per voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGrid {
    shape: GridShape,
    rx: Array2<f32>,
    ry: Array2<f32>,
    rs: Array2<f32>,
}

impl CandidateGrid {
    /// Builds the grid searched by every voxel.
    pub fn shared(spec: &ModelSpec, rules: [Subdivision; 3]) -> FwrfResult<Self> {
        Self::per_unit(std::slice::from_ref(spec), rules)
    }

    /// Builds one grid per unit, all with the same axis lengths.
    pub fn per_unit(specs: &[ModelSpec], rules: [Subdivision; 3]) -> FwrfResult<Self> {
        if specs.is_empty() {
            return Err(FwrfError::EmptyGrid);
        }
        let [rule_x, rule_y, rule_s] = rules;
        let shape = GridShape::new(rule_x.len(), rule_y.len(), rule_s.len());
        let units = specs.len();
        let mut rx = Array2::zeros((units, shape.nx));
        let mut ry = Array2::zeros((units, shape.ny));
        let mut rs = Array2::zeros((units, shape.ns));
        for (u, spec) in specs.iter().enumerate() {
            let xs = rule_x.subdivide(spec.center_x, spec.width_x);
            let ys = rule_y.subdivide(spec.center_y, spec.width_y);
            let ss = rule_s.subdivide(spec.center_size, spec.width_size);
            for (dst, src) in rx.row_mut(u).iter_mut().zip(xs) {
                *dst = src;
            }
            for (dst, src) in ry.row_mut(u).iter_mut().zip(ys) {
                *dst = src;
            }
            for (dst, src) in rs.row_mut(u).iter_mut().zip(ss) {
                *dst = src;
            }
        }
        Ok(Self { shape, rx, ry, rs })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Number of units described by the grid (1 for a shared grid).
    pub fn units(&self) -> usize {
        self.rx.nrows()
    }

    pub fn is_shared(&self) -> bool {
        self.units() == 1
    }

    /// Candidate count per unit.
    pub fn len(&self) -> usize {
        self.shape.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-axis coordinate values for `unit`.
    pub fn axes(&self, unit: usize) -> (ArrayView1<'_, f32>, ArrayView1<'_, f32>, ArrayView1<'_, f32>) {
        (self.rx.row(unit), self.ry.row(unit), self.rs.row(unit))
    }

    /// Absolute `(x, y, size)` of candidate `flat` for `unit`.
    pub fn candidate(&self, unit: usize, flat: usize) -> FwrfResult<[f32; 3]> {
        if unit >= self.units() {
            return Err(FwrfError::UnitCountMismatch {
                grid: self.units(),
                requested: unit + 1,
            });
        }
        let (ix, iy, is) = self.shape.unravel(flat)?;
        Ok([
            self.rx[[unit, ix]],
            self.ry[[unit, iy]],
            self.rs[[unit, is]],
        ])
    }

    /// Flattened candidate coordinates for a block of units and candidates,
    /// each shaped `(units.len(), candidates.len())`.
    pub fn candidate_block(
        &self,
        units: Range<usize>,
        candidates: Range<usize>,
    ) -> FwrfResult<(Array2<f32>, Array2<f32>, Array2<f32>)> {
        if units.end > self.units() {
            return Err(FwrfError::UnitCountMismatch {
                grid: self.units(),
                requested: units.end,
            });
        }
        if candidates.end > self.len() {
            return Err(FwrfError::CandidateOutOfRange {
                index: candidates.end.saturating_sub(1),
                candidates: self.len(),
            });
        }
        let dims = (units.len(), candidates.len());
        let mut xs = Array2::zeros(dims);
        let mut ys = Array2::zeros(dims);
        let mut ss = Array2::zeros(dims);
        for (row, unit) in units.enumerate() {
            for (col, flat) in candidates.clone().enumerate() {
                let [x, y, s] = self.candidate(unit, flat)?;
                xs[[row, col]] = x;
                ys[[row, col]] = y;
                ss[[row, col]] = s;
            }
        }
        Ok((xs, ys, ss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn single_point_subdivisions_return_anchor() {
        for width in [0.0f32, 1.0, 17.5, -3.0] {
            assert_eq!(Subdivision::linear(1).subdivide(2.5, width), vec![2.5]);
            assert_eq!(Subdivision::linear_right_bound(0).subdivide(2.5, width), vec![2.5]);
            assert_eq!(Subdivision::log(1).subdivide(0.7, width), vec![0.7]);
        }
    }

    #[test]
    fn right_bound_includes_both_edges() {
        let values = Subdivision::linear_right_bound(5).subdivide(1.0, 2.0);
        assert_eq!(values.len(), 5);
        assert_abs_diff_eq!(values[0], 1.0);
        assert_abs_diff_eq!(values[4], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1] - values[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn centered_linear_uses_cell_midpoints() {
        let values = Subdivision::linear(4).subdivide(0.0, 8.0);
        assert_eq!(values, vec![-3.0, -1.0, 1.0, 3.0]);
    }

    #[test]
    fn log_spacing_is_geometric() {
        let values = Subdivision::log(3).subdivide(1.0, 100.0);
        assert_eq!(values.len(), 3);
        assert_abs_diff_eq!(values[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[1], 10.0, epsilon = 1e-3);
        assert_abs_diff_eq!(values[2], 100.0, epsilon = 1e-2);
    }

    #[test]
    fn ravel_unravel_round_trip() {
        let shape = GridShape::new(3, 4, 2);
        for ix in 0..3 {
            for iy in 0..4 {
                for is in 0..2 {
                    let flat = shape.ravel(ix, iy, is);
                    assert_eq!(shape.unravel(flat).unwrap(), (ix, iy, is));
                }
            }
        }
        assert!(shape.unravel(24).is_err());
    }

    #[test]
    fn shared_grid_order_is_row_major() {
        let spec = ModelSpec::new([0.0, 0.0, 1.0], [4.0, 4.0, 4.0]);
        let grid = CandidateGrid::shared(
            &spec,
            [
                Subdivision::linear(2),
                Subdivision::linear(2),
                Subdivision::log(2),
            ],
        )
        .unwrap();
        assert_eq!(grid.len(), 8);
        assert!(grid.is_shared());
        let (xs, ys, ss) = grid.candidate_block(0..1, 0..8).unwrap();
        assert_eq!(xs.row(0).to_vec(), vec![-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(ys.row(0).to_vec(), vec![-1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(ss[[0, 0]], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(ss[[0, 1]], 4.0, epsilon = 1e-5);
    }

    #[test]
    fn empty_spec_list_is_rejected() {
        let rules = [Subdivision::linear(2); 3];
        assert!(matches!(
            CandidateGrid::per_unit(&[], rules),
            Err(FwrfError::EmptyGrid)
        ));
    }
}
