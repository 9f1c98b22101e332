//! Strided integer ranges and the trims derived from them.
//!
//! All positions are absolute, measured in root (raw waveform sample) units,
//! and ranges are half-open. A range at stride `s` holds the elements
//! `lo, lo + s, ..., hi - s`.

use super::GeometryResult;
use crate::error::GeometryError;
use burn::tensor::{backend::Backend, BasicOps, Tensor};
use std::fmt;

/// Largest multiple of `stride` that is `<= pos`.
pub fn floor_to(pos: i64, stride: i64) -> i64 {
    pos - pos.rem_euclid(stride)
}

/// Smallest multiple of `stride` that is `>= pos`.
pub fn ceil_to(pos: i64, stride: i64) -> i64 {
    let rem = pos.rem_euclid(stride);
    if rem == 0 {
        pos
    } else {
        pos + stride - rem
    }
}

fn check_aligned(pos: i64, stride: i64) -> GeometryResult<()> {
    if pos.rem_euclid(stride) != 0 {
        return Err(GeometryError::Misaligned {
            position: pos,
            stride,
        });
    }
    Ok(())
}

/// Maximal extent a range may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// No constraint on available data.
    Unbounded,
    /// Half-open `[lo, hi)` bound.
    Bounded(i64, i64),
}

impl Extent {
    /// Apply a bound-preserving map to both ends of a bounded extent.
    pub(crate) fn map(self, f: impl FnOnce(i64, i64) -> (i64, i64)) -> Self {
        match self {
            Extent::Unbounded => Extent::Unbounded,
            Extent::Bounded(lo, hi) => {
                let (lo, hi) = f(lo, hi);
                Extent::Bounded(lo, hi)
            }
        }
    }
}

/// Contiguous range of timesteps at a given stride, inside a bounding extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRange {
    full: Extent,
    sub: (i64, i64),
    stride: i64,
}

impl GridRange {
    /// Create a range, validating stride, alignment and containment.
    pub fn new(full: Extent, sub: (i64, i64), stride: i64) -> GeometryResult<Self> {
        if stride <= 0 {
            return Err(GeometryError::InvalidStride(stride));
        }
        let (lo, hi) = sub;
        if lo >= hi {
            return Err(GeometryError::EmptyRange { lo, hi });
        }
        check_aligned(lo, stride)?;
        check_aligned(hi, stride)?;
        if let Extent::Bounded(full_lo, full_hi) = full {
            check_aligned(full_lo, stride)?;
            check_aligned(full_hi, stride)?;
            if lo < full_lo || hi > full_hi {
                return Err(GeometryError::OutOfBounds {
                    lo,
                    hi,
                    full_lo,
                    full_hi,
                });
            }
        }
        Ok(Self { full, sub, stride })
    }

    /// Range with no bounding extent.
    pub fn unbounded(sub: (i64, i64), stride: i64) -> GeometryResult<Self> {
        Self::new(Extent::Unbounded, sub, stride)
    }

    /// Range inside the bounding extent `full`.
    pub fn bounded(full: (i64, i64), sub: (i64, i64), stride: i64) -> GeometryResult<Self> {
        Self::new(Extent::Bounded(full.0, full.1), sub, stride)
    }

    /// Bounding extent the range lives in.
    pub fn full(&self) -> Extent {
        self.full
    }

    /// Half-open `[lo, hi)` bounds of the requested elements.
    pub fn sub(&self) -> (i64, i64) {
        self.sub
    }

    /// Grid spacing of the elements.
    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// Number of elements in the requested sub-range.
    pub fn sub_length(&self) -> i64 {
        (self.sub.1 - self.sub.0) / self.stride
    }

    /// Width of the sub-range in absolute units.
    pub fn sub_extent(&self) -> i64 {
        self.sub.1 - self.sub.0
    }

    /// True when `other` lies within this range's sub-range at the same stride.
    pub fn contains(&self, other: &GridRange) -> bool {
        self.stride == other.stride && self.sub.0 <= other.sub.0 && other.sub.1 <= self.sub.1
    }
}

impl fmt::Display for GridRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.full {
            Extent::Unbounded => write!(f, "[{}, {}) / {}", self.sub.0, self.sub.1, self.stride),
            Extent::Bounded(lo, hi) => write!(
                f,
                "[{}, {}) in [{}, {}) / {}",
                self.sub.0, self.sub.1, lo, hi, self.stride
            ),
        }
    }
}

/// Element offsets `[start, end)` selecting a sub-slice of an over-produced tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trim {
    pub start: usize,
    pub end: usize,
}

impl Trim {
    /// Offsets of `target` inside the tensor described by `produced`.
    pub fn between(produced: &GridRange, target: &GridRange) -> GeometryResult<Self> {
        if produced.stride != target.stride {
            return Err(GeometryError::StrideMismatch {
                expected: produced.stride,
                found: target.stride,
            });
        }
        if !produced.contains(target) {
            return Err(GeometryError::OutOfBounds {
                lo: target.sub.0,
                hi: target.sub.1,
                full_lo: produced.sub.0,
                full_hi: produced.sub.1,
            });
        }
        let base = produced.sub.0;
        Ok(Self {
            start: ((target.sub.0 - base) / produced.stride) as usize,
            end: ((target.sub.1 - base) / produced.stride) as usize,
        })
    }

    /// Elements kept by the trim.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True when the trim keeps nothing.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Slice `tensor` along `dim` with these offsets.
    pub fn apply<B: Backend, const D: usize, K: BasicOps<B>>(
        &self,
        tensor: Tensor<B, D, K>,
        dim: usize,
    ) -> Tensor<B, D, K> {
        tensor.narrow(dim, self.start, self.len())
    }
}

impl fmt::Display for Trim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn alignment_helpers_handle_negative_positions() {
        assert_eq!(floor_to(-3, 4), -4);
        assert_eq!(ceil_to(-3, 4), 0);
        assert_eq!(floor_to(8, 4), 8);
        assert_eq!(ceil_to(9, 4), 12);
    }

    #[test]
    fn sub_length_counts_elements_at_stride() {
        let gr = GridRange::unbounded((-8, 16), 4).unwrap();
        assert_eq!(gr.sub_length(), 6);
        assert_eq!(gr.sub_extent(), 24);
    }

    #[test]
    fn rejects_misaligned_and_out_of_bounds_ranges() {
        assert_eq!(
            GridRange::unbounded((0, 10), 4).unwrap_err(),
            GeometryError::Misaligned {
                position: 10,
                stride: 4
            }
        );
        assert!(matches!(
            GridRange::bounded((0, 8), (0, 12), 4),
            Err(GeometryError::OutOfBounds { .. })
        ));
        assert!(matches!(
            GridRange::unbounded((4, 4), 1),
            Err(GeometryError::EmptyRange { .. })
        ));
        assert!(matches!(
            GridRange::unbounded((0, 4), 0),
            Err(GeometryError::InvalidStride(0))
        ));
    }

    #[test]
    fn trim_between_reports_element_offsets() {
        let produced = GridRange::unbounded((-6, 30), 2).unwrap();
        let target = GridRange::unbounded((0, 20), 2).unwrap();
        let trim = Trim::between(&produced, &target).unwrap();
        assert_eq!(trim, Trim { start: 3, end: 13 });
        assert!(trim.end as i64 <= produced.sub_length());

        let err = Trim::between(&target, &produced).unwrap_err();
        assert!(matches!(err, GeometryError::OutOfBounds { .. }));
    }

    #[test]
    fn trim_apply_slices_tensor() {
        let device = NdArrayDevice::default();
        let tensor = Tensor::<NdArray<f32>, 2>::from_floats([[0.0, 1.0, 2.0, 3.0, 4.0]], &device);
        let sliced = Trim { start: 1, end: 4 }.apply(tensor, 1).to_data();
        assert_eq!(sliced.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
    }
}
