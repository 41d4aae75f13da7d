/*! Align observed centroid peaks from nearby scans to a theoretical m/z ladder */
use mzpeaks::prelude::*;
use mzpeaks::{CentroidPeak, MZPeakSetType, Tolerance};

use crate::stats::nanmean_columns;

/// The maximum mass error between a theoretical m/z and the observed peak assigned to it
pub const ALIGNMENT_TOLERANCE: Tolerance = Tolerance::PPM(10.0);

/// Find the observed peak closest to `mz` by binary search, accepting it only if it
/// is within `error_tolerance` of `mz`.
///
/// Only the two peaks bracketing the insertion point of `mz` are considered. When both
/// are equally close, the lower m/z peak wins.
pub fn nearest_peak(
    peaks: &[CentroidPeak],
    mz: f64,
    error_tolerance: Tolerance,
) -> Option<&CentroidPeak> {
    let index = peaks.partition_point(|p| p.mz() < mz).max(1);
    let end = (index + 1).min(peaks.len());
    peaks
        .get(index - 1..end)?
        .iter()
        .min_by(|a, b| (a.mz() - mz).abs().total_cmp(&(b.mz() - mz).abs()))
        .filter(|p| error_tolerance.test(p.mz(), mz))
}

/// Observed intensities and m/z errors aligned index-for-index with a theoretical m/z ladder.
///
/// A missing observation is `NaN` in both vectors. The error is the theoretical m/z minus
/// the observed m/z.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AlignedSignal {
    pub intensity: Vec<f64>,
    pub mz_err: Vec<f64>,
}

impl AlignedSignal {
    pub fn len(&self) -> usize {
        self.intensity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty()
    }
}

/// Align a single scan's peaks to `ladder`
pub fn align_scan(peaks: &[CentroidPeak], ladder: &[f64], error_tolerance: Tolerance) -> AlignedSignal {
    let (intensity, mz_err) = ladder
        .iter()
        .map(|mz| match nearest_peak(peaks, *mz, error_tolerance) {
            Some(peak) => (peak.intensity() as f64, mz - peak.mz()),
            None => (f64::NAN, f64::NAN),
        })
        .unzip();
    AlignedSignal { intensity, mz_err }
}

/// Align every scan's peaks to `ladder` and average the results across scans, ignoring
/// missing values. A ladder position missing from every scan stays missing.
pub fn align_scans<'a, I>(scans: I, ladder: &[f64]) -> AlignedSignal
where
    I: IntoIterator<Item = &'a MZPeakSetType<CentroidPeak>>,
{
    let (intensities, errors): (Vec<_>, Vec<_>) = scans
        .into_iter()
        .map(|scan| {
            let aligned = align_scan(scan.as_slice(), ladder, ALIGNMENT_TOLERANCE);
            (aligned.intensity, aligned.mz_err)
        })
        .unzip();
    AlignedSignal {
        intensity: nanmean_columns(&intensities, ladder.len()),
        mz_err: nanmean_columns(&errors, ladder.len()),
    }
}
