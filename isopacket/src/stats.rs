//! Missing-value aware numeric helpers. `NaN` marks a missing value throughout the crate.

/// Sum the finite values, ignoring `NaN`
pub fn nansum(values: &[f64]) -> f64 {
    values.iter().filter(|v| !v.is_nan()).sum()
}

/// The mean of the non-`NaN` values, or `NaN` if there are none
pub fn nanmean(values: &[f64]) -> f64 {
    let (total, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(total, count), v| (total + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        total / count as f64
    }
}

/// The `q`-th quantile of the non-`NaN` values using linear interpolation between
/// the closest ranks, or `NaN` if there are none
pub fn nanquantile(values: &[f64], q: f64) -> f64 {
    let mut present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if present.is_empty() {
        return f64::NAN;
    }
    present.sort_by(|a, b| a.total_cmp(b));
    let position = q.clamp(0.0, 1.0) * (present.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let frac = position - lower as f64;
    present[lower] + (present[upper] - present[lower]) * frac
}

/// Piecewise linear interpolation of `x` over the increasing points `xp` with values `fp`,
/// clamped to the end values outside of `xp`.
///
/// # Panics
/// If `xp` is empty or `xp` and `fp` differ in length.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    assert_eq!(xp.len(), fp.len());
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let j = xp.partition_point(|v| *v <= x) - 1;
    let slope = (fp[j + 1] - fp[j]) / (xp[j + 1] - xp[j]);
    fp[j] + slope * (x - xp[j])
}

/// Full discrete convolution of two sequences
pub fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Column-wise mean of equal length rows, ignoring `NaN`
pub fn nanmean_columns<R: AsRef<[f64]>>(rows: &[R], width: usize) -> Vec<f64> {
    (0..width)
        .map(|i| {
            let column: Vec<f64> = rows
                .iter()
                .map(|row| row.as_ref().get(i).copied().unwrap_or(f64::NAN))
                .collect();
            nanmean(&column)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nan_reductions() {
        let values = [1.0, f64::NAN, 3.0];
        assert_eq!(nansum(&values), 4.0);
        assert_eq!(nanmean(&values), 2.0);
        assert!(nanmean(&[f64::NAN, f64::NAN]).is_nan());
        assert_eq!(nansum(&[f64::NAN]), 0.0);
    }

    #[test]
    fn test_nanquantile() {
        let values = [1.0, 2.0, 3.0, 4.0, f64::NAN, 5.0];
        assert!((nanquantile(&values, 0.9) - 4.6).abs() < 1e-12);
        assert_eq!(nanquantile(&values, 0.5), 3.0);
        assert_eq!(nanquantile(&values, 1.0), 5.0);
        assert_eq!(nanquantile(&[7.0], 0.9), 7.0);
        assert!(nanquantile(&[f64::NAN], 0.9).is_nan());
    }

    #[test]
    fn test_interp() {
        let xp = [0.0, 2.0, 4.0];
        let fp = [0.0, 1.0, 0.0];
        assert_eq!(interp(1.0, &xp, &fp), 0.5);
        assert_eq!(interp(3.0, &xp, &fp), 0.5);
        assert_eq!(interp(2.0, &xp, &fp), 1.0);
        assert_eq!(interp(-1.0, &xp, &fp), 0.0);
        assert_eq!(interp(5.0, &xp, &fp), 0.0);
        assert_eq!(interp(5.0, &[1.0], &[0.25]), 0.25);
    }

    #[test]
    fn test_convolve() {
        assert_eq!(convolve(&[1.0, 2.0], &[0.5, 0.25, 0.25]), vec![0.5, 1.25, 0.75, 0.5]);
        assert!(convolve(&[], &[1.0]).is_empty());
    }

    #[test]
    fn test_nanmean_columns() {
        let rows = vec![vec![1.0, f64::NAN], vec![3.0, f64::NAN]];
        let means = nanmean_columns(&rows, 2);
        assert_eq!(means[0], 2.0);
        assert!(means[1].is_nan());
    }
}
