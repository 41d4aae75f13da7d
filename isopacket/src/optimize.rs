/*! Bounded local and global minimization of model loss functions.

[`nelder_mead`] is a derivative free simplex minimizer which keeps every trial point inside
a box. [`basin_hopping`] repeatedly perturbs the best local minimum found so far with a
model-specific step proposer, re-minimizes, and accepts or rejects the result with the
Metropolis criterion.
*/
use rand::Rng;
use tracing::trace;

/// Parameters controlling [`basin_hopping`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct BasinHoppingParams {
    /// The number of hops after the initial local minimization
    pub niter: usize,
    /// The Metropolis temperature. Higher values accept larger increases in loss.
    pub temperature: f64,
    /// The initial step size passed to the step proposer
    pub stepsize: f64,
    /// The number of hops between step size updates
    pub interval: usize,
    /// The acceptance rate the step size is adapted towards
    pub target_accept_rate: f64,
    /// The factor the step size is scaled by on each update
    pub stepwise_factor: f64,
    /// The local minimizer's settings
    pub local: NelderMeadParams,
}

impl Default for BasinHoppingParams {
    fn default() -> Self {
        Self {
            niter: 100,
            temperature: 2.0,
            stepsize: 0.5,
            interval: 50,
            target_accept_rate: 0.5,
            stepwise_factor: 0.9,
            local: NelderMeadParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NelderMeadParams {
    /// The maximum number of iterations per dimension
    pub max_iter_per_dim: usize,
    /// Convergence threshold on the spread of the simplex vertices
    pub xatol: f64,
    /// Convergence threshold on the spread of the objective over the simplex
    pub fatol: f64,
}

impl Default for NelderMeadParams {
    fn default() -> Self {
        Self {
            max_iter_per_dim: 400,
            xatol: 1e-10,
            fatol: 1e-12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub fun: f64,
    /// The number of objective function evaluations
    pub nfev: usize,
    /// The number of iterations, or hops for [`basin_hopping`]
    pub nit: usize,
    /// The number of accepted hops for [`basin_hopping`]
    pub naccepted: usize,
}

/// Clamp each coordinate of `x` into its `(lower, upper)` bound
pub fn clip(x: &mut [f64], bounds: &[(f64, f64)]) {
    for (v, (lo, hi)) in x.iter_mut().zip(bounds) {
        *v = v.clamp(*lo, *hi);
    }
}

/// Treat `NaN` as the worst possible value so it never wins a comparison
#[inline]
fn finite_or_worst(f: f64) -> f64 {
    if f.is_nan() {
        f64::INFINITY
    } else {
        f
    }
}

/// Minimize `f` starting from `x0` with the Nelder-Mead simplex method, keeping every
/// evaluated point within `bounds`.
///
/// The initial simplex displaces each coordinate of `x0` by 5% (or 0.00025 for zero
/// coordinates), reflecting displacements that leave the box back inside it.
pub fn nelder_mead<F: FnMut(&[f64]) -> f64>(
    mut f: F,
    x0: &[f64],
    bounds: &[(f64, f64)],
    params: &NelderMeadParams,
) -> OptimizeResult {
    const RHO: f64 = 1.0;
    const CHI: f64 = 2.0;
    const PSI: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let n = x0.len();
    let max_iter = params.max_iter_per_dim * n.max(1);
    let mut nfev = 0usize;
    let mut eval = |x: &[f64]| {
        nfev += 1;
        finite_or_worst(f(x))
    };

    let mut start = x0.to_vec();
    clip(&mut start, bounds);

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(start.clone());
    for i in 0..n {
        let mut y = start.clone();
        let delta = if y[i] != 0.0 { 0.05 * y[i] } else { 0.00025 };
        y[i] += delta;
        if let Some((lo, hi)) = bounds.get(i) {
            if y[i] > *hi || y[i] < *lo {
                y[i] = start[i] - delta;
            }
        }
        clip(&mut y, bounds);
        simplex.push(y);
    }
    let mut values: Vec<f64> = simplex.iter().map(|x| eval(x)).collect();

    let mut nit = 0;
    while nit < max_iter {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
        simplex = order.iter().map(|i| simplex[*i].clone()).collect();
        values = order.iter().map(|i| values[*i]).collect();

        let x_spread = simplex[1..]
            .iter()
            .flat_map(|x| x.iter().zip(simplex[0].iter()).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        let f_spread = values[1..]
            .iter()
            .map(|v| (v - values[0]).abs())
            .fold(0.0, f64::max);
        if x_spread <= params.xatol && (f_spread <= params.fatol || f_spread.is_nan()) {
            break;
        }
        nit += 1;

        let centroid: Vec<f64> = (0..n)
            .map(|j| simplex[..n].iter().map(|x| x[j]).sum::<f64>() / n as f64)
            .collect();
        let worst = &simplex[n];
        let point = |scale: f64| -> Vec<f64> {
            let mut p: Vec<f64> = centroid
                .iter()
                .zip(worst.iter())
                .map(|(c, w)| c + scale * (c - w))
                .collect();
            clip(&mut p, bounds);
            p
        };

        let xr = point(RHO);
        let fr = eval(&xr);
        let mut shrink = false;
        if fr < values[0] {
            let xe = point(RHO * CHI);
            let fe = eval(&xe);
            if fe < fr {
                simplex[n] = xe;
                values[n] = fe;
            } else {
                simplex[n] = xr;
                values[n] = fr;
            }
        } else if fr < values[n - 1] {
            simplex[n] = xr;
            values[n] = fr;
        } else if fr < values[n] {
            let xc = point(PSI * RHO);
            let fc = eval(&xc);
            if fc <= fr {
                simplex[n] = xc;
                values[n] = fc;
            } else {
                shrink = true;
            }
        } else {
            let xcc = point(-PSI);
            let fcc = eval(&xcc);
            if fcc < values[n] {
                simplex[n] = xcc;
                values[n] = fcc;
            } else {
                shrink = true;
            }
        }

        if shrink {
            let best = simplex[0].clone();
            for i in 1..=n {
                let mut p: Vec<f64> = best
                    .iter()
                    .zip(simplex[i].iter())
                    .map(|(b, x)| b + SIGMA * (x - b))
                    .collect();
                clip(&mut p, bounds);
                values[i] = eval(&p);
                simplex[i] = p;
            }
        }
    }

    let (best, fun) = simplex
        .iter()
        .zip(values.iter())
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(x, v)| (x.clone(), *v))
        .unwrap_or_else(|| (start.clone(), f64::INFINITY));

    OptimizeResult {
        x: best,
        fun,
        nfev,
        nit,
        naccepted: 0,
    }
}

/// Find the global minimum of `f` within `bounds` by basin hopping.
///
/// `take_step` proposes a new starting point from the current one given the current step
/// size. The step size is adapted every `interval` hops, shrinking when fewer than
/// `target_accept_rate` of the hops so far were accepted and growing otherwise.
pub fn basin_hopping<F, S, R>(
    mut f: F,
    x0: &[f64],
    bounds: &[(f64, f64)],
    mut take_step: S,
    params: &BasinHoppingParams,
    rng: &mut R,
) -> OptimizeResult
where
    F: FnMut(&[f64]) -> f64,
    S: FnMut(&[f64], f64, &mut R) -> Vec<f64>,
    R: Rng,
{
    let mut minimize = |x: &[f64]| nelder_mead(&mut f, x, bounds, &params.local);

    let initial = minimize(x0);
    let mut nfev = initial.nfev;
    let mut current = (initial.x, initial.fun);
    let mut best = current.clone();
    let mut stepsize = params.stepsize;
    let mut naccepted = 0;

    for hop in 1..=params.niter {
        let trial = take_step(&current.0, stepsize, rng);
        let local = minimize(&trial);
        nfev += local.nfev;

        let accept = if local.fun < current.1 {
            true
        } else {
            let w = (-(local.fun - current.1) / params.temperature).min(0.0).exp();
            w >= rng.random::<f64>()
        };
        if accept {
            naccepted += 1;
            if local.fun < best.1 {
                best = (local.x.clone(), local.fun);
            }
            current = (local.x, local.fun);
        }

        if params.interval > 0 && hop % params.interval == 0 {
            let rate = naccepted as f64 / hop as f64;
            if rate > params.target_accept_rate {
                stepsize /= params.stepwise_factor;
            } else {
                stepsize *= params.stepwise_factor;
            }
            trace!("Adjusted step size to {stepsize} at acceptance rate {rate}");
        }
    }

    OptimizeResult {
        x: best.0,
        fun: best.1,
        nfev,
        nit: params.niter,
        naccepted,
    }
}

/// Displace each coordinate uniformly within `[-stepsize, stepsize]`, then clip to `bounds`
pub fn random_displacement<R: Rng>(
    x: &[f64],
    stepsize: f64,
    bounds: &[(f64, f64)],
    rng: &mut R,
) -> Vec<f64> {
    let mut next: Vec<f64> = x
        .iter()
        .map(|v| v + rng.random_range(-stepsize..=stepsize))
        .collect();
    clip(&mut next, bounds);
    next
}
