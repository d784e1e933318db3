/*!

The continuous-time transition solver: converts a generator (rate) matrix `Q` and an
interval `τ` into the transition probability matrix `P = exp(Qτ)`.

The primary method is an eigendecomposition `Q = V·D·V⁻¹`, giving
`exp(Qτ) = V·exp(Dτ)·V⁻¹`. Eigenvalues come from a shifted QR iteration on the Hessenberg
form of `Q`; each eigenvector is the null vector of `Q - λI`.

The eigen route is abandoned in favour of a scaling-and-squaring Padé approximant whenever
 - an eigenvalue is complex,
 - the eigenvector matrix is numerically singular (repeated eigenvalues, defective `Q`), or
 - the reconstructed `P` has a row sum further than [`ROW_SUM_TOLERANCE`] from one.

Every result is clamped into `[0, 1]` and row-normalised, so rows sum to one to machine
precision whichever route produced it.

*/

use crate::matrix::SquareMatrix;
use log::{debug, trace};

/// The row-sum deviation beyond which the eigen reconstruction is rejected.
pub const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// Tolerance on generator row sums (each row must sum to zero).
const GENERATOR_TOLERANCE: f64 = 1e-9;

const MAX_QR_SWEEPS: usize = 200;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExpMethod {
    Eigen,
    ScalingSquaring,
}

#[derive(Copy, Clone, Debug)]
pub struct Exponential<const N: usize> {
    pub matrix: SquareMatrix<N>,
    pub method: ExpMethod,
}

/// Computes `exp(Qτ)` for a generator `q` and interval `tau ≥ 0`.
///
/// # Panics
/// If `q` is not a generator (negative or non-finite off-diagonals, rows not summing to
/// zero) or `tau` is negative or non-finite. Both indicate a bug in the caller, since
/// parameters and designs are validated before any matrix is built.
#[must_use]
pub fn transition_probabilities<const N: usize>(q: &SquareMatrix<N>, tau: f64) -> Exponential<N> {
    assert_generator(q);
    assert!(
        tau.is_finite() && tau >= 0.0,
        "interval must be finite and non-negative, got {tau}"
    );

    let qt = q.scale(tau);
    if let Some(mut p) = eigen_exponential(&qt) {
        let deviation = p.max_row_sum_deviation();
        if deviation <= ROW_SUM_TOLERANCE && p.is_row_stochastic(ROW_SUM_TOLERANCE) {
            p.normalize_rows();
            return Exponential {
                matrix: p,
                method: ExpMethod::Eigen,
            };
        }
        debug!("eigen reconstruction rejected (row-sum deviation {deviation:e}, tau = {tau})");
    } else {
        debug!("eigendecomposition unusable (complex or repeated eigenvalues, tau = {tau})");
    }

    let mut p = pade_exponential(&qt);
    trace!(
        "scaling-and-squaring result has row-sum deviation {:e}",
        p.max_row_sum_deviation()
    );
    p.normalize_rows();
    Exponential {
        matrix: p,
        method: ExpMethod::ScalingSquaring,
    }
}

fn assert_generator<const N: usize>(q: &SquareMatrix<N>) {
    for i in 0..N {
        let mut row_sum = 0.0;
        for j in 0..N {
            let rate = q[(i, j)];
            assert!(rate.is_finite(), "generator entry ({i}, {j}) is not finite: {rate}");
            if i != j {
                assert!(rate >= 0.0, "negative hazard at ({i}, {j}): {rate}");
            }
            row_sum += rate;
        }
        let scale = q.row(i).iter().fold(1.0_f64, |m, x| m.max(x.abs()));
        assert!(
            row_sum.abs() <= GENERATOR_TOLERANCE * scale,
            "generator row {i} sums to {row_sum}, not zero"
        );
    }
}

/// `V·exp(D)·V⁻¹`, or `None` if the decomposition is unusable.
fn eigen_exponential<const N: usize>(a: &SquareMatrix<N>) -> Option<SquareMatrix<N>> {
    let eigenvalues = real_eigenvalues(a)?;

    // Column k of V is the eigenvector for eigenvalues[k].
    let mut v = SquareMatrix::<N>::zeros();
    for (k, &lambda) in eigenvalues.iter().enumerate() {
        let vector = null_vector(a, lambda);
        for i in 0..N {
            v[(i, k)] = vector[i];
        }
    }
    let v_inv = v.inverse()?;

    let mut v_exp = v;
    for (k, lambda) in eigenvalues.iter().enumerate() {
        let factor = lambda.exp();
        for i in 0..N {
            v_exp[(i, k)] *= factor;
        }
    }
    let p = &v_exp * &v_inv;
    p.0.iter().flatten().all(|x| x.is_finite()).then_some(p)
}

/// Reduces `a` to upper Hessenberg form by Householder reflections. Eigenvalues are preserved.
fn hessenberg<const N: usize>(a: &SquareMatrix<N>) -> SquareMatrix<N> {
    let mut h = *a;
    for k in 0..N.saturating_sub(2) {
        let norm = ((k + 1)..N).map(|i| h[(i, k)] * h[(i, k)]).sum::<f64>().sqrt();
        if norm == 0.0 {
            continue;
        }
        let alpha = if h[(k + 1, k)] > 0.0 { -norm } else { norm };
        let mut v = [0.0; N];
        for i in (k + 1)..N {
            v[i] = h[(i, k)];
        }
        v[k + 1] -= alpha;
        let v_norm2: f64 = v.iter().map(|x| x * x).sum();
        if v_norm2 == 0.0 {
            continue;
        }

        // H ← (I - 2vvᵀ/vᵀv) · H · (I - 2vvᵀ/vᵀv)
        for j in 0..N {
            let dot: f64 = ((k + 1)..N).map(|i| v[i] * h[(i, j)]).sum();
            let f = 2.0 * dot / v_norm2;
            for i in (k + 1)..N {
                h[(i, j)] -= f * v[i];
            }
        }
        for i in 0..N {
            let dot: f64 = ((k + 1)..N).map(|j| h[(i, j)] * v[j]).sum();
            let f = 2.0 * dot / v_norm2;
            for j in (k + 1)..N {
                h[(i, j)] -= f * v[j];
            }
        }
    }
    h
}

/// Real eigenvalues of a 2×2 block `[[a, b], [c, d]]`, or `None` if they are complex.
fn eigenvalues_2x2(a: f64, b: f64, c: f64, d: f64) -> Option<(f64, f64)> {
    let half_trace = 0.5 * (a + d);
    let discriminant = 0.25 * (a - d) * (a - d) + b * c;
    if discriminant < 0.0 {
        return None;
    }
    let root = discriminant.sqrt();
    Some((half_trace + root, half_trace - root))
}

/// All eigenvalues of `a`, or `None` if any are complex or the iteration fails to converge.
fn real_eigenvalues<const N: usize>(a: &SquareMatrix<N>) -> Option<[f64; N]> {
    let mut h = hessenberg(a);
    let mut eigenvalues = [0.0; N];
    let mut active = N;
    let mut sweeps = 0;

    while active > 0 {
        if active == 1 {
            eigenvalues[0] = h[(0, 0)];
            break;
        }
        let n = active;
        if n == 2 {
            let (l1, l2) = eigenvalues_2x2(h[(0, 0)], h[(0, 1)], h[(1, 0)], h[(1, 1)])?;
            eigenvalues[0] = l1;
            eigenvalues[1] = l2;
            break;
        }

        let sub = h[(n - 1, n - 2)].abs();
        let neighbourhood = h[(n - 1, n - 1)].abs() + h[(n - 2, n - 2)].abs();
        if sub <= f64::EPSILON * neighbourhood.max(f64::MIN_POSITIVE) || sub < 1e-300 {
            eigenvalues[n - 1] = h[(n - 1, n - 1)];
            active -= 1;
            continue;
        }

        sweeps += 1;
        if sweeps > MAX_QR_SWEEPS {
            return None;
        }

        // Wilkinson shift from the trailing 2×2 block; fall back to the corner entry if the
        // block's eigenvalues are complex.
        let corner = h[(n - 1, n - 1)];
        let shift = match eigenvalues_2x2(
            h[(n - 2, n - 2)],
            h[(n - 2, n - 1)],
            h[(n - 1, n - 2)],
            corner,
        ) {
            Some((l1, l2)) if (l1 - corner).abs() < (l2 - corner).abs() => l1,
            Some((_, l2)) => l2,
            None => corner,
        };
        qr_step(&mut h, n, shift);
    }

    Some(eigenvalues)
}

/// One shifted QR step `H - μI = QR`, `H ← RQ + μI`, on the leading `n × n` block.
fn qr_step<const N: usize>(h: &mut SquareMatrix<N>, n: usize, shift: f64) {
    for i in 0..n {
        h[(i, i)] -= shift;
    }

    let mut rotations = Vec::with_capacity(n - 1);
    for k in 0..(n - 1) {
        let (x, y) = (h[(k, k)], h[(k + 1, k)]);
        let r = x.hypot(y);
        let (c, s) = if r == 0.0 { (1.0, 0.0) } else { (x / r, y / r) };
        for j in 0..n {
            let (a, b) = (h[(k, j)], h[(k + 1, j)]);
            h[(k, j)] = c * a + s * b;
            h[(k + 1, j)] = -s * a + c * b;
        }
        rotations.push((c, s));
    }
    for (k, (c, s)) in rotations.into_iter().enumerate() {
        for i in 0..n {
            let (a, b) = (h[(i, k)], h[(i, k + 1)]);
            h[(i, k)] = c * a + s * b;
            h[(i, k + 1)] = -s * a + c * b;
        }
    }

    for i in 0..n {
        h[(i, i)] += shift;
    }
}

/// A unit vector `x` with `(a - λI)x ≈ 0`, found by Gaussian elimination with complete
/// pivoting on the first `N - 1` pivots and back-substitution with the last unknown free.
fn null_vector<const N: usize>(a: &SquareMatrix<N>, lambda: f64) -> [f64; N] {
    let mut m = *a;
    for i in 0..N {
        m[(i, i)] -= lambda;
    }
    let mut columns: [usize; N] = std::array::from_fn(|j| j);

    for step in 0..N.saturating_sub(1) {
        let (mut pivot_row, mut pivot_col, mut best) = (step, step, 0.0);
        for i in step..N {
            for j in step..N {
                if m[(i, j)].abs() > best {
                    best = m[(i, j)].abs();
                    pivot_row = i;
                    pivot_col = j;
                }
            }
        }
        if best == 0.0 {
            break;
        }
        m.0.swap(step, pivot_row);
        for row in m.0.iter_mut() {
            row.swap(step, pivot_col);
        }
        columns.swap(step, pivot_col);

        let pivot = m[(step, step)];
        for i in (step + 1)..N {
            let factor = m[(i, step)] / pivot;
            for j in step..N {
                m[(i, j)] -= factor * m[(step, j)];
            }
        }
    }

    let mut permuted = [0.0; N];
    permuted[N - 1] = 1.0;
    for i in (0..N - 1).rev() {
        let pivot = m[(i, i)];
        if pivot == 0.0 {
            // Extra free direction; leave it at zero.
            continue;
        }
        let tail: f64 = ((i + 1)..N).map(|j| m[(i, j)] * permuted[j]).sum();
        permuted[i] = -tail / pivot;
    }

    let mut x = [0.0; N];
    for (position, &column) in columns.iter().enumerate() {
        x[column] = permuted[position];
    }
    let norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
    x.iter_mut().for_each(|v| *v /= norm);
    x
}

/// Degree-6 diagonal Padé approximant with scaling and squaring.
fn pade_exponential<const N: usize>(a: &SquareMatrix<N>) -> SquareMatrix<N> {
    const DEGREE: usize = 6;

    let norm = a.norm_one();
    let squarings = if norm > 0.5 {
        (norm / 0.5).log2().ceil() as i32
    } else {
        0
    };
    let scaled = a.scale(0.5_f64.powi(squarings));

    let mut numerator = SquareMatrix::<N>::identity();
    let mut denominator = SquareMatrix::<N>::identity();
    let mut power = SquareMatrix::<N>::identity();
    let mut coefficient = 1.0;
    for k in 1..=DEGREE {
        coefficient *= (DEGREE - k + 1) as f64 / (k * (2 * DEGREE - k + 1)) as f64;
        power = &power * &scaled;
        let term = power.scale(coefficient);
        numerator = numerator.add(&term);
        denominator = denominator.add(&term.scale(if k % 2 == 0 { 1.0 } else { -1.0 }));
    }

    // The denominator is within a small perturbation of the identity after scaling, so it
    // is never singular.
    let mut result = denominator.solve(&numerator).unwrap_or(numerator);
    for _ in 0..squarings {
        result = &result * &result;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario_generator() -> SquareMatrix<3> {
        SquareMatrix::from_rows([[-0.9, 0.5, 0.4], [0.3, -0.7, 0.4], [0.0, 0.0, 0.0]])
    }

    /// A generator whose last state is absorbing, filled row by row from `rates`.
    fn generator_from<const N: usize>(rates: &[f64]) -> SquareMatrix<N> {
        let mut rates = rates.iter().copied();
        let mut q = SquareMatrix::<N>::zeros();
        for i in 0..(N - 1) {
            let mut total = 0.0;
            for j in 0..N {
                if i != j {
                    let rate = rates.next().unwrap_or(0.0);
                    q[(i, j)] = rate;
                    total += rate;
                }
            }
            q[(i, i)] = -total;
        }
        q
    }

    #[test]
    fn scenario_matrix_is_row_stochastic_with_absorbing_dead() {
        let result = transition_probabilities(&scenario_generator(), 1.0);
        assert_eq!(result.method, ExpMethod::Eigen);
        let p = result.matrix;
        assert!(p.is_row_stochastic(1e-9));
        assert!((p[(2, 2)] - 1.0).abs() < 1e-12);
        assert!(p[(2, 0)].abs() < 1e-12 && p[(2, 1)].abs() < 1e-12);
    }

    #[test]
    fn scenario_matches_closed_form() {
        // Eigenvalues of the transient block are -0.4 and -1.2.
        let p = transition_probabilities(&scenario_generator(), 1.0).matrix;
        let (e1, e2) = ((-0.4_f64).exp(), (-1.2_f64).exp());
        let p00 = 0.375 * e1 + 0.625 * e2;
        let p01 = 0.625 * e1 - 0.625 * e2;
        assert!((p[(0, 0)] - p00).abs() < 1e-10);
        assert!((p[(0, 1)] - p01).abs() < 1e-10);
    }

    #[test]
    fn zero_interval_gives_identity() {
        let p = transition_probabilities(&scenario_generator(), 0.0).matrix;
        assert!(p.max_abs_diff(&SquareMatrix::identity()) < 1e-12);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn random_generators_give_stochastic_matrices(
            rates3 in prop::array::uniform4(0.0..3.0f64),
            rates4 in prop::array::uniform9(0.0..3.0f64),
            tau in 0.01..5.0f64,
        ) {
            let p3 = transition_probabilities(&generator_from::<3>(&rates3), tau).matrix;
            let p4 = transition_probabilities(&generator_from::<4>(&rates4), tau).matrix;
            prop_assert!(p3.is_row_stochastic(1e-9), "{:?} at tau = {}", p3, tau);
            prop_assert!(p4.is_row_stochastic(1e-9), "{:?} at tau = {}", p4, tau);
        }

        #[test]
        fn semigroup_property(
            rates in prop::array::uniform4(0.0..3.0f64),
            t1 in 0.05..2.0f64,
            t2 in 0.05..2.0f64,
        ) {
            let q = generator_from::<3>(&rates);
            let whole = transition_probabilities(&q, t1 + t2).matrix;
            let split = &transition_probabilities(&q, t1).matrix
                * &transition_probabilities(&q, t2).matrix;
            prop_assert!(whole.max_abs_diff(&split) < 1e-8, "rates {:?}, t1 = {}, t2 = {}", rates, t1, t2);
        }
    }

    #[test]
    fn repeated_eigenvalue_falls_back_to_scaling_and_squaring() {
        // Equal exit rates give a repeated eigenvalue with a two-dimensional eigenspace.
        let q = SquareMatrix::from_rows([[-0.4, 0.0, 0.4], [0.0, -0.4, 0.4], [0.0, 0.0, 0.0]]);
        let result = transition_probabilities(&q, 2.0);
        assert_eq!(result.method, ExpMethod::ScalingSquaring);
        let survive = (-0.8_f64).exp();
        assert!((result.matrix[(0, 0)] - survive).abs() < 1e-10);
        assert!((result.matrix[(1, 2)] - (1.0 - survive)).abs() < 1e-10);
    }

    #[test]
    fn defective_generator_matches_jordan_closed_form() {
        let a = 0.7;
        let q = SquareMatrix::from_rows([[-a, a, 0.0], [0.0, -a, a], [0.0, 0.0, 0.0]]);
        let tau = 1.5;
        let result = transition_probabilities(&q, tau);
        assert_eq!(result.method, ExpMethod::ScalingSquaring);
        let decay = (-a * tau).exp();
        assert!((result.matrix[(0, 0)] - decay).abs() < 1e-10);
        assert!((result.matrix[(0, 1)] - a * tau * decay).abs() < 1e-10);
        assert!(result.matrix.is_row_stochastic(1e-9));
    }

    #[test]
    fn complex_eigenvalues_are_handled() {
        let q = SquareMatrix::from_rows([[-1.0, 1.0, 0.0], [0.0, -1.0, 1.0], [1.0, 0.0, -1.0]]);
        let result = transition_probabilities(&q, 0.8);
        assert_eq!(result.method, ExpMethod::ScalingSquaring);
        assert!(result.matrix.is_row_stochastic(1e-9));
        let twice = transition_probabilities(&q, 1.6).matrix;
        assert!(twice.max_abs_diff(&(&result.matrix * &result.matrix)) < 1e-9);
    }

    #[test]
    fn large_rates_stay_stochastic() {
        let q = SquareMatrix::from_rows([[-60.0, 50.0, 10.0], [30.0, -70.0, 40.0], [0.0, 0.0, 0.0]]);
        let p = transition_probabilities(&q, 3.0).matrix;
        assert!(p.is_row_stochastic(1e-9));
        assert!(p[(0, 2)] > 0.999);
    }

    #[test]
    #[should_panic(expected = "negative hazard")]
    fn negative_hazard_is_a_bug() {
        let q = SquareMatrix::from_rows([[0.1, -0.1], [0.0, 0.0]]);
        let _ = transition_probabilities(&q, 1.0);
    }
}
