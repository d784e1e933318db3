/*!

Fixed-size dense matrices for the small state spaces of the model (at most 4×4).

Rows are stored contiguously, so `m[(i, j)]` is the probability (or rate) of moving from
state `i` to state `j`.

*/

use std::ops::{Index, IndexMut, Mul};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Matrix<const R: usize, const C: usize>(pub [[f64; C]; R]);

pub type SquareMatrix<const N: usize> = Matrix<N, N>;

impl<const R: usize, const C: usize> Default for Matrix<R, C> {
    fn default() -> Self {
        Self::zeros()
    }
}

impl<const R: usize, const C: usize> Matrix<R, C> {
    #[must_use]
    pub fn zeros() -> Self {
        Matrix([[0.0; C]; R])
    }

    #[must_use]
    pub fn from_rows(rows: [[f64; C]; R]) -> Self {
        Matrix(rows)
    }

    #[inline]
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64; C] {
        &self.0[i]
    }

    #[must_use]
    pub fn row_sums(&self) -> [f64; R] {
        let mut sums = [0.0; R];
        for (sum, row) in sums.iter_mut().zip(self.0.iter()) {
            *sum = row.iter().sum();
        }
        sums
    }

    /// The largest absolute deviation of any row sum from one.
    #[must_use]
    pub fn max_row_sum_deviation(&self) -> f64 {
        self.row_sums()
            .iter()
            .map(|s| (s - 1.0).abs())
            .fold(0.0, f64::max)
    }

    /// Rows sum to one within `tolerance` and every entry lies in `[0, 1]` within `tolerance`.
    #[must_use]
    pub fn is_row_stochastic(&self, tolerance: f64) -> bool {
        self.max_row_sum_deviation() <= tolerance
            && self
                .0
                .iter()
                .flatten()
                .all(|&p| p.is_finite() && p >= -tolerance && p <= 1.0 + tolerance)
    }

    #[must_use]
    pub fn scale(&self, factor: f64) -> Self {
        let mut out = *self;
        out.0.iter_mut().flatten().for_each(|x| *x *= factor);
        out
    }

    #[must_use]
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Clamps entries into `[0, 1]` and rescales each row to sum to exactly one.
    pub(crate) fn normalize_rows(&mut self) {
        for row in self.0.iter_mut() {
            row.iter_mut().for_each(|p| *p = p.clamp(0.0, 1.0));
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|p| *p /= total);
            }
        }
    }
}

impl<const N: usize> Matrix<N, N> {
    #[must_use]
    pub fn identity() -> Self {
        let mut m = Self::zeros();
        for i in 0..N {
            m.0[i][i] = 1.0;
        }
        m
    }

    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        let mut out = *self;
        for (a, b) in out.0.iter_mut().flatten().zip(other.0.iter().flatten()) {
            *a += b;
        }
        out
    }

    /// The maximum absolute column sum.
    #[must_use]
    pub fn norm_one(&self) -> f64 {
        (0..N)
            .map(|j| (0..N).map(|i| self.0[i][j].abs()).sum::<f64>())
            .fold(0.0, f64::max)
    }

    /// Solves `self · X = rhs` by Gaussian elimination with partial pivoting. Returns `None`
    /// if a pivot is negligible relative to the matrix scale.
    #[must_use]
    pub fn solve<const K: usize>(&self, rhs: &Matrix<N, K>) -> Option<Matrix<N, K>> {
        let mut a = *self;
        let mut b = *rhs;
        let scale = self.0.iter().flatten().fold(0.0_f64, |m, x| m.max(x.abs()));
        if scale == 0.0 {
            return None;
        }

        for col in 0..N {
            let pivot_row = (col..N)
                .max_by(|&i, &j| a.0[i][col].abs().total_cmp(&a.0[j][col].abs()))
                .unwrap_or(col);
            if a.0[pivot_row][col].abs() <= SINGULAR_PIVOT * scale {
                return None;
            }
            a.0.swap(col, pivot_row);
            b.0.swap(col, pivot_row);

            let pivot = a.0[col][col];
            for row in 0..N {
                if row == col {
                    continue;
                }
                let factor = a.0[row][col] / pivot;
                if factor == 0.0 {
                    continue;
                }
                for k in col..N {
                    a.0[row][k] -= factor * a.0[col][k];
                }
                for k in 0..K {
                    b.0[row][k] -= factor * b.0[col][k];
                }
            }
        }

        for row in 0..N {
            let pivot = a.0[row][row];
            b.0[row].iter_mut().for_each(|x| *x /= pivot);
        }
        Some(b)
    }

    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        self.solve(&Self::identity())
    }
}

/// Pivots below this fraction of the largest entry are treated as zero.
const SINGULAR_PIVOT: f64 = 1e-12;

impl<const R: usize, const C: usize> Index<(usize, usize)> for Matrix<R, C> {
    type Output = f64;

    #[inline]
    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.0[i][j]
    }
}

impl<const R: usize, const C: usize> IndexMut<(usize, usize)> for Matrix<R, C> {
    #[inline]
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.0[i][j]
    }
}

impl<const R: usize, const K: usize, const C: usize> Mul<&Matrix<K, C>> for &Matrix<R, K> {
    type Output = Matrix<R, C>;

    fn mul(self, rhs: &Matrix<K, C>) -> Matrix<R, C> {
        let mut out = Matrix::<R, C>::zeros();
        for i in 0..R {
            for k in 0..K {
                let a = self.0[i][k];
                if a == 0.0 {
                    continue;
                }
                for j in 0..C {
                    out.0[i][j] += a * rhs.0[k][j];
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_neutral_for_multiplication() {
        let m = Matrix::from_rows([[0.2, 0.3, 0.5], [0.1, 0.1, 0.8], [0.0, 0.0, 1.0]]);
        assert_eq!(&m * &SquareMatrix::<3>::identity(), m);
        assert_eq!(&SquareMatrix::<3>::identity() * &m, m);
    }

    #[test]
    fn rectangular_product_has_expected_shape() {
        let a = Matrix::from_rows([[1.0, 2.0, 3.0]]);
        let b = Matrix::from_rows([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let c: Matrix<1, 2> = &a * &b;
        assert_eq!(c, Matrix::from_rows([[4.0, 5.0]]));
    }

    #[test]
    fn inverse_recovers_identity() {
        let m = Matrix::from_rows([[4.0, 7.0, 2.0], [3.0, 6.0, 1.0], [2.0, 5.0, 3.0]]);
        let inv = m.inverse().unwrap();
        assert!((&m * &inv).max_abs_diff(&SquareMatrix::identity()) < 1e-12);
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let m = Matrix::from_rows([[1.0, 2.0], [2.0, 4.0]]);
        assert!(m.inverse().is_none());
        assert!(SquareMatrix::<3>::zeros().inverse().is_none());
    }

    #[test]
    fn row_stochastic_check() {
        let ok = Matrix::from_rows([[0.36, 0.54, 0.1], [0.0, 0.0, 1.0]]);
        assert!(ok.is_row_stochastic(1e-12));
        let negative = Matrix::from_rows([[1.1, -0.1], [0.5, 0.5]]);
        assert!(!negative.is_row_stochastic(1e-12));
    }

    #[test]
    fn normalize_rows_clamps_and_rescales() {
        let mut m = Matrix::from_rows([[-1e-17, 0.5, 0.5 + 1e-13]]);
        m.normalize_rows();
        assert_eq!(m[(0, 0)], 0.0);
        assert!((m.row_sums()[0] - 1.0).abs() < 1e-15);
    }
}
