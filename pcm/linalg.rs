//! Small dense linear-algebra kernels shared by the estimator, the
//! likelihood and the fitting driver.

use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix2, Zip};
use ndarray_linalg::{Eigh, FactorizeC, InverseC, SVD, UPLO};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinalgError {
    #[error("Singular value decomposition failed: {0}")]
    SvdFailed(ndarray_linalg::error::LinalgError),

    #[error("Singular value decomposition did not return singular vectors.")]
    SvdMissingVectors,

    #[error("Symmetric eigendecomposition failed: {0}")]
    EigendecompositionFailed(ndarray_linalg::error::LinalgError),

    #[error("Matrix is not positive definite; Cholesky factorization failed: {0}")]
    NotPositiveDefinite(ndarray_linalg::error::LinalgError),

    #[error("Expected a square matrix, got {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },
}

/// Moore-Penrose pseudo-inverse. Singular values below
/// `max(m, n) * s_max * eps` are treated as zero.
pub fn pinv<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Result<Array2<f64>, LinalgError> {
    let (m, n) = a.dim();
    if m == 0 || n == 0 {
        return Ok(Array2::zeros((n, m)));
    }

    let (u, s, vt) = a.svd(true, true).map_err(LinalgError::SvdFailed)?;
    let (Some(u), Some(vt)) = (u, vt) else {
        return Err(LinalgError::SvdMissingVectors);
    };

    let s_max = s.iter().copied().fold(0.0_f64, f64::max);
    let tol = (m.max(n) as f64) * s_max * f64::EPSILON;

    let mut result = Array2::<f64>::zeros((n, m));
    for (i, &sigma) in s.iter().enumerate() {
        if sigma <= tol {
            continue;
        }
        let v_i = vt.row(i);
        let u_i = u.column(i);
        let inv_sigma = 1.0 / sigma;
        for r in 0..n {
            let scaled = v_i[r] * inv_sigma;
            if scaled == 0.0 {
                continue;
            }
            for c in 0..m {
                result[[r, c]] += scaled * u_i[c];
            }
        }
    }
    Ok(result)
}

/// Projects a matrix onto the nearest symmetric positive-semidefinite matrix
/// in Frobenius norm: symmetrise, then clip negative eigenvalues at zero.
pub fn nearest_psd(g: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let (rows, cols) = g.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    let sym = symmetrize(g);
    let (eigvals, eigvecs) = sym
        .eigh(UPLO::Lower)
        .map_err(LinalgError::EigendecompositionFailed)?;

    let clipped: Array1<f64> = eigvals.mapv(|l| l.max(0.0));
    let scaled = &eigvecs * &clipped.view().insert_axis(ndarray::Axis(0));
    Ok(symmetrize(scaled.dot(&eigvecs.t()).view()))
}

/// `(A + A') / 2`
pub fn symmetrize(a: ArrayView2<f64>) -> Array2<f64> {
    let mut out = a.to_owned();
    out += &a.t();
    out.mapv_inplace(|v| 0.5 * v);
    out
}

/// Inverse and log-determinant of a symmetric positive-definite matrix,
/// from a single Cholesky factorization.
pub struct SpdInverse {
    pub inverse: Array2<f64>,
    pub log_det: f64,
}

pub fn spd_inverse(a: &Array2<f64>) -> Result<SpdInverse, LinalgError> {
    let factor = a
        .factorizec(UPLO::Lower)
        .map_err(LinalgError::NotPositiveDefinite)?;
    let log_det = 2.0 * factor.factor.diag().iter().map(|d| d.ln()).sum::<f64>();
    let inverse = factor.invc().map_err(LinalgError::NotPositiveDefinite)?;
    Ok(SpdInverse {
        inverse: symmetrize(inverse.view()),
        log_det,
    })
}

/// `trace(A * B)` without forming the product.
pub fn trace_of_product(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
    let mut acc = 0.0;
    Zip::from(&a).and(&b.t()).for_each(|&x, &y| acc += x * y);
    acc
}

/// Element-wise mean of equally-shaped matrices. Returns `None` for an empty slice.
pub fn mean_matrix(matrices: &[&Array2<f64>]) -> Option<Array2<f64>> {
    let (first, rest) = matrices.split_first()?;
    let mut acc = (*first).clone();
    for m in rest {
        acc += *m;
    }
    acc.mapv_inplace(|v| v / matrices.len() as f64);
    Some(acc)
}
