//! Classical single-column active-set NNLS (Lawson-Hanson).
//!
//! Slower than block pivoting but guaranteed to terminate, which makes it
//! the fallback for columns the pivoting solver fails to settle within its
//! iteration budget. Operates on the same Gram form: `gram` = LᵗL and
//! `rhs` = Lᵗc for the least-squares problem min ‖Lx − c‖, x ≥ 0.

use ndarray::{Array1, ArrayView1, ArrayView2};

use crate::error::NmfkError;

use super::normal_eq::solve_on_passive;

const FEASIBILITY_TOL: f64 = 1e-12;

pub(crate) fn nnls_active_set(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView1<f64>,
) -> Result<Array1<f64>, NmfkError> {
    let n = gram.nrows();
    let mut x = Array1::<f64>::zeros(n);
    if n == 0 {
        return Ok(x);
    }
    let mut passive = vec![false; n];
    let budget = 10 * n;
    for _ in 0..budget {
        // stationarity residual; positive entries on the active set mean the
        // objective still decreases by freeing that index
        let w = rhs.to_owned() - gram.dot(&x);
        let mut entering: Option<(usize, f64)> = None;
        for i in 0..n {
            if !passive[i] && w[i] > FEASIBILITY_TOL {
                match entering {
                    Some((_, best)) if best >= w[i] => {}
                    _ => entering = Some((i, w[i])),
                }
            }
        }
        let enter = match entering {
            Some((i, _)) => i,
            None => return Ok(x),
        };
        passive[enter] = true;
        // trial solves until the passive solution is feasible
        for _ in 0..n {
            let idx: Vec<usize> = (0..n).filter(|&i| passive[i]).collect();
            let z = solve_on_passive(gram, rhs, &idx)?;
            let infeasible: Vec<usize> = idx
                .iter()
                .copied()
                .filter(|&i| z[i] <= FEASIBILITY_TOL)
                .collect();
            if infeasible.is_empty() {
                x = z;
                break;
            }
            // step from x toward z as far as feasibility allows, then drop
            // the indices pinned at zero
            let mut alpha = 1.0_f64;
            for &i in &infeasible {
                let denom = x[i] - z[i];
                if denom > 0.0 {
                    alpha = alpha.min(x[i] / denom);
                }
            }
            for &i in &idx {
                x[i] += alpha * (z[i] - x[i]);
            }
            for i in 0..n {
                if passive[i] && x[i] <= FEASIBILITY_TOL {
                    passive[i] = false;
                    x[i] = 0.0;
                }
            }
        }
    }
    log::warn!(
        "active-set NNLS stopped after {} passes on a {}-variable problem",
        budget,
        n
    );
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_kkt(gram: &ArrayView2<f64>, rhs: &ArrayView1<f64>, x: &Array1<f64>) {
        let y = gram.dot(x) - rhs;
        for i in 0..x.len() {
            assert!(x[i] >= 0.0, "primal feasibility broken at {i}");
            assert!(y[i] >= -1e-8, "dual feasibility broken at {i}: {}", y[i]);
            assert!(
                (x[i] * y[i]).abs() <= 1e-8,
                "complementary slackness broken at {i}"
            );
        }
    }

    #[test]
    fn test_clamps_negative_unconstrained_solution() {
        let gram = array![[2.0, 0.0], [0.0, 2.0]];
        let rhs = array![1.0, -1.0];
        let x = nnls_active_set(&gram.view(), &rhs.view()).unwrap();
        assert!((x[0] - 0.5).abs() < 1e-12);
        assert_eq!(x[1], 0.0);
    }

    #[test]
    fn test_interior_solution_is_exact() {
        let gram = array![[1.0, 0.0], [0.0, 1.0]];
        let rhs = array![0.3, 0.7];
        let x = nnls_active_set(&gram.view(), &rhs.view()).unwrap();
        assert!((x[0] - 0.3).abs() < 1e-12);
        assert!((x[1] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_kkt_on_coupled_system() {
        let gram = array![
            [4.0, 1.0, 0.5],
            [1.0, 3.0, 0.2],
            [0.5, 0.2, 2.0]
        ];
        let rhs = array![1.0, -2.0, 0.4];
        let x = nnls_active_set(&gram.view(), &rhs.view()).unwrap();
        assert_kkt(&gram.view(), &rhs.view(), &x);
    }

    #[test]
    fn test_all_negative_rhs_gives_zero() {
        let gram = array![[2.0, 0.3], [0.3, 1.5]];
        let rhs = array![-1.0, -0.5];
        let x = nnls_active_set(&gram.view(), &rhs.view()).unwrap();
        assert_eq!(x, array![0.0, 0.0]);
    }
}
