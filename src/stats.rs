//! Statistical scoring helpers.
//!
//! The significance test compares a node's observed frequency against a
//! null-hypothesis frequency using the cumulative binomial distribution
//! `P(X <= k)` with `X ~ B(n, p)`. The CDF is evaluated through the
//! regularized incomplete beta function:
//!
//! `P(X <= k) = I_{1-p}(n - k, k + 1)`
//!
//! computed with a Lanczos log-gamma and the standard continued-fraction
//! expansion. Accuracy is far beyond what the significance threshold needs.

/// Relative accuracy target for the continued fraction.
const EPS: f64 = 1e-12;
/// Smallest representable quotient guard.
const FPMIN: f64 = 1e-300;

/// Lanczos approximation of `ln(Gamma(x))` for `x > 0`.
pub fn ln_gamma(x: f64) -> f64 {
    // g = 7, n = 9 coefficients.
    const COEF: [f64; 8] = [
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return pi.ln() - (pi * x).sin().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = 0.999_999_999_999_809_93;
    let t = x + 7.5;
    for (i, &c) in COEF.iter().enumerate() {
        a += c / (x + (i as f64) + 1.0);
    }
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// Continued-fraction evaluation for the incomplete beta function.
fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=300 {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function `I_x(a, b)`.
pub fn beta_inc(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_cf(a, b, x) / a
    } else {
        1.0 - front * beta_cf(b, a, 1.0 - x) / b
    }
}

/// Cumulative binomial probability `P(X <= k)` for `X ~ B(n, p)`.
pub fn binomial_cdf(k: i64, n: u64, p: f64) -> f64 {
    if k < 0 {
        return 0.0;
    }
    let k = k as u64;
    if k >= n {
        return 1.0;
    }
    if p <= 0.0 {
        return 1.0;
    }
    if p >= 1.0 {
        return 0.0;
    }
    // P(X <= k) = I_{1-p}(n - k, k + 1)
    beta_inc((n - k) as f64, (k + 1) as f64, 1.0 - p)
}

/// Sub-linear re-scoring threshold: the amount of new evidence required
/// before a node's significance is recomputed.
///
/// Grows as `x^1.15 - x`, so cheap nodes are rechecked often and heavy nodes
/// only after proportionally more observations.
pub fn notify_increment(x: f64) -> u32 {
    1 + (x.powf(1.15) - x).floor().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn ln_gamma_known_values() {
        // Gamma(5) = 24
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-10));
        // Gamma(0.5) = sqrt(pi)
        assert!(close(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), 1e-10));
    }

    #[test]
    fn binomial_cdf_exact_small() {
        // B(4, 0.5): P(X <= 2) = (1 + 4 + 6) / 16 = 0.6875
        assert!(close(binomial_cdf(2, 4, 0.5), 0.6875, 1e-9));
        // P(X <= 0) = 1/16
        assert!(close(binomial_cdf(0, 4, 0.5), 0.0625, 1e-9));
    }

    #[test]
    fn binomial_cdf_edges() {
        assert_eq!(binomial_cdf(-1, 10, 0.3), 0.0);
        assert_eq!(binomial_cdf(10, 10, 0.3), 1.0);
        assert_eq!(binomial_cdf(3, 10, 0.0), 1.0);
        assert_eq!(binomial_cdf(3, 10, 1.0), 0.0);
    }

    #[test]
    fn binomial_cdf_monotone_in_k() {
        let mut last = 0.0;
        for k in 0..20 {
            let v = binomial_cdf(k, 20, 0.35);
            assert!(v >= last);
            last = v;
        }
    }

    #[test]
    fn notify_increment_sublinear() {
        assert_eq!(notify_increment(1.0), 1);
        let small = notify_increment(10.0);
        let large = notify_increment(1000.0);
        assert!(small < large);
        // x^1.15 - x at 1000 is ~1825
        assert!(large > 1000);
    }
}
