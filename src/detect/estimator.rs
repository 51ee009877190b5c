//! Poisson rate-anomaly estimator.
//!
//! The historical baseline is a count observed over some elapsed time. Scaled
//! to the length of the current period it gives the expected number of
//! reports; the cumulative Poisson probability of seeing fewer reports than
//! were actually observed tells how surprising the current count is.

/// Floor for elapsed observation time, in seconds.
pub const ELAPSED_EPSILON_SECS: f64 = 0.0001;

/// Expected count and probability for one observation period.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Estimate {
    pub mean: f64,
    /// `P(X <= new_count - 1)` for `X ~ Poisson(mean)`.
    pub probability: f64,
}

/// Clamp an elapsed time to the epsilon floor.
pub fn floor_elapsed(secs: f64) -> f64 {
    if secs.is_finite() && secs > ELAPSED_EPSILON_SECS {
        secs
    } else {
        ELAPSED_EPSILON_SECS
    }
}

/// Compare `new_count` reports over `new_elapsed_secs` against a baseline of
/// `past_count` reports over `past_elapsed_secs`.
pub fn estimate(past_count: u64, past_elapsed_secs: f64, new_count: u64, new_elapsed_secs: f64) -> Estimate {
    let past_elapsed = floor_elapsed(past_elapsed_secs);
    let new_elapsed = if new_elapsed_secs.is_finite() && new_elapsed_secs > 0.0 {
        new_elapsed_secs
    } else {
        0.0
    };

    let mean = past_count as f64 / past_elapsed * new_elapsed;
    let probability = if new_count == 0 {
        0.0
    } else {
        poisson_cdf(new_count - 1, mean)
    };

    Estimate { mean, probability }
}

/// `P(X <= actual)` for `X ~ Poisson(mean)`.
///
/// Runs the term recurrence `p_0 = e^-mean`, `p_i = p_(i-1) * mean / i` in the
/// log domain and accumulates with log-add-exp. `e^-mean` alone underflows an
/// f64 once the mean passes ~745, so the direct product would report 0 for
/// counts that are in fact almost certain.
pub fn poisson_cdf(actual: u64, mean: f64) -> f64 {
    if mean.is_nan() || mean <= 0.0 {
        return 1.0;
    }
    if mean.is_infinite() {
        return 0.0;
    }

    let ln_mean = mean.ln();
    let mut ln_term = -mean;
    let mut ln_sum = ln_term;

    for i in 1..=actual {
        let i = i as f64;
        ln_term += ln_mean - i.ln();
        ln_sum = ln_add_exp(ln_sum, ln_term);

        // Past the mode the terms only shrink; once they fall below f64
        // resolution of the running sum nothing more can change.
        if i > mean && ln_term < ln_sum - 40.0 {
            break;
        }
    }

    ln_sum.exp().min(1.0)
}

fn ln_add_exp(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}
