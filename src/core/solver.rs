use log::debug;
use serde::Serialize;

use super::engine::{success_rate, window_count};
use super::error::{Result, SwrError};
use super::types::{Inputs, MarketHistory, StrategyKind};

#[derive(Debug, Clone, Copy)]
pub struct RateSolveConfig {
    pub payout_period_years: u32,
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl Default for RateSolveConfig {
    fn default() -> Self {
        Self {
            payout_period_years: 30,
            target_success_rate: 0.95,
            search_min: 0.0,
            search_max: 0.20,
            tolerance: 1e-4,
            max_iterations: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_rate: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSolveResult {
    pub strategy: StrategyKind,
    pub payout_period_years: u32,
    pub target_success_rate: f64,
    pub solved_rate: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub iterations: Vec<RateSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Bisects for the highest withdrawal rate whose success rate still meets the target.
///
/// Assumes success falls as the rate rises. The dynamic rule does not guarantee that, in
/// which case the result is one boundary of the feasible region rather than the maximum.
pub fn solve_max_withdrawal_rate(
    history: &MarketHistory,
    inputs: &Inputs,
    strategy: StrategyKind,
    config: RateSolveConfig,
) -> Result<RateSolveResult> {
    validate_config(config)?;
    window_count(history, config.payout_period_years)?;

    let evaluate = |rate: f64| -> Result<f64> {
        let params = inputs.parameters(strategy, rate, config.payout_period_years);
        success_rate(history, &params)
    };
    let meets_target = |value: f64| value + 1e-12 >= config.target_success_rate;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let mut solved_rate = None;
    let mut converged = false;
    let feasible;
    let message;

    let low_eval = evaluate(config.search_min)?;
    let high_eval = evaluate(config.search_max)?;

    if !meets_target(low_eval) {
        feasible = false;
        message = "No withdrawal rate within the search bounds meets the target.".to_string();
    } else if meets_target(high_eval) {
        solved_rate = Some(config.search_max);
        converged = true;
        feasible = true;
        message = "Upper search bound still meets the target; raise search max for a higher rate."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let value = evaluate(mid)?;
            iterations.push(RateSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_rate: mid,
                success_rate: value,
            });
            debug!("iteration {it}: rate {mid:.6} -> success {value:.4}");

            if meets_target(value) {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_rate = Some(lo);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable withdrawal rate.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate."
                .to_string()
        };
    }

    let achieved_success_rate = match solved_rate {
        Some(rate) => Some(evaluate(rate)?),
        None => None,
    };

    Ok(RateSolveResult {
        strategy,
        payout_period_years: config.payout_period_years,
        target_success_rate: config.target_success_rate,
        solved_rate,
        achieved_success_rate,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn validate_config(config: RateSolveConfig) -> Result<()> {
    let invalid = |msg: &str| Err(SwrError::InvalidParameter(msg.to_string()));

    if !(0.0..=1.0).contains(&config.target_success_rate) {
        return invalid("target success rate must be between 0 and 1");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return invalid("search bounds must be finite");
    }
    if config.search_min < 0.0 || config.search_max >= 1.0 {
        return invalid("search bounds must lie within [0, 1)");
    }
    if config.search_max <= config.search_min {
        return invalid("search max must be greater than search min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return invalid("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("max iterations must be > 0");
    }
    Ok(())
}
