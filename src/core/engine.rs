use super::error::{Result, SwrError};
use super::types::{
    MarketHistory, MarketYear, SimulationParameters, WindowOutcome, WithdrawalStrategy,
    YearTracePoint,
};

/// Per-window state of a withdrawal rule. `depleted` is absorbing.
///
/// For the fixed-real rule `withdrawal` is the amount to be taken this year before the
/// inflation uplift; for the dynamic rule it is the previous year's withdrawal, which
/// anchors the ceiling and floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowState {
    pub portfolio_value: f64,
    pub withdrawal: f64,
    pub years_elapsed: u32,
    pub depleted: bool,
}

impl WindowState {
    pub fn start(params: &SimulationParameters) -> Self {
        let withdrawal = match params.strategy {
            WithdrawalStrategy::FixedReal => {
                params.initial_portfolio_value * params.withdrawal_rate
            }
            WithdrawalStrategy::DynamicSpending { .. } => 0.0,
        };
        Self {
            portfolio_value: params.initial_portfolio_value,
            withdrawal,
            years_elapsed: 0,
            depleted: false,
        }
    }
}

/// Advances one year. `prior_inflation` is the previous calendar year's inflation and is
/// only read by the fixed-real rule after its first year.
pub fn step(
    state: WindowState,
    params: &SimulationParameters,
    year: MarketYear,
    prior_inflation: f64,
) -> WindowState {
    if state.depleted {
        return state;
    }

    let next = match params.strategy {
        WithdrawalStrategy::FixedReal => step_fixed_real(state, params, year, prior_inflation),
        WithdrawalStrategy::DynamicSpending {
            ceiling_growth_rate,
            floor_shrink_rate,
        } => step_dynamic(state, params, year, ceiling_growth_rate, floor_shrink_rate),
    };

    WindowState {
        years_elapsed: state.years_elapsed + 1,
        depleted: next.portfolio_value <= 0.0,
        ..next
    }
}

fn step_fixed_real(
    state: WindowState,
    params: &SimulationParameters,
    year: MarketYear,
    prior_inflation: f64,
) -> WindowState {
    let mut withdrawal = state.withdrawal;
    if state.years_elapsed > 0 {
        withdrawal *= 1.0 + prior_inflation;
    }

    let portfolio_value = state.portfolio_value
        * (1.0 + year.portfolio_return)
        * (1.0 - params.fee_rate)
        - withdrawal;

    WindowState {
        portfolio_value,
        withdrawal,
        ..state
    }
}

fn step_dynamic(
    state: WindowState,
    params: &SimulationParameters,
    year: MarketYear,
    ceiling_growth_rate: f64,
    floor_shrink_rate: f64,
) -> WindowState {
    let nominal_ending =
        state.portfolio_value * (1.0 + year.portfolio_return) * (1.0 - params.fee_rate);

    // First year stays in nominal terms and sets the anchor withdrawal.
    if state.years_elapsed == 0 {
        let withdrawal = params.withdrawal_rate * nominal_ending;
        return WindowState {
            portfolio_value: nominal_ending - withdrawal,
            withdrawal,
            ..state
        };
    }

    let real_ending = nominal_ending / (1.0 + year.inflation);
    let raw_withdrawal = params.withdrawal_rate * real_ending;
    let ceiling = state.withdrawal * (1.0 + ceiling_growth_rate);
    let floor = state.withdrawal * (1.0 - floor_shrink_rate);
    let withdrawal = raw_withdrawal.min(ceiling).max(floor);

    WindowState {
        portfolio_value: real_ending - withdrawal,
        withdrawal,
        ..state
    }
}

fn run_window(
    history: &MarketHistory,
    start: usize,
    params: &SimulationParameters,
    mut trace: Option<&mut Vec<YearTracePoint>>,
) -> WindowOutcome {
    let end = start + params.payout_period_years as usize;
    let inflation = history.inflation().values();
    let mut state = WindowState::start(params);

    for i in start..end {
        let prior_inflation = if i > start { inflation[i - 1] } else { 0.0 };
        let year = history.market_year(i);
        state = step(state, params, year, prior_inflation);

        if let Some(rows) = trace.as_deref_mut() {
            rows.push(YearTracePoint {
                year: history.year(i),
                portfolio_return: year.portfolio_return,
                inflation: year.inflation,
                withdrawal: state.withdrawal,
                portfolio_value: state.portfolio_value,
            });
        }

        if state.depleted {
            break;
        }
    }

    WindowOutcome {
        start_year: history.year(start),
        end_year: history.year(end - 1),
        success: !state.depleted,
    }
}

/// Number of rolling windows of the configured payout period that fit in the history.
pub fn window_count(history: &MarketHistory, payout_period_years: u32) -> Result<usize> {
    let period = payout_period_years as usize;
    if period == 0 || history.len() < period {
        return Err(SwrError::InsufficientHistory {
            payout_period_years,
            available_years: history.len(),
        });
    }
    Ok(history.len() - period + 1)
}

/// Runs the window starting at `start_index`, which must leave a full payout period of history.
pub fn simulate_window(
    history: &MarketHistory,
    start_index: usize,
    params: &SimulationParameters,
) -> Result<WindowOutcome> {
    params.validate()?;
    let windows = window_count(history, params.payout_period_years)?;
    if start_index >= windows {
        return Err(SwrError::InsufficientHistory {
            payout_period_years: params.payout_period_years,
            available_years: history.len() - start_index.min(history.len()),
        });
    }
    Ok(run_window(history, start_index, params, None))
}

pub fn window_outcomes(
    history: &MarketHistory,
    params: &SimulationParameters,
) -> Result<Vec<WindowOutcome>> {
    let windows = window_count(history, params.payout_period_years)?;
    (0..windows)
        .map(|start| simulate_window(history, start, params))
        .collect()
}

/// Fraction of rolling start years whose window finished without depletion.
pub fn success_rate(history: &MarketHistory, params: &SimulationParameters) -> Result<f64> {
    let outcomes = window_outcomes(history, params)?;
    let successes = outcomes.iter().filter(|outcome| outcome.success).count();
    Ok(successes as f64 / outcomes.len() as f64)
}

pub fn trace_window(
    history: &MarketHistory,
    params: &SimulationParameters,
    start_year: i32,
) -> Result<(WindowOutcome, Vec<YearTracePoint>)> {
    params.validate()?;
    let Some(start) = history.returns().position_of(start_year) else {
        return Err(SwrError::InvalidParameter(format!(
            "start year {start_year} is outside the available history"
        )));
    };
    let remaining = history.len() - start;
    if params.payout_period_years == 0 || remaining < params.payout_period_years as usize {
        return Err(SwrError::InsufficientHistory {
            payout_period_years: params.payout_period_years,
            available_years: remaining,
        });
    }

    let mut trace = Vec::with_capacity(params.payout_period_years as usize);
    let outcome = run_window(history, start, params, Some(&mut trace));
    Ok((outcome, trace))
}
