use log::{debug, info, warn};
use rayon::prelude::*;

use super::dataset::HistoricalDataset;
use super::engine::{success_rate, window_count};
use super::error::Result;
use super::series::build_market_history;
use super::types::{
    AnalysisResult, Inputs, MarketHistory, StrategyKind, SuccessScoreRow, SuccessSurface,
    SweepConfig,
};

/// Weight gate, portfolio series, then one surface per requested strategy.
pub fn run_analysis(dataset: &HistoricalDataset, inputs: &Inputs) -> Result<AnalysisResult> {
    let history = build_market_history(dataset, &inputs.weights)?;

    let mut surfaces = Vec::with_capacity(inputs.strategies.len());
    for &strategy in &inputs.strategies {
        let surface = build_success_surface(&history, inputs, strategy)?;
        info!(
            "{}: kept {} rows, truncated {}",
            strategy.title(),
            surface.rows.len(),
            surface.truncated_rows
        );
        surfaces.push(surface);
    }

    Ok(AnalysisResult {
        first_year: history.year(0),
        last_year: history.year(history.len() - 1),
        surfaces,
    })
}

/// One (withdrawal rate, payout period) cell of the sweep grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepCell {
    pub row: usize,
    pub column: usize,
    pub withdrawal_rate: f64,
    pub payout_period_years: u32,
}

pub fn sweep_cells(sweep: &SweepConfig) -> Vec<SweepCell> {
    sweep
        .withdrawal_rates
        .iter()
        .enumerate()
        .flat_map(|(row, &withdrawal_rate)| {
            sweep
                .payout_periods
                .iter()
                .enumerate()
                .map(move |(column, &payout_period_years)| SweepCell {
                    row,
                    column,
                    withdrawal_rate,
                    payout_period_years,
                })
        })
        .collect()
}

/// Success-rate table for one strategy over the sweep grid, cut after the first row whose
/// first-listed payout period reaches exactly zero.
pub fn build_success_surface(
    history: &MarketHistory,
    inputs: &Inputs,
    strategy: StrategyKind,
) -> Result<SuccessSurface> {
    let sweep = &inputs.sweep;
    sweep.validate()?;
    for &period in &sweep.payout_periods {
        window_count(history, period)?;
    }

    let cells = sweep_cells(sweep);
    debug!(
        "{strategy:?}: evaluating {} cells over {} years of history",
        cells.len(),
        history.len()
    );

    let rates = cells
        .par_iter()
        .map(|cell| {
            let params = inputs.parameters(strategy, cell.withdrawal_rate, cell.payout_period_years);
            success_rate(history, &params).map(|rate| (*cell, rate))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rows = sweep
        .withdrawal_rates
        .iter()
        .map(|&withdrawal_rate| SuccessScoreRow {
            withdrawal_rate,
            success_rates: vec![0.0; sweep.payout_periods.len()],
        })
        .collect::<Vec<_>>();
    for (cell, rate) in rates {
        rows[cell.row].success_rates[cell.column] = rate;
    }
    rows.sort_by(|a, b| a.withdrawal_rate.total_cmp(&b.withdrawal_rate));

    let total_rows = rows.len();
    let rows = truncate_at_first_ruin(rows, 0);
    let truncated_rows = total_rows - rows.len();

    Ok(SuccessSurface {
        strategy,
        payout_periods: sweep.payout_periods.clone(),
        rows,
        truncated_rows,
    })
}

/// Keeps rows up to and including the first whose `reference_column` rate is exactly zero.
pub fn truncate_at_first_ruin(
    mut rows: Vec<SuccessScoreRow>,
    reference_column: usize,
) -> Vec<SuccessScoreRow> {
    let Some(first_zero) = rows
        .iter()
        .position(|row| row.success_rates.get(reference_column) == Some(&0.0))
    else {
        return rows;
    };

    let dropped = rows.split_off(first_zero + 1);
    if let Some(row) = dropped
        .iter()
        .find(|row| row.success_rates.iter().any(|&rate| rate > 0.0))
    {
        warn!(
            "truncation after withdrawal rate {:.4} dropped non-zero success rates (first at {:.4})",
            rows[first_zero].withdrawal_rate, row.withdrawal_rate
        );
    }
    rows
}
