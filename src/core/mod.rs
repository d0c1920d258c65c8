mod dataset;
mod engine;
mod error;
mod series;
mod solver;
mod surface;
mod types;

pub use dataset::HistoricalDataset;
pub use engine::{
    WindowState, simulate_window, step, success_rate, trace_window, window_count,
    window_outcomes,
};
pub use error::{Result, SwrError};
pub use series::{build_market_history, portfolio_returns, validate_weights, weighted_returns};
pub use solver::{RateSolveConfig, RateSolveIteration, RateSolveResult, solve_max_withdrawal_rate};
pub use surface::{SweepCell, build_success_surface, run_analysis, sweep_cells, truncate_at_first_ruin};
pub use types::{
    AllocationWeights, AnalysisResult, AnnualSeries, AssetClass, DEFAULT_CEILING_GROWTH_RATE,
    DEFAULT_FLOOR_SHRINK_RATE, DEFAULT_INITIAL_PORTFOLIO, Inputs, MarketHistory, MarketYear,
    REFERENCE_PAYOUT_PERIODS, REFERENCE_RATE_COUNT, REFERENCE_RATE_MIN, REFERENCE_RATE_STEP,
    SimulationParameters, StrategyKind, SuccessScoreRow, SuccessSurface, SweepConfig,
    WindowOutcome, WithdrawalStrategy, YearTracePoint,
};
