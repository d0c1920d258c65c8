use serde::Serialize;

use super::error::{Result, SwrError};

pub const DEFAULT_INITIAL_PORTFOLIO: f64 = 1_000_000.0;
pub const DEFAULT_CEILING_GROWTH_RATE: f64 = 0.05;
pub const DEFAULT_FLOOR_SHRINK_RATE: f64 = 0.015;
pub const REFERENCE_PAYOUT_PERIODS: [u32; 3] = [30, 40, 50];
pub const REFERENCE_RATE_MIN: f64 = 0.03;
pub const REFERENCE_RATE_STEP: f64 = 0.0025;
pub const REFERENCE_RATE_COUNT: usize = 37;

/// Year-indexed sequence of annual values, ascending and one value per year.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnualSeries {
    years: Vec<i32>,
    values: Vec<f64>,
}

impl AnnualSeries {
    pub fn new(years: Vec<i32>, values: Vec<f64>) -> Result<Self> {
        if years.len() != values.len() {
            return Err(SwrError::InvalidParameter(format!(
                "series has {} years but {} values",
                years.len(),
                values.len()
            )));
        }
        Ok(Self { years, values })
    }

    pub fn from_start(start_year: i32, values: Vec<f64>) -> Self {
        let years = (0..values.len()).map(|i| start_year + i as i32).collect();
        Self { years, values }
    }

    pub fn years(&self) -> &[i32] {
        &self.years
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn position_of(&self, year: i32) -> Option<usize> {
        self.years.iter().position(|&y| y == year)
    }
}

/// Portfolio return series paired with the inflation series over the same years.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketHistory {
    returns: AnnualSeries,
    inflation: AnnualSeries,
}

impl MarketHistory {
    pub fn new(returns: AnnualSeries, inflation: AnnualSeries) -> Result<Self> {
        if returns.years() != inflation.years() {
            return Err(SwrError::MisalignedSeries {
                returns: returns.len(),
                inflation: inflation.len(),
            });
        }
        Ok(Self { returns, inflation })
    }

    pub fn returns(&self) -> &AnnualSeries {
        &self.returns
    }

    pub fn inflation(&self) -> &AnnualSeries {
        &self.inflation
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    pub fn year(&self, index: usize) -> i32 {
        self.returns.years()[index]
    }

    pub fn market_year(&self, index: usize) -> MarketYear {
        MarketYear {
            portfolio_return: self.returns.values()[index],
            inflation: self.inflation.values()[index],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketYear {
    pub portfolio_return: f64,
    pub inflation: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum AssetClass {
    UsStocks,
    UsBonds,
    IntlStocks,
    IntlBonds,
}

impl AssetClass {
    pub const ALL: [AssetClass; 4] = [
        AssetClass::UsStocks,
        AssetClass::UsBonds,
        AssetClass::IntlStocks,
        AssetClass::IntlBonds,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AssetClass::UsStocks => "US Stocks",
            AssetClass::UsBonds => "US Bonds",
            AssetClass::IntlStocks => "International Stocks",
            AssetClass::IntlBonds => "International Bonds",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            AssetClass::UsStocks => "us_stocks",
            AssetClass::UsBonds => "us_bonds",
            AssetClass::IntlStocks => "intl_stocks",
            AssetClass::IntlBonds => "intl_bonds",
        }
    }
}

/// Whole-percent allocation per asset class.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWeights {
    pub us_stocks: u32,
    pub us_bonds: u32,
    pub intl_stocks: u32,
    pub intl_bonds: u32,
}

impl Default for AllocationWeights {
    fn default() -> Self {
        Self {
            us_stocks: 100,
            us_bonds: 0,
            intl_stocks: 0,
            intl_bonds: 0,
        }
    }
}

impl AllocationWeights {
    pub fn percent(&self, asset: AssetClass) -> u32 {
        match asset {
            AssetClass::UsStocks => self.us_stocks,
            AssetClass::UsBonds => self.us_bonds,
            AssetClass::IntlStocks => self.intl_stocks,
            AssetClass::IntlBonds => self.intl_bonds,
        }
    }

    pub fn fraction(&self, asset: AssetClass) -> f64 {
        self.percent(asset) as f64 / 100.0
    }

    pub fn total(&self) -> u32 {
        AssetClass::ALL.iter().map(|&a| self.percent(a)).sum()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    FixedReal,
    DynamicSpending,
}

impl StrategyKind {
    pub fn title(self) -> &'static str {
        match self {
            StrategyKind::FixedReal => "Dollar Plus Inflation Strategy",
            StrategyKind::DynamicSpending => "Dynamic Spending Rule",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WithdrawalStrategy {
    FixedReal,
    DynamicSpending {
        ceiling_growth_rate: f64,
        floor_shrink_rate: f64,
    },
}

impl WithdrawalStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            WithdrawalStrategy::FixedReal => StrategyKind::FixedReal,
            WithdrawalStrategy::DynamicSpending { .. } => StrategyKind::DynamicSpending,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulationParameters {
    pub initial_portfolio_value: f64,
    pub fee_rate: f64,
    pub withdrawal_rate: f64,
    pub payout_period_years: u32,
    pub strategy: WithdrawalStrategy,
}

impl SimulationParameters {
    pub fn validate(&self) -> Result<()> {
        if !self.initial_portfolio_value.is_finite() || self.initial_portfolio_value <= 0.0 {
            return Err(SwrError::InvalidParameter(
                "initial portfolio value must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(SwrError::InvalidParameter(
                "fee rate must be in [0, 1)".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.withdrawal_rate) {
            return Err(SwrError::InvalidParameter(
                "withdrawal rate must be in [0, 1)".to_string(),
            ));
        }
        if let WithdrawalStrategy::DynamicSpending {
            ceiling_growth_rate,
            floor_shrink_rate,
        } = self.strategy
        {
            if !ceiling_growth_rate.is_finite() || ceiling_growth_rate < 0.0 {
                return Err(SwrError::InvalidParameter(
                    "ceiling growth rate must be >= 0".to_string(),
                ));
            }
            if !floor_shrink_rate.is_finite() || floor_shrink_rate < 0.0 {
                return Err(SwrError::InvalidParameter(
                    "floor shrink rate must be >= 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowOutcome {
    pub start_year: i32,
    pub end_year: i32,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearTracePoint {
    pub year: i32,
    pub portfolio_return: f64,
    pub inflation: f64,
    pub withdrawal: f64,
    pub portfolio_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessScoreRow {
    pub withdrawal_rate: f64,
    /// One entry per payout period, in the surface's period order.
    pub success_rates: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessSurface {
    pub strategy: StrategyKind,
    pub payout_periods: Vec<u32>,
    pub rows: Vec<SuccessScoreRow>,
    pub truncated_rows: usize,
}

impl SuccessSurface {
    pub fn success_rate(&self, withdrawal_rate: f64, payout_period_years: u32) -> Option<f64> {
        let column = self
            .payout_periods
            .iter()
            .position(|&p| p == payout_period_years)?;
        self.rows
            .iter()
            .find(|row| (row.withdrawal_rate - withdrawal_rate).abs() < 1e-12)
            .map(|row| row.success_rates[column])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub withdrawal_rates: Vec<f64>,
    pub payout_periods: Vec<u32>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::linear(
            REFERENCE_RATE_MIN,
            REFERENCE_RATE_STEP,
            REFERENCE_RATE_COUNT,
            REFERENCE_PAYOUT_PERIODS.to_vec(),
        )
    }
}

impl SweepConfig {
    pub fn linear(min: f64, step: f64, count: usize, payout_periods: Vec<u32>) -> Self {
        Self {
            withdrawal_rates: (0..count).map(|i| min + i as f64 * step).collect(),
            payout_periods,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.withdrawal_rates.is_empty() {
            return Err(SwrError::InvalidParameter(
                "at least one withdrawal rate is required".to_string(),
            ));
        }
        if self.payout_periods.is_empty() {
            return Err(SwrError::InvalidParameter(
                "at least one payout period is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inputs {
    pub initial_portfolio_value: f64,
    pub fee_rate: f64,
    pub weights: AllocationWeights,
    pub sweep: SweepConfig,
    pub ceiling_growth_rate: f64,
    pub floor_shrink_rate: f64,
    pub strategies: Vec<StrategyKind>,
}

impl Default for Inputs {
    fn default() -> Self {
        Self {
            initial_portfolio_value: DEFAULT_INITIAL_PORTFOLIO,
            fee_rate: 0.0,
            weights: AllocationWeights::default(),
            sweep: SweepConfig::default(),
            ceiling_growth_rate: DEFAULT_CEILING_GROWTH_RATE,
            floor_shrink_rate: DEFAULT_FLOOR_SHRINK_RATE,
            strategies: vec![StrategyKind::FixedReal, StrategyKind::DynamicSpending],
        }
    }
}

impl Inputs {
    pub fn strategy(&self, kind: StrategyKind) -> WithdrawalStrategy {
        match kind {
            StrategyKind::FixedReal => WithdrawalStrategy::FixedReal,
            StrategyKind::DynamicSpending => WithdrawalStrategy::DynamicSpending {
                ceiling_growth_rate: self.ceiling_growth_rate,
                floor_shrink_rate: self.floor_shrink_rate,
            },
        }
    }

    pub fn parameters(
        &self,
        kind: StrategyKind,
        withdrawal_rate: f64,
        payout_period_years: u32,
    ) -> SimulationParameters {
        SimulationParameters {
            initial_portfolio_value: self.initial_portfolio_value,
            fee_rate: self.fee_rate,
            withdrawal_rate,
            payout_period_years,
            strategy: self.strategy(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub first_year: i32,
    pub last_year: i32,
    pub surfaces: Vec<SuccessSurface>,
}
