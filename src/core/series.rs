use super::dataset::HistoricalDataset;
use super::error::{Result, SwrError};
use super::types::{AllocationWeights, AnnualSeries, AssetClass, MarketHistory};

pub fn validate_weights(weights: &AllocationWeights) -> Result<()> {
    let total = weights.total();
    if total != 100 {
        return Err(SwrError::AllocationWeights { total });
    }
    Ok(())
}

/// Per-year weighted sum of the asset return series. All series must share one year index.
pub fn weighted_returns(components: &[(f64, &AnnualSeries)]) -> Result<AnnualSeries> {
    let Some((_, first)) = components.first() else {
        return Err(SwrError::InvalidParameter(
            "at least one asset series is required".to_string(),
        ));
    };

    let mut values = vec![0.0; first.len()];
    for (weight, series) in components {
        if series.years() != first.years() {
            return Err(SwrError::MisalignedAssets {
                expected: year_span(first),
                found: year_span(series),
            });
        }
        for (total, value) in values.iter_mut().zip(series.values()) {
            *total += weight * value;
        }
    }

    AnnualSeries::new(first.years().to_vec(), values)
}

fn year_span(series: &AnnualSeries) -> String {
    match (series.years().first(), series.years().last()) {
        (Some(first), Some(last)) => format!("{first}-{last}"),
        _ => "no years".to_string(),
    }
}

pub fn portfolio_returns(
    dataset: &HistoricalDataset,
    weights: &AllocationWeights,
) -> Result<AnnualSeries> {
    validate_weights(weights)?;

    let series = AssetClass::ALL
        .iter()
        .map(|&asset| (weights.fraction(asset), dataset.asset_returns(asset)))
        .collect::<Vec<_>>();
    let components = series
        .iter()
        .map(|(weight, s)| (*weight, s))
        .collect::<Vec<_>>();
    weighted_returns(&components)
}

pub fn build_market_history(
    dataset: &HistoricalDataset,
    weights: &AllocationWeights,
) -> Result<MarketHistory> {
    let returns = portfolio_returns(dataset, weights)?;
    MarketHistory::new(returns, dataset.inflation())
}
