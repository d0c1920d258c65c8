//! Historical annual returns loaded from the `Dates,us_stocks,...,inflation` CSV layout.

use std::io::Read;
use std::path::Path;

use csv::Reader;
use log::debug;
use serde::Deserialize;

use super::error::{Result, SwrError};
use super::types::{AnnualSeries, AssetClass};

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Dates")]
    dates: String,
    us_stocks: f64,
    us_bonds: f64,
    intl_stocks: f64,
    intl_bonds: f64,
    inflation: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalDataset {
    years: Vec<i32>,
    asset_returns: [Vec<f64>; 4],
    inflation: Vec<f64>,
}

impl HistoricalDataset {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let dataset = Self::from_csv_reader(Reader::from_path(path)?)?;
        debug!(
            "loaded {} years of history from {}",
            dataset.len(),
            path.display()
        );
        Ok(dataset)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Self::from_csv_reader(Reader::from_reader(reader))
    }

    fn from_csv_reader<R: Read>(mut reader: Reader<R>) -> Result<Self> {
        let mut rows = Vec::new();
        for result in reader.deserialize() {
            let row: CsvRow = result?;
            let year = year_from_label(&row.dates)?;
            rows.push((year, row));
        }
        if rows.is_empty() {
            return Err(SwrError::Dataset("dataset has no rows".to_string()));
        }

        rows.sort_by_key(|(year, _)| *year);
        for pair in rows.windows(2) {
            let (prev, next) = (pair[0].0, pair[1].0);
            if next == prev {
                return Err(SwrError::Dataset(format!("duplicate year {next}")));
            }
            if next != prev + 1 {
                return Err(SwrError::Dataset(format!(
                    "years are not contiguous: {prev} is followed by {next}"
                )));
            }
        }

        let mut years = Vec::with_capacity(rows.len());
        let mut asset_returns: [Vec<f64>; 4] = Default::default();
        let mut inflation = Vec::with_capacity(rows.len());
        for (year, row) in rows {
            years.push(year);
            asset_returns[0].push(row.us_stocks);
            asset_returns[1].push(row.us_bonds);
            asset_returns[2].push(row.intl_stocks);
            asset_returns[3].push(row.intl_bonds);
            inflation.push(row.inflation);
        }

        Ok(Self {
            years,
            asset_returns,
            inflation,
        })
    }

    pub fn years(&self) -> &[i32] {
        &self.years
    }

    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }

    pub fn asset_returns(&self, asset: AssetClass) -> AnnualSeries {
        let values = self.asset_returns[asset_slot(asset)].clone();
        AnnualSeries::from_start(self.years[0], values)
    }

    pub fn inflation(&self) -> AnnualSeries {
        AnnualSeries::from_start(self.years[0], self.inflation.clone())
    }
}

fn asset_slot(asset: AssetClass) -> usize {
    match asset {
        AssetClass::UsStocks => 0,
        AssetClass::UsBonds => 1,
        AssetClass::IntlStocks => 2,
        AssetClass::IntlBonds => 3,
    }
}

fn year_from_label(label: &str) -> Result<i32> {
    let trimmed = label.trim();
    let head = trimmed.get(..4).unwrap_or(trimmed);
    head.parse::<i32>()
        .map_err(|_| SwrError::Dataset(format!("cannot read a year from Dates value {label:?}")))
}
