use axum::{
    Router,
    extract::{
        Json, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::core::{
    AllocationWeights, HistoricalDataset, Inputs, RateSolveConfig, RateSolveResult,
    StrategyKind, SuccessSurface, SweepConfig, SwrError, WindowOutcome, YearTracePoint,
    build_market_history, run_analysis, solve_max_withdrawal_rate, trace_window,
};

const MAX_WITHDRAWAL_RATES: usize = 1_000;
const MAX_PAYOUT_PERIODS: usize = 100;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliStrategy {
    FixedReal,
    Dynamic,
    Both,
}

impl CliStrategy {
    fn kinds(self) -> Vec<StrategyKind> {
        match self {
            CliStrategy::FixedReal => vec![StrategyKind::FixedReal],
            CliStrategy::Dynamic => vec![StrategyKind::DynamicSpending],
            CliStrategy::Both => vec![StrategyKind::FixedReal, StrategyKind::DynamicSpending],
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiStrategy {
    #[serde(alias = "fixedReal", alias = "fixed_real", alias = "dollar-plus")]
    FixedReal,
    #[serde(alias = "dynamic-spending", alias = "dynamicSpending")]
    Dynamic,
    Both,
}

impl From<ApiStrategy> for CliStrategy {
    fn from(value: ApiStrategy) -> Self {
        match value {
            ApiStrategy::FixedReal => CliStrategy::FixedReal,
            ApiStrategy::Dynamic => CliStrategy::Dynamic,
            ApiStrategy::Both => CliStrategy::Both,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "swr",
    about = "Historical safe withdrawal rate backtester (dollar-plus-inflation and dynamic spending rules)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, help = "Annual returns CSV (Dates, asset columns, inflation)")]
        data: PathBuf,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print success-rate tables for each strategy
    Run {
        #[arg(long)]
        data: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long, help = "Print JSON instead of tables")]
        json: bool,
    },
    /// Find the highest withdrawal rate meeting a target success rate
    Solve {
        #[arg(long)]
        data: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        solve: SolveArgs,
    },
    /// Trace one rolling window year by year
    Window {
        #[arg(long)]
        data: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        window: WindowArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Annual portfolio fee in percent (0 to 2)"
    )]
    pub fee_rate: f64,
    #[arg(long, default_value_t = 100, help = "US stocks allocation in percent")]
    pub us_stocks: u32,
    #[arg(long, default_value_t = 0, help = "US bonds allocation in percent")]
    pub us_bonds: u32,
    #[arg(
        long,
        default_value_t = 0,
        help = "International stocks allocation in percent"
    )]
    pub intl_stocks: u32,
    #[arg(
        long,
        default_value_t = 0,
        help = "International bonds allocation in percent"
    )]
    pub intl_bonds: u32,
    #[arg(long, default_value_t = 1_000_000.0)]
    pub initial_portfolio: f64,
    #[arg(
        long,
        default_value_t = 3.0,
        help = "First withdrawal rate of the sweep in percent"
    )]
    pub withdrawal_rate_min: f64,
    #[arg(long, default_value_t = 0.25, help = "Sweep step in percent")]
    pub withdrawal_rate_step: f64,
    #[arg(long, default_value_t = 37, help = "Number of withdrawal rates swept")]
    pub withdrawal_rate_count: usize,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Explicit withdrawal rates in percent; overrides the linear sweep"
    )]
    pub withdrawal_rates: Option<Vec<f64>>,
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [30u32, 40, 50],
        help = "Payout periods in years; the first one drives truncation"
    )]
    pub payout_periods: Vec<u32>,
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Dynamic rule: max yearly withdrawal increase in percent"
    )]
    pub ceiling_growth: f64,
    #[arg(
        long,
        default_value_t = 1.5,
        help = "Dynamic rule: max yearly withdrawal decrease in percent"
    )]
    pub floor_shrink: f64,
    #[arg(long, value_enum, default_value_t = CliStrategy::Both)]
    pub strategy: CliStrategy,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct SolveArgs {
    #[arg(long, default_value_t = 30)]
    pub payout_period: u32,
    #[arg(
        long,
        default_value_t = 95.0,
        help = "Required historical success rate in percent"
    )]
    pub target_success: f64,
    #[arg(long, default_value_t = 0.0, help = "Lower search bound in percent")]
    pub search_min: f64,
    #[arg(long, default_value_t = 20.0, help = "Upper search bound in percent")]
    pub search_max: f64,
    #[arg(
        long,
        default_value_t = 0.01,
        help = "Search tolerance in percentage points"
    )]
    pub tolerance: f64,
    #[arg(long, default_value_t = 40)]
    pub max_iterations: u32,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct WindowArgs {
    #[arg(long)]
    pub start_year: i32,
    #[arg(long, default_value_t = 4.0, help = "Withdrawal rate in percent")]
    pub withdrawal_rate: f64,
    #[arg(long, default_value_t = 30)]
    pub payout_period: u32,
}

/// List-valued payload key: a JSON array, or a comma-separated string as sent in query strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ListParam<T> {
    Many(Vec<T>),
    Joined(String),
}

impl<T: FromStr> ListParam<T> {
    fn into_values(self, key: &str) -> Result<Vec<T>, String> {
        match self {
            ListParam::Many(values) => Ok(values),
            ListParam::Joined(text) => text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| {
                    item.parse::<T>()
                        .map_err(|_| format!("{key} has an invalid entry '{item}'"))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApiPayload {
    fee_rate: Option<f64>,
    us_stocks: Option<u32>,
    us_bonds: Option<u32>,
    intl_stocks: Option<u32>,
    intl_bonds: Option<u32>,
    initial_portfolio: Option<f64>,
    withdrawal_rate_min: Option<f64>,
    withdrawal_rate_step: Option<f64>,
    withdrawal_rate_count: Option<usize>,
    withdrawal_rates: Option<ListParam<f64>>,
    payout_periods: Option<ListParam<u32>>,
    ceiling_growth: Option<f64>,
    floor_shrink: Option<f64>,
    strategy: Option<ApiStrategy>,

    payout_period: Option<u32>,
    target_success: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u32>,

    start_year: Option<i32>,
    withdrawal_rate: Option<f64>,
}

#[derive(Debug)]
struct ApiRequest {
    inputs: Inputs,
    solve: RateSolveConfig,
    start_year: Option<i32>,
    window_rate: f64,
    window_period: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    first_year: i32,
    last_year: i32,
    fee_rate: f64,
    initial_portfolio_value: f64,
    weights: AllocationWeights,
    surfaces: Vec<SuccessSurface>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveResponse {
    results: Vec<RateSolveResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WindowTrace {
    strategy: StrategyKind,
    outcome: WindowOutcome,
    years: Vec<YearTracePoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WindowResponse {
    withdrawal_rate: f64,
    payout_period_years: u32,
    traces: Vec<WindowTrace>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    years: usize,
}

struct AppState {
    dataset: HistoricalDataset,
}

fn build_inputs(model: ModelArgs) -> Result<Inputs, String> {
    if !(0.0..=2.0).contains(&model.fee_rate) {
        return Err("--fee-rate must be between 0 and 2".to_string());
    }

    for (name, weight) in [
        ("--us-stocks", model.us_stocks),
        ("--us-bonds", model.us_bonds),
        ("--intl-stocks", model.intl_stocks),
        ("--intl-bonds", model.intl_bonds),
    ] {
        if weight > 100 {
            return Err(format!("{name} must be between 0 and 100"));
        }
    }

    if !model.initial_portfolio.is_finite() || model.initial_portfolio <= 0.0 {
        return Err("--initial-portfolio must be > 0".to_string());
    }

    let withdrawal_rates = match model.withdrawal_rates {
        Some(rates) => {
            if rates.is_empty() {
                return Err("--withdrawal-rates must not be empty".to_string());
            }
            if rates.len() > MAX_WITHDRAWAL_RATES {
                return Err(format!(
                    "--withdrawal-rates accepts at most {MAX_WITHDRAWAL_RATES} rates"
                ));
            }
            rates.into_iter().map(|r| r / 100.0).collect::<Vec<_>>()
        }
        None => {
            if !(1..=MAX_WITHDRAWAL_RATES).contains(&model.withdrawal_rate_count) {
                return Err(format!(
                    "--withdrawal-rate-count must be between 1 and {MAX_WITHDRAWAL_RATES}"
                ));
            }
            if !model.withdrawal_rate_step.is_finite() || model.withdrawal_rate_step <= 0.0 {
                return Err("--withdrawal-rate-step must be > 0".to_string());
            }
            (0..model.withdrawal_rate_count)
                .map(|i| (model.withdrawal_rate_min + i as f64 * model.withdrawal_rate_step) / 100.0)
                .collect()
        }
    };

    if withdrawal_rates.iter().any(|r| !(0.0..1.0).contains(r)) {
        return Err("withdrawal rates must be between 0 and 100 (exclusive)".to_string());
    }

    if model.payout_periods.is_empty() {
        return Err("--payout-periods must not be empty".to_string());
    }
    if model.payout_periods.len() > MAX_PAYOUT_PERIODS {
        return Err(format!(
            "--payout-periods accepts at most {MAX_PAYOUT_PERIODS} periods"
        ));
    }
    if model.payout_periods.contains(&0) {
        return Err("--payout-periods must all be > 0".to_string());
    }

    if !model.ceiling_growth.is_finite() || model.ceiling_growth < 0.0 {
        return Err("--ceiling-growth must be >= 0".to_string());
    }
    if !(0.0..=100.0).contains(&model.floor_shrink) {
        return Err("--floor-shrink must be between 0 and 100".to_string());
    }

    Ok(Inputs {
        initial_portfolio_value: model.initial_portfolio,
        fee_rate: model.fee_rate / 100.0,
        weights: AllocationWeights {
            us_stocks: model.us_stocks,
            us_bonds: model.us_bonds,
            intl_stocks: model.intl_stocks,
            intl_bonds: model.intl_bonds,
        },
        sweep: SweepConfig {
            withdrawal_rates,
            payout_periods: model.payout_periods,
        },
        ceiling_growth_rate: model.ceiling_growth / 100.0,
        floor_shrink_rate: model.floor_shrink / 100.0,
        strategies: model.strategy.kinds(),
    })
}

fn build_solve_config(args: SolveArgs) -> Result<RateSolveConfig, String> {
    if !(0.0..=100.0).contains(&args.target_success) {
        return Err("--target-success must be between 0 and 100".to_string());
    }
    if args.search_min < 0.0 || args.search_max >= 100.0 {
        return Err("--search-min and --search-max must lie within [0, 100)".to_string());
    }
    if args.search_max <= args.search_min {
        return Err("--search-max must be greater than --search-min".to_string());
    }
    if !args.tolerance.is_finite() || args.tolerance <= 0.0 {
        return Err("--tolerance must be > 0".to_string());
    }
    if args.max_iterations == 0 {
        return Err("--max-iterations must be > 0".to_string());
    }
    Ok(RateSolveConfig {
        payout_period_years: args.payout_period,
        target_success_rate: args.target_success / 100.0,
        search_min: args.search_min / 100.0,
        search_max: args.search_max / 100.0,
        tolerance: args.tolerance / 100.0,
        max_iterations: args.max_iterations,
    })
}

fn default_model_args() -> ModelArgs {
    ModelArgs {
        fee_rate: 0.0,
        us_stocks: 100,
        us_bonds: 0,
        intl_stocks: 0,
        intl_bonds: 0,
        initial_portfolio: 1_000_000.0,
        withdrawal_rate_min: 3.0,
        withdrawal_rate_step: 0.25,
        withdrawal_rate_count: 37,
        withdrawal_rates: None,
        payout_periods: vec![30, 40, 50],
        ceiling_growth: 5.0,
        floor_shrink: 1.5,
        strategy: CliStrategy::Both,
    }
}

fn default_solve_args() -> SolveArgs {
    SolveArgs {
        payout_period: 30,
        target_success: 95.0,
        search_min: 0.0,
        search_max: 20.0,
        tolerance: 0.01,
        max_iterations: 40,
    }
}

fn default_window_args() -> WindowArgs {
    WindowArgs {
        start_year: 0,
        withdrawal_rate: 4.0,
        payout_period: 30,
    }
}

fn api_request_from_payload(payload: ApiPayload) -> Result<ApiRequest, String> {
    let mut model = default_model_args();
    let mut solve = default_solve_args();
    let mut window = default_window_args();

    if let Some(v) = payload.fee_rate {
        model.fee_rate = v;
    }
    if let Some(v) = payload.us_stocks {
        model.us_stocks = v;
    }
    if let Some(v) = payload.us_bonds {
        model.us_bonds = v;
    }
    if let Some(v) = payload.intl_stocks {
        model.intl_stocks = v;
    }
    if let Some(v) = payload.intl_bonds {
        model.intl_bonds = v;
    }
    if let Some(v) = payload.initial_portfolio {
        model.initial_portfolio = v;
    }
    if let Some(v) = payload.withdrawal_rate_min {
        model.withdrawal_rate_min = v;
    }
    if let Some(v) = payload.withdrawal_rate_step {
        model.withdrawal_rate_step = v;
    }
    if let Some(v) = payload.withdrawal_rate_count {
        model.withdrawal_rate_count = v;
    }
    if let Some(v) = payload.withdrawal_rates {
        model.withdrawal_rates = Some(v.into_values("withdrawalRates")?);
    }
    if let Some(v) = payload.payout_periods {
        model.payout_periods = v.into_values("payoutPeriods")?;
    }
    if let Some(v) = payload.ceiling_growth {
        model.ceiling_growth = v;
    }
    if let Some(v) = payload.floor_shrink {
        model.floor_shrink = v;
    }
    if let Some(v) = payload.strategy {
        model.strategy = v.into();
    }

    if let Some(v) = payload.payout_period {
        solve.payout_period = v;
        window.payout_period = v;
    }
    if let Some(v) = payload.target_success {
        solve.target_success = v;
    }
    if let Some(v) = payload.search_min {
        solve.search_min = v;
    }
    if let Some(v) = payload.search_max {
        solve.search_max = v;
    }
    if let Some(v) = payload.tolerance {
        solve.tolerance = v;
    }
    if let Some(v) = payload.max_iterations {
        solve.max_iterations = v;
    }
    if let Some(v) = payload.withdrawal_rate {
        window.withdrawal_rate = v;
    }

    let window_rate = window_rate(window.withdrawal_rate)?;

    Ok(ApiRequest {
        inputs: build_inputs(model)?,
        solve: build_solve_config(solve)?,
        start_year: payload.start_year,
        window_rate,
        window_period: window.payout_period,
    })
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<ApiPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn window_rate(percent: f64) -> Result<f64, String> {
    if !(0.0..100.0).contains(&percent) {
        return Err("--withdrawal-rate must be between 0 and 100 (exclusive)".to_string());
    }
    Ok(percent / 100.0)
}

fn analyze(dataset: &HistoricalDataset, inputs: &Inputs) -> Result<AnalyzeResponse, SwrError> {
    let result = run_analysis(dataset, inputs)?;
    Ok(AnalyzeResponse {
        first_year: result.first_year,
        last_year: result.last_year,
        fee_rate: inputs.fee_rate,
        initial_portfolio_value: inputs.initial_portfolio_value,
        weights: inputs.weights,
        surfaces: result.surfaces,
    })
}

fn solve(
    dataset: &HistoricalDataset,
    inputs: &Inputs,
    config: RateSolveConfig,
) -> Result<SolveResponse, SwrError> {
    let history = build_market_history(dataset, &inputs.weights)?;
    let results = inputs
        .strategies
        .iter()
        .map(|&strategy| solve_max_withdrawal_rate(&history, inputs, strategy, config))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SolveResponse { results })
}

fn window(
    dataset: &HistoricalDataset,
    inputs: &Inputs,
    start_year: i32,
    withdrawal_rate: f64,
    payout_period_years: u32,
) -> Result<WindowResponse, SwrError> {
    let history = build_market_history(dataset, &inputs.weights)?;
    let traces = inputs
        .strategies
        .iter()
        .map(|&strategy| {
            let params = inputs.parameters(strategy, withdrawal_rate, payout_period_years);
            trace_window(&history, &params, start_year).map(|(outcome, years)| WindowTrace {
                strategy,
                outcome,
                years,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(WindowResponse {
        withdrawal_rate,
        payout_period_years,
        traces,
    })
}

pub async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Serve { data, port } => {
            let dataset = load_dataset(&data)?;
            run_http_server(dataset, port)
                .await
                .map_err(|e| format!("Server error: {e}"))
        }
        Command::Run { data, model, json } => {
            let dataset = load_dataset(&data)?;
            let inputs = build_inputs(model)?;
            let response = analyze(&dataset, &inputs).map_err(|e| e.to_string())?;
            if json {
                println!("{}", to_json(&response)?);
            } else {
                println!(
                    "Historical windows from {} to {}\n",
                    response.first_year, response.last_year
                );
                for surface in &response.surfaces {
                    println!("{}", surface.strategy.title());
                    println!("{}", render_surface_table(surface));
                }
            }
            Ok(())
        }
        Command::Solve {
            data,
            model,
            solve: solve_args,
        } => {
            let dataset = load_dataset(&data)?;
            let inputs = build_inputs(model)?;
            let config = build_solve_config(solve_args)?;
            let response = solve(&dataset, &inputs, config).map_err(|e| e.to_string())?;
            for result in &response.results {
                println!("{}", render_solve_result(result));
            }
            Ok(())
        }
        Command::Window {
            data,
            model,
            window: window_args,
        } => {
            let dataset = load_dataset(&data)?;
            let inputs = build_inputs(model)?;
            let rate = window_rate(window_args.withdrawal_rate)?;
            let response = window(
                &dataset,
                &inputs,
                window_args.start_year,
                rate,
                window_args.payout_period,
            )
            .map_err(|e| e.to_string())?;
            for trace in &response.traces {
                println!("{}", trace.strategy.title());
                println!("{}", render_window_trace(trace));
            }
            Ok(())
        }
    }
}

fn load_dataset(path: &Path) -> Result<HistoricalDataset, String> {
    HistoricalDataset::load(path).map_err(|e| format!("{}: {e}", path.display()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("cannot serialize response: {e}"))
}

pub async fn run_http_server(dataset: HistoricalDataset, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = Arc::new(AppState { dataset });
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/analyze", get(analyze_get_handler).post(analyze_post_handler))
        .route("/api/solve", get(solve_get_handler).post(solve_post_handler))
        .route("/api/window", get(window_get_handler).post(window_post_handler))
        .fallback(not_found_handler)
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("SWR HTTP API listening on http://{addr}");
    info!("Local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            years: state.dataset.len(),
        },
    )
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn analyze_get_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ApiPayload>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(payload)) => run_blocking(state, payload, analyze_handler_impl).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn analyze_post_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ApiPayload>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(payload)) => run_blocking(state, payload, analyze_handler_impl).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn solve_get_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ApiPayload>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(payload)) => run_blocking(state, payload, solve_handler_impl).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn solve_post_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ApiPayload>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(payload)) => run_blocking(state, payload, solve_handler_impl).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn window_get_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ApiPayload>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(payload)) => run_blocking(state, payload, window_handler_impl).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn window_post_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ApiPayload>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(payload)) => run_blocking(state, payload, window_handler_impl).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

/// Sweeps are CPU-bound, so they run on tokio's blocking pool.
async fn run_blocking(
    state: Arc<AppState>,
    payload: ApiPayload,
    handler: fn(&AppState, ApiPayload) -> Response,
) -> Response {
    match tokio::task::spawn_blocking(move || handler(&state, payload)).await {
        Ok(response) => response,
        Err(e) => {
            error!("request task failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "request task failed")
        }
    }
}

fn analyze_handler_impl(state: &AppState, payload: ApiPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    match analyze(&state.dataset, &request.inputs) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(e) => core_error_response(&e),
    }
}

fn solve_handler_impl(state: &AppState, payload: ApiPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    match solve(&state.dataset, &request.inputs, request.solve) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(e) => core_error_response(&e),
    }
}

fn window_handler_impl(state: &AppState, payload: ApiPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let Some(start_year) = request.start_year else {
        return error_response(StatusCode::BAD_REQUEST, "startYear is required");
    };
    match window(
        &state.dataset,
        &request.inputs,
        start_year,
        request.window_rate,
        request.window_period,
    ) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(e) => core_error_response(&e),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn core_error_response(err: &SwrError) -> Response {
    if err.is_configuration() {
        error_response(StatusCode::BAD_REQUEST, &err.to_string())
    } else {
        error!("request failed: {err}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    }
}

fn percent(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

fn render_surface_table(surface: &SuccessSurface) -> String {
    let mut headers = vec!["Withdrawal Rate".to_string()];
    headers.extend(
        surface
            .payout_periods
            .iter()
            .map(|p| format!("Payout Period {p} years")),
    );
    let widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();

    let mut out = String::new();
    out.push_str(&format_row(&headers, &widths));
    for row in &surface.rows {
        let mut cells = vec![percent(row.withdrawal_rate)];
        cells.extend(row.success_rates.iter().map(|&rate| percent(rate)));
        out.push_str(&format_row(&cells, &widths));
    }
    out
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:>width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    format!("{line}\n")
}

fn render_solve_result(result: &RateSolveResult) -> String {
    let solved = result
        .solved_rate
        .map(percent)
        .unwrap_or_else(|| "none".to_string());
    let achieved = result
        .achieved_success_rate
        .map(percent)
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "{}: {}-year payout, target {} -> max withdrawal rate {} (success {}). {}",
        result.strategy.title(),
        result.payout_period_years,
        percent(result.target_success_rate),
        solved,
        achieved,
        result.message
    )
}

fn render_window_trace(trace: &WindowTrace) -> String {
    let headers = ["Year", "Return", "Inflation", "Withdrawal", "Portfolio"]
        .map(String::from)
        .to_vec();
    let widths = [6, 10, 10, 16, 18];

    let mut out = String::new();
    out.push_str(&format_row(&headers, &widths));
    for point in &trace.years {
        let cells = vec![
            point.year.to_string(),
            percent(point.portfolio_return),
            percent(point.inflation),
            format!("{:.2}", point.withdrawal),
            format!("{:.2}", point.portfolio_value),
        ];
        out.push_str(&format_row(&cells, &widths));
    }
    let verdict = if trace.outcome.success {
        "survived"
    } else {
        "depleted"
    };
    out.push_str(&format!(
        "{}-{}: {verdict}\n",
        trace.outcome.start_year, trace.outcome.end_year
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::REFERENCE_RATE_COUNT;
    use axum::http::Uri;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_model() -> ModelArgs {
        default_model_args()
    }

    fn synthetic_dataset(years: usize) -> HistoricalDataset {
        let mut csv = String::from("Dates,us_stocks,us_bonds,intl_stocks,intl_bonds,inflation\n");
        for i in 0..years {
            let stocks = match i % 5 {
                0 => -0.18,
                1 => 0.22,
                2 => 0.11,
                3 => 0.04,
                _ => 0.15,
            };
            let inflation = 0.01 + (i % 4) as f64 * 0.01;
            csv.push_str(&format!(
                "{},{stocks},0.04,{},0.03,{inflation}\n",
                1926 + i,
                stocks * 0.8
            ));
        }
        HistoricalDataset::from_reader(csv.as_bytes()).expect("valid csv")
    }

    fn state(years: usize) -> AppState {
        AppState {
            dataset: synthetic_dataset(years),
        }
    }

    #[test]
    fn build_inputs_defaults_to_reference_sweep() {
        let inputs = build_inputs(sample_model()).expect("valid inputs");
        assert_eq!(inputs.sweep.withdrawal_rates.len(), REFERENCE_RATE_COUNT);
        assert_approx(inputs.sweep.withdrawal_rates[0], 0.03);
        assert_approx(inputs.sweep.withdrawal_rates[36], 0.12);
        assert_eq!(inputs.sweep.payout_periods, vec![30, 40, 50]);
        assert_approx(inputs.ceiling_growth_rate, 0.05);
        assert_approx(inputs.floor_shrink_rate, 0.015);
        assert_eq!(
            inputs.strategies,
            vec![StrategyKind::FixedReal, StrategyKind::DynamicSpending]
        );
        assert_eq!(inputs.weights, AllocationWeights::default());
    }

    #[test]
    fn build_inputs_converts_percent_units() {
        let mut model = sample_model();
        model.fee_rate = 1.5;
        model.withdrawal_rates = Some(vec![4.0, 5.5]);
        model.strategy = CliStrategy::Dynamic;

        let inputs = build_inputs(model).expect("valid inputs");
        assert_approx(inputs.fee_rate, 0.015);
        assert_eq!(inputs.sweep.withdrawal_rates, vec![0.04, 0.055]);
        assert_eq!(inputs.strategies, vec![StrategyKind::DynamicSpending]);
    }

    #[test]
    fn build_inputs_rejects_fee_outside_range() {
        let mut model = sample_model();
        model.fee_rate = 2.5;
        let err = build_inputs(model).expect_err("must reject fee");
        assert!(err.contains("--fee-rate"));
    }

    #[test]
    fn build_inputs_rejects_single_weight_above_100() {
        let mut model = sample_model();
        model.intl_bonds = 150;
        let err = build_inputs(model).expect_err("must reject weight");
        assert!(err.contains("--intl-bonds"));
    }

    #[test]
    fn build_inputs_rejects_zero_payout_period() {
        let mut model = sample_model();
        model.payout_periods = vec![30, 0];
        let err = build_inputs(model).expect_err("must reject period");
        assert!(err.contains("--payout-periods"));
    }

    #[test]
    fn build_inputs_caps_sweep_size() {
        let mut model = sample_model();
        model.withdrawal_rate_count = 4_000_000_000;
        model.withdrawal_rate_step = 1e-9;
        let err = build_inputs(model).expect_err("must reject huge sweep");
        assert!(err.contains("--withdrawal-rate-count"));

        let mut model = sample_model();
        model.withdrawal_rates = Some(vec![4.0; MAX_WITHDRAWAL_RATES + 1]);
        let err = build_inputs(model).expect_err("must reject long rate list");
        assert!(err.contains("--withdrawal-rates"));

        let mut model = sample_model();
        model.payout_periods = vec![30; MAX_PAYOUT_PERIODS + 1];
        let err = build_inputs(model).expect_err("must reject long period list");
        assert!(err.contains("--payout-periods"));

        let mut model = sample_model();
        model.withdrawal_rate_count = MAX_WITHDRAWAL_RATES;
        model.withdrawal_rate_min = 0.0;
        model.withdrawal_rate_step = 0.01;
        assert!(build_inputs(model).is_ok());
    }

    #[test]
    fn build_solve_config_rejects_inverted_bounds() {
        let mut args = default_solve_args();
        args.search_min = 10.0;
        args.search_max = 5.0;
        let err = build_solve_config(args).expect_err("must reject bounds");
        assert!(err.contains("--search-max"));
    }

    #[test]
    fn cli_parses_run_subcommand_with_lists() {
        let cli = Cli::try_parse_from([
            "swr",
            "run",
            "--data",
            "returns.csv",
            "--payout-periods",
            "20,25",
            "--us-stocks",
            "60",
            "--us-bonds",
            "40",
            "--strategy",
            "fixed-real",
        ])
        .expect("valid arguments");
        let Command::Run { data, model, json } = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(data, PathBuf::from("returns.csv"));
        assert!(!json);
        assert_eq!(model.payout_periods, vec![20, 25]);
        assert_eq!(model.us_bonds, 40);
        assert_eq!(model.strategy, CliStrategy::FixedReal);
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let json = r#"{
          "feeRate": 0.5,
          "usStocks": 50,
          "usBonds": 30,
          "intlStocks": 10,
          "intlBonds": 10,
          "initialPortfolio": 500000,
          "payoutPeriods": [25, 35],
          "withdrawalRates": [3, 4, 5],
          "ceilingGrowth": 4,
          "floorShrink": 2,
          "strategy": "dynamic-spending",
          "payoutPeriod": 25,
          "targetSuccess": 90,
          "startYear": 1950,
          "withdrawalRate": 4.5
        }"#;
        let request = api_request_from_json(json).expect("json should parse");
        let inputs = request.inputs;

        assert_approx(inputs.fee_rate, 0.005);
        assert_eq!(inputs.weights.us_bonds, 30);
        assert_eq!(inputs.weights.total(), 100);
        assert_approx(inputs.initial_portfolio_value, 500_000.0);
        assert_eq!(inputs.sweep.payout_periods, vec![25, 35]);
        assert_eq!(inputs.sweep.withdrawal_rates, vec![0.03, 0.04, 0.05]);
        assert_approx(inputs.ceiling_growth_rate, 0.04);
        assert_approx(inputs.floor_shrink_rate, 0.02);
        assert_eq!(inputs.strategies, vec![StrategyKind::DynamicSpending]);
        assert_eq!(request.solve.payout_period_years, 25);
        assert_approx(request.solve.target_success_rate, 0.9);
        assert_eq!(request.start_year, Some(1950));
        assert_approx(request.window_rate, 0.045);
        assert_eq!(request.window_period, 25);
    }

    #[test]
    fn api_request_rejects_unknown_strategy() {
        let err = api_request_from_json(r#"{"strategy": "yolo"}"#).expect_err("must reject");
        assert!(err.contains("Invalid API JSON payload"));
    }

    #[test]
    fn analyze_handler_returns_both_surfaces() {
        let response = analyze_handler_impl(&state(60), ApiPayload::default());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&header::HeaderValue::from_static("no-store"))
        );

        let inputs = build_inputs(sample_model()).expect("valid inputs");
        let body = analyze(&synthetic_dataset(60), &inputs).expect("valid analysis");
        assert_eq!(body.surfaces.len(), 2);
        assert_eq!(body.first_year, 1926);
        assert_eq!(body.last_year, 1985);
        let json = serde_json::to_string(&body).expect("response should serialize");
        assert!(json.contains("\"surfaces\""));
        assert!(json.contains("\"payoutPeriods\""));
        assert!(json.contains("\"successRates\""));
        assert!(json.contains("\"truncatedRows\""));
        assert!(json.contains("\"strategy\":\"dynamic-spending\""));
    }

    #[test]
    fn analyze_handler_rejects_weights_not_summing_to_100() {
        let payload = ApiPayload {
            us_stocks: Some(70),
            us_bonds: Some(20),
            ..ApiPayload::default()
        };
        let response = analyze_handler_impl(&state(60), payload);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn analyze_handler_rejects_history_shorter_than_payout_period() {
        let response = analyze_handler_impl(&state(45), ApiPayload::default());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn window_handler_requires_start_year() {
        let response = window_handler_impl(&state(60), ApiPayload::default());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let payload = ApiPayload {
            start_year: Some(1930),
            ..ApiPayload::default()
        };
        let response = window_handler_impl(&state(60), payload);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn solve_runs_for_each_requested_strategy() {
        let inputs = build_inputs(sample_model()).expect("valid inputs");
        let config = build_solve_config(default_solve_args()).expect("valid config");
        let response = solve(&synthetic_dataset(60), &inputs, config).expect("valid solve");
        assert_eq!(response.results.len(), 2);
        for result in &response.results {
            assert_eq!(result.payout_period_years, 30);
            if let Some(rate) = result.solved_rate {
                assert!((0.0..=0.2).contains(&rate));
            }
        }
    }

    #[test]
    fn window_trace_spans_the_payout_period_when_it_survives() {
        let mut model = sample_model();
        model.strategy = CliStrategy::FixedReal;
        let inputs = build_inputs(model).expect("valid inputs");
        let response =
            window(&synthetic_dataset(40), &inputs, 1930, 0.0, 10).expect("valid window");
        let trace = &response.traces[0];
        assert!(trace.outcome.success);
        assert_eq!(trace.outcome.start_year, 1930);
        assert_eq!(trace.outcome.end_year, 1939);
        assert_eq!(trace.years.len(), 10);

        let rendered = render_window_trace(trace);
        assert!(rendered.contains("1930-1939: survived"));
    }

    #[test]
    fn render_surface_table_formats_percentages() {
        let surface = SuccessSurface {
            strategy: StrategyKind::FixedReal,
            payout_periods: vec![30, 40],
            rows: vec![
                crate::core::SuccessScoreRow {
                    withdrawal_rate: 0.0325,
                    success_rates: vec![1.0, 0.875],
                },
                crate::core::SuccessScoreRow {
                    withdrawal_rate: 0.035,
                    success_rates: vec![0.0, 0.0],
                },
            ],
            truncated_rows: 0,
        };
        let table = render_surface_table(&surface);
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Withdrawal Rate"));
        assert!(lines[0].contains("Payout Period 40 years"));
        assert!(lines[1].contains("3.25%"));
        assert!(lines[1].contains("100.00%"));
        assert!(lines[1].contains("87.50%"));
        assert!(lines[2].contains("0.00%"));
    }

    #[test]
    fn render_solve_result_reports_missing_rate() {
        let result = RateSolveResult {
            strategy: StrategyKind::FixedReal,
            payout_period_years: 30,
            target_success_rate: 0.95,
            solved_rate: None,
            achieved_success_rate: None,
            iterations: Vec::new(),
            converged: false,
            feasible: false,
            message: "No withdrawal rate within the search bounds meets the target.".to_string(),
        };
        let line = render_solve_result(&result);
        assert!(line.contains("max withdrawal rate none"));
        assert!(line.contains("95.00%"));
    }

    fn query(uri: &str) -> Result<Query<ApiPayload>, QueryRejection> {
        let uri = uri.parse::<Uri>().expect("valid uri");
        Query::<ApiPayload>::try_from_uri(&uri)
    }

    #[test]
    fn query_string_accepts_comma_separated_lists() {
        let Query(payload) = query(
            "/api/analyze?payoutPeriods=25,35&withdrawalRates=3,4.5&feeRate=0.5&strategy=fixed-real",
        )
        .expect("query should parse");
        let inputs = api_request_from_payload(payload)
            .expect("valid request")
            .inputs;
        assert_eq!(inputs.sweep.payout_periods, vec![25, 35]);
        assert_eq!(inputs.sweep.withdrawal_rates.len(), 2);
        assert_approx(inputs.sweep.withdrawal_rates[0], 0.03);
        assert_approx(inputs.sweep.withdrawal_rates[1], 0.045);
        assert_approx(inputs.fee_rate, 0.005);
        assert_eq!(inputs.strategies, vec![StrategyKind::FixedReal]);
    }

    #[test]
    fn query_string_accepts_single_list_entry() {
        let Query(payload) =
            query("/api/analyze?payoutPeriods=30&withdrawalRates=4").expect("query should parse");
        let inputs = api_request_from_payload(payload)
            .expect("valid request")
            .inputs;
        assert_eq!(inputs.sweep.payout_periods, vec![30]);
        assert_eq!(inputs.sweep.withdrawal_rates, vec![0.04]);
    }

    #[test]
    fn query_string_list_with_bad_entry_names_the_key() {
        let Query(payload) = query("/api/analyze?payoutPeriods=30,abc").expect("query should parse");
        let err = api_request_from_payload(payload).expect_err("must reject");
        assert!(err.contains("payoutPeriods"));
        assert!(err.contains("abc"));
    }

    #[tokio::test]
    async fn get_handler_runs_sweep_from_query_lists() {
        let state = Arc::new(state(40));
        let response = analyze_get_handler(
            State(state.clone()),
            query("/api/analyze?payoutPeriods=20,30&withdrawalRates=3,4,5"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = window_get_handler(
            State(state),
            query("/api/window?startYear=1930&payoutPeriod=10&withdrawalRate=4"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_query_gets_json_error_body() {
        let response = analyze_get_handler(
            State(Arc::new(state(60))),
            query("/api/analyze?usStocks=lots"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&header::HeaderValue::from_static("application/json"))
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&header::HeaderValue::from_static("no-store"))
        );
    }

    #[tokio::test]
    async fn post_handler_reports_configuration_errors_from_blocking_pool() {
        let payload = ApiPayload {
            us_stocks: Some(50),
            ..ApiPayload::default()
        };
        let response = solve_post_handler(State(Arc::new(state(60))), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
