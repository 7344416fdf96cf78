use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    Annuity, AnnuityPayout, ConfidenceRow, ConsumptionMode, FlatRateTaxModel, Gender,
    HouseholdParams, MarketParams, MortalityImprovement, RunOptions, Scenario, ScenarioResult,
    SimError, SimulationRequest, SpouseParams, UsState, confidence_table, simulate,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliGender {
    Male,
    Female,
}

impl From<CliGender> for Gender {
    fn from(value: CliGender) -> Self {
        match value {
            CliGender::Male => Gender::Male,
            CliGender::Female => Gender::Female,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliConsumptionMode {
    Gross,
    Net,
}

impl From<CliConsumptionMode> for ConsumptionMode {
    fn from(value: CliConsumptionMode) -> Self {
        match value {
            CliConsumptionMode::Gross => ConsumptionMode::Gross,
            CliConsumptionMode::Net => ConsumptionMode::Net,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiGender {
    #[serde(alias = "Male", alias = "m")]
    Male,
    #[serde(alias = "Female", alias = "f")]
    Female,
}

impl From<ApiGender> for CliGender {
    fn from(value: ApiGender) -> Self {
        match value {
            ApiGender::Male => CliGender::Male,
            ApiGender::Female => CliGender::Female,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiConsumptionMode {
    #[serde(alias = "Gross")]
    Gross,
    #[serde(alias = "Net", alias = "netConsumption", alias = "net_consumption")]
    Net,
}

impl From<ApiConsumptionMode> for CliConsumptionMode {
    fn from(value: ApiConsumptionMode) -> Self {
        match value {
            ApiConsumptionMode::Gross => CliConsumptionMode::Gross,
            ApiConsumptionMode::Net => CliConsumptionMode::Net,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiScenario {
    name: String,
    initial_portfolio: f64,
    annuity_type: Option<String>,
    #[serde(default)]
    annuity_amount: f64,
    #[serde(default)]
    guarantee_years: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSpouse {
    age: u32,
    gender: Option<ApiGender>,
    #[serde(default)]
    social_security: f64,
    #[serde(default)]
    pension: f64,
    #[serde(default)]
    employment_income: f64,
    #[serde(default)]
    employment_growth: f64,
    retirement_age: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    scenarios: Option<Vec<ApiScenario>>,
    spending_levels: Option<Vec<f64>>,
    n_years: Option<u32>,
    n_paths: Option<u32>,
    start_year: Option<i32>,
    seed: Option<u64>,

    expected_return: Option<f64>,
    volatility: Option<f64>,
    dividend_yield: Option<f64>,
    fat_tail_probability: Option<f64>,

    current_age: Option<u32>,
    gender: Option<ApiGender>,
    social_security: Option<f64>,
    pension: Option<f64>,
    employment_income: Option<f64>,
    employment_growth: Option<f64>,
    retirement_age: Option<u32>,
    include_mortality: Option<bool>,
    mortality_improvement: Option<bool>,
    consumption_mode: Option<ApiConsumptionMode>,
    spouse: Option<ApiSpouse>,

    state: Option<String>,
    ordinary_tax_rate: Option<f64>,
    preferential_tax_rate: Option<f64>,
    state_tax_rate: Option<f64>,

    record_cashflows: Option<bool>,
    confidence_levels: Option<Vec<f64>>,
}

#[derive(Parser, Debug)]
#[command(
    name = "finsim",
    about = "Monte Carlo retirement portfolio survival across scenarios and spending levels"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one sweep and print the results as JSON
    Simulate(SimulateArgs),
    /// Serve the JSON API over HTTP
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(
        long = "scenario",
        default_value = "baseline:1000000",
        help = "Scenario as name:portfolio[:annuity-type:annual-amount:guarantee-years]; repeatable"
    )]
    scenarios: Vec<String>,
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "40000,50000,60000,70000",
        help = "Comma-separated annual consumption levels in today's money"
    )]
    spending: Vec<f64>,
    #[arg(long, default_value_t = 30)]
    n_years: u32,
    #[arg(long, default_value_t = 1000, help = "Paths simulated per scenario")]
    n_paths: u32,
    #[arg(long, default_value_t = 2025)]
    start_year: i32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(
        long,
        default_value_t = 7.0,
        help = "Expected annual price return in percent"
    )]
    expected_return: f64,
    #[arg(
        long,
        default_value_t = 18.0,
        help = "Annual return volatility in percent"
    )]
    volatility: f64,
    #[arg(long, default_value_t = 1.8, help = "Dividend yield in percent")]
    dividend_yield: f64,
    #[arg(
        long,
        default_value_t = 2.0,
        help = "Share of return draws replaced by fat-tail moves, in percent"
    )]
    fat_tail_probability: f64,
    #[arg(long, default_value_t = 65)]
    current_age: u32,
    #[arg(long, value_enum, default_value_t = CliGender::Male)]
    gender: CliGender,
    #[arg(
        long,
        default_value_t = 24000.0,
        help = "Annual Social Security benefit, COLA-indexed"
    )]
    social_security: f64,
    #[arg(long, default_value_t = 0.0, help = "Annual pension, not indexed")]
    pension: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Annual employment income paid until retirement age"
    )]
    employment_income: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Annual employment income growth in percent"
    )]
    employment_growth: f64,
    #[arg(long, help = "Age when employment income stops; defaults to current age")]
    retirement_age: Option<u32>,
    #[arg(long, help = "Disable mortality draws (household always survives)")]
    no_mortality: bool,
    #[arg(long, help = "Apply projected mortality improvement to the base tables")]
    mortality_improvement: bool,
    #[arg(long, value_enum, default_value_t = CliConsumptionMode::Gross)]
    consumption_mode: CliConsumptionMode,
    #[arg(long, help = "Spouse age; enables joint filing and a second mortality draw")]
    spouse_age: Option<u32>,
    #[arg(long, value_enum, default_value_t = CliGender::Female)]
    spouse_gender: CliGender,
    #[arg(long, default_value_t = 0.0)]
    spouse_social_security: f64,
    #[arg(long, default_value_t = 0.0)]
    spouse_pension: f64,
    #[arg(long, default_value_t = 0.0)]
    spouse_employment_income: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Spouse annual employment income growth in percent"
    )]
    spouse_employment_growth: f64,
    #[arg(long, help = "Spouse retirement age; defaults to spouse age")]
    spouse_retirement_age: Option<u32>,
    #[arg(long, default_value = "CA", help = "Two-letter state code")]
    state: String,
    #[arg(long, default_value_t = 12.0, help = "Ordinary income tax rate in percent")]
    ordinary_tax_rate: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Tax rate on realized gains and dividends in percent"
    )]
    preferential_tax_rate: f64,
    #[arg(long, default_value_t = 0.0, help = "Flat state tax rate in percent")]
    state_tax_rate: f64,
    #[arg(long, help = "Include per-year median cashflows in the output")]
    record_cashflows: bool,
    #[arg(long, help = "Run spending levels on one thread")]
    sequential: bool,
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "95,90,75,50",
        help = "Target success rates in percent for the spending lookup table"
    )]
    confidence: Vec<f64>,
}

#[derive(Debug)]
struct ApiRequest {
    request: SimulationRequest,
    tax_model: FlatRateTaxModel,
    confidence_levels: Vec<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    n_years: u32,
    n_paths_per_scenario: u32,
    seed: u64,
    results: Vec<ScenarioResult>,
    confidence_table: Vec<ConfidenceRow>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn parse_scenario(spec: &str) -> Result<Scenario, String> {
    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
    let portfolio = |raw: &str| {
        raw.parse::<f64>()
            .map_err(|_| format!("--scenario '{spec}' has an invalid portfolio value"))
    };
    match parts.as_slice() {
        [name, value] => Ok(Scenario::new(*name, portfolio(value)?)),
        [name, value, payout, amount, years] => {
            let payout = payout
                .parse::<AnnuityPayout>()
                .map_err(|e| format!("--scenario '{spec}': {e}"))?;
            let annual_amount = amount
                .parse::<f64>()
                .map_err(|_| format!("--scenario '{spec}' has an invalid annuity amount"))?;
            let guarantee_years = years
                .parse::<u32>()
                .map_err(|_| format!("--scenario '{spec}' has invalid guarantee years"))?;
            Ok(Scenario::new(*name, portfolio(value)?).with_annuity(Annuity {
                payout,
                annual_amount,
                guarantee_years,
            }))
        }
        _ => Err(format!(
            "--scenario '{spec}' must be name:portfolio or name:portfolio:annuity-type:amount:years"
        )),
    }
}

fn build_request(args: &SimulateArgs) -> Result<SimulationRequest, String> {
    if args.scenarios.is_empty() {
        return Err("--scenario must be given at least once".to_string());
    }
    if args.spending.is_empty() {
        return Err("--spending must list at least one level".to_string());
    }
    if args.n_years == 0 {
        return Err("--n-years must be > 0".to_string());
    }
    if args.n_paths == 0 {
        return Err("--n-paths must be > 0".to_string());
    }
    if args.volatility < 0.0 {
        return Err("--volatility must be >= 0".to_string());
    }
    if !(0.0..=100.0).contains(&args.fat_tail_probability) {
        return Err("--fat-tail-probability must be between 0 and 100".to_string());
    }
    if !(0.0..=100.0).contains(&args.dividend_yield) {
        return Err("--dividend-yield must be between 0 and 100".to_string());
    }
    if !args.employment_growth.is_finite() || args.employment_growth <= -100.0 {
        return Err("--employment-growth must be > -100".to_string());
    }

    let retirement_age = args.retirement_age.unwrap_or(args.current_age);
    if retirement_age < args.current_age {
        return Err("--retirement-age must be >= --current-age".to_string());
    }

    let spouse = match args.spouse_age {
        Some(age) => {
            let spouse_retirement_age = args.spouse_retirement_age.unwrap_or(age);
            if spouse_retirement_age < age {
                return Err("--spouse-retirement-age must be >= --spouse-age".to_string());
            }
            if !args.spouse_employment_growth.is_finite() || args.spouse_employment_growth <= -100.0
            {
                return Err("--spouse-employment-growth must be > -100".to_string());
            }
            Some(SpouseParams {
                age,
                gender: args.spouse_gender.into(),
                social_security: args.spouse_social_security,
                pension: args.spouse_pension,
                employment_income: args.spouse_employment_income,
                retirement_age: spouse_retirement_age,
                employment_growth_rate: args.spouse_employment_growth / 100.0,
            })
        }
        None => {
            if args.spouse_retirement_age.is_some() {
                return Err("--spouse-retirement-age requires --spouse-age".to_string());
            }
            None
        }
    };

    let scenarios = args
        .scenarios
        .iter()
        .map(|spec| parse_scenario(spec))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SimulationRequest {
        scenarios,
        spending_levels: args.spending.clone(),
        n_years: args.n_years,
        n_paths_per_scenario: args.n_paths,
        start_year: args.start_year,
        market: MarketParams {
            expected_return: args.expected_return / 100.0,
            volatility: args.volatility / 100.0,
            dividend_yield: args.dividend_yield / 100.0,
            fat_tail_probability: args.fat_tail_probability / 100.0,
        },
        household: HouseholdParams {
            current_age: args.current_age,
            gender: args.gender.into(),
            social_security: args.social_security,
            pension: args.pension,
            employment_income: args.employment_income,
            employment_growth_rate: args.employment_growth / 100.0,
            retirement_age,
            include_mortality: !args.no_mortality,
            mortality_improvement: args
                .mortality_improvement
                .then(MortalityImprovement::default),
            consumption_mode: args.consumption_mode.into(),
            spouse,
        },
        random_seed: args.seed,
        options: RunOptions {
            record_cashflows: args.record_cashflows,
            parallel: !args.sequential,
        },
    })
}

fn build_tax_model(args: &SimulateArgs) -> Result<FlatRateTaxModel, String> {
    let state = args
        .state
        .parse::<UsState>()
        .map_err(|e| format!("--state: {e}"))?;
    for (name, rate) in [
        ("--ordinary-tax-rate", args.ordinary_tax_rate),
        ("--preferential-tax-rate", args.preferential_tax_rate),
        ("--state-tax-rate", args.state_tax_rate),
    ] {
        if !(0.0..=100.0).contains(&rate) {
            return Err(format!("{name} must be between 0 and 100"));
        }
    }
    let mut model = FlatRateTaxModel::new(state).with_state_rate(args.state_tax_rate / 100.0);
    model.ordinary_rate = args.ordinary_tax_rate / 100.0;
    model.preferential_rate = args.preferential_tax_rate / 100.0;
    Ok(model)
}

fn build_confidence_levels(args: &SimulateArgs) -> Result<Vec<f64>, String> {
    args.confidence
        .iter()
        .map(|level| {
            if (0.0..=100.0).contains(level) {
                Ok(level / 100.0)
            } else {
                Err("--confidence levels must be between 0 and 100".to_string())
            }
        })
        .collect()
}

fn api_request_from_args(args: &SimulateArgs) -> Result<ApiRequest, String> {
    Ok(ApiRequest {
        request: build_request(args)?,
        tax_model: build_tax_model(args)?,
        confidence_levels: build_confidence_levels(args)?,
    })
}

fn status_for(err: &SimError) -> StatusCode {
    match err {
        SimError::Tax(_) => StatusCode::BAD_GATEWAY,
        SimError::InvalidConfig(_) | SimError::UnknownScenario(_) | SimError::EmptySweep => {
            StatusCode::BAD_REQUEST
        }
    }
}

fn run_api_request(api: &ApiRequest) -> Result<SimulateResponse, SimError> {
    let results = simulate(&api.request, &api.tax_model)?;
    let confidence_table = confidence_table(&results, &api.confidence_levels)?;
    Ok(SimulateResponse {
        n_years: api.request.n_years,
        n_paths_per_scenario: api.request.n_paths_per_scenario,
        seed: api.request.random_seed,
        results,
        confidence_table,
    })
}

/// Runs one sweep from command-line arguments and returns pretty-printed JSON.
pub fn run_cli(args: &SimulateArgs) -> Result<String, String> {
    let api = api_request_from_args(args)?;
    let response = run_api_request(&api)?;
    serde_json::to_string_pretty(&response).map_err(|e| format!("failed to encode results: {e}"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "finsim HTTP API listening");
    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let api = match api_request_from_payload(payload) {
        Ok(api) => api,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || run_api_request(&api)).await {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => error_response(status_for(&err), &err.to_string()),
        Err(join_err) => {
            error!(error = %join_err, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
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

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_scenario(scenario: ApiScenario) -> Result<Scenario, String> {
    let base = Scenario::new(scenario.name, scenario.initial_portfolio);
    match scenario.annuity_type {
        None => Ok(base),
        Some(kind) => {
            let payout = kind
                .parse::<AnnuityPayout>()
                .map_err(|e| format!("scenario '{}': {e}", base.name))?;
            Ok(base.with_annuity(Annuity {
                payout,
                annual_amount: scenario.annuity_amount,
                guarantee_years: scenario.guarantee_years,
            }))
        }
    }
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.spending_levels {
        args.spending = v;
    }
    if let Some(v) = payload.n_years {
        args.n_years = v;
    }
    if let Some(v) = payload.n_paths {
        args.n_paths = v;
    }
    if let Some(v) = payload.start_year {
        args.start_year = v;
    }
    if let Some(v) = payload.seed {
        args.seed = v;
    }
    if let Some(v) = payload.expected_return {
        args.expected_return = v;
    }
    if let Some(v) = payload.volatility {
        args.volatility = v;
    }
    if let Some(v) = payload.dividend_yield {
        args.dividend_yield = v;
    }
    if let Some(v) = payload.fat_tail_probability {
        args.fat_tail_probability = v;
    }
    if let Some(v) = payload.current_age {
        args.current_age = v;
    }
    if let Some(v) = payload.gender {
        args.gender = v.into();
    }
    if let Some(v) = payload.social_security {
        args.social_security = v;
    }
    if let Some(v) = payload.pension {
        args.pension = v;
    }
    if let Some(v) = payload.employment_income {
        args.employment_income = v;
    }
    if let Some(v) = payload.employment_growth {
        args.employment_growth = v;
    }
    if let Some(v) = payload.retirement_age {
        args.retirement_age = Some(v);
    }
    if let Some(v) = payload.include_mortality {
        args.no_mortality = !v;
    }
    if let Some(v) = payload.mortality_improvement {
        args.mortality_improvement = v;
    }
    if let Some(v) = payload.consumption_mode {
        args.consumption_mode = v.into();
    }
    if let Some(spouse) = payload.spouse {
        args.spouse_age = Some(spouse.age);
        if let Some(gender) = spouse.gender {
            args.spouse_gender = gender.into();
        }
        args.spouse_social_security = spouse.social_security;
        args.spouse_pension = spouse.pension;
        args.spouse_employment_income = spouse.employment_income;
        args.spouse_employment_growth = spouse.employment_growth;
        args.spouse_retirement_age = spouse.retirement_age;
    }
    if let Some(v) = payload.state {
        args.state = v;
    }
    if let Some(v) = payload.ordinary_tax_rate {
        args.ordinary_tax_rate = v;
    }
    if let Some(v) = payload.preferential_tax_rate {
        args.preferential_tax_rate = v;
    }
    if let Some(v) = payload.state_tax_rate {
        args.state_tax_rate = v;
    }
    if let Some(v) = payload.record_cashflows {
        args.record_cashflows = v;
    }
    if let Some(v) = payload.confidence_levels {
        args.confidence = v;
    }

    let mut api = api_request_from_args(&args)?;
    if let Some(scenarios) = payload.scenarios {
        api.request.scenarios = scenarios
            .into_iter()
            .map(api_scenario)
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(api)
}

fn default_args_for_api() -> SimulateArgs {
    SimulateArgs {
        scenarios: vec!["baseline:1000000".to_string()],
        spending: vec![40_000.0, 50_000.0, 60_000.0, 70_000.0],
        n_years: 30,
        n_paths: 1_000,
        start_year: 2025,
        seed: 42,
        expected_return: 7.0,
        volatility: 18.0,
        dividend_yield: 1.8,
        fat_tail_probability: 2.0,
        current_age: 65,
        gender: CliGender::Male,
        social_security: 24_000.0,
        pension: 0.0,
        employment_income: 0.0,
        employment_growth: 0.0,
        retirement_age: None,
        no_mortality: false,
        mortality_improvement: false,
        consumption_mode: CliConsumptionMode::Gross,
        spouse_age: None,
        spouse_gender: CliGender::Female,
        spouse_social_security: 0.0,
        spouse_pension: 0.0,
        spouse_employment_income: 0.0,
        spouse_employment_growth: 0.0,
        spouse_retirement_age: None,
        state: "CA".to_string(),
        ordinary_tax_rate: 12.0,
        preferential_tax_rate: 15.0,
        state_tax_rate: 0.0,
        record_cashflows: false,
        sequential: false,
        confidence: vec![95.0, 90.0, 75.0, 50.0],
    }
}
