#![deny(warnings)]

//! Core domain model for the budget allocation session.
//!
//! This crate defines the serializable dataset handed over by the page at load
//! time, validation helpers for it, and the [`AllocationStore`]: the single
//! source of truth for current budgets plus the immutable session baselines
//! (original budgets and original metric values) every rescale is anchored to.

use chrono::{Duration, NaiveDate};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tolerance used for no-op detection, reset churn avoidance and conservation.
pub const EPSILON: f64 = 0.01;

/// Length of the forecast window assumed when the dataset carries none.
pub const DEFAULT_FORECAST_DAYS: i64 = 90;

/// Seed for the fallback metric generator.
pub const DEFAULT_METRIC_SEED: u64 = 0x5EED_B0D6;

/// Opaque, session-unique forecast identifier (the `data-forecast-id` key).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForecastId(pub String);

impl fmt::Display for ForecastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ForecastId {
    fn from(s: &str) -> Self {
        ForecastId(s.to_string())
    }
}

/// Budget of one forecast. `value` is absent when the source had no spend data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Inclusive forecast window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
}

impl DateRange {
    /// Window of `days` days beginning at `start`.
    pub fn starting(start: NaiveDate, days: i64) -> Self {
        Self {
            start,
            end: start + Duration::days(days),
            days: Some(days),
        }
    }

    /// Number of days between start and end (never negative).
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days().max(0)
    }
}

/// One KPI row of a forecast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Display name as exported by the ad platform, e.g. "Link Clicks".
    pub name: String,
    /// Baseline observed value (display only).
    pub current: f64,
    /// Model output.
    #[serde(default)]
    pub simulated: f64,
    /// Percent change of `simulated` against the session baseline.
    #[serde(default)]
    pub impact: f64,
}

impl Metric {
    /// A metric at rest: simulated equals current, no impact.
    pub fn baseline(name: impl Into<String>, current: f64) -> Self {
        Self {
            name: name.into(),
            current,
            simulated: current,
            impact: 0.0,
        }
    }
}

/// How a metric responds to a budget change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricClass {
    /// Scales linearly with budget (clicks, conversions, spend, ...).
    Volume,
    /// Budget invariant (CTR, CPC, CPM, ROI, ...).
    Rate,
    /// Return on ad spend, modeled with diminishing efficiency.
    Roas,
}

/// A campaign or ad-set being budgeted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub id: ForecastId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub campaign: String,
    #[serde(default)]
    pub budget: Option<Budget>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

impl Forecast {
    /// Current budget value, if this forecast has budget data at all.
    pub fn budget_value(&self) -> Option<f64> {
        self.budget.as_ref().and_then(|b| b.value)
    }

    /// Overwrite the budget value, keeping the currency.
    pub fn set_budget_value(&mut self, value: f64) {
        match &mut self.budget {
            Some(b) => b.value = Some(value),
            None => {
                self.budget = Some(Budget {
                    value: Some(value),
                    currency: None,
                })
            }
        }
    }

    /// Currency symbol when present and non-empty.
    pub fn currency(&self) -> Option<&str> {
        self.budget
            .as_ref()
            .and_then(|b| b.currency.as_deref())
            .filter(|c| !c.trim().is_empty())
    }
}

/// Page-embedded dataset the session is initialized from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub forecasts: Vec<Forecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

impl Dataset {
    /// Dataset range, else the first forecast's range, else a default window from `today`.
    pub fn resolved_date_range(&self, today: NaiveDate) -> DateRange {
        self.date_range
            .clone()
            .or_else(|| self.forecasts.first().and_then(|f| f.date_range.clone()))
            .unwrap_or_else(|| DateRange::starting(today, DEFAULT_FORECAST_DAYS))
    }
}

/// Validation errors for dataset invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Identifiers must be non-empty.
    #[error("forecast id must not be empty")]
    EmptyId,
    /// Identifiers must be unique within a session.
    #[error("duplicate forecast id: {0}")]
    DuplicateId(String),
    /// Budget and metric values must be finite.
    #[error("non-finite value in forecast {0}")]
    NonFinite(String),
    /// Budgets must be non-negative.
    #[error("negative budget {value} in forecast {forecast}")]
    NegativeBudget { forecast: String, value: f64 },
    /// Every metric needs a name to be addressable.
    #[error("unnamed metric in forecast {0}")]
    EmptyMetricName(String),
    /// End date precedes start date.
    #[error("date range ends ({end}) before it starts ({start})")]
    InvertedDateRange { start: NaiveDate, end: NaiveDate },
}

/// Validate a date range.
pub fn validate_date_range(r: &DateRange) -> Result<(), ValidationError> {
    if r.end < r.start {
        return Err(ValidationError::InvertedDateRange {
            start: r.start,
            end: r.end,
        });
    }
    Ok(())
}

/// Validate one forecast in isolation.
pub fn validate_forecast(f: &Forecast) -> Result<(), ValidationError> {
    if f.id.0.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if let Some(v) = f.budget_value() {
        if !v.is_finite() {
            return Err(ValidationError::NonFinite(f.id.0.clone()));
        }
        if v < 0.0 {
            return Err(ValidationError::NegativeBudget {
                forecast: f.id.0.clone(),
                value: v,
            });
        }
    }
    for m in &f.metrics {
        if m.name.trim().is_empty() {
            return Err(ValidationError::EmptyMetricName(f.id.0.clone()));
        }
        if !(m.current.is_finite() && m.simulated.is_finite() && m.impact.is_finite()) {
            return Err(ValidationError::NonFinite(f.id.0.clone()));
        }
    }
    if let Some(r) = &f.date_range {
        validate_date_range(r)?;
    }
    Ok(())
}

/// Validate the dataset, including id uniqueness across forecasts.
pub fn validate_dataset(d: &Dataset) -> Result<(), ValidationError> {
    let mut ids: BTreeSet<&ForecastId> = BTreeSet::new();
    for f in &d.forecasts {
        validate_forecast(f)?;
        if !ids.insert(&f.id) {
            return Err(ValidationError::DuplicateId(f.id.0.clone()));
        }
    }
    if let Some(r) = &d.date_range {
        validate_date_range(r)?;
    }
    Ok(())
}

/// Seeded stand-in metrics for a forecast whose export carried none.
///
/// Produces Clicks, Conversions and ROAS at rest (simulated = current).
pub fn default_metrics(seed: u64) -> Vec<Metric> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let clicks: f64 = rng.gen_range(800.0..12_000.0);
    let conversions: f64 = rng.gen_range(50.0..800.0);
    let roas: f64 = rng.gen_range(1.8..4.2);
    vec![
        Metric::baseline("Clicks", clicks.round()),
        Metric::baseline("Conversions", conversions.round()),
        Metric::baseline("ROAS", (roas * 10.0).round() / 10.0),
    ]
}

/// In-memory allocation state for one dashboard session.
///
/// Forecast order is the dataset order and is significant: the zero-pool
/// tie-break awards to the first sibling in this order.
#[derive(Clone, Debug, Default)]
pub struct AllocationStore {
    forecasts: Vec<Forecast>,
    date_range: Option<DateRange>,
    original_budgets: BTreeMap<ForecastId, f64>,
    original_metrics: BTreeMap<ForecastId, BTreeMap<String, f64>>,
}

impl AllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the store from the page dataset.
    ///
    /// Absent input is logged and ignored. Invalid forecasts (and an inverted
    /// dataset range) are skipped one by one, keeping the first of any
    /// duplicate ids; the store stays empty only if nothing valid is left.
    /// The store is populated at most once. Returns whether this call
    /// populated it.
    pub fn initialize(&mut self, dataset: Option<Dataset>) -> bool {
        let Some(mut dataset) = dataset else {
            warn!("no dataset provided; allocation store left empty");
            return false;
        };
        if !self.forecasts.is_empty() {
            warn!("allocation store already populated; ignoring dataset");
            return false;
        }
        if let Some(Err(e)) = dataset.date_range.as_ref().map(validate_date_range) {
            warn!(error = %e, "dataset date range dropped");
            dataset.date_range = None;
        }
        let offered = dataset.forecasts.len();
        let mut seen: BTreeSet<ForecastId> = BTreeSet::new();
        dataset.forecasts.retain(|f| {
            let verdict = validate_forecast(f).and_then(|()| {
                if seen.contains(&f.id) {
                    Err(ValidationError::DuplicateId(f.id.0.clone()))
                } else {
                    Ok(())
                }
            });
            match verdict {
                Ok(()) => {
                    seen.insert(f.id.clone());
                    true
                }
                Err(e) => {
                    warn!(forecast_id = %f.id, error = %e, "malformed forecast skipped");
                    false
                }
            }
        });
        if dataset.forecasts.is_empty() {
            warn!(offered, "no valid forecasts; allocation store left empty");
            return false;
        }
        for (idx, f) in dataset.forecasts.iter_mut().enumerate() {
            if f.metrics.is_empty() {
                debug!(forecast_id = %f.id, "no metrics exported; using fallback set");
                f.metrics = default_metrics(DEFAULT_METRIC_SEED.wrapping_add(idx as u64));
            }
        }
        info!(forecasts = dataset.forecasts.len(), "allocation store initialized");
        self.forecasts = dataset.forecasts;
        self.date_range = dataset.date_range;
        true
    }

    /// Parse the embedded JSON payload and populate from it.
    pub fn initialize_from_json(&mut self, raw: &str) -> bool {
        match serde_json::from_str::<Dataset>(raw) {
            Ok(d) => self.initialize(Some(d)),
            Err(e) => {
                warn!(error = %e, "dataset payload is not valid JSON");
                false
            }
        }
    }

    /// Capture the session baselines.
    ///
    /// Idempotent: an id that already has an original keeps it. Forecasts
    /// without budget data get no original budget entry.
    pub fn snapshot_originals(&mut self) {
        for f in &self.forecasts {
            if let Some(v) = f.budget_value() {
                self.original_budgets.entry(f.id.clone()).or_insert(v);
            }
            if f.metrics.is_empty() {
                continue;
            }
            let originals = self.original_metrics.entry(f.id.clone()).or_default();
            for m in &f.metrics {
                originals.entry(m.name.clone()).or_insert(m.current);
            }
        }
        debug!(
            budgets = self.original_budgets.len(),
            metric_sets = self.original_metrics.len(),
            "session baselines captured"
        );
    }

    /// Restore every forecast to its baseline.
    ///
    /// Values already within `epsilon` of the baseline are left alone. Returns
    /// the ids of forecasts that actually changed.
    pub fn reset(&mut self, epsilon: f64) -> Vec<ForecastId> {
        let mut touched = Vec::new();
        for f in &mut self.forecasts {
            let mut changed = false;
            if let Some(&orig) = self.original_budgets.get(&f.id) {
                let differs = f
                    .budget_value()
                    .map_or(true, |v| (v - orig).abs() > epsilon);
                if differs {
                    f.set_budget_value(orig);
                    changed = true;
                }
            }
            if let Some(originals) = self.original_metrics.get(&f.id) {
                for m in &mut f.metrics {
                    let Some(&orig) = originals.get(&m.name) else {
                        continue;
                    };
                    if (m.simulated - orig).abs() > epsilon || m.impact != 0.0 {
                        m.simulated = orig;
                        m.impact = 0.0;
                        changed = true;
                    }
                }
            }
            if changed {
                touched.push(f.id.clone());
            }
        }
        info!(reset = touched.len(), "session reset to baselines");
        touched
    }

    pub fn forecasts(&self) -> &[Forecast] {
        &self.forecasts
    }

    pub fn len(&self) -> usize {
        self.forecasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forecasts.is_empty()
    }

    pub fn forecast(&self, id: &ForecastId) -> Option<&Forecast> {
        self.forecasts.iter().find(|f| &f.id == id)
    }

    pub fn forecast_mut(&mut self, id: &ForecastId) -> Option<&mut Forecast> {
        self.forecasts.iter_mut().find(|f| &f.id == id)
    }

    /// Current budget of `id`, if the forecast exists and has budget data.
    pub fn budget_of(&self, id: &ForecastId) -> Option<f64> {
        self.forecast(id).and_then(Forecast::budget_value)
    }

    /// Overwrite the budget of `id`. Returns false for an unknown id.
    pub fn set_budget(&mut self, id: &ForecastId, value: f64) -> bool {
        match self.forecast_mut(id) {
            Some(f) => {
                f.set_budget_value(value);
                true
            }
            None => false,
        }
    }

    pub fn original_budget(&self, id: &ForecastId) -> Option<f64> {
        self.original_budgets.get(id).copied()
    }

    pub fn original_metrics(&self, id: &ForecastId) -> Option<&BTreeMap<String, f64>> {
        self.original_metrics.get(id)
    }

    pub fn original_metric(&self, id: &ForecastId, name: &str) -> Option<f64> {
        self.original_metrics
            .get(id)
            .and_then(|m| m.get(name))
            .copied()
    }

    /// Real-valued sum of every budget.
    pub fn total_budget(&self) -> f64 {
        self.forecasts.iter().filter_map(Forecast::budget_value).sum()
    }

    /// Sum of floored budgets, matching the integer aggregate display.
    pub fn total_budget_floor(&self) -> f64 {
        self.forecasts
            .iter()
            .filter_map(Forecast::budget_value)
            .map(f64::floor)
            .sum()
    }

    /// First non-empty currency across forecasts that have a budget.
    pub fn display_currency(&self) -> Option<&str> {
        self.forecasts
            .iter()
            .filter(|f| f.budget_value().is_some())
            .find_map(Forecast::currency)
    }

    pub fn date_range(&self) -> Option<&DateRange> {
        self.date_range.as_ref()
    }

    pub fn set_date_range(&mut self, range: DateRange) {
        self.date_range = Some(range);
    }

    /// Snapshot of the current state in dataset shape.
    pub fn to_dataset(&self) -> Dataset {
        Dataset {
            forecasts: self.forecasts.clone(),
            date_range: self.date_range.clone(),
        }
    }
}
