#![deny(warnings)]

//! Budget economics: redistribution and metric rescaling.
//!
//! This module provides:
//! - A closed metric classification table (volume, rate, ROAS)
//! - The rescaling model deriving simulated KPIs from a budget change,
//!   always anchored to the session's original budget and metric values
//! - The redistribution engine keeping the total budget fixed when one
//!   forecast is edited, plus the unlocked (free total) variant

use budget_core::{AllocationStore, ForecastId, MetricClass};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Exponent of the ROAS efficiency modifier `ratio^(-elasticity)`.
pub const DEFAULT_ROAS_ELASTICITY: f64 = 0.05;

const VOLUME_METRICS: &[&str] = &[
    "clicks",
    "link clicks",
    "total clicks",
    "conversions",
    "conv",
    "conv.",
    "all conv",
    "all conv.",
    "all conversions",
    "website purchase",
    "website purchases",
    "impressions",
    "impr",
    "impr.",
    "imps",
    "spend",
    "cost",
    "amount spent",
    "value",
    "conv. value",
    "conversion value",
];

const RATE_METRICS: &[&str] = &[
    "ctr",
    "click through rate",
    "click-through rate",
    "conversion rate",
    "conv. rate",
    "cr",
    "cvr",
    "cpc",
    "cost per click",
    "avg. cpc",
    "average cpc",
    "cpm",
    "cost per mille",
    "cost per thousand",
    "roi",
];

/// Lower-case, trim and collapse inner whitespace.
pub fn canonical_metric_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lookup table from canonical metric name to [`MetricClass`].
///
/// Names not in the table are [`MetricClass::Volume`].
#[derive(Clone, Debug)]
pub struct MetricClassifier {
    table: HashMap<String, MetricClass>,
}

impl Default for MetricClassifier {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MetricClassifier {
    /// The built-in advertising metric vocabulary.
    pub fn builtin() -> Self {
        let mut table = HashMap::new();
        for name in VOLUME_METRICS {
            table.insert((*name).to_string(), MetricClass::Volume);
        }
        for name in RATE_METRICS {
            table.insert((*name).to_string(), MetricClass::Rate);
        }
        table.insert("roas".to_string(), MetricClass::Roas);
        Self { table }
    }

    /// Merge extra entries over the table; later entries win.
    pub fn with_overrides<I, S>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, MetricClass)>,
        S: AsRef<str>,
    {
        for (name, class) in overrides {
            self.table
                .insert(canonical_metric_name(name.as_ref()), class);
        }
        self
    }

    /// Explicit table entry for `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<MetricClass> {
        self.table.get(&canonical_metric_name(name)).copied()
    }

    pub fn classify(&self, name: &str) -> MetricClass {
        self.lookup(name).unwrap_or(MetricClass::Volume)
    }
}

/// Tunables of the rescaling model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RescaleParams {
    pub roas_elasticity: f64,
}

impl Default for RescaleParams {
    fn default() -> Self {
        Self {
            roas_elasticity: DEFAULT_ROAS_ELASTICITY,
        }
    }
}

/// Simulated value and percent impact for one metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricEstimate {
    pub simulated: f64,
    pub impact: f64,
}

/// Errors produced by the rescaling model.
#[derive(Debug, Error, PartialEq)]
pub enum RescaleError {
    #[error("unknown forecast {0}")]
    UnknownForecast(String),
    /// Scaling from a zero baseline would yield infinities.
    #[error("original budget of forecast {forecast} is {value}; budget ratio undefined")]
    ZeroBaseline { forecast: String, value: f64 },
    #[error("no original metrics recorded for forecast {0}")]
    MissingOriginals(String),
}

/// Estimate one metric from its baseline value and the budget ratio.
///
/// `ratio` is `new_budget / original_budget`. At a zero ratio ROAS has no
/// spend to return on and is reported as 0 (impact -100%).
pub fn estimate_metric(
    class: MetricClass,
    original_value: f64,
    ratio: f64,
    params: RescaleParams,
) -> MetricEstimate {
    match class {
        MetricClass::Volume => MetricEstimate {
            simulated: original_value * ratio,
            impact: (ratio - 1.0) * 100.0,
        },
        MetricClass::Rate => MetricEstimate {
            simulated: original_value,
            impact: 0.0,
        },
        MetricClass::Roas => {
            if ratio <= 0.0 {
                return MetricEstimate {
                    simulated: 0.0,
                    impact: -100.0,
                };
            }
            let modifier = ratio.powf(-params.roas_elasticity);
            MetricEstimate {
                simulated: original_value * modifier,
                impact: (modifier - 1.0) * 100.0,
            }
        }
    }
}

/// Recompute `simulated`/`impact` for every metric of a forecast.
///
/// The ratio is taken against the forecast's original budget, never
/// `old_budget`, so repeated edits do not compound. Returns the number of
/// metrics updated; on error nothing is mutated.
pub fn recalc(
    store: &mut AllocationStore,
    classifier: &MetricClassifier,
    params: RescaleParams,
    id: &ForecastId,
    old_budget: f64,
    new_budget: f64,
) -> Result<usize, RescaleError> {
    if store.forecast(id).is_none() {
        return Err(RescaleError::UnknownForecast(id.0.clone()));
    }
    let original_budget = store.original_budget(id).unwrap_or(0.0);
    if original_budget <= 0.0 {
        warn!(forecast_id = %id, original_budget, "cannot rescale from a zero baseline");
        return Err(RescaleError::ZeroBaseline {
            forecast: id.0.clone(),
            value: original_budget,
        });
    }
    let originals = store
        .original_metrics(id)
        .cloned()
        .ok_or_else(|| RescaleError::MissingOriginals(id.0.clone()))?;

    let new_budget = if new_budget.is_finite() && new_budget > 0.0 {
        new_budget
    } else {
        0.0
    };
    let ratio = new_budget / original_budget;
    debug!(forecast_id = %id, old_budget, new_budget, ratio, "rescaling metrics");

    let mut updated = 0;
    if let Some(forecast) = store.forecast_mut(id) {
        for metric in &mut forecast.metrics {
            let Some(&original_value) = originals.get(&metric.name) else {
                warn!(forecast_id = %id, metric = %metric.name, "no original value for metric");
                continue;
            };
            let est = estimate_metric(
                classifier.classify(&metric.name),
                original_value,
                ratio,
                params,
            );
            metric.simulated = est.simulated;
            metric.impact = est.impact;
            updated += 1;
        }
    }
    Ok(updated)
}

/// Errors produced by the redistribution engine.
#[derive(Debug, Error, PartialEq)]
pub enum RedistributeError {
    #[error("unknown forecast {0}")]
    UnknownForecast(String),
    #[error("forecast {0} has no budget data")]
    NoBudget(String),
    #[error("forecast {0} has no original budget")]
    NoOriginalBudget(String),
}

/// A budget that moved from `old` to `new`.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetChange {
    pub id: ForecastId,
    pub old: f64,
    pub new: f64,
}

/// How an edit was absorbed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedistributionKind {
    /// Below epsilon; nothing mutated.
    NoOp,
    /// Only the edited forecast changed (empty pool or unlocked total).
    Isolated,
    /// Zero-valued pool; the first sibling took the whole difference.
    SingleRecipient,
    /// Siblings absorbed the difference in proportion to their budgets.
    Proportional,
}

/// Outcome of one budget edit.
#[derive(Clone, Debug, PartialEq)]
pub struct Redistribution {
    pub edited: BudgetChange,
    /// Requested value after clamping; what the input control should show.
    pub clamped: f64,
    pub siblings: Vec<BudgetChange>,
    pub kind: RedistributionKind,
}

impl Redistribution {
    /// Every budget that changed, edited forecast first.
    pub fn changes(&self) -> impl Iterator<Item = &BudgetChange> {
        let edited = (self.kind != RedistributionKind::NoOp).then_some(&self.edited);
        edited.into_iter().chain(self.siblings.iter())
    }

    fn noop(id: &ForecastId, previous: f64, clamped: f64) -> Self {
        Self {
            edited: BudgetChange {
                id: id.clone(),
                old: previous,
                new: previous,
            },
            clamped,
            siblings: Vec::new(),
            kind: RedistributionKind::NoOp,
        }
    }
}

/// Which siblings may absorb a difference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolPolicy {
    /// Any sibling with a defined budget, zero included; zero pool awards
    /// everything to the first member.
    Direct,
    /// Siblings with a positive budget share the difference; when none is
    /// positive the first zero-budget sibling takes it all.
    Slider,
}

/// Longest leading `-?digits[.digits]` run of `s`, or `""` without a digit.
fn numeric_prefix(s: &str) -> &str {
    let bytes = s.as_bytes();
    let mut i = usize::from(bytes.first() == Some(&b'-'));
    let mut end = 0;
    let mut seen_dot = false;
    while let Some(&b) = bytes.get(i) {
        match b {
            b'0'..=b'9' => end = i + 1,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        i += 1;
    }
    &s[..end]
}

/// Parse a budget text box: separators and currency symbols are ignored and
/// the longest numeric prefix wins, so `"1.2.3"` reads as 1.2. Input without
/// any number is 0.
pub fn parse_budget_input(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    match numeric_prefix(&cleaned).parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Clamp a requested budget into `[0, total]`.
pub fn clamp_budget(requested: f64, total: f64) -> f64 {
    if !requested.is_finite() {
        return 0.0;
    }
    requested.clamp(0.0, total.max(0.0))
}

/// Absolute target for a slider expressed as percent change of the original.
/// A non-finite percent is read as 0%.
pub fn percent_target(original_budget: f64, percent: f64) -> f64 {
    if !percent.is_finite() {
        return original_budget;
    }
    original_budget * (1.0 + percent / 100.0)
}

fn current_budget(store: &AllocationStore, id: &ForecastId) -> Result<f64, RedistributeError> {
    let forecast = store
        .forecast(id)
        .ok_or_else(|| RedistributeError::UnknownForecast(id.0.clone()))?;
    forecast
        .budget_value()
        .ok_or_else(|| RedistributeError::NoBudget(id.0.clone()))
}

fn redistribute_with(
    store: &mut AllocationStore,
    id: &ForecastId,
    requested: f64,
    epsilon: f64,
    policy: PoolPolicy,
) -> Result<Redistribution, RedistributeError> {
    let previous = current_budget(store, id)?;
    let total = store.total_budget_floor();
    let new_value = clamp_budget(requested, total);
    let difference = previous - new_value;
    if difference.abs() < epsilon {
        debug!(forecast_id = %id, previous, new_value, "edit below epsilon; no-op");
        return Ok(Redistribution::noop(id, previous, new_value));
    }

    let candidates: Vec<(ForecastId, f64)> = store
        .forecasts()
        .iter()
        .filter(|f| &f.id != id)
        .filter_map(|f| f.budget_value().map(|v| (f.id.clone(), v)))
        .collect();
    let pool: Vec<(ForecastId, f64)> = match policy {
        PoolPolicy::Direct => candidates.clone(),
        PoolPolicy::Slider => candidates.iter().filter(|(_, v)| *v > 0.0).cloned().collect(),
    };
    let pool_total: f64 = pool.iter().map(|(_, v)| v).sum();

    store.set_budget(id, new_value);
    let edited = BudgetChange {
        id: id.clone(),
        old: previous,
        new: new_value,
    };

    let (kind, siblings) = if candidates.is_empty() {
        (RedistributionKind::Isolated, Vec::new())
    } else if pool.is_empty() || pool_total <= 0.0 {
        let (first, old) = candidates[0].clone();
        let new = (old + difference).max(0.0);
        store.set_budget(&first, new);
        (
            RedistributionKind::SingleRecipient,
            vec![BudgetChange { id: first, old, new }],
        )
    } else {
        let mut changes = Vec::with_capacity(pool.len());
        for (sibling, old) in pool {
            let new = (old + difference * (old / pool_total)).max(0.0);
            store.set_budget(&sibling, new);
            changes.push(BudgetChange {
                id: sibling,
                old,
                new,
            });
        }
        (RedistributionKind::Proportional, changes)
    };

    debug!(
        forecast_id = %id,
        previous,
        new_value,
        difference,
        siblings = siblings.len(),
        ?kind,
        "budget redistributed"
    );
    Ok(Redistribution {
        edited,
        clamped: new_value,
        siblings,
        kind,
    })
}

/// Locked-total direct edit: clamp to `[0, total]` and spread the difference
/// over every sibling with budget data.
pub fn redistribute(
    store: &mut AllocationStore,
    id: &ForecastId,
    requested: f64,
    epsilon: f64,
) -> Result<Redistribution, RedistributeError> {
    redistribute_with(store, id, requested, epsilon, PoolPolicy::Direct)
}

/// Locked-total slider edit: `percent` is relative to the original budget.
pub fn redistribute_percent(
    store: &mut AllocationStore,
    id: &ForecastId,
    percent: f64,
    epsilon: f64,
) -> Result<Redistribution, RedistributeError> {
    let original = store
        .original_budget(id)
        .ok_or_else(|| RedistributeError::NoOriginalBudget(id.0.clone()))?;
    redistribute_with(
        store,
        id,
        percent_target(original, percent),
        epsilon,
        PoolPolicy::Slider,
    )
}

/// Unlocked edit: only the edited forecast moves and the total floats.
pub fn apply_unlocked(
    store: &mut AllocationStore,
    id: &ForecastId,
    requested: f64,
    epsilon: f64,
) -> Result<Redistribution, RedistributeError> {
    let previous = current_budget(store, id)?;
    let new_value = if requested.is_finite() {
        requested.max(0.0)
    } else {
        0.0
    };
    if (previous - new_value).abs() < epsilon {
        return Ok(Redistribution::noop(id, previous, new_value));
    }
    store.set_budget(id, new_value);
    Ok(Redistribution {
        edited: BudgetChange {
            id: id.clone(),
            old: previous,
            new: new_value,
        },
        clamped: new_value,
        siblings: Vec::new(),
        kind: RedistributionKind::Isolated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use budget_core::{Budget, Dataset, Forecast, Metric, EPSILON};
    use proptest::prelude::*;

    fn forecast(id: &str, budget: f64, metrics: Vec<Metric>) -> Forecast {
        Forecast {
            id: ForecastId(id.to_string()),
            title: id.to_string(),
            platform: "Google".to_string(),
            campaign: "Google Performance".to_string(),
            budget: Some(Budget {
                value: Some(budget),
                currency: Some("£".to_string()),
            }),
            metrics,
            date_range: None,
        }
    }

    fn store(budgets: &[(&str, f64)]) -> AllocationStore {
        let mut s = AllocationStore::new();
        s.initialize(Some(Dataset {
            forecasts: budgets
                .iter()
                .map(|(id, b)| forecast(id, *b, vec![Metric::baseline("Clicks", 100.0)]))
                .collect(),
            date_range: None,
        }));
        s.snapshot_originals();
        s
    }

    fn budget(s: &AllocationStore, id: &str) -> f64 {
        s.budget_of(&id.into()).unwrap()
    }

    #[test]
    fn classification_is_exact_and_case_insensitive() {
        let c = MetricClassifier::builtin();
        assert_eq!(c.classify("Link  Clicks"), MetricClass::Volume);
        assert_eq!(c.classify("CTR"), MetricClass::Rate);
        assert_eq!(c.classify("Conversion Rate"), MetricClass::Rate);
        assert_eq!(c.classify("Cost per Click"), MetricClass::Rate);
        assert_eq!(c.classify("ROAS"), MetricClass::Roas);
        assert_eq!(c.lookup("Reach"), None);
        assert_eq!(c.classify("Reach"), MetricClass::Volume);
    }

    #[test]
    fn overrides_take_precedence() {
        let c = MetricClassifier::builtin()
            .with_overrides([("Reach", MetricClass::Rate), ("ROI", MetricClass::Roas)]);
        assert_eq!(c.classify("reach"), MetricClass::Rate);
        assert_eq!(c.classify("roi"), MetricClass::Roas);
    }

    #[test]
    fn roas_diminishing_return() {
        let e = estimate_metric(MetricClass::Roas, 4.0, 2.0, RescaleParams::default());
        assert!((e.simulated - 3.863).abs() < 1e-3);
        assert!((e.impact + 3.41).abs() < 0.01);
    }

    #[test]
    fn roas_at_zero_budget_is_finite() {
        let e = estimate_metric(MetricClass::Roas, 4.0, 0.0, RescaleParams::default());
        assert_eq!(e.simulated, 0.0);
        assert_eq!(e.impact, -100.0);
    }

    #[test]
    fn rate_metrics_hold_still() {
        let e = estimate_metric(MetricClass::Rate, 2.5, 3.0, RescaleParams::default());
        assert_eq!(e, MetricEstimate { simulated: 2.5, impact: 0.0 });
    }

    #[test]
    fn recalc_anchors_to_original_budget() {
        let mut s = store(&[("a", 100.0)]);
        let c = MetricClassifier::builtin();
        let id: ForecastId = "a".into();
        recalc(&mut s, &c, RescaleParams::default(), &id, 100.0, 150.0).unwrap();
        recalc(&mut s, &c, RescaleParams::default(), &id, 150.0, 120.0).unwrap();
        let m = &s.forecast(&id).unwrap().metrics[0];
        assert!((m.simulated - 120.0).abs() < 1e-9);
        assert!((m.impact - 20.0).abs() < 1e-9);
    }

    #[test]
    fn recalc_refuses_zero_baseline() {
        let mut s = store(&[("a", 0.0)]);
        let id: ForecastId = "a".into();
        let before = s.forecast(&id).unwrap().metrics.clone();
        let err = recalc(
            &mut s,
            &MetricClassifier::builtin(),
            RescaleParams::default(),
            &id,
            0.0,
            50.0,
        )
        .unwrap_err();
        assert!(matches!(err, RescaleError::ZeroBaseline { .. }));
        assert_eq!(s.forecast(&id).unwrap().metrics, before);
    }

    #[test]
    fn recalc_skips_metrics_without_baseline() {
        let mut s = store(&[("a", 100.0)]);
        let id: ForecastId = "a".into();
        s.forecast_mut(&id)
            .unwrap()
            .metrics
            .push(Metric::baseline("Late Arrival", 7.0));
        let n = recalc(
            &mut s,
            &MetricClassifier::builtin(),
            RescaleParams::default(),
            &id,
            100.0,
            200.0,
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(s.forecast(&id).unwrap().metrics[1].simulated, 7.0);
    }

    #[test]
    fn parse_input_coerces() {
        assert_eq!(parse_budget_input("1,250.50"), 1250.5);
        assert_eq!(parse_budget_input("£300"), 300.0);
        assert_eq!(parse_budget_input("abc"), 0.0);
        assert_eq!(parse_budget_input(""), 0.0);
        assert_eq!(parse_budget_input("-40"), -40.0);
        assert_eq!(parse_budget_input("1,250.50."), 1250.5);
        assert_eq!(parse_budget_input("1.2.3"), 1.2);
        assert_eq!(parse_budget_input("12-"), 12.0);
        assert_eq!(parse_budget_input("£.5"), 0.5);
        assert_eq!(parse_budget_input("--5"), 0.0);
        assert_eq!(parse_budget_input("-"), 0.0);
    }

    #[test]
    fn proportional_split() {
        let mut s = store(&[("a", 100.0), ("b", 30.0), ("c", 70.0)]);
        let r = redistribute(&mut s, &"a".into(), 50.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::Proportional);
        assert_eq!(budget(&s, "a"), 50.0);
        assert!((budget(&s, "b") - 45.0).abs() < 1e-9);
        assert!((budget(&s, "c") - 105.0).abs() < 1e-9);
        assert_eq!(r.changes().count(), 3);
    }

    #[test]
    fn zero_pool_goes_to_first_sibling() {
        let mut s = store(&[("a", 100.0), ("b", 0.0), ("c", 0.0)]);
        let r = redistribute(&mut s, &"a".into(), 60.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::SingleRecipient);
        assert_eq!(budget(&s, "b"), 40.0);
        assert_eq!(budget(&s, "c"), 0.0);
    }

    #[test]
    fn clamp_to_pool_total() {
        let mut s = store(&[("a", 100.0), ("b", 50.0)]);
        let r = redistribute(&mut s, &"a".into(), 1_000.0, EPSILON).unwrap();
        assert_eq!(r.clamped, 150.0);
        assert_eq!(budget(&s, "a"), 150.0);
        assert_eq!(budget(&s, "b"), 0.0);

        let r = redistribute(&mut s, &"a".into(), -20.0, EPSILON).unwrap();
        assert_eq!(r.clamped, 0.0);
        assert_eq!(budget(&s, "b"), 150.0);
    }

    #[test]
    fn single_forecast_edits_in_isolation() {
        let mut s = store(&[("a", 100.0)]);
        let r = redistribute(&mut s, &"a".into(), 40.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::Isolated);
        assert_eq!(budget(&s, "a"), 40.0);
    }

    #[test]
    fn forecasts_without_budget_are_not_in_pool() {
        let mut s = store(&[("a", 100.0), ("b", 100.0)]);
        s.forecast_mut(&"b".into()).unwrap().budget = None;
        let r = redistribute(&mut s, &"a".into(), 60.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::Isolated);
        assert_eq!(
            redistribute(&mut s, &"b".into(), 10.0, EPSILON),
            Err(RedistributeError::NoBudget("b".to_string()))
        );
        assert_eq!(
            redistribute(&mut s, &"zz".into(), 10.0, EPSILON),
            Err(RedistributeError::UnknownForecast("zz".to_string()))
        );
    }

    #[test]
    fn repeated_value_is_noop() {
        let mut s = store(&[("a", 100.0), ("b", 30.0), ("c", 70.0)]);
        redistribute(&mut s, &"a".into(), 50.0, EPSILON).unwrap();
        let snapshot: Vec<f64> = ["b", "c"].iter().map(|id| budget(&s, id)).collect();
        let r = redistribute(&mut s, &"a".into(), 50.005, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::NoOp);
        assert_eq!(r.changes().count(), 0);
        let after: Vec<f64> = ["b", "c"].iter().map(|id| budget(&s, id)).collect();
        assert_eq!(snapshot, after);
        assert_eq!(budget(&s, "a"), 50.0);
    }

    #[test]
    fn slider_targets_original_budget() {
        let mut s = store(&[("a", 100.0), ("b", 100.0), ("c", 0.0)]);
        redistribute(&mut s, &"a".into(), 80.0, EPSILON).unwrap();
        // +10% of the original 100, not of the current 80
        let r = redistribute_percent(&mut s, &"a".into(), 10.0, EPSILON).unwrap();
        assert!((budget(&s, "a") - 110.0).abs() < 1e-9);
        assert_eq!(r.kind, RedistributionKind::Proportional);
        assert_eq!(r.siblings.len(), 1);
        assert!((budget(&s, "b") - 90.0).abs() < 1e-9);
        assert_eq!(budget(&s, "c"), 0.0);
        assert!((s.total_budget() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn slider_with_zero_pool_awards_first_sibling() {
        let mut s = store(&[("a", 100.0), ("b", 0.0), ("c", 0.0)]);
        let r = redistribute_percent(&mut s, &"a".into(), -50.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::SingleRecipient);
        assert_eq!(budget(&s, "a"), 50.0);
        assert_eq!(budget(&s, "b"), 50.0);
        assert_eq!(budget(&s, "c"), 0.0);
        assert_eq!(s.total_budget(), 100.0);
    }

    #[test]
    fn slider_skips_zero_siblings_when_others_are_funded() {
        let mut s = store(&[("a", 100.0), ("b", 0.0), ("c", 100.0)]);
        let r = redistribute_percent(&mut s, &"a".into(), -50.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::Proportional);
        assert_eq!(r.siblings.len(), 1);
        assert_eq!(budget(&s, "b"), 0.0);
        assert_eq!(budget(&s, "c"), 150.0);
    }

    #[test]
    fn non_finite_percent_targets_original() {
        assert_eq!(percent_target(100.0, f64::NAN), 100.0);
        assert_eq!(percent_target(100.0, f64::INFINITY), 100.0);
        let mut s = store(&[("a", 100.0), ("b", 100.0)]);
        redistribute(&mut s, &"a".into(), 60.0, EPSILON).unwrap();
        redistribute_percent(&mut s, &"a".into(), f64::NAN, EPSILON).unwrap();
        assert_eq!(budget(&s, "a"), 100.0);
        assert_eq!(budget(&s, "b"), 100.0);
    }

    #[test]
    fn unlocked_edit_lets_total_float() {
        let mut s = store(&[("a", 100.0), ("b", 50.0)]);
        let r = apply_unlocked(&mut s, &"a".into(), 400.0, EPSILON).unwrap();
        assert_eq!(r.kind, RedistributionKind::Isolated);
        assert_eq!(budget(&s, "a"), 400.0);
        assert_eq!(budget(&s, "b"), 50.0);
        apply_unlocked(&mut s, &"a".into(), -3.0, EPSILON).unwrap();
        assert_eq!(budget(&s, "a"), 0.0);
    }

    proptest! {
        #[test]
        fn locked_edits_conserve_total(
            budgets in proptest::collection::vec(0.0f64..50_000.0, 2..8),
            edits in proptest::collection::vec((0usize..8, -10_000.0f64..200_000.0), 1..10),
        ) {
            let ids: Vec<String> = (0..budgets.len()).map(|i| format!("f{i}")).collect();
            let pairs: Vec<(&str, f64)> = ids.iter().map(String::as_str).zip(budgets.iter().copied()).collect();
            let mut s = store(&pairs);
            for (idx, requested) in edits {
                let id = ForecastId(ids[idx % ids.len()].clone());
                let before = s.total_budget();
                let cap = s.total_budget_floor();
                let r = redistribute(&mut s, &id, requested, EPSILON).unwrap();
                prop_assert!((s.total_budget() - before).abs() <= EPSILON);
                prop_assert!(r.clamped >= 0.0 && r.clamped <= cap);
                for f in s.forecasts() {
                    prop_assert!(f.budget_value().unwrap() >= 0.0);
                }
            }
        }

        #[test]
        fn reapplying_clamped_value_is_idempotent(
            budgets in proptest::collection::vec(1.0f64..10_000.0, 2..6),
            requested in 0i64..40_000,
        ) {
            // Whole-unit requests keep the clamped value within the floored total.
            let requested = requested as f64;
            let ids: Vec<String> = (0..budgets.len()).map(|i| format!("f{i}")).collect();
            let pairs: Vec<(&str, f64)> = ids.iter().map(String::as_str).zip(budgets.iter().copied()).collect();
            let mut s = store(&pairs);
            let id = ForecastId(ids[0].clone());
            let first = redistribute(&mut s, &id, requested, EPSILON).unwrap();
            let siblings: Vec<f64> = s.forecasts().iter().skip(1).filter_map(|f| f.budget_value()).collect();
            let second = redistribute(&mut s, &id, first.clamped, EPSILON).unwrap();
            prop_assert_eq!(second.kind, RedistributionKind::NoOp);
            let again: Vec<f64> = s.forecasts().iter().skip(1).filter_map(|f| f.budget_value()).collect();
            prop_assert_eq!(siblings, again);
        }
    }
}
