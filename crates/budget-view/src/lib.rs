#![deny(warnings)]

//! Presentation sync: projects the allocation store onto page controls.
//!
//! Nothing here computes business values. Every function reads the store
//! (and the metric classification, for display precision) and emits
//! [`ControlUpdate`]s keyed by the `data-forecast-id` of the target control.

use budget_core::{AllocationStore, DateRange, Forecast, ForecastId, Metric, MetricClass};
use budget_econ::{canonical_metric_name, MetricClassifier};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Shown in place of a value that cannot be rendered.
pub const PLACEHOLDER: &str = "--";

/// Slider bounds, in percent of the original budget.
pub const SLIDER_MIN: f64 = -100.0;
pub const SLIDER_MAX: f64 = 100.0;

/// Message of the blocking alert raised when the simulator call fails.
pub const SIMULATION_FAILED: &str = "Failed to run simulation. Please try again.";

/// Color class of an impact cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactTone {
    Positive,
    Negative,
    Neutral,
}

impl ImpactTone {
    /// Zero (and anything non-finite) is neutral.
    pub fn from_impact(impact: f64) -> Self {
        if impact > 0.0 {
            ImpactTone::Positive
        } else if impact < 0.0 {
            ImpactTone::Negative
        } else {
            ImpactTone::Neutral
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            ImpactTone::Positive => "impact-positive",
            ImpactTone::Negative => "impact-negative",
            ImpactTone::Neutral => "impact-neutral",
        }
    }
}

/// Decimal places a metric class is displayed with.
pub fn decimals(class: MetricClass) -> u32 {
    match class {
        MetricClass::Roas => 1,
        MetricClass::Rate => 2,
        MetricClass::Volume => 0,
    }
}

fn to_decimal(value: f64, dp: u32) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    let mut d = Decimal::from_f64(value)?
        .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    d.rescale(dp);
    if d.is_zero() {
        d.set_sign_positive(true);
    }
    Some(d)
}

/// Fixed-point rendering with `dp` decimals, half away from zero.
pub fn format_fixed(value: f64, dp: u32) -> String {
    to_decimal(value, dp).map_or_else(|| PLACEHOLDER.to_string(), |d| d.to_string())
}

/// Like [`format_fixed`] with `,` thousands separators.
pub fn format_thousands(value: f64, dp: u32) -> String {
    let Some(d) = to_decimal(value, dp) else {
        return PLACEHOLDER.to_string();
    };
    let text = d.to_string();
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Impact with one decimal and a percent sign.
pub fn format_impact(impact: f64) -> String {
    format!("{}%", format_fixed(impact, 1))
}

/// `"Jan 1, 2025 - Mar 31, 2025"`.
pub fn date_range_label(range: &DateRange) -> String {
    format!(
        "{} - {}",
        range.start.format("%b %-d, %Y"),
        range.end.format("%b %-d, %Y")
    )
}

/// A change to one visible control.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlUpdate {
    BudgetInput {
        forecast_id: ForecastId,
        value: String,
    },
    BudgetSlider {
        forecast_id: ForecastId,
        percent: f64,
    },
    MetricCell {
        forecast_id: ForecastId,
        metric: String,
        simulated: String,
        impact: String,
        tone: ImpactTone,
    },
    AggregateTotal {
        currency: String,
        value: String,
    },
    /// Blocking, user-facing message.
    Alert {
        message: String,
    },
}

/// Which aggregate an [`Insight`] rolls up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightKind {
    Conversions,
    Clicks,
}

/// Cross-campaign roll-up card.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Insight {
    pub key: &'static str,
    pub kind: InsightKind,
    pub title: &'static str,
    pub name: &'static str,
    pub current: f64,
    pub simulated: f64,
    pub impact: f64,
    pub tone: ImpactTone,
}

impl Insight {
    fn new(
        key: &'static str,
        kind: InsightKind,
        name: &'static str,
        current: f64,
        simulated: f64,
    ) -> Self {
        let impact = if current > 0.0 {
            (simulated - current) / current * 100.0
        } else {
            0.0
        };
        Self {
            key,
            kind,
            title: "All Campaigns",
            name,
            current,
            simulated,
            impact,
            tone: ImpactTone::from_impact(impact),
        }
    }
}

/// One table row of the metric filter view.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricRow {
    pub forecast_id: ForecastId,
    /// First visible row of its forecast; carries title/platform/campaign/budget cells.
    pub leading: bool,
    /// Rows spanned by the forecast-level cells.
    pub span: usize,
    pub title: String,
    pub platform: String,
    pub campaign: String,
    pub metric: String,
    pub current: String,
    pub simulated: String,
    pub impact: String,
    pub tone: ImpactTone,
    pub budget: String,
}

/// Projects store state onto controls.
#[derive(Clone, Debug)]
pub struct Presenter {
    classifier: MetricClassifier,
    default_currency: String,
}

impl Presenter {
    pub fn new(classifier: MetricClassifier, default_currency: impl Into<String>) -> Self {
        Self {
            classifier,
            default_currency: default_currency.into(),
        }
    }

    pub fn classifier(&self) -> &MetricClassifier {
        &self.classifier
    }

    fn format_metric_value(&self, metric: &str, value: f64) -> String {
        format_fixed(value, decimals(self.classifier.classify(metric)))
    }

    fn metric_cell(&self, forecast_id: &ForecastId, metric: &Metric) -> ControlUpdate {
        ControlUpdate::MetricCell {
            forecast_id: forecast_id.clone(),
            metric: metric.name.clone(),
            simulated: self.format_metric_value(&metric.name, metric.simulated),
            impact: format_impact(metric.impact),
            tone: ImpactTone::from_impact(metric.impact),
        }
    }

    /// Write an explicit value into a budget input (e.g. the clamped request).
    pub fn budget_input(&self, forecast_id: &ForecastId, value: f64) -> ControlUpdate {
        ControlUpdate::BudgetInput {
            forecast_id: forecast_id.clone(),
            value: format_thousands(value, 2),
        }
    }

    /// Budget input and slider for one forecast.
    pub fn render_budget(&self, store: &AllocationStore, id: &ForecastId) -> Vec<ControlUpdate> {
        let Some(value) = store.budget_of(id) else {
            debug!(forecast_id = %id, "no budget to render");
            return Vec::new();
        };
        let mut out = vec![self.budget_input(id, value)];
        if let Some(original) = store.original_budget(id).filter(|o| *o > 0.0) {
            let percent = ((value / original - 1.0) * 100.0).clamp(SLIDER_MIN, SLIDER_MAX);
            out.push(ControlUpdate::BudgetSlider {
                forecast_id: id.clone(),
                percent,
            });
        }
        out
    }

    /// Simulated value and impact cells for one forecast.
    pub fn render_metrics(&self, store: &AllocationStore, id: &ForecastId) -> Vec<ControlUpdate> {
        match store.forecast(id) {
            Some(f) => f.metrics.iter().map(|m| self.metric_cell(id, m)).collect(),
            None => {
                debug!(forecast_id = %id, "no forecast to render");
                Vec::new()
            }
        }
    }

    pub fn render_forecast(&self, store: &AllocationStore, id: &ForecastId) -> Vec<ControlUpdate> {
        let mut out = self.render_budget(store, id);
        out.extend(self.render_metrics(store, id));
        out
    }

    /// Floored total with the session's display currency.
    pub fn render_aggregate(&self, store: &AllocationStore) -> ControlUpdate {
        ControlUpdate::AggregateTotal {
            currency: store
                .display_currency()
                .unwrap_or(&self.default_currency)
                .to_string(),
            value: format_thousands(store.total_budget_floor(), 0),
        }
    }

    /// Every control on the page.
    pub fn render_all(&self, store: &AllocationStore) -> Vec<ControlUpdate> {
        let mut out: Vec<ControlUpdate> = store
            .forecasts()
            .iter()
            .flat_map(|f| self.render_forecast(store, &f.id))
            .collect();
        out.push(self.render_aggregate(store));
        out
    }

    pub fn alert(&self, message: impl Into<String>) -> ControlUpdate {
        ControlUpdate::Alert {
            message: message.into(),
        }
    }

    /// Table rows for the metrics selected in `filter`.
    pub fn metric_rows(&self, store: &AllocationStore, filter: &MetricFilter) -> Vec<MetricRow> {
        let mut rows = Vec::new();
        for forecast in store.forecasts() {
            let visible: Vec<&Metric> = forecast
                .metrics
                .iter()
                .filter(|m| filter.is_selected(&m.name))
                .collect();
            let span = visible.len();
            for (idx, metric) in visible.into_iter().enumerate() {
                rows.push(MetricRow {
                    forecast_id: forecast.id.clone(),
                    leading: idx == 0,
                    span,
                    title: forecast.title.clone(),
                    platform: forecast.platform.clone(),
                    campaign: forecast.campaign.clone(),
                    metric: metric.name.clone(),
                    current: self.format_metric_value(&metric.name, metric.current),
                    simulated: self.format_metric_value(&metric.name, metric.simulated),
                    impact: format_impact(metric.impact),
                    tone: ImpactTone::from_impact(metric.impact),
                    budget: budget_cell(forecast),
                });
            }
        }
        rows
    }
}

fn budget_cell(forecast: &Forecast) -> String {
    match forecast.budget_value() {
        Some(v) => format!("{}{}", forecast.currency().unwrap_or(""), v.trunc()),
        None => PLACEHOLDER.to_string(),
    }
}

#[derive(Default)]
struct Totals {
    current: f64,
    simulated: f64,
}

impl Totals {
    fn add(&mut self, m: Option<&Metric>) {
        if let Some(m) = m {
            self.current += m.current;
            self.simulated += m.simulated;
        }
    }
}

fn find_metric<'a>(f: &'a Forecast, pred: impl Fn(&str) -> bool) -> Option<&'a Metric> {
    f.metrics
        .iter()
        .find(|m| pred(&canonical_metric_name(&m.name)))
}

/// Conversions and clicks rolled up across every forecast.
///
/// Each forecast contributes at most one metric per family. A card is only
/// produced when its current total is positive.
pub fn aggregate_insights(store: &AllocationStore) -> Vec<Insight> {
    let mut purchases = Totals::default();
    let mut all_conv = Totals::default();
    let mut link_clicks = Totals::default();
    let mut clicks = Totals::default();
    for f in store.forecasts() {
        purchases.add(find_metric(f, |n| n.contains("website purchase")));
        all_conv.add(find_metric(f, |n| n.contains("all conv")));
        link_clicks.add(find_metric(f, |n| n.contains("link clicks")));
        clicks.add(find_metric(f, |n| n == "clicks" || n == "total clicks"));
    }

    let mut insights = Vec::new();
    if purchases.current > 0.0 || all_conv.current > 0.0 {
        insights.push(Insight::new(
            "aggregate-conversions",
            InsightKind::Conversions,
            "Total Conversions (Website Purchases + All Conv.)",
            purchases.current + all_conv.current,
            purchases.simulated + all_conv.simulated,
        ));
    }
    if link_clicks.current > 0.0 || clicks.current > 0.0 {
        insights.push(Insight::new(
            "aggregate-clicks",
            InsightKind::Clicks,
            "Total Clicks (Link Clicks + Clicks)",
            link_clicks.current + clicks.current,
            link_clicks.simulated + clicks.simulated,
        ));
    }
    insights
}

/// Selection of visible metric names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricFilter {
    available: Vec<String>,
    selected: BTreeSet<String>,
}

impl MetricFilter {
    /// Unique metric names in first-seen order, all selected.
    pub fn from_store(store: &AllocationStore) -> Self {
        let mut available: Vec<String> = Vec::new();
        for f in store.forecasts() {
            for m in &f.metrics {
                if !available.contains(&m.name) {
                    available.push(m.name.clone());
                }
            }
        }
        let selected = available.iter().cloned().collect();
        Self {
            available,
            selected,
        }
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.contains(name)
    }

    pub fn selected_count(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Replace the selection; unknown names are ignored.
    pub fn select<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.selected = names
            .into_iter()
            .filter_map(|n| {
                let n = n.as_ref();
                self.available.iter().find(|a| a.as_str() == n).cloned()
            })
            .collect();
    }

    /// Select everything, or nothing if everything was already selected.
    /// Returns whether all metrics are now selected.
    pub fn toggle_all(&mut self) -> bool {
        if self.selected.len() == self.available.len() {
            self.selected.clear();
            false
        } else {
            self.selected = self.available.iter().cloned().collect();
            true
        }
    }

    /// Dropdown button caption.
    pub fn label(&self) -> String {
        format!("Metrics ({})", self.selected_count())
    }
}
