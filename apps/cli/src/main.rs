#![deny(warnings)]

//! Headless driver for a budget allocation session: load a dataset, replay
//! edits, print the projected table and optionally round-trip the simulator.

use anyhow::{bail, Context, Result};
use budget_config::EngineConfig;
use budget_core::{Budget, Dataset, DateRange, Forecast, ForecastId, Metric};
use budget_runtime::Session;
use budget_view::{aggregate_insights, date_range_label, format_thousands, ControlUpdate, MetricFilter};
use chrono::{Local, NaiveDate};
use sim_gateway::HttpGateway;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum Action {
    Edit(ForecastId, String),
    Percent(ForecastId, f64),
    Reset,
}

#[derive(Debug, Default)]
struct Args {
    dataset: Option<String>,
    config: Option<String>,
    actions: Vec<Action>,
    unlocked: bool,
    simulate: bool,
    refresh: bool,
    metrics: Option<Vec<String>>,
    json: bool,
    version: bool,
}

fn split_assignment(raw: &str) -> Option<(ForecastId, &str)> {
    let (id, value) = raw.rsplit_once('=')?;
    Some((ForecastId(id.to_string()), value))
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--dataset" => args.dataset = it.next(),
            "--config" => args.config = it.next(),
            "--edit" => {
                let raw = it.next().context("--edit needs id=value")?;
                let (id, value) = split_assignment(&raw).context("--edit needs id=value")?;
                args.actions.push(Action::Edit(id, value.to_string()));
            }
            "--percent" => {
                let raw = it.next().context("--percent needs id=pct")?;
                let (id, pct) = split_assignment(&raw).context("--percent needs id=pct")?;
                let pct: f64 = pct.parse().with_context(|| format!("bad percent {pct:?}"))?;
                args.actions.push(Action::Percent(id, pct));
            }
            "--reset" => args.actions.push(Action::Reset),
            "--unlocked" => args.unlocked = true,
            "--simulate" => args.simulate = true,
            "--refresh" => args.refresh = true,
            "--metrics" => {
                args.metrics = it
                    .next()
                    .map(|s| s.split(',').map(|m| m.trim().to_string()).collect())
            }
            "--json" => args.json = true,
            "--version" => args.version = true,
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(args)
}

fn demo_forecast(id: &str, platform: &str, campaign: &str, budget: f64, metrics: Vec<Metric>) -> Forecast {
    Forecast {
        id: ForecastId(id.to_string()),
        title: format!("{platform} {campaign}"),
        platform: platform.to_string(),
        campaign: campaign.to_string(),
        budget: Some(Budget {
            value: Some(budget),
            currency: Some("£".to_string()),
        }),
        metrics,
        date_range: None,
    }
}

fn demo_dataset() -> Dataset {
    let start = NaiveDate::from_ymd_opt(2025, 1, 1);
    let end = NaiveDate::from_ymd_opt(2025, 3, 31);
    Dataset {
        forecasts: vec![
            demo_forecast(
                "ForecastName 1",
                "Meta",
                "Awareness",
                12_000.0,
                vec![
                    Metric::baseline("Link Clicks", 8_400.0),
                    Metric::baseline("CTR", 1.42),
                    Metric::baseline("Website Purchases", 310.0),
                    Metric::baseline("ROAS", 3.6),
                ],
            ),
            demo_forecast(
                "ForecastName 2",
                "Google",
                "Search",
                8_500.0,
                vec![
                    Metric::baseline("Clicks", 6_100.0),
                    Metric::baseline("CPC", 1.39),
                    Metric::baseline("All Conv.", 240.0),
                    Metric::baseline("ROAS", 4.1),
                ],
            ),
            demo_forecast("ForecastName 3", "TikTok", "Prospecting", 3_500.0, Vec::new()),
        ],
        date_range: start.zip(end).map(|(start, end)| DateRange {
            start,
            end,
            days: None,
        }),
    }
}

fn print_table(session: &Session, filter: &MetricFilter) {
    let store = session.store();
    let range = store.to_dataset().resolved_date_range(Local::now().date_naive());
    println!("Forecast window: {}", date_range_label(&range));
    println!(
        "Total budget locked: {}",
        if session.is_locked() { "yes" } else { "no" }
    );
    println!();

    let rows = session.presenter().metric_rows(store, filter);
    if rows.is_empty() {
        println!("No metrics selected");
    }
    for row in rows {
        if row.leading {
            println!(
                "{} | {} | {} | budget {}",
                row.title, row.platform, row.campaign, row.budget
            );
        }
        println!(
            "    {:<22} {:>10} -> {:>10}  {:>8}",
            row.metric, row.current, row.simulated, row.impact
        );
    }
    println!();

    if let ControlUpdate::AggregateTotal { currency, value } =
        session.presenter().render_aggregate(store)
    {
        println!("Total budget: {currency}{value}");
    }
    for insight in aggregate_insights(store) {
        println!(
            "{} | {}: {} -> {} ({:.1}%)",
            insight.title,
            insight.name,
            format_thousands(insight.current, 0),
            format_thousands(insight.simulated, 0),
            insight.impact
        );
    }
}

fn emit(updates: &[ControlUpdate], json: bool) -> Result<()> {
    for u in updates {
        if let ControlUpdate::Alert { message } = u {
            eprintln!("ALERT: {message}");
        }
    }
    if json {
        println!("{}", serde_json::to_string(updates)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();

    let args = parse_args()?;
    if args.version {
        println!("budget-sim {} ({})", env!("GIT_SHA"), env!("BUILD_DATE"));
        return Ok(());
    }
    info!(dataset = ?args.dataset, config = ?args.config, actions = args.actions.len(), "starting CLI");

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut session = Session::new(config);
    if args.unlocked {
        session.set_locked(false);
    }
    let loaded = match &args.dataset {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            session.load_json(&raw)
        }
        None => session.load(Some(demo_dataset())),
    };
    if !loaded {
        warn!("dataset not loaded; nothing to show");
        return Ok(());
    }

    for action in &args.actions {
        let updates = match action {
            Action::Edit(id, raw) => session.edit_budget(id, raw),
            Action::Percent(id, pct) => session.edit_percent(id, *pct),
            Action::Reset => session.reset(),
        };
        info!(?action, updates = updates.len(), "action applied");
        emit(&updates, args.json)?;
    }

    if args.simulate || args.refresh {
        let rt = tokio::runtime::Runtime::new()?;
        let gateway = HttpGateway::new(session.config().gateway.clone())?;
        rt.block_on(async {
            if args.refresh {
                let updates = session.refresh_with(&gateway).await;
                emit(&updates, args.json)?;
            }
            if args.simulate {
                let updates = session.simulate_with(&gateway).await;
                emit(&updates, args.json)?;
            }
            anyhow::Ok(())
        })?;
        print_table(&session, &selected_filter(&session, args.metrics.as_deref()));
        rt.block_on(async {
            let handle = session.close(gateway);
            if tokio::time::timeout(Duration::from_millis(500), handle).await.is_err() {
                warn!("cleanup still pending at exit");
            }
        });
        return Ok(());
    }

    print_table(&session, &selected_filter(&session, args.metrics.as_deref()));
    Ok(())
}

fn selected_filter(session: &Session, metrics: Option<&[String]>) -> MetricFilter {
    let mut filter = MetricFilter::from_store(session.store());
    if let Some(names) = metrics {
        filter.select(names);
    }
    filter
}
