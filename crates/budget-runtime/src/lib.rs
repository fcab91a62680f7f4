#![deny(warnings)]

//! Session runtime: wires the allocation store, the redistribution engine,
//! the rescaling model, presentation sync and the simulation gateway.
//!
//! Every handler here is a user-input entry point. Handlers never fail: bad
//! ids and missing data are logged and yield an empty batch of control
//! updates. Only a failed simulator call reaches the user, as an alert.

use budget_config::EngineConfig;
use budget_core::{AllocationStore, Dataset, ForecastId};
use budget_econ::{
    apply_unlocked, parse_budget_input, percent_target, recalc, redistribute,
    redistribute_percent, RedistributeError, Redistribution, RedistributionKind, RescaleParams,
};
use budget_view::{ControlUpdate, Presenter, SIMULATION_FAILED};
use sim_gateway::{
    spawn_cleanup, GatewayError, RequestSequencer, RequestToken, SimulationGateway,
    SimulationRequest, SimulationResponse,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Alert raised when a refresh call fails.
pub const REFRESH_FAILED: &str = "Failed to refresh forecasts. Please try again.";

/// A simulate call ready to be sent.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationTicket {
    pub token: RequestToken,
    pub request: SimulationRequest,
}

/// One dashboard session.
#[derive(Debug)]
pub struct Session {
    config: EngineConfig,
    store: AllocationStore,
    presenter: Presenter,
    params: RescaleParams,
    locked: bool,
    sequencer: RequestSequencer,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        let presenter = Presenter::new(config.classifier(), config.default_currency.clone());
        Self {
            params: config.rescale_params(),
            locked: config.locked_by_default,
            presenter,
            store: AllocationStore::new(),
            sequencer: RequestSequencer::new(),
            config,
        }
    }

    /// Populate the store and capture baselines. A second load is ignored.
    pub fn load(&mut self, dataset: Option<Dataset>) -> bool {
        let loaded = self.store.initialize(dataset);
        if loaded {
            self.store.snapshot_originals();
        }
        loaded
    }

    pub fn load_json(&mut self, raw: &str) -> bool {
        let loaded = self.store.initialize_from_json(raw);
        if loaded {
            self.store.snapshot_originals();
        }
        loaded
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    pub fn presenter(&self) -> &Presenter {
        &self.presenter
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        if self.locked != locked {
            info!(locked, "total budget lock toggled");
        }
        self.locked = locked;
    }

    pub fn render_all(&self) -> Vec<ControlUpdate> {
        self.presenter.render_all(&self.store)
    }

    /// Budget text box changed.
    pub fn edit_budget(&mut self, id: &ForecastId, raw: &str) -> Vec<ControlUpdate> {
        self.edit_value(id, parse_budget_input(raw))
    }

    /// Budget changed to an absolute value.
    pub fn edit_value(&mut self, id: &ForecastId, requested: f64) -> Vec<ControlUpdate> {
        let eps = self.config.epsilon;
        let outcome = if self.locked {
            redistribute(&mut self.store, id, requested, eps)
        } else {
            apply_unlocked(&mut self.store, id, requested, eps)
        };
        self.finish_edit(id, outcome)
    }

    /// Slider moved to `percent` change of the original budget.
    pub fn edit_percent(&mut self, id: &ForecastId, percent: f64) -> Vec<ControlUpdate> {
        let eps = self.config.epsilon;
        let outcome = if self.locked {
            redistribute_percent(&mut self.store, id, percent, eps)
        } else {
            match self.store.original_budget(id) {
                Some(original) => {
                    apply_unlocked(&mut self.store, id, percent_target(original, percent), eps)
                }
                None => Err(RedistributeError::NoOriginalBudget(id.0.clone())),
            }
        };
        self.finish_edit(id, outcome)
    }

    fn finish_edit(
        &mut self,
        id: &ForecastId,
        outcome: Result<Redistribution, RedistributeError>,
    ) -> Vec<ControlUpdate> {
        let r = match outcome {
            Ok(r) => r,
            Err(e) => {
                warn!(forecast_id = %id, error = %e, "edit ignored");
                return Vec::new();
            }
        };
        if r.kind == RedistributionKind::NoOp {
            return vec![self.presenter.budget_input(id, r.clamped)];
        }
        for change in r.changes() {
            if let Err(e) = recalc(
                &mut self.store,
                self.presenter.classifier(),
                self.params,
                &change.id,
                change.old,
                change.new,
            ) {
                debug!(forecast_id = %change.id, error = %e, "metrics left as they were");
            }
        }
        let mut out: Vec<ControlUpdate> = r
            .changes()
            .flat_map(|c| self.presenter.render_forecast(&self.store, &c.id))
            .collect();
        out.push(self.presenter.render_aggregate(&self.store));
        out
    }

    /// Restore every forecast to its baseline and re-render what moved.
    pub fn reset(&mut self) -> Vec<ControlUpdate> {
        let touched = self.store.reset(self.config.epsilon);
        if touched.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<ControlUpdate> = touched
            .iter()
            .flat_map(|id| self.presenter.render_forecast(&self.store, id))
            .collect();
        out.push(self.presenter.render_aggregate(&self.store));
        out
    }

    /// Net percent change vs original for every forecast with a positive baseline.
    pub fn simulation_request(&self) -> SimulationRequest {
        let mut request = SimulationRequest::default();
        for f in self.store.forecasts() {
            let (Some(current), Some(original)) = (f.budget_value(), self.store.original_budget(&f.id))
            else {
                continue;
            };
            if original > 0.0 {
                request
                    .budget_changes
                    .insert(f.id.clone(), (current / original - 1.0) * 100.0);
            }
        }
        request
    }

    /// Issue a token for a simulate call. Any earlier in-flight call becomes stale.
    pub fn begin_simulation(&mut self) -> SimulationTicket {
        let token = self.sequencer.issue();
        let request = self.simulation_request();
        debug!(token = token.get(), changes = request.budget_changes.len(), "simulation issued");
        SimulationTicket { token, request }
    }

    pub fn begin_refresh(&mut self) -> RequestToken {
        let token = self.sequencer.issue();
        debug!(token = token.get(), "refresh issued");
        token
    }

    pub fn complete_simulation(
        &mut self,
        token: RequestToken,
        result: Result<SimulationResponse, GatewayError>,
    ) -> Vec<ControlUpdate> {
        self.complete(token, result, SIMULATION_FAILED)
    }

    pub fn complete_refresh(
        &mut self,
        token: RequestToken,
        result: Result<SimulationResponse, GatewayError>,
    ) -> Vec<ControlUpdate> {
        self.complete(token, result, REFRESH_FAILED)
    }

    fn complete(
        &mut self,
        token: RequestToken,
        result: Result<SimulationResponse, GatewayError>,
        failure: &str,
    ) -> Vec<ControlUpdate> {
        if !self.sequencer.is_current(token) {
            warn!(
                token = token.get(),
                latest = ?self.sequencer.latest().map(RequestToken::get),
                "stale simulator response discarded"
            );
            return Vec::new();
        }
        match result {
            Ok(response) => {
                let touched = self.apply_response(response);
                info!(token = token.get(), forecasts = touched.len(), "simulator response applied");
                let mut out: Vec<ControlUpdate> = touched
                    .iter()
                    .flat_map(|id| self.presenter.render_forecast(&self.store, id))
                    .collect();
                out.push(self.presenter.render_aggregate(&self.store));
                out
            }
            Err(e) => {
                error!(token = token.get(), error = %e, "simulator call failed");
                vec![self.presenter.alert(failure)]
            }
        }
    }

    /// Overwrite budgets and metric lists with the simulator's values.
    /// Originals are kept so later local edits stay anchored to the session start.
    fn apply_response(&mut self, response: SimulationResponse) -> Vec<ForecastId> {
        let mut touched = Vec::new();
        for update in response.forecasts {
            let Some(forecast) = self.store.forecast_mut(&update.id) else {
                warn!(forecast_id = %update.id, "simulator returned an unknown forecast");
                continue;
            };
            if let Some(value) = update.budget.and_then(|b| b.value) {
                if value.is_finite() && value >= 0.0 {
                    forecast.set_budget_value(value);
                } else {
                    warn!(forecast_id = %update.id, value, "simulator budget rejected");
                }
            }
            if let Some(metrics) = update.metrics {
                forecast.metrics = metrics;
            }
            touched.push(update.id);
        }
        if let Some(range) = response.date_range {
            self.store.set_date_range(range);
        }
        touched
    }

    /// Issue, await and apply one simulate call.
    pub async fn simulate_with<G: SimulationGateway>(&mut self, gateway: &G) -> Vec<ControlUpdate> {
        let ticket = self.begin_simulation();
        let result = gateway.simulate(&ticket.request).await;
        self.complete_simulation(ticket.token, result)
    }

    pub async fn refresh_with<G: SimulationGateway>(&mut self, gateway: &G) -> Vec<ControlUpdate> {
        let token = self.begin_refresh();
        let result = gateway.refresh().await;
        self.complete_refresh(token, result)
    }

    /// End the session and fire the server-side cleanup without waiting.
    pub fn close<G>(self, gateway: G) -> JoinHandle<()>
    where
        G: SimulationGateway + Send + Sync + 'static,
    {
        info!(forecasts = self.store.len(), "session closed");
        spawn_cleanup(gateway)
    }
}
