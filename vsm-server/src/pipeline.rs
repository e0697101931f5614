//! Rule pipeline: six rules evaluated in order on every uplink.
//!
//! Each rule sees the state as patched by the rules before it and returns
//! an optional patch. A failing rule is logged and contributes nothing;
//! the remaining rules still run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vsm_core::rules;
use vsm_core::{
    DeviceState, Downlink, GnssState, Merge, Result, SolveRequest, Update, VsmState,
};

use crate::downlink::Downlinker;
use crate::downloads::AlmanacDownloads;
use crate::solver::Solver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Ask for the rules CRC until the device reports it.
    ChecksumPresence,
    /// Correct device clock drift reported with a GNSS scan.
    ClockDrift,
    /// Solve WiFi/GNSS scans into a position.
    PositionSolve,
    /// Provide an assistance position when none was ever sent.
    AssistanceBackstop,
    /// Replace almanacs older than a month.
    AlmanacFreshness,
    /// Record which translator produced the record.
    VersionStamp,
}

impl Rule {
    pub const ALL: [Rule; 6] = [
        Rule::ChecksumPresence,
        Rule::ClockDrift,
        Rule::PositionSolve,
        Rule::AssistanceBackstop,
        Rule::AlmanacFreshness,
        Rule::VersionStamp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Rule::ChecksumPresence => "checksum-presence",
            Rule::ClockDrift => "clock-drift",
            Rule::PositionSolve => "position-solve",
            Rule::AssistanceBackstop => "assistance-backstop",
            Rule::AlmanacFreshness => "almanac-freshness",
            Rule::VersionStamp => "version-stamp",
        }
    }
}

/// Per-uplink inputs shared by all rules.
struct RuleCtx<'a> {
    device_id: &'a str,
    update: &'a Update,
    now: DateTime<Utc>,
    /// Reference position reported with the uplink (gateway or network).
    observer: Option<(f64, f64)>,
}

pub struct Pipeline {
    /// `None` when position solving is disabled.
    solver: Option<Arc<dyn Solver>>,
    downlinker: Arc<dyn Downlinker>,
    downloads: Arc<AlmanacDownloads>,
    translator_version: String,
    clock_drift_threshold_s: f64,
    default_max_size: usize,
}

impl Pipeline {
    pub fn new(
        solver: Option<Arc<dyn Solver>>,
        downlinker: Arc<dyn Downlinker>,
        downloads: Arc<AlmanacDownloads>,
        translator_version: &str,
    ) -> Self {
        Pipeline {
            solver,
            downlinker,
            downloads,
            translator_version: translator_version.to_string(),
            clock_drift_threshold_s: rules::DEFAULT_CLOCK_DRIFT_THRESHOLD_S,
            default_max_size: 40,
        }
    }

    pub fn with_clock_drift_threshold(mut self, threshold_s: f64) -> Self {
        self.clock_drift_threshold_s = threshold_s;
        self
    }

    /// Max payload used for almanac frames when the record has none.
    pub fn with_default_max_size(mut self, max_size: usize) -> Self {
        self.default_max_size = max_size;
        self
    }

    pub fn downloads(&self) -> &Arc<AlmanacDownloads> {
        &self.downloads
    }

    /// Run all rules against `state` and return the next state.
    pub async fn apply(
        &self,
        device_id: &str,
        mut state: DeviceState,
        update: &Update,
        now: DateTime<Utc>,
        observer_lat: Option<f64>,
        observer_lng: Option<f64>,
    ) -> DeviceState {
        let ctx = RuleCtx {
            device_id,
            update,
            now,
            observer: observer_lat.zip(observer_lng),
        };

        for rule in Rule::ALL {
            match self.evaluate(rule, &state, &ctx).await {
                Ok(Some(patch)) => {
                    debug!(device = device_id, rule = rule.name(), "rule patched state");
                    state.merge(patch);
                }
                Ok(None) => {}
                Err(e) => warn!(device = device_id, rule = rule.name(), error = %e, "rule failed"),
            }
        }
        state
    }

    async fn evaluate(&self, rule: Rule, state: &DeviceState, ctx: &RuleCtx<'_>) -> Result<Option<DeviceState>> {
        match rule {
            Rule::ChecksumPresence => self.checksum_presence(state, ctx).await,
            Rule::ClockDrift => self.clock_drift(ctx).await,
            Rule::PositionSolve => self.position_solve(state, ctx).await,
            Rule::AssistanceBackstop => self.assistance_backstop(state, ctx).await,
            Rule::AlmanacFreshness => Ok(self.almanac_freshness(state, ctx)),
            Rule::VersionStamp => Ok(Some(self.version_stamp())),
        }
    }

    async fn checksum_presence(&self, state: &DeviceState, ctx: &RuleCtx<'_>) -> Result<Option<DeviceState>> {
        if !rules::needs_status_request(state) {
            return Ok(None);
        }
        debug!(device = ctx.device_id, "rules CRC unknown, requesting status");
        self.downlinker
            .send(ctx.device_id, &Downlink::status_request())
            .await?;
        Ok(None)
    }

    async fn clock_drift(&self, ctx: &RuleCtx<'_>) -> Result<Option<DeviceState>> {
        if let Some(drift) = rules::clock_drift(ctx.update) {
            debug!(device = ctx.device_id, drift_s = drift, "device clock offset");
        }
        let Some(delta) = rules::clock_correction(ctx.update, self.clock_drift_threshold_s) else {
            return Ok(None);
        };
        info!(device = ctx.device_id, delta_s = delta, "updating device time");
        self.downlinker
            .send(ctx.device_id, &Downlink::clock_delta(delta))
            .await?;
        Ok(None)
    }

    async fn position_solve(&self, state: &DeviceState, ctx: &RuleCtx<'_>) -> Result<Option<DeviceState>> {
        if !(ctx.update.has_wifi_scan() || ctx.update.has_gnss_scan()) {
            return Ok(None);
        }
        let Some(solver) = self.solver.as_ref() else {
            return Ok(None);
        };
        let Some(request) = SolveRequest::from_update(ctx.update) else {
            debug!(device = ctx.device_id, "scan without solver fragment");
            return Ok(None);
        };

        let Some(response) = solver.solve(&request).await else {
            return Ok(None);
        };
        if response.result.is_none() {
            if let Some(errors) = &response.errors {
                warn!(device = ctx.device_id, ?errors, "no position solved");
            }
        }
        let Some(mut patch) = response.into_patch() else {
            return Ok(None);
        };

        if let Some(assist) = self.assist(state, ctx).await {
            patch.merge(assist);
        }
        Ok(Some(patch))
    }

    async fn assistance_backstop(&self, state: &DeviceState, ctx: &RuleCtx<'_>) -> Result<Option<DeviceState>> {
        match &state.gnss {
            Some(gnss) if gnss.assistance_latitude.is_none() => Ok(self.assist(state, ctx).await),
            _ => Ok(None),
        }
    }

    /// Send an assistance position when due; the attempt is recorded even
    /// if the send fails.
    async fn assist(&self, state: &DeviceState, ctx: &RuleCtx<'_>) -> Option<DeviceState> {
        let (lat, lng) = ctx.observer?;
        let gnss = state.gnss.as_ref()?;
        if !rules::assistance_required(gnss, lat, lng, ctx.now) {
            return None;
        }

        info!(device = ctx.device_id, lat, lng, "sending assistance position");
        if let Err(e) = self
            .downlinker
            .send(ctx.device_id, &Downlink::assistance_position(lat, lng))
            .await
        {
            warn!(device = ctx.device_id, error = %e, "assistance downlink failed");
        }
        Some(DeviceState::gnss_patch(GnssState {
            last_assistance_update_attempt: Some(ctx.now),
            ..Default::default()
        }))
    }

    fn almanac_freshness(&self, state: &DeviceState, ctx: &RuleCtx<'_>) -> Option<DeviceState> {
        let gnss = state.gnss.as_ref()?;
        if !rules::almanac_download_due(gnss, ctx.now) {
            return None;
        }

        let max_size = state.max_size().unwrap_or(self.default_max_size);
        self.downloads.launch(ctx.device_id, max_size);
        Some(DeviceState::gnss_patch(GnssState {
            last_almanac_download_attempt: Some(ctx.now),
            ..Default::default()
        }))
    }

    fn version_stamp(&self) -> DeviceState {
        DeviceState::vsm_patch(VsmState {
            translator_version: Some(self.translator_version.clone()),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
