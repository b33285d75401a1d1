//! Polling cycle controller.
//!
//! A cycle verifies connectivity, reads every configured measurement in
//! payload order, transmits one snapshot and re-checks connectivity. The
//! schedule is an explicit [`PollingState`] value threaded through
//! [`CycleController::tick`], so the controller holds no timing state of
//! its own.
//!
//! Failed reads and sends are never retried inside a cycle: a retry would
//! stretch bus timing for every other device, and the next scheduled cycle
//! already is the retry.

use std::future::Future;
use std::time::Duration;

use sensorlink_common::{
    Format, Reading, ReadingSnapshot, current_timestamp_millis, encode, format_timestamp,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{MeasurementSource, PollPlan, StationConfig, StationIdentity};
use crate::reader::read_value;
use crate::transport::RegisterTransport;
use crate::uplink::{Connectivity, SendReport, TransmissionError, Transmitter};

/// When the last cycle started and how far apart cycles are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingState {
    last_cycle: Option<Instant>,
    cycle_interval: Duration,
}

impl PollingState {
    /// State for a station that has not run yet; the first check is due.
    pub fn new(cycle_interval: Duration) -> Self {
        Self {
            last_cycle: None,
            cycle_interval,
        }
    }

    /// State whose last cycle started at `last_cycle`.
    pub fn starting_at(last_cycle: Instant, cycle_interval: Duration) -> Self {
        Self {
            last_cycle: Some(last_cycle),
            cycle_interval,
        }
    }

    /// Whether a new cycle may start at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_cycle {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.cycle_interval,
        }
    }

    /// State after a cycle started at `now`.
    ///
    /// Cycles are spaced start to start: a cycle longer than the interval
    /// makes the next one due immediately.
    pub fn begin_cycle(self, now: Instant) -> Self {
        Self {
            last_cycle: Some(now),
            ..self
        }
    }

    pub fn last_cycle(&self) -> Option<Instant> {
        self.last_cycle
    }

    pub fn cycle_interval(&self) -> Duration {
        self.cycle_interval
    }

    /// Earliest instant the next cycle may start, if one has run.
    pub fn next_due(&self) -> Option<Instant> {
        self.last_cycle.map(|last| last + self.cycle_interval)
    }
}

/// Settings the controller needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub station: StationIdentity,
    pub format: Format,
    pub inter_read_delay: Duration,
    pub reconnect_timeout: Duration,
    pub tick: Duration,
}

impl CycleSettings {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            station: config.station.clone(),
            format: config.uplink.format,
            inter_read_delay: config.polling.inter_read_delay(),
            reconnect_timeout: config.polling.reconnect_timeout(),
            tick: config.polling.tick(),
        }
    }
}

/// What happened during one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Connectivity after the pre-cycle check.
    pub connected_at_start: bool,
    /// Register reads that produced a value.
    pub reads_ok: usize,
    /// Register reads that failed.
    pub reads_failed: usize,
    /// The snapshot handed to the transmitter.
    pub snapshot: ReadingSnapshot,
    /// Result of the single send attempt.
    pub transmission: Result<SendReport, TransmissionError>,
    /// Wall time spent in the cycle.
    pub duration: Duration,
}

/// Drives polling cycles over one bus and one uplink.
pub struct CycleController<T, U> {
    plan: PollPlan,
    settings: CycleSettings,
    transport: T,
    uplink: U,
}

impl<T, U> CycleController<T, U>
where
    T: RegisterTransport,
    U: Connectivity + Transmitter,
{
    pub fn new(plan: PollPlan, settings: CycleSettings, transport: T, uplink: U) -> Self {
        Self {
            plan,
            settings,
            transport,
            uplink,
        }
    }

    pub fn plan(&self) -> &PollPlan {
        &self.plan
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    /// Run one cycle if it is due at `now`.
    ///
    /// Returns the state to pass to the next call, and the cycle report if
    /// a cycle ran.
    pub async fn tick(
        &mut self,
        state: PollingState,
        now: Instant,
    ) -> (PollingState, Option<CycleReport>) {
        if !state.is_due(now) {
            return (state, None);
        }

        let report = self.run_cycle().await;
        (state.begin_cycle(now), Some(report))
    }

    /// Re-check the schedule every tick until `shutdown` resolves.
    ///
    /// Shutdown is observed between ticks only; a running cycle completes.
    pub async fn run<F>(&mut self, mut state: PollingState, shutdown: F) -> PollingState
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            devices = self.plan.devices.len(),
            measurements = self.plan.measurements.len(),
            interval_ms = state.cycle_interval().as_millis() as u64,
            "Polling loop started"
        );

        loop {
            let (next, _) = self.tick(state, Instant::now()).await;
            state = next;

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.settings.tick) => {}
            }
        }

        info!("Polling loop stopped");
        state
    }

    /// Run one full cycle unconditionally.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let taken_at = current_timestamp_millis();
        info!("Starting data cycle");

        let connected_at_start = self.ensure_connected().await;

        let mut snapshot =
            ReadingSnapshot::new(&self.settings.station.id_field, &self.settings.station.id)
                .with_timestamp(self.settings.station.include_timestamp);
        snapshot.timestamp = taken_at;
        let (reads_ok, reads_failed) = self.read_measurements(&mut snapshot).await;

        let transmission = self.transmit(&snapshot).await;

        self.ensure_connected().await;

        let duration = started.elapsed();
        info!(
            reads_ok,
            reads_failed,
            duration_ms = duration.as_millis() as u64,
            "Cycle complete"
        );

        CycleReport {
            connected_at_start,
            reads_ok,
            reads_failed,
            snapshot,
            transmission,
            duration,
        }
    }

    /// Check connectivity and make one bounded reconnect attempt if needed.
    async fn ensure_connected(&mut self) -> bool {
        if self.uplink.is_connected() {
            debug!("Uplink already connected");
            return true;
        }

        info!(
            timeout_ms = self.settings.reconnect_timeout.as_millis() as u64,
            "Uplink offline, reconnecting"
        );
        let connected = self.uplink.connect(self.settings.reconnect_timeout).await;
        if connected {
            info!("Uplink connection restored");
        } else {
            warn!("Uplink reconnect failed; continuing without connectivity");
        }
        connected
    }

    /// Read every measurement in order into `snapshot`.
    ///
    /// Returns (successful reads, failed reads).
    async fn read_measurements(&mut self, snapshot: &mut ReadingSnapshot) -> (usize, usize) {
        let mut ok = 0;
        let mut failed = 0;
        let mut first_read = true;

        for measurement in &self.plan.measurements {
            let value = match measurement.source {
                MeasurementSource::Constant(value) => Some(value),
                MeasurementSource::Register {
                    device: position,
                    index,
                    ..
                } => {
                    if !first_read && !self.settings.inter_read_delay.is_zero() {
                        tokio::time::sleep(self.settings.inter_read_delay).await;
                    }
                    first_read = false;

                    let Some(device) = self.plan.devices.get(position) else {
                        failed += 1;
                        warn!(
                            measurement = %measurement.name,
                            position,
                            devices = self.plan.devices.len(),
                            "Measurement refers to a device outside the plan"
                        );
                        snapshot.push(Reading::new(measurement.name.clone(), None));
                        continue;
                    };
                    debug!(measurement = %measurement.name, device = %device.name(), index, "Reading");

                    match read_value(&mut self.transport, device, index).await {
                        Ok(raw) => {
                            ok += 1;
                            let value = measurement.scale(raw);
                            debug!(measurement = %measurement.name, raw, value, "Read ok");
                            Some(value)
                        }
                        Err(e) => {
                            failed += 1;
                            warn!(
                                measurement = %measurement.name,
                                device = %device.name(),
                                index,
                                error = %e,
                                "Read failed"
                            );
                            None
                        }
                    }
                }
            };

            snapshot.push(Reading::new(measurement.name.clone(), value));
        }

        (ok, failed)
    }

    /// Encode and send the snapshot once, regardless of connectivity.
    async fn transmit(
        &mut self,
        snapshot: &ReadingSnapshot,
    ) -> Result<SendReport, TransmissionError> {
        let format = self.settings.format;
        let payload = match encode(snapshot, format) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode snapshot");
                return Err(TransmissionError::Encode(e.to_string()));
            }
        };

        if format == Format::Json {
            debug!(payload = %String::from_utf8_lossy(&payload), "Snapshot payload");
        }
        info!(
            bytes = payload.len(),
            missing = snapshot.missing(),
            taken_at = %format_timestamp(snapshot.timestamp),
            "Sending snapshot"
        );

        let result = self.uplink.send(payload, format.mime_type()).await;
        match &result {
            Ok(report) if report.is_success() => {
                info!(status = report.status, "Snapshot delivered");
                debug!(body = %report.body, "Collector response");
            }
            Ok(report) => {
                warn!(status = report.status, body = %report.body, "Collector rejected snapshot");
            }
            Err(e) => {
                warn!(error = %e, "Snapshot transmission failed");
            }
        }
        result
    }
}
