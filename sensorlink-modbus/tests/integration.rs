//! Integration tests for sensorlink-modbus: full cycles against a mock bus
//! and a mock uplink.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::time::Duration;

use sensorlink_common::{Format, current_timestamp_millis, decode};
use sensorlink_modbus::config::{
    ConfigError, Measurement, MeasurementSource, PollPlan, StationConfig, StationIdentity,
};
use sensorlink_modbus::poller::{CycleController, CycleSettings, PollingState};
use sensorlink_modbus::protocol::FunctionCode;
use sensorlink_modbus::reader::read_value;
use sensorlink_modbus::transport::{RegisterTransport, TransportError};
use sensorlink_modbus::uplink::{Connectivity, SendReport, TransmissionError, Transmitter};
use tokio::time::Instant;

const STATION: &str = r#"{
    station: { id: "2567dbd8", id_field: "weatherStationId" },
    bus: { connection: { type: "rtu", port: "/dev/ttyUSB0" } },
    devices: [
        { name: "meter", model: "EM619002", address: 2 },
        { name: "lux", model: "SEM226O", address: 3 },
        { name: "wind", model: "WSD304", address: 5 },
        { name: "air", model: "SEM227", address: 6 },
    ],
    measurements: [
        { name: "temperature", device: "air", index: 1, scale: 0.1 },
        { name: "humidity", device: "air", index: 0, scale: 0.1 },
        { name: "light", device: "lux", index: 1 },
        { name: "pressure", value: 0 },
        { name: "windSpeed", device: "wind", index: 0 },
        { name: "current", device: "meter", index: 4, scale: 0.0001 },
    ],
    polling: { inter_read_delay_ms: 0 },
    uplink: { endpoint: "https://collector.example.com/api/v1/reading" },
}"#;

fn station() -> StationConfig {
    json5::from_str(STATION).expect("valid station config")
}

/// Bus answering from a register map keyed by (slave, address).
#[derive(Default)]
struct MockBus {
    registers: HashMap<(u8, u16), Vec<u16>>,
    offline: HashSet<u8>,
    requests: Vec<(u8, u16, u16)>,
}

impl MockBus {
    fn weather_station() -> Self {
        let mut bus = MockBus::default();
        bus.registers.insert((6, 0), vec![482]); // 48.2 %RH
        bus.registers.insert((6, 1), vec![0xFFE7]); // -2.5 degC
        bus.registers.insert((3, 2), vec![0x0001, 0x0000]); // 65536 lx
        bus.registers.insert((5, 0), vec![4]); // 4 m/s
        bus.registers.insert((2, 313), vec![0xFFFF, 0xB1E0]); // -2.0 A
        bus
    }
}

impl RegisterTransport for MockBus {
    async fn read_registers(
        &mut self,
        bus_address: u8,
        function: FunctionCode,
        start_address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        assert_eq!(function, FunctionCode::ReadHoldingRegisters);
        self.requests.push((bus_address, start_address, count));

        if self.offline.contains(&bus_address) {
            return Err(TransportError::Timeout(Duration::from_millis(1000)));
        }

        self.registers
            .get(&(bus_address, start_address))
            .cloned()
            .ok_or_else(|| TransportError::Exception("IllegalDataAddress".to_string()))
    }
}

/// Uplink recording every call.
struct MockUplink {
    connected: bool,
    reconnect_succeeds: bool,
    connect_calls: usize,
    fail_send: bool,
    sent: Vec<(Vec<u8>, &'static str)>,
    /// Wall-clock time spent inside `connect`.
    connect_delay: Duration,
    /// Wall-clock stamp of the first `connect` call.
    connect_started_at: Option<i64>,
}

impl MockUplink {
    fn online() -> Self {
        Self {
            connected: true,
            reconnect_succeeds: true,
            connect_calls: 0,
            fail_send: false,
            sent: Vec::new(),
            connect_delay: Duration::ZERO,
            connect_started_at: None,
        }
    }

    fn offline() -> Self {
        Self {
            connected: false,
            reconnect_succeeds: false,
            ..Self::online()
        }
    }
}

impl Connectivity for MockUplink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self, _timeout: Duration) -> bool {
        self.connect_calls += 1;
        self.connect_started_at.get_or_insert_with(current_timestamp_millis);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.connected = self.reconnect_succeeds;
        self.connected
    }
}

impl Transmitter for MockUplink {
    async fn send(
        &mut self,
        payload: Vec<u8>,
        content_type: &'static str,
    ) -> Result<SendReport, TransmissionError> {
        self.sent.push((payload, content_type));
        if self.fail_send {
            return Err(TransmissionError::Network("no route to host".to_string()));
        }
        Ok(SendReport {
            status: 201,
            body: "{}".to_string(),
        })
    }
}

fn settings(config: &StationConfig) -> CycleSettings {
    CycleSettings::from_config(config)
}

fn controller(
    bus: MockBus,
    uplink: MockUplink,
) -> (CycleController<MockBus, MockUplink>, StationConfig) {
    let config = station();
    let plan: PollPlan = config.plan().expect("valid plan");
    (
        CycleController::new(plan, settings(&config), bus, uplink),
        config,
    )
}

fn approx(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-9
}

#[tokio::test]
async fn test_cycle_builds_scaled_snapshot_in_payload_order() {
    let (mut controller, _) = controller(MockBus::weather_station(), MockUplink::online());

    let report = controller.run_cycle().await;

    assert_eq!(report.reads_ok, 5);
    assert_eq!(report.reads_failed, 0);
    assert!(report.connected_at_start);

    let snapshot = &report.snapshot;
    let names: Vec<&str> = snapshot.readings().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["temperature", "humidity", "light", "pressure", "windSpeed", "current"]
    );
    assert!(approx(snapshot.get("temperature").unwrap(), -2.5));
    assert!(approx(snapshot.get("humidity").unwrap(), 48.2));
    assert_eq!(snapshot.get("light"), Some(65536.0));
    assert_eq!(snapshot.get("pressure"), Some(0.0));
    assert_eq!(snapshot.get("windSpeed"), Some(4.0));
    assert!(approx(snapshot.get("current").unwrap(), -2.0));

    // Reads follow payload order; constants never touch the bus
    assert_eq!(
        controller.transport().requests,
        vec![(6, 1, 1), (6, 0, 1), (3, 2, 2), (5, 0, 1), (2, 313, 2)]
    );

    let (payload, content_type) = &controller.uplink().sent[0];
    assert_eq!(*content_type, "application/json");
    let json: serde_json::Value = decode(payload, Format::Json).unwrap();
    assert_eq!(json["weatherStationId"], "2567dbd8");
    assert_eq!(json["windSpeed"], 4.0);
}

#[tokio::test]
async fn test_snapshot_is_stamped_before_reconnect_wait() {
    let mut uplink = MockUplink::offline();
    uplink.connect_delay = Duration::from_millis(50);
    let (mut controller, _) = controller(MockBus::weather_station(), uplink);

    let before = current_timestamp_millis();
    let report = controller.run_cycle().await;

    let connect_started = controller.uplink().connect_started_at.unwrap();
    assert!(report.snapshot.timestamp >= before);
    assert!(report.snapshot.timestamp <= connect_started);
}

#[tokio::test]
async fn test_hand_built_plan_with_unknown_device_degrades_reading() {
    let config = station();
    let mut plan = config.plan().expect("valid plan");
    plan.measurements.insert(
        1,
        Measurement {
            name: "ghost".to_string(),
            source: MeasurementSource::Register {
                device: 99,
                index: 0,
                scale: 1.0,
                offset: 0.0,
            },
        },
    );
    let mut controller = CycleController::new(
        plan,
        settings(&config),
        MockBus::weather_station(),
        MockUplink::online(),
    );

    let report = controller.run_cycle().await;

    assert_eq!(report.reads_ok, 5);
    assert_eq!(report.reads_failed, 1);
    assert_eq!(report.snapshot.readings()[1].name, "ghost");
    assert_eq!(report.snapshot.get("ghost"), None);
    assert_eq!(report.snapshot.get("windSpeed"), Some(4.0));
    assert_eq!(controller.transport().requests.len(), 5);
    assert_eq!(controller.uplink().sent.len(), 1);
}

#[tokio::test]
async fn test_offline_cycle_still_reads_everything_and_sends_once() {
    let (mut controller, _) = controller(MockBus::weather_station(), MockUplink::offline());

    let report = controller.run_cycle().await;

    assert!(!report.connected_at_start);
    assert_eq!(controller.transport().requests.len(), 5);
    assert_eq!(controller.uplink().sent.len(), 1);
    // One attempt before the reads, one opportunistic attempt after sending
    assert_eq!(controller.uplink().connect_calls, 2);
}

#[tokio::test]
async fn test_reconnect_before_cycle() {
    let mut uplink = MockUplink::offline();
    uplink.reconnect_succeeds = true;
    let (mut controller, _) = controller(MockBus::weather_station(), uplink);

    let report = controller.run_cycle().await;

    assert!(report.connected_at_start);
    assert_eq!(controller.uplink().connect_calls, 1);
}

#[tokio::test]
async fn test_transport_error_does_not_stop_later_reads() {
    let mut bus = MockBus::weather_station();
    bus.offline.insert(6);
    let (mut controller, _) = controller(bus, MockUplink::online());

    let report = controller.run_cycle().await;

    assert_eq!(report.reads_failed, 2);
    assert_eq!(report.reads_ok, 3);
    assert_eq!(report.snapshot.get("temperature"), None);
    assert_eq!(report.snapshot.get("humidity"), None);
    assert_eq!(report.snapshot.get("windSpeed"), Some(4.0));
    assert_eq!(report.snapshot.missing(), 2);

    // No in-cycle retry: each failing register was asked exactly once
    let air_requests = controller
        .transport()
        .requests
        .iter()
        .filter(|(slave, _, _)| *slave == 6)
        .count();
    assert_eq!(air_requests, 2);

    let json: serde_json::Value = decode(&controller.uplink().sent[0].0, Format::Json).unwrap();
    assert!(json["temperature"].is_null());
}

#[tokio::test]
async fn test_transmission_failure_is_reported_not_fatal() {
    let mut uplink = MockUplink::online();
    uplink.fail_send = true;
    let (mut controller, _) = controller(MockBus::weather_station(), uplink);

    let first = controller.run_cycle().await;
    let second = controller.run_cycle().await;

    assert!(matches!(first.transmission, Err(TransmissionError::Network(_))));
    assert!(second.transmission.is_err());
    assert_eq!(controller.uplink().sent.len(), 2);
}

#[tokio::test]
async fn test_cbor_payload() {
    let config = station();
    let plan = config.plan().unwrap();
    let mut settings = settings(&config);
    settings.format = Format::Cbor;
    settings.station = StationIdentity {
        id: "ws-02".to_string(),
        id_field: "stationId".to_string(),
        include_timestamp: true,
    };
    let mut controller =
        CycleController::new(plan, settings, MockBus::weather_station(), MockUplink::online());

    controller.run_cycle().await;

    let (payload, content_type) = &controller.uplink().sent[0];
    assert_eq!(*content_type, "application/cbor");
    let value: serde_json::Value = decode(payload, Format::Cbor).unwrap();
    assert_eq!(value["stationId"], "ws-02");
    assert!(value["timestamp"].is_i64() || value["timestamp"].is_u64());
}

#[tokio::test]
async fn test_repeated_reads_are_idempotent() {
    let plan = station().plan().unwrap();
    let mut bus = MockBus::weather_station();
    let meter = &plan.devices[0];

    let first = read_value(&mut bus, meter, 4).await.unwrap();
    let second = read_value(&mut bus, meter, 4).await.unwrap();

    assert_eq!(first, -20000.0);
    assert_eq!(first, second);
    // No caching: both calls reached the bus
    assert_eq!(bus.requests.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_tick_waits_for_interval() {
    let (mut controller, config) = controller(MockBus::weather_station(), MockUplink::online());
    let t = Instant::now();
    let state = PollingState::starting_at(t, config.polling.cycle_interval());

    let (state, report) = controller
        .tick(state, t + Duration::from_millis(14_999))
        .await;
    assert!(report.is_none());
    assert!(controller.transport().requests.is_empty());
    assert_eq!(state.last_cycle(), Some(t));

    let due = t + Duration::from_millis(15_000);
    let (state, report) = controller.tick(state, due).await;
    assert!(report.is_some());
    assert_eq!(state.last_cycle(), Some(due));
    assert_eq!(controller.uplink().sent.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inter_read_delay_between_reads() {
    let config = station();
    let plan = config.plan().unwrap();
    let mut settings = settings(&config);
    settings.inter_read_delay = Duration::from_millis(1000);
    let mut controller =
        CycleController::new(plan, settings, MockBus::weather_station(), MockUplink::online());

    let started = Instant::now();
    let report = controller.run_cycle().await;
    let elapsed = started.elapsed();

    // Five register reads, four gaps; no delay after the last read
    assert!(elapsed >= Duration::from_millis(4000));
    assert!(elapsed < Duration::from_millis(4500));
    assert_eq!(report.reads_ok, 5);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_until_shutdown() {
    let (mut controller, config) = controller(MockBus::weather_station(), MockUplink::online());
    let state = PollingState::new(config.polling.cycle_interval());

    let state = controller
        .run(state, tokio::time::sleep(Duration::from_millis(31_000)))
        .await;

    // Cycles at start, ~15s and ~30s
    assert_eq!(controller.uplink().sent.len(), 3);
    assert!(state.last_cycle().is_some());
}

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(STATION.as_bytes()).unwrap();

    let config = StationConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.devices.len(), 4);
    assert_eq!(config.measurements.len(), 6);

    let missing = StationConfig::load_from_file("/nonexistent/sensorlink.json5");
    assert!(matches!(missing, Err(ConfigError::NotFound(_))));
}

#[test]
fn test_load_reports_unparsable_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{ station: ").unwrap();

    let result = StationConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_rejects_bad_index() {
    let broken = STATION.replace("index: 4, scale: 0.0001", "index: 6, scale: 0.0001");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(broken.as_bytes()).unwrap();

    let result = StationConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}
