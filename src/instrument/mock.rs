//! Simulated KEL103 electronic load.
//!
//! `MockLoad` implements [`Transport`] by interpreting the frames it receives the way the
//! instrument does, so the protocol client, the facade and the discharge controller can
//! be exercised end to end without hardware.
//!
//! # Features
//!
//! - Device state: output, remote sense, keyboard lock, function mode, setpoints and
//!   battery profile slots
//! - Scripted terminal voltage (one value per `MEAS:VOLT?` read, last value sticks)
//! - Fault injection on the n-th occurrence of a query ([`MockEvent`])
//! - Settings that silently ignore writes (for verification failures)
//! - Frame log for verifying exactly what went over the wire
//!
//! Clones share the same simulated device, so a test keeps one handle for inspection
//! while the client owns the other.
//!
//! # Example
//!
//! ```
//! use korad_daq::instrument::mock::MockLoad;
//! use korad_daq::instrument::Kel103;
//!
//! # tokio_test::block_on(async {
//! let mock = MockLoad::new();
//! let mut load = Kel103::new(mock.clone());
//! load.set_output(true).await.unwrap();
//! assert!(mock.output_enabled());
//! assert_eq!(mock.frames(), vec![":INP 1", ":INP?"]);
//! # })
//! ```

use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

/// Identity string reported by `*IDN?` unless overridden.
pub const DEFAULT_IDENTITY: &str = "KORAD-KEL103 V3.30 SN:00000001";

/// Fault injected when a query is seen for the n-th time.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// Swallow the query: the attempt runs into its receive timeout.
    DropReply,
    /// Answer with an empty datagram.
    EmptyReply,
    /// Answer with the given text instead of the simulated value.
    Reply(String),
    /// Fail the transport call with an I/O error of this kind.
    Fail(io::ErrorKind),
    /// Switch the output off (device-side protection trip), then answer normally.
    TripOutput,
    /// Panic inside the transport call.
    Panic,
}

#[derive(Debug)]
struct MockState {
    identity: String,
    output: bool,
    remote_sense: bool,
    keyboard_lock: bool,
    mode: String,
    current_setpoint: f64,
    voltage_setpoint: f64,
    power_setpoint: f64,
    profiles: HashMap<u8, [f64; 5]>,
    recalled: Option<u8>,
    voltage_script: VecDeque<f64>,
    voltage: f64,
    elapsed_minutes: f64,
    capacity: f64,
    silent: bool,
    closed: bool,
    ignored: HashSet<String>,
    events: Vec<(String, u32, MockEvent)>,
    query_counts: HashMap<String, u32>,
    frames: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            output: false,
            remote_sense: false,
            keyboard_lock: false,
            mode: "CC".to_string(),
            current_setpoint: 0.0,
            voltage_setpoint: 0.0,
            power_setpoint: 0.0,
            profiles: HashMap::new(),
            recalled: None,
            voltage_script: VecDeque::new(),
            voltage: 4.2,
            elapsed_minutes: 0.0,
            capacity: 0.0,
            silent: false,
            closed: false,
            ignored: HashSet::new(),
            events: Vec::new(),
            query_counts: HashMap::new(),
            frames: Vec::new(),
        }
    }
}

/// Simulated KEL103 reachable through the [`Transport`] trait.
#[derive(Debug, Clone, Default)]
pub struct MockLoad {
    state: Arc<Mutex<MockState>>,
}

enum Action {
    Reply(Vec<u8>),
    Timeout,
    Fail(io::ErrorKind),
    Panic,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Some(true),
        "0" | "OFF" => Some(false),
        _ => None,
    }
}

fn on_off(value: bool) -> String {
    let text = if value { "ON" } else { "OFF" };
    text.to_string()
}

impl MockLoad {
    /// Create a simulated load: output off, CC mode, 4.2 V on the terminals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a different identity on `*IDN?`.
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        self.lock().identity = identity.into();
        self
    }

    /// Serve these terminal voltages, one per `MEAS:VOLT?` read.
    ///
    /// The last value keeps being reported once the script is exhausted.
    pub fn with_voltage_script(self, volts: impl IntoIterator<Item = f64>) -> Self {
        {
            let mut state = self.lock();
            state.voltage_script = volts.into_iter().collect();
            if let Some(first) = state.voltage_script.front() {
                state.voltage = *first;
            }
        }
        self
    }

    /// Stop answering queries altogether.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Accept writes to `setting` without applying them.
    pub fn ignore_writes(&self, setting: &str) {
        self.lock().ignored.insert(setting.to_string());
    }

    /// Inject `event` on the `nth` (1-based) occurrence of the exact query text.
    pub fn on_query(&self, query: &str, nth: u32, event: MockEvent) {
        self.lock().events.push((query.to_string(), nth, event));
    }

    /// Frames received so far, without the line terminator.
    pub fn frames(&self) -> Vec<String> {
        self.lock().frames.clone()
    }

    /// Number of received frames equal to `text`.
    pub fn count_frames(&self, text: &str) -> usize {
        self.lock().frames.iter().filter(|f| f.as_str() == text).count()
    }

    /// Forget the frame log.
    pub fn clear_frames(&self) {
        self.lock().frames.clear();
    }

    /// Current output state.
    pub fn output_enabled(&self) -> bool {
        self.lock().output
    }

    /// Force the output state from the device side.
    pub fn set_output_state(&self, on: bool) {
        self.lock().output = on;
    }

    /// Current remote-sense state.
    pub fn remote_sense(&self) -> bool {
        self.lock().remote_sense
    }

    /// Current function mode as the device reports it.
    pub fn mode(&self) -> String {
        self.lock().mode.clone()
    }

    /// Force the function mode from the device side.
    pub fn set_mode(&self, mode: &str) {
        self.lock().mode = mode.to_string();
    }

    /// Stored battery profile fields for a slot.
    pub fn profile(&self, slot: u8) -> Option<[f64; 5]> {
        self.lock().profiles.get(&slot).copied()
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn process(&self, frame: &[u8], expects_reply: bool) -> Action {
        let mut state = self.lock();
        let text = String::from_utf8_lossy(frame)
            .trim_end_matches('\n')
            .to_string();
        state.frames.push(text.clone());

        if state.closed {
            return Action::Fail(io::ErrorKind::NotConnected);
        }

        if !text.ends_with('?') {
            state.apply_command(&text);
            return Action::Reply(Vec::new());
        }

        let count = {
            let counter = state.query_counts.entry(text.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let event = state
            .events
            .iter()
            .find(|(query, nth, _)| *query == text && *nth == count)
            .map(|(_, _, event)| event.clone());

        if state.silent || !expects_reply {
            return Action::Timeout;
        }

        match event {
            Some(MockEvent::DropReply) => Action::Timeout,
            Some(MockEvent::EmptyReply) => Action::Reply(Vec::new()),
            Some(MockEvent::Fail(kind)) => Action::Fail(kind),
            Some(MockEvent::Panic) => Action::Panic,
            Some(MockEvent::Reply(reply)) => Action::Reply(reply.into_bytes()),
            Some(MockEvent::TripOutput) => {
                state.output = false;
                Action::Reply(state.answer(&text).into_bytes())
            }
            None => Action::Reply(state.answer(&text).into_bytes()),
        }
    }
}

impl MockState {
    fn apply_command(&mut self, text: &str) {
        let body = text.trim_start_matches(':');
        let (name, arg) = body.split_once(' ').unwrap_or((body, ""));
        let name = name.to_ascii_uppercase();
        if self.ignored.contains(&name) {
            return;
        }

        match name.as_str() {
            "INP" => {
                if let Some(on) = parse_flag(arg) {
                    self.output = on;
                }
            }
            "SYST:COMP" => {
                if let Some(on) = parse_flag(arg) {
                    self.remote_sense = on;
                }
            }
            "SYST:LOCK" => {
                if let Some(on) = parse_flag(arg) {
                    self.keyboard_lock = on;
                }
            }
            "FUNC" => self.mode = arg.trim().to_ascii_uppercase(),
            "CURR" => {
                if let Some(value) = parse_number(arg) {
                    self.current_setpoint = round3(value);
                    self.mode = "CC".to_string();
                }
            }
            "VOLT" => {
                if let Some(value) = parse_number(arg) {
                    self.voltage_setpoint = round3(value);
                    self.mode = "CV".to_string();
                }
            }
            "POW" => {
                if let Some(value) = parse_number(arg) {
                    self.power_setpoint = round3(value);
                    self.mode = "CW".to_string();
                }
            }
            "BATT" => {
                let mut parts = arg.split(',').map(str::trim);
                let slot = parts.next().and_then(|s| s.parse::<u8>().ok());
                let fields: Vec<f64> = parts.filter_map(parse_number).map(round3).collect();
                if let (Some(slot), Ok(fields)) = (slot, <[f64; 5]>::try_from(fields)) {
                    self.profiles.insert(slot, fields);
                }
            }
            "RCL:BATT" => {
                if let Ok(slot) = arg.trim().parse::<u8>() {
                    self.recalled = Some(slot);
                    self.mode = "BATTERY".to_string();
                }
            }
            _ => {}
        }
    }

    fn discharge_current(&self) -> f64 {
        if !self.output {
            return 0.0;
        }
        match (self.mode.as_str(), self.recalled) {
            ("BATTERY", Some(slot)) => self.profiles.get(&slot).map_or(0.0, |p| p[1]),
            _ => self.current_setpoint,
        }
    }

    fn next_voltage(&mut self) -> f64 {
        if self.voltage_script.len() > 1 {
            self.voltage_script.pop_front();
        }
        let reading = self.voltage;
        if let Some(next) = self.voltage_script.front() {
            self.voltage = *next;
        }
        reading
    }

    fn answer(&mut self, text: &str) -> String {
        if text.eq_ignore_ascii_case("*IDN?") {
            return format!("{}\n", self.identity);
        }
        let name = text
            .trim_start_matches(':')
            .trim_end_matches('?')
            .to_ascii_uppercase();

        let reply = match name.as_str() {
            "INP" => on_off(self.output),
            "SYST:COMP" => on_off(self.remote_sense),
            "SYST:LOCK" => on_off(self.keyboard_lock),
            "FUNC" => self.mode.clone(),
            "CURR" => format!("{:.3}A", self.current_setpoint),
            "VOLT" => format!("{:.3}V", self.voltage_setpoint),
            "POW" => format!("{:.3}W", self.power_setpoint),
            "MEAS:VOLT" => format!("{:.3}V", self.next_voltage()),
            "MEAS:CURR" => format!("{:.3}A", self.discharge_current()),
            "MEAS:POW" => format!("{:.3}W", self.voltage * self.discharge_current()),
            "BATT:CAP" => format!("{:.3}AH", self.capacity),
            "BATT:TIM" => {
                if self.output {
                    self.elapsed_minutes += 1.0 / 60.0;
                    self.capacity += self.discharge_current() / 3600.0;
                }
                format!("{:.3}M", self.elapsed_minutes)
            }
            "RCL:BATT" => {
                let p = self
                    .recalled
                    .and_then(|slot| self.profiles.get(&slot).copied())
                    .unwrap_or([0.0; 5]);
                format!(
                    "{:.3}A,{:.3}A,{:.3}V,{:.3}AH,{:.3}M",
                    p[0], p[1], p[2], p[3], p[4]
                )
            }
            _ => "ERR".to_string(),
        };
        format!("{reply}\n")
    }
}

#[async_trait]
impl Transport for MockLoad {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.process(frame, false) {
            Action::Fail(kind) => Err(io::Error::from(kind)),
            _ => Ok(()),
        }
    }

    async fn send_and_receive(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        match self.process(frame, true) {
            Action::Reply(reply) => Ok(Some(reply)),
            Action::Timeout => {
                sleep(timeout).await;
                Ok(None)
            }
            Action::Fail(kind) => Err(io::Error::from(kind)),
            Action::Panic => panic!("simulated KEL103 panicked on {:?}", String::from_utf8_lossy(frame)),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
