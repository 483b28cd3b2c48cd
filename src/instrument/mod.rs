//! KEL103 electronic load driver.
//!
//! [`Kel103`] maps the domain operations of the load onto the typed accessor layer.
//! The host keeps no copy of instrument state: every getter queries the device and
//! every setter is verified by reading the setting back.
//!
//! ## Command set
//!
//! | Operation                  | Setting     | Domain      |
//! |----------------------------|-------------|-------------|
//! | output                     | `INP`       | boolean     |
//! | remote sense               | `SYST:COMP` | boolean     |
//! | keyboard lock              | `SYST:LOCK` | boolean     |
//! | function mode              | `FUNC`      | enum        |
//! | current / voltage / power  | `CURR` `VOLT` `POW` | float (A, V, W) |
//! | measurements               | `MEAS:VOLT` `MEAS:CURR` `MEAS:POW` | float |
//! | battery test elapsed time  | `BATT:TIM`  | float (M)   |
//! | battery test capacity      | `BATT:CAP`  | float (AH)  |
//! | battery profile            | `BATT` / `RCL:BATT` | five fields |

pub mod mock;

use crate::accessor::{decode_float, Accessor, Unit, FLOAT_PRECISION};
use crate::error::{AppResult, DaqError};
use crate::protocol::{ProtocolClient, QueryPolicy};
use crate::transport::{Transport, UdpTransport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Operating mode reported by `FUNC?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FunctionMode {
    /// Constant current.
    Cc,
    /// Constant voltage.
    Cv,
    /// Constant resistance.
    Cr,
    /// Constant power.
    Cw,
    /// Battery test; entered by recalling a battery profile.
    Battery,
    /// Short circuit.
    Short,
}

impl FunctionMode {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            FunctionMode::Cc => "CC",
            FunctionMode::Cv => "CV",
            FunctionMode::Cr => "CR",
            FunctionMode::Cw => "CW",
            FunctionMode::Battery => "BATTERY",
            FunctionMode::Short => "SHORT",
        }
    }

    /// Whether the mode can be selected with `FUNC`.
    pub fn is_settable(self) -> bool {
        matches!(
            self,
            FunctionMode::Cc | FunctionMode::Cv | FunctionMode::Cr | FunctionMode::Cw
        )
    }
}

impl fmt::Display for FunctionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CC" => Ok(FunctionMode::Cc),
            "CV" => Ok(FunctionMode::Cv),
            "CR" => Ok(FunctionMode::Cr),
            "CW" => Ok(FunctionMode::Cw),
            "BATTERY" => Ok(FunctionMode::Battery),
            "SHORT" => Ok(FunctionMode::Short),
            _ => Err(DaqError::decode("FUNC", s, "unknown function mode")),
        }
    }
}

/// Battery test parameters stored in one of the instrument's profile slots.
///
/// The instrument refuses writes to slots 0 and 1 until slot 2 has been programmed.
/// This is a device-side rule the host cannot check, so nothing here enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryProfile {
    /// Profile slot on the instrument.
    pub slot: u8,
    /// Current range limit in amperes.
    pub max_current: f64,
    /// Discharge current in amperes.
    pub set_current: f64,
    /// Terminal voltage at which the instrument ends the test, in volts.
    pub voltage_cutoff: f64,
    /// Discharged capacity at which the instrument ends the test, in ampere-hours.
    pub capacity_cutoff: f64,
    /// Duration after which the instrument ends the test, in minutes.
    pub time_cutoff: f64,
}

impl BatteryProfile {
    const FIELDS: [(&'static str, Unit); 5] = [
        ("max_current", Unit::Ampere),
        ("set_current", Unit::Ampere),
        ("voltage_cutoff", Unit::Volt),
        ("capacity_cutoff", Unit::AmpereHour),
        ("time_cutoff", Unit::Minute),
    ];

    fn values(&self) -> [f64; 5] {
        [
            self.max_current,
            self.set_current,
            self.voltage_cutoff,
            self.capacity_cutoff,
            self.time_cutoff,
        ]
    }

    /// The `:BATT` command programming this profile.
    pub fn to_command(&self) -> String {
        format!(
            ":BATT {},{}A,{}A,{}V,{}AH,{}M",
            self.slot,
            self.max_current,
            self.set_current,
            self.voltage_cutoff,
            self.capacity_cutoff,
            self.time_cutoff
        )
    }

    /// Parse a `RCL:BATT?` reply such as `30.000A,1.500A,2.600V,99.000AH,99.000M`.
    pub fn parse(slot: u8, reply: &str) -> AppResult<Self> {
        let parts: Vec<&str> = reply.trim().split(',').collect();
        if parts.len() != Self::FIELDS.len() {
            return Err(DaqError::decode(
                "RCL:BATT",
                reply,
                format!("expected 5 fields, got {}", parts.len()),
            ));
        }

        let mut values = [0.0; 5];
        for (value, ((name, unit), part)) in values
            .iter_mut()
            .zip(Self::FIELDS.iter().zip(parts))
        {
            *value = decode_float(&format!("RCL:BATT.{name}"), part, *unit)?;
        }

        Ok(Self {
            slot,
            max_current: values[0],
            set_current: values[1],
            voltage_cutoff: values[2],
            capacity_cutoff: values[3],
            time_cutoff: values[4],
        })
    }

    /// First field that differs from `other` at 3-decimal precision.
    ///
    /// Returns the field name with both values formatted for display.
    pub fn first_mismatch(&self, other: &BatteryProfile) -> Option<(&'static str, String, String)> {
        Self::FIELDS
            .iter()
            .zip(self.values().into_iter().zip(other.values()))
            .find(|(_, (mine, theirs))| {
                !crate::accessor::same_at_precision(*mine, *theirs, FLOAT_PRECISION)
            })
            .map(|((name, unit), (mine, theirs))| {
                (
                    *name,
                    crate::accessor::format_float(mine, *unit, FLOAT_PRECISION),
                    crate::accessor::format_float(theirs, *unit, FLOAT_PRECISION),
                )
            })
    }
}

/// One reading of the three live measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// Terminal voltage in volts.
    pub voltage: f64,
    /// Load current in amperes.
    pub current: f64,
    /// Dissipated power in watts.
    pub power: f64,
}

/// KORAD KEL103 electronic load.
#[derive(Debug)]
pub struct Kel103<T> {
    accessor: Accessor<T>,
}

impl Kel103<UdpTransport> {
    /// Bind `local` and talk to the load at `device`.
    pub async fn connect(
        local: SocketAddr,
        device: SocketAddr,
        policy: QueryPolicy,
    ) -> AppResult<Self> {
        let transport = UdpTransport::bind(local, device).await?;
        info!(%local, %device, "connected to KEL103");
        Ok(Self::with_policy(transport, policy))
    }
}

impl<T: Transport> Kel103<T> {
    /// Drive the load through `transport` with the default query policy.
    pub fn new(transport: T) -> Self {
        Self::with_policy(transport, QueryPolicy::default())
    }

    /// Drive the load through `transport` with an explicit query policy.
    pub fn with_policy(transport: T, policy: QueryPolicy) -> Self {
        Self {
            accessor: Accessor::new(ProtocolClient::with_policy(transport, policy)),
        }
    }

    /// Borrow the protocol client.
    pub fn client(&self) -> &ProtocolClient<T> {
        self.accessor.client()
    }

    /// Identity string (`*IDN?`), trimmed.
    pub async fn identify(&mut self) -> AppResult<String> {
        let reply = self.accessor.query("*IDN?").await?;
        Ok(reply.trim().to_string())
    }

    /// Whether the identity contains `expected`.
    pub async fn is_model(&mut self, expected: &str) -> AppResult<bool> {
        Ok(self.identify().await?.contains(expected))
    }

    /// Input switch state (`INP?`).
    pub async fn output_enabled(&mut self) -> AppResult<bool> {
        self.accessor.get_boolean("INP").await
    }

    /// Switch the input on or off and verify it.
    pub async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.accessor.set_boolean("INP", on).await
    }

    /// Remote (4-wire) sense state.
    pub async fn remote_sense_enabled(&mut self) -> AppResult<bool> {
        self.accessor.get_boolean("SYST:COMP").await
    }

    /// Enable or disable remote sense.
    pub async fn set_remote_sense(&mut self, on: bool) -> AppResult<()> {
        self.accessor.set_boolean("SYST:COMP", on).await
    }

    /// Front panel lock state.
    pub async fn keyboard_lock(&mut self) -> AppResult<bool> {
        self.accessor.get_boolean("SYST:LOCK").await
    }

    /// Lock or unlock the front panel.
    pub async fn set_keyboard_lock(&mut self, locked: bool) -> AppResult<()> {
        self.accessor.set_boolean("SYST:LOCK", locked).await
    }

    /// Active function mode.
    pub async fn function_mode(&mut self) -> AppResult<FunctionMode> {
        self.accessor.get_enum("FUNC").await?.parse()
    }

    /// Select CC, CV, CR or CW.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for `Battery` and `Short`, which the device only
    /// reports; nothing is sent in that case.
    pub async fn set_function_mode(&mut self, mode: FunctionMode) -> AppResult<()> {
        if !mode.is_settable() {
            return Err(DaqError::Configuration(format!(
                "function mode {mode} is read-only"
            )));
        }
        self.accessor.set_enum("FUNC", mode.as_str()).await
    }

    /// Measured voltage in V.
    pub async fn measure_voltage(&mut self) -> AppResult<f64> {
        self.accessor.get_float("MEAS:VOLT", Unit::Volt).await
    }

    /// Measured current in A.
    pub async fn measure_current(&mut self) -> AppResult<f64> {
        self.accessor.get_float("MEAS:CURR", Unit::Ampere).await
    }

    /// Measured power in W.
    pub async fn measure_power(&mut self) -> AppResult<f64> {
        self.accessor.get_float("MEAS:POW", Unit::Watt).await
    }

    /// Voltage, current and power, read in that order.
    pub async fn measure_all(&mut self) -> AppResult<Measurements> {
        Ok(Measurements {
            voltage: self.measure_voltage().await?,
            current: self.measure_current().await?,
            power: self.measure_power().await?,
        })
    }

    /// CC setpoint in A.
    pub async fn current_setpoint(&mut self) -> AppResult<f64> {
        self.accessor.get_float("CURR", Unit::Ampere).await
    }

    /// Set the CC setpoint. Switches the device to CC.
    pub async fn set_current(&mut self, amps: f64) -> AppResult<()> {
        self.accessor.set_float("CURR", amps, Unit::Ampere).await
    }

    /// CV setpoint in V.
    pub async fn voltage_setpoint(&mut self) -> AppResult<f64> {
        self.accessor.get_float("VOLT", Unit::Volt).await
    }

    /// Set the CV setpoint. Switches the device to CV.
    pub async fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        self.accessor.set_float("VOLT", volts, Unit::Volt).await
    }

    /// CW setpoint in W.
    pub async fn power_setpoint(&mut self) -> AppResult<f64> {
        self.accessor.get_float("POW", Unit::Watt).await
    }

    /// Set the CW setpoint. Switches the device to CW.
    pub async fn set_power(&mut self, watts: f64) -> AppResult<()> {
        self.accessor.set_float("POW", watts, Unit::Watt).await
    }

    /// Minutes elapsed in the running battery test.
    pub async fn battery_elapsed_time(&mut self) -> AppResult<f64> {
        self.accessor.get_float("BATT:TIM", Unit::Minute).await
    }

    /// Capacity discharged so far in the running battery test, in ampere-hours.
    pub async fn battery_capacity(&mut self) -> AppResult<f64> {
        self.accessor.get_float("BATT:CAP", Unit::AmpereHour).await
    }

    /// Recall profile `slot` and read its fields.
    ///
    /// Recalling a profile switches the instrument into battery mode.
    pub async fn battery_profile(&mut self, slot: u8) -> AppResult<BatteryProfile> {
        self.accessor.command(&format!(":RCL:BATT {slot}")).await?;
        let reply = self.accessor.query(":RCL:BATT?").await?;
        BatteryProfile::parse(slot, &reply)
    }

    /// Program a profile with a single `:BATT` write and verify every field.
    ///
    /// The write is never repeated: on mismatch the error names the slot and the
    /// first differing field.
    pub async fn set_battery_profile(&mut self, profile: &BatteryProfile) -> AppResult<()> {
        for (name, value) in BatteryProfile::FIELDS.iter().map(|(n, _)| *n).zip(profile.values()) {
            if !value.is_finite() || value < 0.0 {
                return Err(DaqError::Configuration(format!(
                    "battery profile field {name} must be a non-negative number, got {value}"
                )));
            }
        }

        self.accessor.command(&profile.to_command()).await?;
        let stored = self.battery_profile(profile.slot).await?;

        if let Some((field, requested, observed)) = profile.first_mismatch(&stored) {
            warn!(slot = profile.slot, field, %requested, %observed, "battery profile not adopted");
            return Err(DaqError::verification(
                format!("BATT[{}].{field}", profile.slot),
                requested,
                observed,
            ));
        }
        debug!(?profile, "battery profile verified");
        Ok(())
    }

    /// Disable the output, then release the transport.
    ///
    /// The transport is released even when disabling fails; the first error wins.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let disabled = self.set_output(false).await;
        let closed = self.accessor.close().await;
        info!(output_disabled = disabled.is_ok(), "KEL103 connection shut down");
        disabled.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockEvent, MockLoad};
    use super::*;

    fn profile() -> BatteryProfile {
        BatteryProfile {
            slot: 2,
            max_current: 30.0,
            set_current: 1.5,
            voltage_cutoff: 2.6,
            capacity_cutoff: 99.0,
            time_cutoff: 99.0,
        }
    }

    #[test]
    fn profile_command_lists_all_fields() {
        assert_eq!(profile().to_command(), ":BATT 2,30A,1.5A,2.6V,99AH,99M");
    }

    #[test]
    fn parses_profile_reply() {
        let parsed =
            BatteryProfile::parse(2, "30.000A,1.500A,2.600V,99.000AH,99.000M\n").unwrap();
        assert_eq!(parsed, profile());
    }

    #[test]
    fn rejects_short_profile_reply() {
        let err = BatteryProfile::parse(2, "30.000A,1.500A\n").unwrap_err();
        assert!(matches!(err, DaqError::ProtocolDecode { .. }));
    }

    #[test]
    fn function_modes_parse_case_insensitively() {
        assert_eq!("cw".parse::<FunctionMode>().unwrap(), FunctionMode::Cw);
        assert_eq!("BATTERY\n".parse::<FunctionMode>().unwrap(), FunctionMode::Battery);
        assert!("XX".parse::<FunctionMode>().is_err());
    }

    #[tokio::test]
    async fn identifies_model() {
        let mut load = Kel103::new(MockLoad::new());

        assert!(load.identify().await.unwrap().starts_with("KORAD-KEL103"));
        assert!(load.is_model("KEL103").await.unwrap());
        assert!(!load.is_model("KA3005P").await.unwrap());
    }

    #[tokio::test]
    async fn setpoints_round_trip() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());

        load.set_current(1.25).await.unwrap();
        assert_eq!(load.current_setpoint().await.unwrap(), 1.25);
        assert_eq!(load.function_mode().await.unwrap(), FunctionMode::Cc);

        load.set_voltage(12.0).await.unwrap();
        assert_eq!(load.voltage_setpoint().await.unwrap(), 12.0);

        load.set_power(5.5).await.unwrap();
        assert_eq!(load.power_setpoint().await.unwrap(), 5.5);
        assert_eq!(mock.mode(), "CW");
    }

    #[tokio::test]
    async fn toggles_switches() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());

        load.set_remote_sense(true).await.unwrap();
        load.set_keyboard_lock(true).await.unwrap();

        assert!(load.remote_sense_enabled().await.unwrap());
        assert!(load.keyboard_lock().await.unwrap());
        assert!(mock.remote_sense());
    }

    #[tokio::test]
    async fn selects_function_mode() {
        let mut load = Kel103::new(MockLoad::new());

        load.set_function_mode(FunctionMode::Cr).await.unwrap();

        assert_eq!(load.function_mode().await.unwrap(), FunctionMode::Cr);
    }

    #[tokio::test]
    async fn read_only_modes_are_rejected_before_sending() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());

        for mode in [FunctionMode::Battery, FunctionMode::Short] {
            let err = load.set_function_mode(mode).await.unwrap_err();
            assert!(matches!(err, DaqError::Configuration(_)));
        }
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn measures_in_order() {
        let mock = MockLoad::new().with_voltage_script([3.9]);
        let mut load = Kel103::new(mock.clone());
        load.set_current(2.0).await.unwrap();
        load.set_output(true).await.unwrap();
        mock.clear_frames();

        let m = load.measure_all().await.unwrap();

        assert_eq!(m.voltage, 3.9);
        assert_eq!(m.current, 2.0);
        assert!((m.power - 7.8).abs() < 1e-9);
        assert_eq!(mock.frames(), vec![":MEAS:VOLT?", ":MEAS:CURR?", ":MEAS:POW?"]);
    }

    #[tokio::test]
    async fn programs_and_recalls_battery_profile() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());

        load.set_battery_profile(&profile()).await.unwrap();

        assert_eq!(mock.profile(2), Some([30.0, 1.5, 2.6, 99.0, 99.0]));
        assert_eq!(load.function_mode().await.unwrap(), FunctionMode::Battery);
        assert_eq!(load.battery_profile(2).await.unwrap(), profile());
    }

    #[tokio::test]
    async fn altered_profile_field_is_named_and_not_rewritten() {
        let mock = MockLoad::new();
        mock.on_query(
            ":RCL:BATT?",
            1,
            MockEvent::Reply("30.000A,1.500A,2.700V,99.000AH,99.000M\n".into()),
        );
        let mut load = Kel103::new(mock.clone());

        let err = load.set_battery_profile(&profile()).await.unwrap_err();

        match err {
            DaqError::VerificationFailed {
                setting,
                requested,
                observed,
            } => {
                assert_eq!(setting, "BATT[2].voltage_cutoff");
                assert_eq!(requested, "2.600V");
                assert_eq!(observed, "2.700V");
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
        assert_eq!(mock.count_frames(&profile().to_command()), 1);
    }

    #[tokio::test]
    async fn negative_profile_field_is_never_sent() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());
        let bad = BatteryProfile {
            set_current: -1.0,
            ..profile()
        };

        let err = load.set_battery_profile(&bad).await.unwrap_err();

        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn battery_counters_advance_while_output_is_on() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());
        load.set_battery_profile(&profile()).await.unwrap();
        load.set_output(true).await.unwrap();

        let first = load.battery_elapsed_time().await.unwrap();
        let second = load.battery_elapsed_time().await.unwrap();

        assert!(second > first);
        assert!(load.battery_capacity().await.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn shutdown_disables_output_and_closes() {
        let mock = MockLoad::new();
        let mut load = Kel103::new(mock.clone());
        load.set_output(true).await.unwrap();

        load.shutdown().await.unwrap();

        assert!(!mock.output_enabled());
        assert!(mock.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_even_when_disable_fails() {
        let mock = MockLoad::new();
        mock.ignore_writes("INP");
        mock.set_output_state(true);
        let mut load = Kel103::new(mock.clone());

        let err = load.shutdown().await.unwrap_err();

        assert!(matches!(err, DaqError::VerificationFailed { .. }));
        assert!(mock.is_closed());
    }
}
