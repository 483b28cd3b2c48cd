//! Typed, verified access to instrument settings.
//!
//! Every setting belongs to one of three value domains:
//!
//! | Domain  | Read reply      | Write argument      |
//! |---------|-----------------|---------------------|
//! | boolean | `ON` / `OFF`    | `1` / `0`           |
//! | float   | `1.234A`        | `1.234A` (3 digits) |
//! | enum    | `CC`, `CV`, ... | same text           |
//!
//! Writes are actions and the instrument never acknowledges them, so every `set_*`
//! reads the setting back and fails with [`DaqError::VerificationFailed`] when the
//! device did not adopt the value. The read-back is the only delivery confirmation the
//! link offers.

use crate::error::{AppResult, DaqError};
use crate::protocol::ProtocolClient;
use crate::transport::Transport;
use std::fmt;
use tracing::debug;

/// Fractional digits used when writing and comparing floats.
pub const FLOAT_PRECISION: usize = 3;

/// Physical unit suffix of a float setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// `A`
    Ampere,
    /// `V`
    Volt,
    /// `W`
    Watt,
    /// `AH`
    AmpereHour,
    /// `M`
    Minute,
}

impl Unit {
    /// Suffix as written on the wire.
    pub fn suffix(self) -> &'static str {
        match self {
            Unit::Ampere => "A",
            Unit::Volt => "V",
            Unit::Watt => "W",
            Unit::AmpereHour => "AH",
            Unit::Minute => "M",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// True when `a` and `b` are equal after rounding both to `precision` fractional digits.
pub fn same_at_precision(a: f64, b: f64, precision: usize) -> bool {
    let scale = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
    (a * scale).round() == (b * scale).round()
}

/// Decode an `ON`/`OFF` reply.
pub fn decode_boolean(setting: &str, reply: &str) -> AppResult<bool> {
    if reply.contains("OFF") {
        Ok(false)
    } else if reply.contains("ON") {
        Ok(true)
    } else {
        Err(DaqError::decode(setting, reply, "expected ON or OFF"))
    }
}

/// Decode a float reply carrying `unit` as suffix.
///
/// A reply without the suffix is accepted; any other trailing text is not.
pub fn decode_float(setting: &str, reply: &str, unit: Unit) -> AppResult<f64> {
    let trimmed = reply.trim();
    let number = trimmed.strip_suffix(unit.suffix()).unwrap_or(trimmed).trim();
    match number.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err(DaqError::decode(setting, reply, "value is not finite")),
        Err(e) => Err(DaqError::decode(
            setting,
            reply,
            format!("expected a decimal number in {unit}: {e}"),
        )),
    }
}

/// Format a float for the wire: fixed `precision` digits followed by the unit suffix.
pub fn format_float(value: f64, unit: Unit, precision: usize) -> String {
    format!("{value:.precision$}{unit}")
}

/// Generic get/set helpers over a [`ProtocolClient`].
#[derive(Debug)]
pub struct Accessor<T> {
    client: ProtocolClient<T>,
}

impl<T: Transport> Accessor<T> {
    /// Wrap a protocol client.
    pub fn new(client: ProtocolClient<T>) -> Self {
        Self { client }
    }

    /// Borrow the protocol client.
    pub fn client(&self) -> &ProtocolClient<T> {
        &self.client
    }

    /// Raw query, for replies that do not fit a value domain.
    pub async fn query(&mut self, text: &str) -> AppResult<String> {
        self.client.query(text).await
    }

    /// Raw action.
    pub async fn command(&mut self, text: &str) -> AppResult<()> {
        self.client.command(text).await
    }

    /// Release the transport.
    pub async fn close(&mut self) -> AppResult<()> {
        self.client.close().await
    }

    /// Read a boolean setting.
    pub async fn get_boolean(&mut self, name: &str) -> AppResult<bool> {
        let reply = self.client.query(&format!(":{name}?")).await?;
        decode_boolean(name, &reply)
    }

    /// Write a boolean setting and verify it.
    pub async fn set_boolean(&mut self, name: &str, value: bool) -> AppResult<()> {
        self.client
            .command(&format!(":{name} {}", u8::from(value)))
            .await?;
        let observed = self.get_boolean(name).await?;
        if observed != value {
            return Err(DaqError::verification(name, value, observed));
        }
        debug!(setting = name, value, "boolean setting verified");
        Ok(())
    }

    /// Read a float setting expressed in `unit`.
    pub async fn get_float(&mut self, name: &str, unit: Unit) -> AppResult<f64> {
        let reply = self.client.query(&format!(":{name}?")).await?;
        decode_float(name, &reply, unit)
    }

    /// Write a float setting with [`FLOAT_PRECISION`] digits and verify it.
    pub async fn set_float(&mut self, name: &str, value: f64, unit: Unit) -> AppResult<()> {
        self.set_float_with_precision(name, value, unit, FLOAT_PRECISION)
            .await
    }

    /// Write a float setting with `precision` digits and verify it at that precision.
    pub async fn set_float_with_precision(
        &mut self,
        name: &str,
        value: f64,
        unit: Unit,
        precision: usize,
    ) -> AppResult<()> {
        if !value.is_finite() {
            return Err(DaqError::Configuration(format!(
                "refusing to write non-finite value {value} to '{name}'"
            )));
        }
        let requested = format_float(value, unit, precision);
        self.client.command(&format!(":{name} {requested}")).await?;

        let observed = self.get_float(name, unit).await?;
        if !same_at_precision(value, observed, precision) {
            return Err(DaqError::verification(
                name,
                requested,
                format_float(observed, unit, precision),
            ));
        }
        debug!(setting = name, value = %requested, "float setting verified");
        Ok(())
    }

    /// Read an enumerated setting, trimmed.
    pub async fn get_enum(&mut self, name: &str) -> AppResult<String> {
        let reply = self.client.query(&format!(":{name}?")).await?;
        Ok(reply.trim().to_string())
    }

    /// Write an enumerated setting and verify it.
    pub async fn set_enum(&mut self, name: &str, value: &str) -> AppResult<()> {
        let requested = value.trim().to_ascii_uppercase();
        self.client.command(&format!(":{name} {requested}")).await?;
        let observed = self.get_enum(name).await?;
        if observed != requested {
            return Err(DaqError::verification(name, requested, observed));
        }
        debug!(setting = name, value = %requested, "enum setting verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{MockEvent, MockLoad};

    fn accessor(mock: &MockLoad) -> Accessor<MockLoad> {
        Accessor::new(ProtocolClient::new(mock.clone()))
    }

    #[test]
    fn decodes_booleans() {
        assert!(decode_boolean("INP", "ON\n").unwrap());
        assert!(!decode_boolean("INP", "OFF\n").unwrap());
        assert!(matches!(
            decode_boolean("INP", "1\n"),
            Err(DaqError::ProtocolDecode { .. })
        ));
    }

    #[test]
    fn decodes_floats_with_and_without_suffix() {
        assert_eq!(decode_float("CURR", "1.234A\n", Unit::Ampere).unwrap(), 1.234);
        assert_eq!(decode_float("BATT:CAP", "0.500AH\n", Unit::AmpereHour).unwrap(), 0.5);
        assert_eq!(decode_float("MEAS:VOLT", " 3.7 ", Unit::Volt).unwrap(), 3.7);
    }

    #[test]
    fn rejects_malformed_floats() {
        for reply in ["", "ERR", "1.2X", "1.2V", "NaN"] {
            assert!(
                matches!(
                    decode_float("CURR", reply, Unit::Ampere),
                    Err(DaqError::ProtocolDecode { .. })
                ),
                "reply {reply:?} should not decode"
            );
        }
    }

    #[test]
    fn formats_with_fixed_precision() {
        assert_eq!(format_float(1.0, Unit::Ampere, 3), "1.000A");
        assert_eq!(format_float(2.6, Unit::Volt, 3), "2.600V");
        assert_eq!(format_float(99.0, Unit::AmpereHour, 3), "99.000AH");
    }

    #[test]
    fn compares_at_precision() {
        assert!(same_at_precision(1.2344, 1.234, 3));
        assert!(!same_at_precision(1.2346, 1.234, 3));
        assert!(same_at_precision(-0.0001, 0.0, 3));
    }

    #[tokio::test]
    async fn float_round_trip_at_declared_precision() {
        let mock = MockLoad::new();
        let mut acc = accessor(&mock);

        for value in [0.1, 0.5, 1.0, 10.5, 29.999, 1.23456, 299.99] {
            acc.set_float("CURR", value, Unit::Ampere).await.unwrap();
            let read = acc.get_float("CURR", Unit::Ampere).await.unwrap();
            assert!(same_at_precision(read, value, 3), "{value} read back as {read}");
        }
    }

    #[tokio::test]
    async fn boolean_round_trip() {
        let mock = MockLoad::new();
        let mut acc = accessor(&mock);

        for value in [true, false, true] {
            acc.set_boolean("SYST:COMP", value).await.unwrap();
            assert_eq!(acc.get_boolean("SYST:COMP").await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn ignored_boolean_write_fails_verification_without_further_calls() {
        let mock = MockLoad::new();
        mock.ignore_writes("SYST:LOCK");
        let mut acc = accessor(&mock);

        let err = acc.set_boolean("SYST:LOCK", true).await.unwrap_err();

        match err {
            DaqError::VerificationFailed {
                setting,
                requested,
                observed,
            } => {
                assert_eq!(setting, "SYST:LOCK");
                assert_eq!(requested, "true");
                assert_eq!(observed, "false");
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
        assert_eq!(mock.frames(), vec![":SYST:LOCK 1", ":SYST:LOCK?"]);
    }

    #[tokio::test]
    async fn ignored_float_write_fails_verification() {
        let mock = MockLoad::new();
        mock.ignore_writes("POW");
        let mut acc = accessor(&mock);

        let err = acc.set_float("POW", 3.0, Unit::Watt).await.unwrap_err();

        assert!(matches!(err, DaqError::VerificationFailed { ref setting, .. } if setting == "POW"));
        assert_eq!(mock.count_frames(":POW 3.000W"), 1);
    }

    #[tokio::test]
    async fn non_finite_float_is_never_sent() {
        let mock = MockLoad::new();
        let mut acc = accessor(&mock);

        let err = acc
            .set_float("CURR", f64::NAN, Unit::Ampere)
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn garbled_boolean_reply_is_decode_error() {
        let mock = MockLoad::new();
        mock.on_query(":INP?", 1, MockEvent::Reply("MAYBE".into()));
        let mut acc = accessor(&mock);

        let err = acc.get_boolean("INP").await.unwrap_err();

        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn enum_round_trip_is_case_normalised() {
        let mock = MockLoad::new();
        let mut acc = accessor(&mock);

        acc.set_enum("FUNC", "cw").await.unwrap();

        assert_eq!(acc.get_enum("FUNC").await.unwrap(), "CW");
        assert_eq!(mock.frames()[0], ":FUNC CW");
    }
}
