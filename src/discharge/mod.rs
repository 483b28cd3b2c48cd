//! Battery discharge test controller.
//!
//! # State machine
//!
//! ```text
//! Idle --setup--> Configured --run--> Running --+--> Completed
//!                                                +--> Aborted
//! ```
//!
//! - `setup` checks the model, programs the battery profile and remote sense.
//!   On failure the test stays `Idle`.
//! - `run` re-reads mode, profile and sense before touching the output. A mismatch
//!   aborts without the output ever being enabled.
//! - An interrupt raised before the output is enabled aborts without enabling it.
//! - The sampling loop takes one [`Sample`] per cycle and stops when the output has
//!   gone off on its own (the instrument ended the test) or the sampled voltage is at
//!   or below the cutoff. The voltage is read again only if the sample was skipped.
//!   Timeouts and garbled replies only skip the cycle.
//!
//! # Output safety
//!
//! Every way out of `Running` turns the output off:
//!
//! | Exit                    | Disable                          | State       |
//! |-------------------------|----------------------------------|-------------|
//! | stop condition          | once                             | `Completed` |
//! | [`InterruptFlag`]       | once                             | `Aborted`   |
//! | error                   | [`DisablePolicy`], error returned | `Aborted`   |
//! | panic                   | [`DisablePolicy`], panic resumed  | `Aborted`   |
//!
//! A failing single disable escalates to the repeated one.

pub mod interrupt;
pub mod session;

pub use interrupt::InterruptFlag;
pub use session::{Sample, TestSession};

use crate::error::{AppResult, DaqError};
use crate::export::ExportSink;
use crate::instrument::{BatteryProfile, FunctionMode, Kel103};
use crate::transport::Transport;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a discharge test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestState {
    /// Created, instrument untouched.
    Idle,
    /// Profile and sense programmed and verified.
    Configured,
    /// Output enabled, sampling.
    Running,
    /// Ended by a stop condition.
    Completed,
    /// Ended by an interrupt, an error or a failed precondition.
    Aborted,
}

impl TestState {
    /// Whether the test has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, TestState::Completed | TestState::Aborted)
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a test ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Measured voltage reached the cutoff.
    VoltageCutoff,
    /// The instrument switched the output off (capacity or time cutoff, protection).
    OutputDisabled,
    /// The interrupt flag was raised.
    Interrupted,
    /// The pre-run cross-check failed.
    PreconditionFailed,
    /// An error or a panic ended the loop.
    Fault,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::VoltageCutoff => "voltage cutoff reached",
            StopReason::OutputDisabled => "output disabled by instrument",
            StopReason::Interrupted => "interrupted",
            StopReason::PreconditionFailed => "precondition failed",
            StopReason::Fault => "fault",
        };
        f.write_str(text)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// `Completed` or `Aborted`.
    pub state: TestState,
    /// Terminating cause.
    pub reason: StopReason,
    /// Cycles started, including skipped ones.
    pub cycles: u64,
    /// Samples recorded.
    pub samples: usize,
}

/// How hard the controller tries to switch the output off after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisablePolicy {
    /// Number of disable commands sent, successful or not.
    pub attempts: u32,
    /// Pause between two attempts.
    pub pause: Duration,
}

impl Default for DisablePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_secs(1),
        }
    }
}

/// Parameters of one discharge test.
#[derive(Debug, Clone, PartialEq)]
pub struct DischargeConfig {
    /// Identifier of the cell under test, used in the export name.
    pub cell_id: String,
    /// Pause between two cycles.
    pub sampling_period: Duration,
    /// Four-wire voltage measurement.
    pub remote_sense: bool,
    /// Profile programmed into the instrument.
    pub profile: BatteryProfile,
    /// Substring the `*IDN?` reply must contain.
    pub expected_model: String,
    /// Fault-path output disable.
    pub disable: DisablePolicy,
}

impl DischargeConfig {
    fn voltage_cutoff(&self) -> f64 {
        self.profile.voltage_cutoff
    }
}

/// Battery discharge test driving one KEL103.
#[derive(Debug)]
pub struct DischargeTest<T> {
    load: Kel103<T>,
    config: DischargeConfig,
    interrupt: InterruptFlag,
    state: TestState,
    session: Option<TestSession>,
    cycles: u64,
}

impl<T: Transport> DischargeTest<T> {
    /// Take ownership of the load for the duration of the test.
    pub fn new(load: Kel103<T>, config: DischargeConfig, interrupt: InterruptFlag) -> Self {
        Self {
            load,
            config,
            interrupt,
            state: TestState::Idle,
            session: None,
            cycles: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TestState {
        self.state
    }

    /// Settings the test was created with.
    pub fn config(&self) -> &DischargeConfig {
        &self.config
    }

    /// Collected data, available from `setup` on.
    pub fn session(&self) -> Option<&TestSession> {
        self.session.as_ref()
    }

    /// Borrow the load, e.g. for status queries between phases.
    pub fn load_mut(&mut self) -> &mut Kel103<T> {
        &mut self.load
    }

    /// Give the load back, e.g. for [`Kel103::shutdown`].
    pub fn into_load(self) -> Kel103<T> {
        self.load
    }

    fn expect_state(&self, expected: TestState, operation: &'static str) -> AppResult<()> {
        if self.state != expected {
            return Err(DaqError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Verify the instrument and program it for the test.
    ///
    /// # Errors
    /// - [`DaqError::WrongModel`] when `*IDN?` does not contain the expected model
    /// - [`DaqError::VerificationFailed`] when the profile or sense did not stick
    ///
    /// The state stays `Idle` on any error.
    pub async fn setup(&mut self) -> AppResult<()> {
        self.expect_state(TestState::Idle, "setup")?;

        let identity = self.load.identify().await?;
        if !identity.contains(&self.config.expected_model) {
            return Err(DaqError::WrongModel {
                expected: self.config.expected_model.clone(),
                identity,
            });
        }

        self.load.set_battery_profile(&self.config.profile).await?;
        self.load.set_remote_sense(self.config.remote_sense).await?;

        self.session = Some(TestSession::new(self.config.cell_id.clone()));
        self.state = TestState::Configured;
        info!(
            cell = %self.config.cell_id,
            %identity,
            profile = ?self.config.profile,
            remote_sense = self.config.remote_sense,
            "discharge test configured"
        );
        Ok(())
    }

    /// Run the test to its end.
    ///
    /// Returns the outcome for stop conditions and interrupts. Errors from the loop
    /// are returned after the output has been disabled; panics are resumed after the
    /// same.
    pub async fn run(&mut self) -> AppResult<TestOutcome> {
        self.expect_state(TestState::Configured, "run")?;

        if let Err(err) = self.check_preconditions().await {
            error!(error = %err, "pre-run check failed, output left off");
            self.finish(TestState::Aborted, StopReason::PreconditionFailed);
            return Err(err);
        }

        if self.interrupt.is_triggered() {
            warn!("interrupted before the output was enabled");
            self.finish(TestState::Aborted, StopReason::Interrupted);
            return Ok(self.outcome(TestState::Aborted, StopReason::Interrupted));
        }

        self.state = TestState::Running;
        info!(cell = %self.config.cell_id, "discharge test running");

        let result = AssertUnwindSafe(self.sampling_loop()).catch_unwind().await;

        match result {
            Ok(Ok(reason)) => self.conclude(reason).await,
            Ok(Err(err)) => {
                error!(error = %err, cycle = self.cycles, "discharge loop failed");
                self.disable_repeatedly().await;
                self.finish(TestState::Aborted, StopReason::Fault);
                Err(err)
            }
            Err(panic) => {
                error!(cycle = self.cycles, "discharge loop panicked");
                self.disable_repeatedly().await;
                self.finish(TestState::Aborted, StopReason::Fault);
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Hand the session to `sink` under its default name.
    pub async fn export<S: ExportSink + ?Sized>(&self, sink: &S) -> AppResult<PathBuf> {
        let session = self.exportable_session()?;
        self.export_to(sink, &session.default_destination()).await
    }

    /// Hand the session to `sink` under `destination`.
    ///
    /// # Errors
    /// - [`DaqError::InvalidState`] before the test has ended
    /// - [`DaqError::EmptySession`] when no sample was recorded
    /// - whatever the sink reports; nothing is retried
    pub async fn export_to<S: ExportSink + ?Sized>(
        &self,
        sink: &S,
        destination: &str,
    ) -> AppResult<PathBuf> {
        let session = self.exportable_session()?;
        let path = sink.export(session, destination).await?;
        info!(path = %path.display(), samples = session.len(), "session exported");
        Ok(path)
    }

    fn exportable_session(&self) -> AppResult<&TestSession> {
        if !self.state.is_terminal() {
            return Err(DaqError::InvalidState {
                operation: "export",
                state: self.state.to_string(),
            });
        }
        match &self.session {
            Some(session) if !session.is_empty() => Ok(session),
            _ => Err(DaqError::EmptySession),
        }
    }

    async fn check_preconditions(&mut self) -> AppResult<()> {
        let mode = self.load.function_mode().await?;
        if mode != FunctionMode::Battery {
            return Err(DaqError::PreconditionFailed(format!(
                "function mode is {mode}, expected {}",
                FunctionMode::Battery
            )));
        }

        let expected = self.config.profile;
        let stored = self.load.battery_profile(expected.slot).await?;
        if let Some((field, requested, observed)) = expected.first_mismatch(&stored) {
            return Err(DaqError::PreconditionFailed(format!(
                "battery profile {} field {field} is {observed}, configured {requested}",
                expected.slot
            )));
        }

        let sense = self.load.remote_sense_enabled().await?;
        if sense != self.config.remote_sense {
            return Err(DaqError::PreconditionFailed(format!(
                "remote sense is {sense}, configured {}",
                self.config.remote_sense
            )));
        }
        Ok(())
    }

    async fn sampling_loop(&mut self) -> AppResult<StopReason> {
        self.load.set_output(true).await?;
        let interrupt = self.interrupt.clone();

        loop {
            if interrupt.is_triggered() {
                return Ok(StopReason::Interrupted);
            }
            self.cycles += 1;
            let cycle = self.cycles;

            let sampled_voltage = match self.take_sample().await {
                Ok(sample) => {
                    debug!(cycle, voltage = sample.voltage, current = sample.current, "sample");
                    let voltage = sample.voltage;
                    if let Some(session) = self.session.as_mut() {
                        session.push(sample);
                    }
                    Some(voltage)
                }
                Err(err) if err.is_recoverable() => {
                    warn!(cycle, error = %err, "sample skipped");
                    None
                }
                Err(err) => return Err(err),
            };

            match self.stop_condition(sampled_voltage).await {
                Ok(Some(reason)) => return Ok(reason),
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    warn!(cycle, error = %err, "stop check missed, continuing");
                }
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sampling_period) => {}
                _ = interrupt.triggered() => debug!(cycle, "pause cut short by interrupt"),
            }
        }
    }

    async fn take_sample(&mut self) -> AppResult<Sample> {
        let measurements = self.load.measure_all().await?;
        let capacity = self.load.battery_capacity().await?;
        let elapsed_minutes = self.load.battery_elapsed_time().await?;
        Ok(Sample {
            voltage: measurements.voltage,
            current: measurements.current,
            power: measurements.power,
            capacity,
            elapsed_minutes,
            timestamp: Utc::now(),
        })
    }

    /// Judge the cycle on the voltage just recorded; read it afresh only when the
    /// sample was skipped.
    async fn stop_condition(
        &mut self,
        sampled_voltage: Option<f64>,
    ) -> AppResult<Option<StopReason>> {
        if !self.load.output_enabled().await? {
            return Ok(Some(StopReason::OutputDisabled));
        }
        let voltage = match sampled_voltage {
            Some(voltage) => voltage,
            None => self.load.measure_voltage().await?,
        };
        if voltage <= self.config.voltage_cutoff() {
            return Ok(Some(StopReason::VoltageCutoff));
        }
        Ok(None)
    }

    async fn conclude(&mut self, reason: StopReason) -> AppResult<TestOutcome> {
        let state = if reason == StopReason::Interrupted {
            TestState::Aborted
        } else {
            TestState::Completed
        };

        if let Err(err) = self.load.set_output(false).await {
            error!(error = %err, %reason, "disabling output failed, retrying");
            self.disable_repeatedly().await;
            self.finish(TestState::Aborted, StopReason::Fault);
            return Err(err);
        }

        self.finish(state, reason);
        Ok(self.outcome(state, reason))
    }

    fn outcome(&self, state: TestState, reason: StopReason) -> TestOutcome {
        let outcome = TestOutcome {
            state,
            reason,
            cycles: self.cycles,
            samples: self.session.as_ref().map_or(0, TestSession::len),
        };
        info!(?outcome, "discharge test ended");
        outcome
    }

    /// Send every disable attempt of the policy, pausing in between.
    async fn disable_repeatedly(&mut self) {
        let policy = self.config.disable;
        for attempt in 1..=policy.attempts {
            match self.load.set_output(false).await {
                Ok(()) => debug!(attempt, "output disabled"),
                Err(err) => error!(attempt, error = %err, "output disable failed"),
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.pause).await;
            }
        }
    }

    fn finish(&mut self, state: TestState, reason: StopReason) {
        self.state = state;
        if let Some(session) = self.session.as_mut() {
            session.set_stop_reason(reason);
        }
    }
}
