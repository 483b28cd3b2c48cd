//! # KORAD KEL103 Controller Library
//!
//! Host-side control of a KORAD KEL103 electronic load over its UDP LAN interface,
//! with a battery discharge test built on top.
//!
//! ## Crate Structure
//!
//! Layers from the wire upwards:
//!
//! - **`transport`**: the `Transport` trait and `UdpTransport`. One frame per datagram,
//!   a receive timeout per call, nothing else.
//! - **`protocol`**: `ProtocolClient` frames command text, resends unanswered queries
//!   within a `QueryPolicy` and reports `CommunicationTimeout` when the ceiling expires.
//! - **`accessor`**: boolean, float and enum settings with read-back verification of
//!   every write.
//! - **`instrument`**: the `Kel103` facade with all instrument operations, and
//!   `instrument::mock::MockLoad`, a simulated load for tests.
//! - **`discharge`**: the `DischargeTest` state machine and its `TestSession`.
//! - **`export`**: `ExportSink` and the CSV implementation.
//! - **`config`**: figment-based `Settings`.
//! - **`logging`**: tracing-subscriber setup.
//! - **`error`**: the `DaqError` enum shared by all layers.
//!
//! ## Example
//!
//! ```no_run
//! use korad_daq::config::Settings;
//! use korad_daq::discharge::{DischargeTest, InterruptFlag};
//! use korad_daq::export::CsvExporter;
//! use korad_daq::instrument::Kel103;
//!
//! # async fn run() -> korad_daq::error::AppResult<()> {
//! let settings = Settings::load()?;
//! let load = Kel103::connect(
//!     settings.local_addr()?,
//!     settings.device_addr()?,
//!     settings.query_policy(),
//! )
//! .await?;
//!
//! let mut test = DischargeTest::new(load, settings.discharge_config(), InterruptFlag::new());
//! test.setup().await?;
//! let outcome = test.run().await?;
//! test.export(&CsvExporter::new(&settings.storage.output_dir)).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod config;
pub mod discharge;
pub mod error;
pub mod export;
pub mod instrument;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use error::{AppResult, DaqError};
