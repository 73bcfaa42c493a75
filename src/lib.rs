//! Payment-acceptor pulse ingestion pipeline.
//!
//! Consumes the byte stream from a USB-CDC connected payment-acceptor
//! controller board, reconstructs discrete pulse/credit events, and converts
//! each event into a monetary credit exactly once - across process restarts,
//! device resets, and transient persistence failures.
//!
//! # Architecture Overview
//!
//! ```text
//! bytes --> FrameAccumulator --> decoder --[PulseEvent]--> mpsc channel
//!                                                              |
//!                        PulseOrchestrator --- DuplicateGuard decision
//!                              |                        |
//!                   broadcast::channel <--[CreditDelta] |
//!                              |            [async persist] --> ProcessedIdStore
//!                        subscribers                 \-- failure --> RetryQueue
//! ```
//!
//! - [`framing::FrameAccumulator`] slices complete frames out of the raw
//!   stream, resynchronizing byte-at-a-time past corruption.
//! - [`decode::decode_pulse_payload`] turns a frame payload into a
//!   [`event::PulseEvent`], handling both the unique-id and the legacy
//!   cumulative-counter wire formats.
//! - [`device::PulseDeviceClient`] runs the cancellable background read loop
//!   over the serial transport.
//! - [`guard::DuplicateGuard`] decides, for each event, whether and how much
//!   to credit.
//! - [`store::ProcessedIdStore`] is the durable dedup ledger;
//!   [`retry::RetryQueue`] absorbs its failures so a credit is never
//!   silently dropped.
//! - [`orchestrator::PulseOrchestrator`] wires it all together and owns the
//!   background tasks' lifecycle.
//!
//! # Guarantees
//!
//! Persistence is at-least-once (bounded by the retry queue's documented
//! capacity); crediting is at-most-once per unique id. `CreditDelta` emission
//! order matches wire order. Persistence never blocks or reverses an emitted
//! credit.
//!
//! # Example
//!
//! ```rust,no_run
//! use pulse_ingest::config::PulseConfig;
//! use pulse_ingest::orchestrator::PulseOrchestrator;
//! use pulse_ingest::store::JsonlStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> pulse_ingest::error::PulseResult<()> {
//! let store = Arc::new(JsonlStore::open("processed_ids.jsonl").await?);
//! let orchestrator = PulseOrchestrator::new(PulseConfig::default(), store);
//! orchestrator.initialize().await?;
//!
//! let mut credits = orchestrator.subscribe();
//! orchestrator.start("/dev/ttyACM0").await?;
//!
//! while let Ok(delta) = credits.recv().await {
//!     println!("credit {} to {}", delta.amount, delta.accepter);
//! }
//!
//! orchestrator.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod event;
pub mod framing;
pub mod guard;
pub mod orchestrator;
pub mod retry;
pub mod serial;
pub mod store;

pub use config::{PulseConfig, SerialConfig};
pub use error::{PulseError, PulseResult};
pub use event::{AccepterId, CreditDelta, ProcessedIdRecord, PulseEvent};
pub use guard::{CreditDecision, DuplicateGuard};
pub use orchestrator::PulseOrchestrator;
pub use store::{JsonlStore, MemoryStore, ProcessedIdStore};
