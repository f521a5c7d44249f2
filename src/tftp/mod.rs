//! TFTP-derived transfer engine
//!
//! Files and whole directories are moved over a UDP endpoint that other
//! protocols share, told apart by a datagram prefix. The engine downloads
//! (client role) and serves read requests (server role) at the same time,
//! one exchange per peer at a time.
//!
//! Protocol basis:
//! - [RFC 1350](https://www.rfc-editor.org/rfc/rfc1350) TFTP Protocol version 2
//! - [RFC 2347](https://www.rfc-editor.org/rfc/rfc2347) TFTP Option Extension
//! - [RFC 2348](https://www.rfc-editor.org/rfc/rfc2348) Blocksize Option
//! - [RFC 2349](https://www.rfc-editor.org/rfc/rfc2349) Timeout and Transfer Size Options
//!
//! Unlike plain TFTP nothing is retransmitted: a peer that stays silent for
//! the negotiated timeout fails the transfer.
//!
//! ## Module Structure
//!
//! ```text
//! tftp/
//! ├── core/           # Stateless protocol pieces
//! │   ├── packet      # Packet serialization/deserialization
//! │   └── options     # Option negotiation
//! │
//! ├── engine/         # Session routing and the transfer state machine
//! ├── session         # One in-flight transfer
//! ├── queue           # Per-peer session queues
//! ├── transport       # Endpoint/scheduler seams and tokio adapters
//! │
//! ├── server/         # Serving side
//! │   ├── storage     # Name resolution under the root directory
//! │   └── packer      # Directory archives
//! │
//! └── client          # Download-to-disk wrapper
//! ```
//!
//! ## Usage Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tftpmux::tftp::{EngineConfig, TokioScheduler, TransferEngine, UdpEndpoint};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let endpoint = UdpEndpoint::bind("0.0.0.0:6969".parse()?).await?;
//! let scheduler = Arc::new(TokioScheduler::current()?);
//! let engine = TransferEngine::new(EngineConfig::new("/srv/tftp".into()), endpoint, scheduler);
//! engine.start()?;
//!
//! let photos = engine.download("dir:photos", "10.0.0.5:6969".parse()?).await?;
//! println!("received a {} byte archive", photos.len());
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod queue;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types for convenience
pub use client::Client;
pub use config::EngineConfig;
pub use engine::TransferEngine;
pub use error::{FailureReason, ResolveError, TransferFailure};
pub use server::DIR_PREFIX;
pub use transport::{Endpoint, Scheduler, TaskHandle, TokioScheduler, UdpEndpoint};
