//! # xmodem-engine
//!
//! A full-duplex implementation of the XMODEM file-transfer protocol —
//! both the original 8-bit checksum variant and XMODEM/CRC — over a
//! generic byte-oriented transport.
//!
//! This crate provides the protocol engine only:
//!
//! - Block framing, integrity codecs (checksum-8 and CRC-16/XMODEM)
//! - The sender and receiver halves of the XMODEM finite-state machine
//! - Timeout-driven retry and cancellation accounting
//!
//! Enumerating, opening, and configuring the physical serial port;
//! reading source files and writing destination files beyond the
//! [`Sink`]/[`Source`] contract; and any user interface are all left to
//! the embedder — see [`Transport`], [`Sink`], and [`Source`].
//!
//! ## Supported variants
//!
//! - XMODEM (8-bit checksum)
//! - XMODEM/CRC (CRC-16/XMODEM)
//!
//! XMODEM-1K, YMODEM, and ZMODEM are explicit non-goals; see
//! [`codec::BLOCK_SIZE`].
//!
//! ## Concurrency model
//!
//! The engine is driven by two event sources that may run on different
//! threads: a transport callback delivering inbound bytes
//! ([`Engine::feed_bytes`]), and a background [`TimerService`] firing
//! deadlines. Both paths serialize through one mutex inside [`Engine`];
//! see the module docs on [`engine`] for the full concurrency
//! discussion.
//!
//! ### Quick start — sending a file
//!
//! ```no_run
//! use xmodem_engine::{Engine, EngineConfig, Transport};
//! use std::io;
//!
//! struct MyTransport;
//! impl Transport for MyTransport {
//!     fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
//!         // write `bytes` to the serial port
//!         Ok(())
//!     }
//! }
//!
//! let engine = Engine::new(Box::new(MyTransport), EngineConfig::default());
//! engine.start_send_from_path("firmware.bin", true)?;
//!
//! // Whenever bytes arrive from the serial port:
//! // engine.feed_bytes(&bytes_from_port);
//! # Ok::<(), xmodem_engine::Error>(())
//! ```
//!
//! ### Quick start — receiving a file
//!
//! ```no_run
//! use xmodem_engine::{Engine, EngineConfig, Transport};
//! use std::io;
//!
//! struct MyTransport;
//! impl Transport for MyTransport {
//!     fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let engine = Engine::new(Box::new(MyTransport), EngineConfig::default());
//! engine.start_receive_to_path("received.bin", true)?;
//! # Ok::<(), xmodem_engine::Error>(())
//! ```
//!
//! ## Features
//!
//! - `serde`: derives `Serialize`/`Deserialize` on [`EngineConfig`] so an
//!   embedder can load it from its own configuration file.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod engine;
pub mod error;
pub mod io_contract;
pub mod timer;
pub mod transport;

pub use engine::{Engine, EngineConfig, TransferState};
pub use error::{Error, Result};
pub use io_contract::{FileSink, FileSource, MemorySink, MemorySource, Sink, Source};
pub use timer::TimerService;
pub use transport::Transport;
