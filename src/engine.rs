//! The protocol engine: the finite-state machine, receive buffer, block
//! processing, and retry/timeout accounting (§3, §4, §12). This is the
//! 70%-of-the-crate core everything else in the crate exists to serve.
//!
//! [`Engine`] is a `Clone`-able handle around `Arc<Mutex<EngineInner>>`
//! plus an `Arc<TimerService>`, following the teacher's `Arc`-wrapped
//! shared-state style — though the teacher's blocking `YmodemTransfer`
//! never needed a mutex, since it owned its port outright and drove the
//! transfer from a single call stack. This engine is callback-driven
//! (bytes and timer fires arrive from whatever thread delivers them, per
//! §5), so every externally visible mutation happens under the one lock.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::codec::{
    ACK, BLOCK_SIZE, CAN, CHAR_C, EOT, NAK, SOH, decode_block, encode_block, frame_len, pad_payload,
};
use crate::error::{Error, Result};
use crate::io_contract::{FileSink, FileSource, Sink, Source};
use crate::timer::TimerService;
use crate::transport::Transport;

/// The transfer's finite-state machine (§3).
///
/// `Receiving`, `Sending`, and `SendingEot` are entered and left within a
/// single engine step — they never persist across a `feed_bytes` or
/// timer-fire call, so no caller ever observes them from
/// [`Engine::current_state`]. They still have to exist as enum variants
/// because the spec defines eleven states, not eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer in progress.
    Idle,
    /// Receiver: about to emit (or re-emit) the initiation signal.
    ReceiverInit,
    /// Receiver: waiting for the next `SOH`/`EOT`/`CAN`.
    ExpectingSoh,
    /// Receiver: validating a just-arrived block.
    Receiving,
    /// Sender: waiting for the receiver's NAK/'C'.
    SenderWaitInit,
    /// Sender: about to transmit a block.
    Sending,
    /// Sender: waiting for ACK/NAK on the outstanding block.
    WaitingForAck,
    /// Sender: about to transmit EOT.
    SendingEot,
    /// Sender: waiting for the final ACK after EOT.
    WaitingForEotAck,
    /// Transfer finished successfully.
    Completed,
    /// Transfer aborted (locally or by the remote).
    Aborted,
    /// Transfer ended due to an unrecoverable I/O failure.
    Error,
}

impl TransferState {
    /// Terminal states: `Completed`, `Aborted`, `Error` (§3 invariant 6).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Error)
    }
}

/// Tunable protocol parameters (§4.2, §10.3).
///
/// `block_size` is deliberately not a field here — it is the compile-time
/// constant [`crate::codec::BLOCK_SIZE`], since XMODEM-1K is a declared
/// non-goal (§1).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Per-block and per-EOT retry cap.
    pub max_retries: u32,
    /// Initial-phase retry cap (both sides).
    pub max_init_retries: u32,
    /// Receiver: wait for first SOH. Sender: wait for NAK/'C'.
    pub init_timeout: Duration,
    /// Sender: wait for ACK/NAK after a block. Receiver: wait for the
    /// next SOH/EOT after sending ACK.
    pub ack_timeout: Duration,
    /// Sender: wait for the final ACK after EOT.
    pub eot_ack_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            max_init_retries: 6,
            init_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            eot_ack_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Override the per-block/per-EOT retry cap.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the initial-phase retry cap.
    #[must_use]
    pub fn with_max_init_retries(mut self, max_init_retries: u32) -> Self {
        self.max_init_retries = max_init_retries;
        self
    }

    /// Override the initiation timeout.
    #[must_use]
    pub fn with_init_timeout(mut self, init_timeout: Duration) -> Self {
        self.init_timeout = init_timeout;
        self
    }

    /// Override the block-ACK timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Override the EOT-ACK timeout.
    #[must_use]
    pub fn with_eot_ack_timeout(mut self, eot_ack_timeout: Duration) -> Self {
        self.eot_ack_timeout = eot_ack_timeout;
        self
    }
}

/// A full-duplex XMODEM engine handle.
///
/// Cloning an `Engine` shares the same underlying transfer — all clones
/// observe the same state and drive the same mutex, the way a
/// `mpsc::Sender` clone shares one channel. This is what lets a transport
/// callback and a timer thread both hold a handle.
pub struct Engine {
    inner: Arc<Mutex<EngineInner>>,
    timer: Arc<TimerService>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timer: Arc::clone(&self.timer),
        }
    }
}

impl Engine {
    /// Build a new, idle engine around `transport`.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, config: EngineConfig) -> Self {
        let inner = Arc::new(Mutex::new(EngineInner::new(transport, config)));
        let weak_inner: Weak<Mutex<EngineInner>> = Arc::downgrade(&inner);
        let timer = Arc::new_cyclic(|weak_timer: &Weak<TimerService>| {
            let weak_timer = weak_timer.clone();
            TimerService::new(move |generation| {
                let (Some(inner), Some(timer)) = (weak_inner.upgrade(), weak_timer.upgrade())
                else {
                    return;
                };
                let mut guard = inner.lock().expect("engine lock poisoned");
                guard.on_timeout(generation, &timer);
            })
        });
        Self { inner, timer }
    }

    /// Start receiving into an already-open `sink` (§4.3).
    ///
    /// Fails with [`Error::AlreadyActive`] if a transfer is already in
    /// progress.
    pub fn start_receive(&self, use_crc: bool, sink: Box<dyn Sink + Send>) -> Result<()> {
        let mut guard = self.inner.lock().expect("engine lock poisoned");
        guard.start_receive(use_crc, sink, &self.timer)
    }

    /// Convenience wrapper: open `path` as a [`FileSink`] and start
    /// receiving into it, mapping an open failure to
    /// [`Error::SinkUnavailable`].
    pub fn start_receive_to_path(&self, path: impl AsRef<Path>, use_crc: bool) -> Result<()> {
        let sink =
            FileSink::create(path.as_ref()).map_err(|e| Error::SinkUnavailable(e.to_string()))?;
        self.start_receive(use_crc, Box::new(sink))
    }

    /// Start sending `file_data` (§4.4). `use_crc_preferred` is advisory
    /// only — the mode actually used follows whichever init byte the
    /// receiver sends first (§9, open question).
    ///
    /// Fails with [`Error::EmptySource`] if `file_data` is empty: XMODEM
    /// has no defined empty-file encoding (§9, open question).
    pub fn start_send(&self, file_data: Vec<u8>, use_crc_preferred: bool) -> Result<()> {
        let mut guard = self.inner.lock().expect("engine lock poisoned");
        guard.start_send(file_data, use_crc_preferred, &self.timer)
    }

    /// Convenience wrapper: bulk-read `path` as a [`FileSource`] and start
    /// sending it, mapping a read failure to [`Error::SourceUnavailable`].
    pub fn start_send_from_path(&self, path: impl AsRef<Path>, use_crc_preferred: bool) -> Result<()> {
        let mut source = FileSource::new(path.as_ref());
        let data = source
            .read_all()
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        self.start_send(data, use_crc_preferred)
    }

    /// Feed newly-arrived transport bytes to the engine (§4.3/§4.4/§5).
    ///
    /// `bytes` is assumed to be one atomically-delivered run from the
    /// transport's inbound callback, in arrival order; it need not align
    /// with protocol frame boundaries.
    pub fn feed_bytes(&self, bytes: &[u8]) {
        let mut guard = self.inner.lock().expect("engine lock poisoned");
        guard.feed_bytes(bytes, &self.timer);
    }

    /// Abort the transfer locally, emitting `CAN CAN` if a transfer was
    /// in progress (§4.5). A no-op if already terminal.
    pub fn abort_local(&self) {
        let mut guard = self.inner.lock().expect("engine lock poisoned");
        guard.abort_local(&self.timer);
    }

    /// The current [`TransferState`].
    #[must_use]
    pub fn current_state(&self) -> TransferState {
        self.inner.lock().expect("engine lock poisoned").state
    }

    /// A description of the [`Error`] kind behind the most recent
    /// abort/error transition, if any (§7/§10.1). `None` before any
    /// transfer has ended, or after a transfer that completed normally.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("engine lock poisoned")
            .last_error
            .as_ref()
            .map(ToString::to_string)
    }

    /// Tear down the timer service, draining any callback already in
    /// flight, before the engine itself is dropped (§5 "Shutdown"). An
    /// abort already in progress remains observable as `Aborted`
    /// afterward. Idempotent.
    pub fn shutdown(&self) {
        self.timer.shutdown();
    }
}

/// All mutable engine state, guarded by [`Engine`]'s single mutex (§3
/// invariant 2, §5).
struct EngineInner {
    state: TransferState,
    use_crc: bool,
    buffer: VecDeque<u8>,
    config: EngineConfig,
    transport: Box<dyn Transport>,

    // Receiver state.
    expected_block_number: u64,
    receive_retries: u32,
    sink: Option<Box<dyn Sink + Send>>,

    // Sender state.
    file_data: Vec<u8>,
    current_block_index: usize,
    send_retries: u32,

    // Generation of the deadline currently expected to be live; any
    // `on_timeout` call carrying a different generation is stale (§5,
    // §9 "Timer races").
    timer_generation: u64,

    // The `Error` kind behind the most recent abort/error transition, if
    // any (§7/§10.1). Cleared at the start of each new transfer.
    last_error: Option<Error>,
}

impl EngineInner {
    fn new(transport: Box<dyn Transport>, config: EngineConfig) -> Self {
        Self {
            state: TransferState::Idle,
            use_crc: false,
            buffer: VecDeque::new(),
            config,
            transport,
            expected_block_number: 1,
            receive_retries: 0,
            sink: None,
            file_data: Vec::new(),
            current_block_index: 0,
            send_retries: 0,
            timer_generation: 0,
            last_error: None,
        }
    }

    // ---- timer plumbing -------------------------------------------------

    fn arm(&mut self, timer: &TimerService, dur: Duration) {
        self.timer_generation = timer.arm(dur);
    }

    fn cancel_timer(&self, timer: &TimerService) {
        timer.cancel();
    }

    // ---- outbound bytes ---------------------------------------------------

    /// Send raw bytes, suppressing the write once terminal (invariant 6).
    /// A transport failure here is fatal: there is nowhere left to send a
    /// `CAN` to, so the engine drops straight to `Error` (§7).
    fn send_bytes(&mut self, bytes: &[u8], timer: &TimerService) {
        if self.state.is_terminal() {
            return;
        }
        trace!("-> {bytes:02x?}");
        if let Err(e) = self.transport.send(bytes) {
            warn!("transport send failed, aborting transfer: {e}");
            self.cancel_timer(timer);
            self.state = TransferState::Error;
            self.last_error = Some(Error::Io(e));
            self.cleanup();
        }
    }

    fn send_control(&mut self, byte: u8, timer: &TimerService) {
        self.send_bytes(&[byte], timer);
    }

    fn cleanup(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                warn!("failed to close sink during cleanup: {e}");
            }
        }
        self.buffer.clear();
        self.file_data.clear();
    }

    // ---- public entry points (called with the engine lock held) -------

    fn start_receive(
        &mut self,
        use_crc: bool,
        sink: Box<dyn Sink + Send>,
        timer: &TimerService,
    ) -> Result<()> {
        if self.state != TransferState::Idle {
            return Err(Error::AlreadyActive);
        }
        info!("starting receive, use_crc={use_crc}");
        self.use_crc = use_crc;
        self.sink = Some(sink);
        self.expected_block_number = 1;
        self.receive_retries = 0;
        self.buffer.clear();
        self.last_error = None;
        self.emit_receiver_init(timer);
        Ok(())
    }

    fn start_send(
        &mut self,
        file_data: Vec<u8>,
        use_crc_preferred: bool,
        timer: &TimerService,
    ) -> Result<()> {
        if self.state != TransferState::Idle {
            return Err(Error::AlreadyActive);
        }
        if file_data.is_empty() {
            self.state = TransferState::Error;
            return Err(Error::EmptySource);
        }
        info!(
            "starting send, {} bytes, use_crc_preferred={use_crc_preferred}",
            file_data.len()
        );
        self.file_data = file_data;
        self.use_crc = use_crc_preferred;
        self.send_retries = 0;
        self.current_block_index = 0;
        self.buffer.clear();
        self.last_error = None;
        self.state = TransferState::SenderWaitInit;
        self.arm(timer, self.config.init_timeout);
        Ok(())
    }

    fn feed_bytes(&mut self, bytes: &[u8], timer: &TimerService) {
        if self.state.is_terminal() {
            trace!("discarding {} byte(s) after terminal state", bytes.len());
            return;
        }
        self.buffer.extend(bytes.iter().copied());
        self.pump(timer);
    }

    fn abort_local(&mut self, timer: &TimerService) {
        if self.state.is_terminal() {
            return;
        }
        warn!("aborting transfer locally");
        self.cancel_timer(timer);
        let was_active = self.state != TransferState::Idle;
        self.state = TransferState::Aborted;
        if was_active {
            // Send as one call: the transport contract delivers bytes
            // atomically, so CAN CAN cannot be split by an interleaved
            // write (§4.1, §6).
            if let Err(e) = self.transport.send(&[CAN, CAN]) {
                warn!("failed to send CAN CAN during abort: {e}");
            }
        }
        self.cleanup();
    }

    fn abort_remote(&mut self, timer: &TimerService) {
        if self.state.is_terminal() {
            return;
        }
        info!("remote sent CAN, aborting transfer");
        self.cancel_timer(timer);
        self.state = TransferState::Aborted;
        self.last_error = Some(Error::RemoteCancelled);
        self.cleanup();
    }

    // ---- buffer-driven state machine -----------------------------------

    /// Drive the state machine until it can't make progress without more
    /// bytes. Each `step_*` returns whether it consumed something and
    /// progress might still be possible.
    fn pump(&mut self, timer: &TimerService) {
        loop {
            let made_progress = match self.state {
                TransferState::ExpectingSoh => self.step_expecting_soh(timer),
                TransferState::SenderWaitInit => self.step_sender_wait_init(timer),
                TransferState::WaitingForAck => self.step_waiting_for_ack(timer),
                TransferState::WaitingForEotAck => self.step_waiting_for_eot_ack(timer),
                _ => false,
            };
            if !made_progress {
                break;
            }
        }
    }

    fn step_expecting_soh(&mut self, timer: &TimerService) -> bool {
        let Some(&first) = self.buffer.front() else {
            return false;
        };
        match first {
            SOH => {
                let needed = frame_len(self.use_crc);
                if self.buffer.len() < needed {
                    // Wait for the rest of the block; do not cancel the
                    // timer while it's still in flight (§4.3 rule 1).
                    return false;
                }
                self.cancel_timer(timer);
                let frame: Vec<u8> = self.buffer.drain(..needed).collect();
                self.state = TransferState::Receiving;
                self.handle_block(&frame, timer);
                true
            }
            EOT => {
                self.cancel_timer(timer);
                self.buffer.pop_front();
                self.handle_eot(timer);
                true
            }
            CAN => {
                self.cancel_timer(timer);
                self.buffer.pop_front();
                self.abort_remote(timer);
                true
            }
            other => {
                trace!("discarding stray byte 0x{other:02x} while expecting SOH");
                self.buffer.pop_front();
                true
            }
        }
    }

    fn handle_block(&mut self, frame: &[u8], timer: &TimerService) {
        let (decoded, payload) = match decode_block(frame, self.use_crc) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("block rejected: {e}");
                self.handle_block_error(timer);
                return;
            }
        };
        let blk = decoded.block_number;

        let expected = (self.expected_block_number % 256) as u8;
        if blk == expected {
            let write_result = self
                .sink
                .as_mut()
                .expect("sink present while state is Receiving")
                .write_all(payload);
            match write_result {
                Ok(()) => {
                    self.receive_retries = 0;
                    self.expected_block_number += 1;
                    self.send_control(ACK, timer);
                    if self.state.is_terminal() {
                        return;
                    }
                    self.state = TransferState::ExpectingSoh;
                    self.arm(timer, self.config.ack_timeout);
                }
                Err(e) => {
                    warn!("sink write failed, aborting: {e}");
                    self.cancel_timer(timer);
                    self.state = TransferState::Error;
                    // Unlike a transport failure, the remote is still
                    // reachable here — only our local destination died —
                    // so a local CAN CAN is still owed (§7). Sent directly
                    // rather than through `send_bytes`, which would
                    // suppress it once `state` is terminal.
                    if let Err(send_err) = self.transport.send(&[CAN, CAN]) {
                        warn!("failed to send CAN CAN during sink-failure abort: {send_err}");
                    }
                    self.last_error = Some(Error::Io(e));
                    self.cleanup();
                }
            }
            return;
        }

        let previous = (self.expected_block_number > 1)
            .then(|| ((self.expected_block_number - 1) % 256) as u8);
        if previous == Some(blk) {
            debug!("duplicate of block {blk}, re-acking without writing");
            self.send_control(ACK, timer);
            if self.state.is_terminal() {
                return;
            }
            self.state = TransferState::ExpectingSoh;
            self.arm(timer, self.config.ack_timeout);
        } else {
            warn!("unrecoverable sequence error: got block {blk}, expected {expected}");
            self.last_error = Some(Error::ProtocolViolation { got: blk, expected });
            self.abort_local(timer);
        }
    }

    fn handle_block_error(&mut self, timer: &TimerService) {
        self.receive_retries += 1;
        if self.receive_retries >= self.config.max_retries {
            self.last_error = Some(Error::RetryExhausted {
                attempts: self.receive_retries,
            });
            self.abort_local(timer);
            return;
        }
        self.send_control(NAK, timer);
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::ExpectingSoh;
        self.arm(timer, self.config.ack_timeout);
    }

    fn handle_eot(&mut self, timer: &TimerService) {
        self.send_control(ACK, timer);
        if self.state.is_terminal() {
            // Transport failed mid-ACK; already in Error, sink untouched.
            return;
        }
        if let Some(mut sink) = self.sink.take() {
            match sink.close().and_then(|()| sink.truncate_trailing_sub()) {
                Ok(()) => {}
                Err(e) => warn!("error trimming trailing padding (transfer still completed): {e}"),
            }
        }
        info!("transfer complete");
        self.state = TransferState::Completed;
    }

    fn emit_receiver_init(&mut self, timer: &TimerService) {
        self.state = TransferState::ReceiverInit;
        if self.receive_retries >= self.config.max_init_retries {
            warn!("initiation retries exhausted, aborting");
            self.last_error = Some(Error::RemoteInitiationTimeout);
            self.abort_local(timer);
            return;
        }
        self.receive_retries += 1;
        let byte = if self.use_crc { CHAR_C } else { NAK };
        self.send_control(byte, timer);
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::ExpectingSoh;
        self.arm(timer, self.config.init_timeout);
    }

    fn step_sender_wait_init(&mut self, timer: &TimerService) -> bool {
        let Some(b) = self.buffer.pop_front() else {
            return false;
        };
        match b {
            NAK => {
                debug!("receiver requested checksum mode");
                self.use_crc = false;
                self.send_retries = 0;
                self.current_block_index = 0;
                self.send_next_block(timer);
            }
            CHAR_C => {
                debug!("receiver requested CRC mode");
                self.use_crc = true;
                self.send_retries = 0;
                self.current_block_index = 0;
                self.send_next_block(timer);
            }
            CAN => self.abort_remote(timer),
            other => trace!("discarding stray byte 0x{other:02x} while awaiting init"),
        }
        true
    }

    fn send_next_block(&mut self, timer: &TimerService) {
        let start = self.current_block_index * BLOCK_SIZE;
        if start >= self.file_data.len() {
            self.send_eot(timer);
            return;
        }
        self.state = TransferState::Sending;
        let end = (start + BLOCK_SIZE).min(self.file_data.len());
        let payload = pad_payload(&self.file_data[start..end]);
        let wire_block_number = ((self.current_block_index + 1) % 256) as u8;
        let frame = encode_block(wire_block_number, &payload, self.use_crc);
        self.send_bytes(&frame, timer);
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::WaitingForAck;
        self.arm(timer, self.config.ack_timeout);
    }

    fn step_waiting_for_ack(&mut self, timer: &TimerService) -> bool {
        let Some(b) = self.buffer.pop_front() else {
            return false;
        };
        match b {
            ACK => {
                self.send_retries = 0;
                self.current_block_index += 1;
                if self.current_block_index * BLOCK_SIZE >= self.file_data.len() {
                    self.send_eot(timer);
                } else {
                    self.send_next_block(timer);
                }
            }
            NAK => {
                self.send_retries += 1;
                if self.send_retries >= self.config.max_retries {
                    self.last_error = Some(Error::RetryExhausted {
                        attempts: self.send_retries,
                    });
                    self.abort_local(timer);
                } else {
                    warn!("receiver NAKed block, retransmitting");
                    self.send_next_block(timer);
                }
            }
            CAN => self.abort_remote(timer),
            other => trace!("discarding stray byte 0x{other:02x} while waiting for ACK"),
        }
        true
    }

    fn send_eot(&mut self, timer: &TimerService) {
        self.state = TransferState::SendingEot;
        self.send_control(EOT, timer);
        if self.state.is_terminal() {
            return;
        }
        self.send_retries = 0;
        self.state = TransferState::WaitingForEotAck;
        self.arm(timer, self.config.eot_ack_timeout);
    }

    fn step_waiting_for_eot_ack(&mut self, timer: &TimerService) -> bool {
        let Some(b) = self.buffer.pop_front() else {
            return false;
        };
        match b {
            ACK => {
                self.cancel_timer(timer);
                info!("transfer complete");
                self.state = TransferState::Completed;
            }
            CAN => self.abort_remote(timer),
            other => trace!("discarding stray byte 0x{other:02x} while waiting for EOT ACK"),
        }
        true
    }

    // ---- timer callback --------------------------------------------------

    fn on_timeout(&mut self, generation: u64, timer: &TimerService) {
        if generation != self.timer_generation {
            trace!("ignoring stale timer fire (generation {generation})");
            return;
        }
        if self.state.is_terminal() {
            return;
        }
        match self.state {
            TransferState::ExpectingSoh if self.expected_block_number == 1 => {
                debug!("init timeout waiting for first block, re-emitting init signal");
                self.emit_receiver_init(timer);
            }
            TransferState::ExpectingSoh => {
                self.receive_retries += 1;
                if self.receive_retries >= self.config.max_retries {
                    self.last_error = Some(Error::RetryExhausted {
                        attempts: self.receive_retries,
                    });
                    self.abort_local(timer);
                } else {
                    debug!("ack timeout, re-emitting NAK");
                    self.send_control(NAK, timer);
                    if !self.state.is_terminal() {
                        self.arm(timer, self.config.ack_timeout);
                    }
                }
            }
            TransferState::SenderWaitInit => {
                self.send_retries += 1;
                if self.send_retries >= self.config.max_init_retries {
                    self.last_error = Some(Error::LocalInitiationTimeout);
                    self.abort_local(timer);
                } else {
                    debug!("init timeout waiting for receiver, re-arming");
                    self.arm(timer, self.config.init_timeout);
                }
            }
            TransferState::WaitingForAck => {
                self.send_retries += 1;
                if self.send_retries >= self.config.max_retries {
                    self.last_error = Some(Error::RetryExhausted {
                        attempts: self.send_retries,
                    });
                    self.abort_local(timer);
                } else {
                    debug!("ack timeout, retransmitting block");
                    self.send_next_block(timer);
                }
            }
            TransferState::WaitingForEotAck => {
                self.send_retries += 1;
                if self.send_retries >= self.config.max_retries {
                    self.last_error = Some(Error::RetryExhausted {
                        attempts: self.send_retries,
                    });
                    self.abort_local(timer);
                } else {
                    debug!("eot-ack timeout, re-emitting EOT");
                    self.send_control(EOT, timer);
                    if !self.state.is_terminal() {
                        self.arm(timer, self.config.eot_ack_timeout);
                    }
                }
            }
            _ => {
                // Idle, ReceiverInit, Receiving, Sending, SendingEot: none
                // of these leave a timer armed across a pump() call.
                warn!("unexpected timer fire in state {:?}", self.state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_contract::MemorySink;
    use crate::transport::LoopbackTransport;

    fn short_config() -> EngineConfig {
        EngineConfig::default()
            .with_init_timeout(Duration::from_millis(60))
            .with_ack_timeout(Duration::from_millis(60))
            .with_eot_ack_timeout(Duration::from_millis(60))
            .with_max_init_retries(3)
            .with_max_retries(3)
    }

    #[test]
    fn receiver_rejects_second_start_while_active() {
        let ((transport, _inbox), (_peer, _peer_inbox)) = LoopbackTransport::pair();
        let engine = Engine::new(Box::new(transport), short_config());
        engine
            .start_receive(false, Box::new(MemorySink::new()))
            .unwrap();
        let err = engine
            .start_receive(false, Box::new(MemorySink::new()))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyActive));
        engine.shutdown();
    }

    #[test]
    fn sender_rejects_empty_source() {
        let ((transport, _inbox), (_peer, _peer_inbox)) = LoopbackTransport::pair();
        let engine = Engine::new(Box::new(transport), short_config());
        let err = engine.start_send(Vec::new(), false).unwrap_err();
        assert!(matches!(err, Error::EmptySource));
        assert_eq!(engine.current_state(), TransferState::Error);
        engine.shutdown();
    }

    #[test]
    fn end_to_end_loopback_single_block_checksum() {
        let ((sender_transport, sender_inbox), (receiver_transport, receiver_inbox)) =
            LoopbackTransport::pair();
        let sender = Engine::new(Box::new(sender_transport), short_config());
        let receiver = Engine::new(Box::new(receiver_transport), short_config());

        let data = b"AB".to_vec();
        sender.start_send(data.clone(), false).unwrap();

        let sink = MemorySink::new();
        receiver.start_receive(false, Box::new(sink)).unwrap();

        // Ping-pong bytes between the two loopback mirrors until both
        // sides reach a terminal state. `sender_inbox` mirrors what the
        // sender itself sent (relay it to the receiver); `receiver_inbox`
        // mirrors what the receiver itself sent (relay it to the sender).
        for _ in 0..64 {
            let to_receiver = LoopbackTransport::drain(&sender_inbox);
            if !to_receiver.is_empty() {
                receiver.feed_bytes(&to_receiver);
            }
            let to_sender = LoopbackTransport::drain(&receiver_inbox);
            if !to_sender.is_empty() {
                sender.feed_bytes(&to_sender);
            }
            if sender.current_state().is_terminal() && receiver.current_state().is_terminal() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(sender.current_state(), TransferState::Completed);
        assert_eq!(receiver.current_state(), TransferState::Completed);
        sender.shutdown();
        receiver.shutdown();
    }

    #[test]
    fn duplicate_block_does_not_advance_or_rewrite() {
        let ((transport, inbox), (_peer, _peer_inbox)) = LoopbackTransport::pair();
        let engine = Engine::new(Box::new(transport), short_config());
        let sink = MemorySink::new();
        engine.start_receive(false, Box::new(sink)).unwrap();
        LoopbackTransport::drain(&inbox); // drain the initial NAK

        let payload = pad_payload(b"AB");
        let frame = encode_block(1, &payload, false);
        engine.feed_bytes(&frame);
        assert_eq!(LoopbackTransport::drain(&inbox), vec![ACK]);

        // Retransmit the same block (simulating a dropped ACK).
        engine.feed_bytes(&frame);
        assert_eq!(LoopbackTransport::drain(&inbox), vec![ACK]);

        engine.shutdown();
    }

    #[test]
    fn remote_cancel_aborts_without_emitting_bytes() {
        let ((transport, inbox), (_peer, _peer_inbox)) = LoopbackTransport::pair();
        let engine = Engine::new(Box::new(transport), short_config());
        engine
            .start_receive(false, Box::new(MemorySink::new()))
            .unwrap();
        LoopbackTransport::drain(&inbox);

        engine.feed_bytes(&[CAN]);
        assert_eq!(engine.current_state(), TransferState::Aborted);
        assert!(LoopbackTransport::drain(&inbox).is_empty());

        // Bytes after abort are discarded, not reprocessed.
        engine.feed_bytes(&[SOH, 1, 0xFE]);
        assert_eq!(engine.current_state(), TransferState::Aborted);
        engine.shutdown();
    }

    #[test]
    fn corrupted_block_exhausts_retries_and_aborts_with_can_can() {
        let ((transport, inbox), (_peer, _peer_inbox)) = LoopbackTransport::pair();
        let engine = Engine::new(
            Box::new(transport),
            short_config().with_max_retries(3),
        );
        engine
            .start_receive(false, Box::new(MemorySink::new()))
            .unwrap();
        LoopbackTransport::drain(&inbox);

        let payload = pad_payload(b"AB");
        let mut frame = encode_block(1, &payload, false);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF; // corrupt checksum

        for _ in 0..3 {
            engine.feed_bytes(&frame);
        }

        assert_eq!(engine.current_state(), TransferState::Aborted);
        assert_eq!(LoopbackTransport::drain(&inbox), vec![CAN, CAN]);
        engine.shutdown();
    }

    #[test]
    fn block_number_wrap_distinguishes_retransmit_from_new_block() {
        let ((transport, inbox), (_peer, _peer_inbox)) = LoopbackTransport::pair();
        let engine = Engine::new(Box::new(transport), short_config());
        let sink = MemorySink::new();
        engine.start_receive(false, Box::new(sink)).unwrap();
        LoopbackTransport::drain(&inbox);

        // Fast-forward the running counter to simulate having already
        // received block 256 (wire value 0x00), without driving 256
        // feed_bytes calls to get there. Waiting for block 257 (wire 0x01);
        // "previous" is block 256 (wire 0x00).
        engine.inner.lock().expect("engine lock poisoned").expected_block_number = 257;

        // A retransmission of block 256 (wire 0x00) — the sender missed
        // our ACK — must be treated as a duplicate of "previous", not a
        // new block: re-ACK, no write, no advance.
        let payload = pad_payload(&[0u8]);
        let frame = encode_block(0, &payload, false);
        engine.feed_bytes(&frame);
        assert_eq!(LoopbackTransport::drain(&inbox), vec![ACK]);
        assert_eq!(engine.current_state(), TransferState::ExpectingSoh);
        assert_eq!(
            engine.inner.lock().expect("engine lock poisoned").expected_block_number,
            257
        );

        // Block 257 (wire 0x01) is genuinely new and must not be confused
        // with a retransmission of block 1 (which also wrapped to 0x01
        // long ago).
        let payload = pad_payload(&[1u8]);
        let frame = encode_block(1, &payload, false); // wire 0x01 == block 257
        engine.feed_bytes(&frame);
        assert_eq!(LoopbackTransport::drain(&inbox), vec![ACK]);
        assert_eq!(engine.current_state(), TransferState::ExpectingSoh);
        assert_eq!(
            engine.inner.lock().expect("engine lock poisoned").expected_block_number,
            258
        );

        engine.shutdown();
    }
}
