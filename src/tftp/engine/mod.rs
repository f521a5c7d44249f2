//! Transfer engine: session routing and the RRQ/OACK/DATA/ACK state machine
//!
//! Every peer has a FIFO of sessions. Only the head of a queue talks to the
//! peer; when it finishes or fails it is dequeued, its callback fires and
//! the next session starts right away. All queue access goes through one
//! engine-wide lock, which is never held across file I/O or callbacks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::config::EngineConfig;
use super::core::options::{MIN_BLOCK_SIZE, clamp_timeout, find_option};
use super::core::{ErrorCode, OCTET_MODE, Opcode, OptionType, OptionsProtocol, Packet, TransferOption};
use super::error::{FailureReason, TransferFailure};
use super::queue::SessionTable;
use super::server::Storage;
use super::session::{Completion, DeferredStart, FailureCallback, Session, SessionState, SuccessCallback};
use super::transport::{Endpoint, Scheduler, TaskHandle};


pub struct TransferEngine {
    config: EngineConfig,
    storage: Storage,
    endpoint: Arc<dyn Endpoint>,
    scheduler: Arc<dyn Scheduler>,
    /// `None` once the engine has been stopped
    sessions: Mutex<Option<SessionTable>>,
    sweep_task: Mutex<Option<TaskHandle>>,
    next_id: AtomicU64,
}

impl TransferEngine {
    pub fn new(config: EngineConfig, endpoint: Arc<dyn Endpoint>, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        let storage = Storage::new(config.root_dir.clone());
        Arc::new(Self {
            config,
            storage,
            endpoint,
            scheduler,
            sessions: Mutex::new(Some(SessionTable::new())),
            sweep_task: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register on the endpoint and start the timeout sweep
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.storage.ensure_root()?;
        self.sessions.lock().get_or_insert_with(SessionTable::new);

        let weak: Weak<Self> = Arc::downgrade(self);
        self.endpoint.listen_to(
            &self.config.prefix,
            Arc::new(move |peer: SocketAddr, data: &[u8]| {
                if let Some(engine) = weak.upgrade() {
                    engine.on_datagram_received(peer, data);
                }
            }),
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = self.scheduler.schedule_periodic(
            "tftp timeout check",
            self.config.sweep_interval,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.check_timeout();
                }
            }),
        );
        if let Some(previous) = self.sweep_task.lock().replace(handle) {
            previous.cancel();
        }

        log::info!("Transfer engine started, root directory {}", self.storage.root_dir().display());
        Ok(())
    }

    /// Cancel the sweep and drop every queued session without notifying it
    pub fn stop(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.cancel();
        }
        let dropped = self.sessions.lock().take();
        if let Some(table) = dropped {
            log::info!("Transfer engine stopped, abandoning sessions for {} peer(s)", table.peer_count());
        }
    }

    pub fn is_running(&self) -> bool {
        self.sessions.lock().is_some()
    }

    /// Sessions queued for `peer`, the active one included
    pub fn queue_len(&self, peer: &SocketAddr) -> usize {
        self.sessions.lock().as_ref().map_or(0, |t| t.queue_len(peer))
    }

    /// Download `file_name` from `peer`.
    ///
    /// The read request goes out immediately if no other session for `peer`
    /// is in progress, otherwise once the ones ahead of it have finished.
    /// Exactly one of the callbacks is invoked when the transfer ends.
    pub fn initiate_download(
        &self,
        file_name: &str,
        peer: SocketAddr,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) {
        log::debug!("Start downloading {} from {}", file_name, peer);
        let mut session = Session::client(
            self.next_id(),
            peer,
            file_name.to_string(),
            self.config.download_options(),
            on_success,
            on_failure,
        );
        session.deferred_start = Some(DeferredStart::StartRead);

        let mut completions = Vec::new();
        {
            let mut guard = self.sessions.lock();
            match guard.as_mut() {
                Some(table) => self.enqueue(table, session, &mut completions),
                None => {
                    log::warn!("{} rejected, engine is stopped", session);
                    session.set_failed(FailureReason::Stopped);
                    completions.extend(session.into_completion());
                }
            }
        }
        completions.into_iter().for_each(Completion::invoke);
    }

    /// Download `file_name` from `peer` and wait for the result
    pub async fn download(&self, file_name: &str, peer: SocketAddr) -> Result<Vec<u8>, TransferFailure> {
        let (tx, rx) = oneshot::channel::<Result<Vec<u8>, TransferFailure>>();
        let on_success = Arc::new(Mutex::new(Some(tx)));
        let on_failure = on_success.clone();

        self.initiate_download(
            file_name,
            peer,
            Some(Box::new(move |data: Vec<u8>| {
                if let Some(tx) = on_success.lock().take() {
                    let _ = tx.send(Ok(data));
                }
            })),
            Some(Box::new(move |failure: TransferFailure| {
                if let Some(tx) = on_failure.lock().take() {
                    let _ = tx.send(Err(failure));
                }
            })),
        );

        // The sender is dropped unanswered only when the engine stops mid-transfer
        rx.await.unwrap_or_else(|_| {
            Err(TransferFailure {
                file_name: file_name.to_string(),
                reason: FailureReason::Stopped,
                partial_data: Vec::new(),
            })
        })
    }

    /// Entry point for every datagram carrying this engine's prefix
    pub fn on_datagram_received(self: &Arc<Self>, peer: SocketAddr, data: &[u8]) {
        log::debug!("GOT packet [{}] from {}", data.len(), peer);

        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::error!("Invalid packet from {}, packet=[{}], error={}", peer, hex_preview(data), e);
                return;
            }
        };

        match packet {
            Packet::Rrq { .. } | Packet::Wrq { .. } => self.handle_new_request(peer, packet),
            _ => self.handle_response(peer, packet),
        }
    }

    /// Fail every head session whose peer has been silent too long
    pub fn check_timeout(&self) {
        self.check_timeout_at(Instant::now());
    }

    pub fn check_timeout_at(&self, now: Instant) {
        let mut completions = Vec::new();
        {
            let mut guard = self.sessions.lock();
            let Some(table) = guard.as_mut() else {
                return;
            };

            for peer in table.peers_where(|s| s.is_timed_out(now)) {
                if let Some(session) = table.head_mut(&peer) {
                    log::warn!("{} timed out after {:?}", session, session.timeout);
                    session.set_failed(FailureReason::PeerTimeout);
                }
                self.settle(table, &peer, &mut completions);
            }
        }
        completions.into_iter().for_each(Completion::invoke);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_new_request(self: &Arc<Self>, peer: SocketAddr, packet: Packet) {
        let (file_name, options) = match packet {
            Packet::Rrq { filename, options, .. } => (filename, options),
            other => {
                log::error!("Unexpected request from {}, opcode={}: packet={:?}", peer, other.opcode(), other);
                self.reject_request(peer, ErrorCode::IllegalOperation);
                return;
            }
        };

        let Some(granted) = OptionsProtocol::from_request(&options) else {
            log::error!("No 'blksize' or 'timeout' in request from {} for {}: {:?}", peer, file_name, options);
            self.reject_request(peer, ErrorCode::OptionNegotiationFailed);
            return;
        };

        // Reading and packing stay off the dispatch thread and outside the queue lock
        let engine = Arc::clone(self);
        self.scheduler
            .spawn_blocking(Box::new(move || engine.load_and_enqueue(peer, file_name, granted)));
    }

    fn load_and_enqueue(&self, peer: SocketAddr, file_name: String, granted: OptionsProtocol) {
        let payload = match self.storage.load(&file_name) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("[READ {}] {}", peer, e);
                self.reject_request(peer, e.error_code());
                return;
            }
        };

        let mut session = Session::server(self.next_id(), peer, file_name, payload.data, granted);
        session.deferred_start = Some(DeferredStart::SendOack);
        log::debug!(
            "{} accepted, blksize={}, timeout={:?}, tsize={}",
            session,
            session.block_size,
            session.timeout,
            payload.size
        );

        let mut completions = Vec::new();
        {
            let mut guard = self.sessions.lock();
            let Some(table) = guard.as_mut() else {
                log::debug!("Engine stopped, dropping request from {}", peer);
                return;
            };
            self.enqueue(table, session, &mut completions);
        }
        completions.into_iter().for_each(Completion::invoke);
    }

    /// Answer a request that will not be served, if configured to
    fn reject_request(&self, peer: SocketAddr, code: ErrorCode) {
        if !self.config.reply_to_rejected_requests {
            return;
        }
        match Packet::error(code).serialize() {
            Ok(bytes) => {
                log::debug!("SEND OP[{}] -> {} code = {}", Opcode::Error, peer, code.as_u16());
                if let Err(e) = self.endpoint.send_packet(peer, &bytes, &self.config.prefix) {
                    log::warn!("Failed to send rejection to {}: {}", peer, e);
                }
            }
            Err(e) => log::error!("Failed to encode rejection for {}: {}", peer, e),
        }
    }

    fn handle_response(&self, peer: SocketAddr, packet: Packet) {
        let mut completions = Vec::new();
        {
            let mut guard = self.sessions.lock();
            let Some(table) = guard.as_mut() else {
                return;
            };
            let Some(session) = table.head_mut(&peer) else {
                log::error!("Got {} from {} with no session in progress", packet.opcode(), peer);
                return;
            };

            self.process_packet(session, packet);
            self.settle(table, &peer, &mut completions);
        }
        completions.into_iter().for_each(Completion::invoke);
    }

    fn enqueue(&self, table: &mut SessionTable, session: Session, completions: &mut Vec<Completion>) {
        let peer = session.address;
        if !table.enqueue(session) {
            log::debug!("Queued session for {} behind {} other(s)", peer, table.queue_len(&peer) - 1);
        }
        self.settle(table, &peer, completions);
    }

    /// Start a freshly promoted head, retire terminal heads, and repeat
    /// until the peer's head is active or its queue is gone.
    fn settle(&self, table: &mut SessionTable, peer: &SocketAddr, completions: &mut Vec<Completion>) {
        while let Some(head) = table.head_mut(peer) {
            if *head.state() == SessionState::Queued {
                self.start_session(head);
                continue;
            }
            if !head.is_terminal() {
                break;
            }

            let Some(session) = table.pop_head(peer) else {
                break;
            };
            match session.state() {
                SessionState::Failed(reason) => log::warn!("{} failed: {}", session, reason),
                _ => log::debug!("{} removed from queue", session),
            }
            completions.extend(session.into_completion());
        }
    }

    fn start_session(&self, session: &mut Session) {
        session.activate();
        match session.deferred_start.take() {
            Some(DeferredStart::StartRead) => self.send_request_packet(session),
            Some(DeferredStart::SendOack) => self.send_oack_packet(session),
            None => {}
        }
    }

    fn process_packet(&self, session: &mut Session, packet: Packet) {
        session.last_contact = Instant::now();

        if let Packet::Error { code, msg } = &packet {
            log::error!("{} got ERROR message: code = {}, msg = {}", session, code.as_u16(), msg);
            session.set_failed(FailureReason::RemoteError {
                code: *code,
                msg: msg.clone(),
            });
        } else if session.is_client {
            self.handle_packet_as_receiver(session, &packet);
        } else {
            self.handle_packet_as_sender(session, &packet);
        }

        session.last_received_packet = Some(packet);
    }

    fn handle_packet_as_receiver(&self, session: &mut Session, packet: &Packet) {
        match packet {
            Packet::Oack(options) => {
                if session.last_received_packet.is_some() {
                    return self.fail(session, ErrorCode::IllegalOperation, "unexpected OACK".to_string());
                }
                if let Err(detail) = accept_oack(session, options) {
                    return self.fail(session, ErrorCode::OptionNegotiationFailed, detail);
                }
                session.file_data.clear();
                let block_num = session.wire_block();
                self.send_ack_packet(session, block_num);
                session.block_number += 1;
            }
            Packet::Data { block_num, data } => {
                if session.last_received_packet.is_none() {
                    return self.fail(session, ErrorCode::IllegalOperation, "DATA before OACK".to_string());
                }
                if *block_num != session.wire_block() {
                    let detail = format!("got DATA block {} while expecting {}", block_num, session.wire_block());
                    return self.fail(session, ErrorCode::IllegalOperation, detail);
                }
                if data.len() > usize::from(session.block_size) {
                    let detail = format!("DATA block of {} bytes exceeds blksize {}", data.len(), session.block_size);
                    return self.fail(session, ErrorCode::IllegalOperation, detail);
                }

                session.file_data.extend_from_slice(data);
                self.send_ack_packet(session, *block_num);
                session.block_number += 1;

                if data.len() < usize::from(session.block_size) {
                    session.set_done();
                    log::info!("{} transfer finished, {} bytes", session, session.file_data.len());
                }
            }
            other => {
                let detail = format!("got {} while expecting DATA", other.opcode());
                self.fail(session, ErrorCode::IllegalOperation, detail);
            }
        }
    }

    fn handle_packet_as_sender(&self, session: &mut Session, packet: &Packet) {
        let Packet::Ack(block_num) = packet else {
            let detail = format!("got {} while expecting ACK", packet.opcode());
            return self.fail(session, ErrorCode::IllegalOperation, detail);
        };
        if *block_num != session.wire_block() {
            let detail = format!("got ACK block {} while expecting {}", block_num, session.wire_block());
            return self.fail(session, ErrorCode::IllegalOperation, detail);
        }

        // The short block has been acknowledged
        if session.sent_final_block() {
            session.set_done();
            log::info!("{} finished, {} bytes", session, session.file_data.len());
            return;
        }

        let data = session.next_block();
        let block_num = session.wire_block();
        self.send_data_packet(session, block_num, data);
    }

    /// Mark the session failed and tell the peer why
    fn fail(&self, session: &mut Session, code: ErrorCode, detail: String) {
        log::error!("{} {}", session, detail);
        session.set_failed(FailureReason::ProtocolViolation { code, detail });
        self.send_packet(session, Packet::error(code));
    }

    fn send_packet(&self, session: &mut Session, packet: Packet) {
        let bytes = match packet.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("{} cannot encode {}: {}", session, packet.opcode(), e);
                session.set_failed(FailureReason::InvalidRequest(e.to_string()));
                return;
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            let mut extra = String::new();
            if let Some(block) = packet.block_num() {
                extra.push_str(&format!(" block_number = {}", block));
            }
            if let Packet::Data { data, .. } = &packet {
                extra.push_str(&format!(" block_size = {}", data.len()));
            }
            log::debug!("SEND OP[{}] -> {}{}", packet.opcode(), session.address, extra);
        }

        if let Err(e) = self.endpoint.send_packet(session.address, &bytes, &self.config.prefix) {
            log::error!("{} failed to send {}: {}", session, packet.opcode(), e);
            session.set_failed(FailureReason::SendFailed(e.to_string()));
        }

        session.last_contact = Instant::now();
        session.last_sent_packet = Some(packet);
    }

    fn send_request_packet(&self, session: &mut Session) {
        let packet = Packet::Rrq {
            filename: session.file_name.clone(),
            mode: OCTET_MODE.to_string(),
            options: session.options().request_options(),
        };
        self.send_packet(session, packet);
    }

    fn send_oack_packet(&self, session: &mut Session) {
        let packet = Packet::Oack(session.options().oack_options());
        self.send_packet(session, packet);
    }

    fn send_data_packet(&self, session: &mut Session, block_num: u16, data: Vec<u8>) {
        self.send_packet(session, Packet::Data { block_num, data });
    }

    fn send_ack_packet(&self, session: &mut Session, block_num: u16) {
        self.send_packet(session, Packet::Ack(block_num));
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_task.get_mut().take() {
            task.cancel();
        }
    }
}

/// Adopt the parameters a server granted in its OACK
fn accept_oack(session: &mut Session, options: &[TransferOption]) -> Result<(), String> {
    let requested = u64::from(session.block_size);
    let block_size = find_option(options, OptionType::BlockSize).unwrap_or(requested);
    if block_size < u64::from(MIN_BLOCK_SIZE) || block_size > requested {
        return Err(format!("server granted blksize {} for a request of {}", block_size, requested));
    }
    // bounded by `requested`, which is a u16
    session.block_size = block_size as u16;

    if let Some(timeout) = find_option(options, OptionType::Timeout) {
        session.timeout = clamp_timeout(timeout);
    }
    if let Some(size) = find_option(options, OptionType::TransferSize) {
        session.file_size = Some(size);
    }
    Ok(())
}

fn hex_preview(data: &[u8]) -> String {
    const MAX: usize = 32;
    let mut out = hex::encode(&data[..data.len().min(MAX)]);
    if data.len() > MAX {
        out.push_str("...");
    }
    out
}
