//! State of one in-flight transfer

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::core::{OptionsProtocol, Packet};
use super::error::{FailureReason, TransferFailure};

pub type SuccessCallback = Box<dyn FnOnce(Vec<u8>) + Send>;
pub type FailureCallback = Box<dyn FnOnce(TransferFailure) + Send>;

/// The TFTP operation a session performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// What a queued session does once it reaches the head of its peer's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredStart {
    /// Send the read request (client role)
    StartRead,
    /// Send the option acknowledgment (server role)
    SendOack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting behind another session for the same peer
    Queued,
    /// Head of its queue, exchanging packets
    Active,
    Done,
    Failed(FailureReason),
}

/// Result handed to whoever started the session
pub enum Completion {
    Success(SuccessCallback, Vec<u8>),
    Failure(FailureCallback, TransferFailure),
}

impl Completion {
    pub fn invoke(self) {
        match self {
            Completion::Success(callback, data) => callback(data),
            Completion::Failure(callback, failure) => callback(failure),
        }
    }
}

pub struct Session {
    pub id: u64,
    pub is_client: bool,
    pub address: SocketAddr,
    pub request: RequestKind,
    pub file_name: String,
    pub file_data: Vec<u8>,
    pub file_size: Option<u64>,
    pub block_size: u16,
    pub timeout: Duration,
    /// Blocks exchanged so far. Never wraps; the wire carries it modulo 2^16.
    pub block_number: u64,
    pub last_read_count: Option<usize>,
    pub last_contact: Instant,
    pub last_sent_packet: Option<Packet>,
    pub last_received_packet: Option<Packet>,
    pub deferred_start: Option<DeferredStart>,
    state: SessionState,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl Session {
    /// A download this node initiated
    pub fn client(
        id: u64,
        address: SocketAddr,
        file_name: String,
        options: OptionsProtocol,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> Self {
        let mut session = Self::new(id, true, address, file_name, Vec::new(), None, options);
        session.on_success = on_success;
        session.on_failure = on_failure;
        session
    }

    /// A read request this node serves from `file_data`
    pub fn server(id: u64, address: SocketAddr, file_name: String, file_data: Vec<u8>, options: OptionsProtocol) -> Self {
        let file_size = Some(file_data.len() as u64);
        Self::new(id, false, address, file_name, file_data, file_size, options)
    }

    fn new(
        id: u64,
        is_client: bool,
        address: SocketAddr,
        file_name: String,
        file_data: Vec<u8>,
        file_size: Option<u64>,
        options: OptionsProtocol,
    ) -> Self {
        Self {
            id,
            is_client,
            address,
            request: RequestKind::Read,
            file_name,
            file_data,
            file_size,
            block_size: options.block_size,
            timeout: options.timeout,
            block_number: 0,
            last_read_count: None,
            last_contact: Instant::now(),
            last_sent_packet: None,
            last_received_packet: None,
            deferred_start: None,
            state: SessionState::Queued,
            on_success: None,
            on_failure: None,
        }
    }

    /// Parameters this session negotiates with its peer
    pub fn options(&self) -> OptionsProtocol {
        OptionsProtocol {
            block_size: self.block_size,
            timeout: self.timeout,
            transfer_size: self.file_size,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == SessionState::Done
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SessionState::Failed(_))
    }

    pub fn is_terminal(&self) -> bool {
        self.is_done() || self.is_failed()
    }

    /// Block number as carried on the wire
    pub fn wire_block(&self) -> u16 {
        (self.block_number & 0xffff) as u16
    }

    pub fn activate(&mut self) {
        if self.state == SessionState::Queued {
            self.state = SessionState::Active;
        }
    }

    pub fn set_done(&mut self) {
        if !self.is_terminal() {
            self.state = SessionState::Done;
        }
    }

    pub fn set_failed(&mut self, reason: FailureReason) {
        if !self.is_terminal() {
            self.state = SessionState::Failed(reason);
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_contact) >= self.timeout
    }

    /// Take the next block to send, starting at `block_number * block_size`.
    pub fn next_block(&mut self) -> Vec<u8> {
        let block_size = usize::from(self.block_size);
        let len = self.file_data.len();
        let start = usize::try_from(self.block_number)
            .unwrap_or(usize::MAX)
            .saturating_mul(block_size)
            .min(len);
        let end = start.saturating_add(block_size).min(len);

        let data = self.file_data[start..end].to_vec();
        self.block_number += 1;
        self.last_read_count = Some(data.len());
        data
    }

    /// Whether the last block handed out was the short, final one
    pub fn sent_final_block(&self) -> bool {
        self.last_read_count
            .is_some_and(|count| count < usize::from(self.block_size))
    }

    /// Consume the terminal session into its callback invocation, if any
    pub fn into_completion(mut self) -> Option<Completion> {
        let data = std::mem::take(&mut self.file_data);
        match self.state {
            SessionState::Done => self.on_success.take().map(|cb| Completion::Success(cb, data)),
            SessionState::Failed(reason) => self.on_failure.take().map(|cb| {
                Completion::Failure(
                    cb,
                    TransferFailure {
                        file_name: self.file_name,
                        reason,
                        partial_data: data,
                    },
                )
            }),
            SessionState::Queued | SessionState::Active => None,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.is_client { "RECV" } else { "SEND" };
        write!(f, "[{} #{} {} {}]", role, self.id, self.address, self.file_name)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .field("address", &self.address)
            .field("file_name", &self.file_name)
            .field("block_size", &self.block_size)
            .field("block_number", &self.block_number)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::core::ErrorCode;
    use std::sync::{Arc, Mutex};

    fn addr() -> SocketAddr {
        "10.0.0.5:1234".parse().unwrap()
    }

    fn options(block_size: u16) -> OptionsProtocol {
        OptionsProtocol {
            block_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_next_block_walks_payload() {
        let mut session = Session::server(1, addr(), "f".into(), (0u8..20).collect(), options(8));

        assert_eq!(session.next_block(), (0u8..8).collect::<Vec<_>>());
        assert!(!session.sent_final_block());
        assert_eq!(session.next_block(), (8u8..16).collect::<Vec<_>>());
        assert_eq!(session.next_block(), (16u8..20).collect::<Vec<_>>());
        assert!(session.sent_final_block());
        assert_eq!(session.block_number, 3);
    }

    #[test]
    fn test_exact_multiple_ends_with_empty_block() {
        let mut session = Session::server(1, addr(), "f".into(), vec![7; 16], options(8));
        session.next_block();
        session.next_block();
        assert!(!session.sent_final_block());
        assert!(session.next_block().is_empty());
        assert!(session.sent_final_block());
    }

    #[test]
    fn test_terminal_state_is_permanent() {
        let mut session = Session::server(1, addr(), "f".into(), vec![], options(8));
        session.activate();
        session.set_done();
        session.set_failed(FailureReason::PeerTimeout);
        assert!(session.is_done());
        assert!(!session.is_failed());

        let mut other = Session::server(2, addr(), "f".into(), vec![], options(8));
        other.set_failed(FailureReason::PeerTimeout);
        other.set_done();
        assert!(other.is_failed());
        assert!(!other.is_done());
    }

    #[test]
    fn test_wire_block_wraps() {
        let mut session = Session::server(1, addr(), "f".into(), vec![], options(8));
        session.block_number = 65_535;
        assert_eq!(session.wire_block(), 65_535);
        session.block_number = 65_536;
        assert_eq!(session.wire_block(), 0);
        session.block_number = 65_537;
        assert_eq!(session.wire_block(), 1);
    }

    #[test]
    fn test_failure_completion_carries_partial_data() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut session = Session::client(
            9,
            addr(),
            "report.txt".into(),
            OptionsProtocol::default(),
            None,
            Some(Box::new(move |failure: TransferFailure| *sink.lock().unwrap() = Some(failure))),
        );
        session.file_data.extend_from_slice(b"partial");
        session.set_failed(FailureReason::ProtocolViolation {
            code: ErrorCode::IllegalOperation,
            detail: "unexpected OACK".into(),
        });

        session.into_completion().unwrap().invoke();
        let failure = seen.lock().unwrap().take().unwrap();
        assert_eq!(failure.file_name, "report.txt");
        assert_eq!(failure.partial_data, b"partial");
    }

    #[test]
    fn test_non_terminal_session_has_no_completion() {
        let session = Session::client(1, addr(), "a".into(), OptionsProtocol::default(), None, None);
        assert!(session.into_completion().is_none());
    }
}
