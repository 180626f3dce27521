use std::net::SocketAddr;

use uuid::Uuid;

use crate::protocol::TransferHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// `Connecting -> HeaderExchanged -> Streaming -> Completed`, with `Failed`
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HeaderExchanged,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, HeaderExchanged) => true,
            (HeaderExchanged, Streaming) => true,
            (Streaming, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One transfer attempt, live only for the duration of its connection.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: Uuid,
    pub role: Role,
    pub peer_address: SocketAddr,
    pub header: Option<TransferHeader>,
    pub bytes_transferred: u64,
    state: SessionState,
    failure: Option<String>,
}

impl TransferSession {
    pub fn new(role: Role, peer_address: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            peer_address,
            header: None,
            bytes_transferred: 0,
            state: SessionState::Connecting,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn file_name(&self) -> &str {
        self.header.as_ref().map(|h| h.file_name.as_str()).unwrap_or("")
    }

    fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                "Session {} ignored transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        tracing::debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        true
    }

    pub fn header_exchanged(&mut self, header: TransferHeader) -> bool {
        if self.advance(SessionState::HeaderExchanged) {
            self.header = Some(header);
            true
        } else {
            false
        }
    }

    pub fn start_streaming(&mut self) -> bool {
        self.advance(SessionState::Streaming)
    }

    pub fn record_bytes(&mut self, n: u64) {
        self.bytes_transferred += n;
    }

    pub fn complete(&mut self) -> bool {
        self.advance(SessionState::Completed)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.advance(SessionState::Failed) {
            self.failure = Some(reason.into());
            true
        } else {
            false
        }
    }
}
