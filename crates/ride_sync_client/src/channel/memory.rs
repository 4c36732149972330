/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! In-process transport. The paired [`MemoryServer`] plays the server side of every
//! connection the client opens, which makes the channel drivable from tests.

use super::events::WireEvent;
use super::transport::{ConnectError, Transport, TransportLink, TransportSignal};
use super::{Channel, ChannelManager, ChannelSettings};
use crate::common::credentials::MemoryCredentialStore;
use crate::common::types::{SessionIdentity, Token};
use crate::tools::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Outcome of the next handshake. Unscripted handshakes are accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    Accept,
    Reject(String),
    Unreachable(String),
}

#[derive(Default)]
struct Script {
    handshakes: VecDeque<Handshake>,
    attempts: Vec<Token>,
}

pub struct MemoryTransport {
    script: Arc<Mutex<Script>>,
    connections: UnboundedSender<MemoryConnection>,
}

pub struct MemoryServer {
    script: Arc<Mutex<Script>>,
    connections: UnboundedReceiver<MemoryConnection>,
}

/// The server end of one accepted connection.
#[derive(Debug)]
pub struct MemoryConnection {
    pub token: Token,
    from_client: UnboundedReceiver<WireEvent>,
    to_client: UnboundedSender<TransportSignal>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryServer) {
        let script = Arc::new(Mutex::new(Script::default()));
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                script: script.clone(),
                connections: connections_tx,
            },
            MemoryServer {
                script,
                connections: connections_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, token: &Token) -> Result<TransportLink, ConnectError> {
        let handshake = match self.script.lock() {
            Ok(mut script) => {
                script.attempts.push(token.to_owned());
                script.handshakes.pop_front().unwrap_or(Handshake::Accept)
            }
            Err(err) => return Err(ConnectError::Unreachable(err.to_string())),
        };
        match handshake {
            Handshake::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                self.connections
                    .send(MemoryConnection {
                        token: token.to_owned(),
                        from_client: outbound_rx,
                        to_client: inbound_tx,
                    })
                    .map_err(|_| ConnectError::Unreachable("Server stopped".to_string()))?;
                Ok(TransportLink {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                })
            }
            Handshake::Reject(reason) => Err(ConnectError::Rejected(reason)),
            Handshake::Unreachable(reason) => Err(ConnectError::Unreachable(reason)),
        }
    }
}

/// Connects a session channel over a fresh in-memory transport. The returned connection
/// is past the `join:ride` identity binding.
pub async fn connected_channel(
    identity: SessionIdentity,
    settings: ChannelSettings,
) -> Result<(Channel, MemoryServer, MemoryConnection), AppError> {
    let (transport, mut server) = MemoryTransport::pair();
    let credentials = MemoryCredentialStore::with_token(identity.role, "memory-token");
    let manager = ChannelManager::new(Arc::new(transport), Arc::new(credentials), settings);
    let channel = manager.connect(identity).await?;
    let mut connection = server
        .accept()
        .await
        .ok_or_else(|| AppError::ChannelClosed("No connection accepted".to_string()))?;
    connection
        .expect_event("join:ride")
        .await
        .ok_or_else(|| AppError::ChannelClosed("Identity never bound".to_string()))?;
    Ok((channel, server, connection))
}

impl MemoryServer {
    pub fn script(&self, handshake: Handshake) {
        if let Ok(mut script) = self.script.lock() {
            script.handshakes.push_back(handshake);
        }
    }

    /// Tokens presented on every handshake attempt so far, accepted or not.
    pub fn attempts(&self) -> Vec<Token> {
        self.script
            .lock()
            .map(|script| script.attempts.to_owned())
            .unwrap_or_default()
    }

    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.connections.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryConnection> {
        self.connections.try_recv().ok()
    }
}

impl MemoryConnection {
    pub fn push(&self, name: &str, payload: Value) -> bool {
        self.to_client
            .send(TransportSignal::Event(WireEvent {
                name: name.to_string(),
                payload,
            }))
            .is_ok()
    }

    pub fn reject(&self, reason: &str) -> bool {
        self.to_client
            .send(TransportSignal::Rejected(reason.to_string()))
            .is_ok()
    }

    pub fn close(self, reason: &str) {
        let _ = self
            .to_client
            .send(TransportSignal::Closed(reason.to_string()));
    }

    pub async fn next_event(&mut self) -> Option<WireEvent> {
        self.from_client.recv().await
    }

    /// Everything the client emitted so far, without waiting.
    pub fn drain(&mut self) -> Vec<WireEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.from_client.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits for the next event with the given name, discarding others.
    pub async fn expect_event(&mut self, name: &str) -> Option<Value> {
        while let Some(event) = self.from_client.recv().await {
            if event.name == name {
                return Some(event.payload);
            }
        }
        None
    }
}
