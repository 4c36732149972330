/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use super::events::WireEvent;
use crate::common::types::Token;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// What the transport reports to the channel after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Event(WireEvent),
    /// The server refused the session after it was established.
    Rejected(String),
    Closed(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectError {
    #[error("Handshake rejected : {0}")]
    Rejected(String),
    #[error("Server unreachable : {0}")]
    Unreachable(String),
}

/// One established connection. Dropping `outbound` asks the transport to close.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: UnboundedSender<WireEvent>,
    pub inbound: UnboundedReceiver<TransportSignal>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, token: &Token) -> Result<TransportLink, ConnectError>;
}

const CREDENTIAL_REJECTIONS: [&str; 5] = [
    "token expired",
    "invalid token",
    "jwt expired",
    "authentication error",
    "unauthorized",
];

/// Whether a server rejection means the stored credential can no longer be used.
pub fn is_credential_rejection(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    CREDENTIAL_REJECTIONS
        .iter()
        .any(|rejection| reason.contains(rejection))
}
