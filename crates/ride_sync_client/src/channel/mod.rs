/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! The realtime channel shared by every ride component of a session.
//!
//! A [`Channel`] owns one supervised connection. Inbound events are decoded once and
//! fanned out to the [`Subscription`]s whose names match; a subscription stops
//! receiving as soon as it is dropped.

pub mod events;
pub mod memory;
pub mod socketio;
pub mod transport;

use self::events::{InboundEvent, JoinRide, OutboundEvent, WireEvent};
use self::transport::{is_credential_rejection, ConnectError, Transport, TransportLink, TransportSignal};
use crate::channel_event;
use crate::common::{
    credentials::CredentialStore,
    types::{SessionIdentity, Token},
};
use crate::tools::{error::AppError, prometheus::CHANNEL_RECONNECTS};
use rustc_hash::FxHashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// The server refused the credential. Terminal, the session must log in again.
    AuthExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub reconnect_max_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            reconnect_max_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
        }
    }
}

struct Subscriber {
    names: Vec<&'static str>,
    sender: mpsc::UnboundedSender<InboundEvent>,
}

struct ChannelInner {
    identity: SessionIdentity,
    state: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WireEvent>>>,
    subscribers: Mutex<FxHashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
}

impl ChannelInner {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn install(&self, sender: Option<mpsc::UnboundedSender<WireEvent>>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = sender;
        }
    }

    fn dispatch(&self, name: &str, event: InboundEvent) {
        channel_event!("inbound", name);
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|_, subscriber| {
            if subscriber.names.iter().any(|subscribed| *subscribed == name) {
                subscriber.sender.send(event.to_owned()).is_ok()
            } else {
                !subscriber.sender.is_closed()
            }
        });
    }

    fn emit_wire(&self, wire: WireEvent) -> Result<(), AppError> {
        if *self.state.borrow() != ChannelState::Connected {
            return Err(AppError::ChannelNotConnected);
        }
        let outbound = self
            .outbound
            .lock()
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        let sender = outbound.as_ref().ok_or(AppError::ChannelNotConnected)?;
        let name = wire.name.to_owned();
        sender
            .send(wire)
            .map_err(|_| AppError::ChannelClosed(name.to_owned()))?;
        channel_event!("outbound", name.as_str());
        Ok(())
    }
}

/// Scoped registration for a set of inbound event names.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<InboundEvent>,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            if let Ok(mut subscribers) = channel.subscribers.lock() {
                subscribers.remove(&self.id);
            }
        }
    }
}

pub struct Channel {
    inner: Arc<ChannelInner>,
    supervisor: JoinHandle<()>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

impl Channel {
    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the channel is connected, or with the terminal state it ended in.
    pub async fn wait_connected(&self) -> Result<(), AppError> {
        let mut state = self.watch_state();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ChannelState::Connected => return Ok(()),
                ChannelState::AuthExpired => {
                    return Err(AppError::CredentialExpired("Channel refused".to_string()))
                }
                ChannelState::Disconnected => return Err(AppError::ChannelNotConnected),
                ChannelState::Connecting => {}
            }
            state
                .changed()
                .await
                .map_err(|_| AppError::ChannelClosed("Channel dropped".to_string()))?;
        }
    }

    /// Sends an event now. Emission while not connected is rejected, never queued.
    pub fn emit(&self, event: OutboundEvent) -> Result<(), AppError> {
        self.inner.emit_wire(event.to_wire()?)
    }

    pub fn subscribe(&self, names: &[&'static str]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.insert(
                id,
                Subscriber {
                    names: names.to_vec(),
                    sender,
                },
            );
        }
        Subscription {
            id,
            receiver,
            channel: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or_default()
    }
}

pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    settings: ChannelSettings,
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        settings: ChannelSettings,
    ) -> Self {
        ChannelManager {
            transport,
            credentials,
            settings,
        }
    }

    /// Opens the session channel for `identity`.
    ///
    /// Fails without touching the network when no credential is stored, and with
    /// `CredentialExpired` when the server refuses the one presented. A server that cannot
    /// be reached yields a channel in `Connecting` that keeps retrying in the background.
    pub async fn connect(&self, identity: SessionIdentity) -> Result<Channel, AppError> {
        let token = self
            .credentials
            .active_token()
            .ok_or(AppError::MissingCredential)?;

        let (state, _) = watch::channel(ChannelState::Connecting);
        let inner = Arc::new(ChannelInner {
            identity,
            state,
            outbound: Mutex::new(None),
            subscribers: Mutex::new(FxHashMap::default()),
            next_subscriber: AtomicU64::new(0),
        });

        let first = self.transport.open(&token).await;

        let (link, failed_attempts) = match first {
            Ok(link) => (Some(link), 0),
            Err(ConnectError::Rejected(reason)) if is_credential_rejection(&reason) => {
                expire_credentials(&inner, self.credentials.as_ref(), &reason);
                return Err(AppError::CredentialExpired(reason));
            }
            Err(err) => {
                warn!(tag = "[Channel]", error = %err, "Initial handshake failed");
                inner.dispatch(
                    events::names::CONNECT_ERROR,
                    InboundEvent::connect_error(&err.to_string()),
                );
                (None, 1)
            }
        };

        if let Some(link) = &link {
            establish(&inner, &link.outbound);
        }

        let supervisor = tokio::spawn(supervise(
            inner.clone(),
            self.transport.clone(),
            self.credentials.clone(),
            self.settings.to_owned(),
            link,
            failed_attempts,
        ));

        Ok(Channel { inner, supervisor })
    }
}

fn establish(inner: &ChannelInner, outbound: &mpsc::UnboundedSender<WireEvent>) {
    inner.install(Some(outbound.to_owned()));
    inner.set_state(ChannelState::Connected);
    info!(tag = "[Channel]", role = %inner.identity.role, "Connected");

    // The server binds the socket to a party through `join:ride`, after every handshake.
    let join = OutboundEvent::JoinRide(JoinRide::Identity {
        user_id: inner.identity.party_id.to_owned(),
        user_type: inner.identity.role.user_type().to_string(),
    });
    if let Err(err) = join.to_wire().and_then(|wire| inner.emit_wire(wire)) {
        error!(tag = "[Channel]", error = %err, "Failed to bind session identity");
    }
    inner.dispatch(events::names::CONNECT, InboundEvent::Connect);
}

fn expire_credentials(inner: &ChannelInner, credentials: &dyn CredentialStore, reason: &str) {
    warn!(tag = "[Channel]", reason = %reason, "Credential rejected, clearing stored tokens");
    if let Err(err) = credentials.clear_all() {
        error!(tag = "[Channel]", error = %err, "Failed to clear credentials");
    }
    inner.install(None);
    inner.set_state(ChannelState::AuthExpired);
    inner.dispatch(
        events::names::CONNECT_ERROR,
        InboundEvent::connect_error(reason),
    );
}

/// Why a live connection ended.
enum LinkEnd {
    Closed(String),
    Rejected(String),
}

async fn pump(inner: &ChannelInner, mut link: TransportLink) -> LinkEnd {
    while let Some(signal) = link.inbound.recv().await {
        match signal {
            TransportSignal::Event(wire) => {
                let name = wire.name.to_owned();
                match InboundEvent::from_wire(wire) {
                    Ok(event) => inner.dispatch(&name, event),
                    Err(err) => {
                        debug!(tag = "[Channel]", event = %name, error = %err, "Dropping undecodable event")
                    }
                }
            }
            TransportSignal::Rejected(reason) => return LinkEnd::Rejected(reason),
            TransportSignal::Closed(reason) => return LinkEnd::Closed(reason),
        }
    }
    LinkEnd::Closed("transport close".to_string())
}

async fn supervise(
    inner: Arc<ChannelInner>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    settings: ChannelSettings,
    mut link: Option<TransportLink>,
    mut failed_attempts: u32,
) {
    loop {
        if let Some(live) = link.take() {
            failed_attempts = 0;
            match pump(&inner, live).await {
                LinkEnd::Rejected(reason) if is_credential_rejection(&reason) => {
                    expire_credentials(&inner, credentials.as_ref(), &reason);
                    return;
                }
                LinkEnd::Rejected(reason) | LinkEnd::Closed(reason) => {
                    inner.install(None);
                    inner.set_state(ChannelState::Connecting);
                    warn!(tag = "[Channel]", reason = %reason, "Disconnected");
                    inner.dispatch(
                        events::names::DISCONNECT,
                        InboundEvent::disconnect(&reason),
                    );
                }
            }
        }

        if failed_attempts >= settings.reconnect_max_attempts {
            error!(tag = "[Channel]", attempts = failed_attempts, "Giving up reconnecting");
            inner.set_state(ChannelState::Disconnected);
            return;
        }

        inner.set_state(ChannelState::Connecting);
        tokio::time::sleep(settings.reconnect_delay).await;

        let Some(token): Option<Token> = credentials.active_token() else {
            warn!(tag = "[Channel]", "Credential removed while reconnecting");
            inner.set_state(ChannelState::Disconnected);
            return;
        };

        CHANNEL_RECONNECTS.inc();
        info!(tag = "[Channel]", attempt = failed_attempts + 1, "Reconnecting");

        match transport.open(&token).await {
            Ok(live) => {
                establish(&inner, &live.outbound);
                link = Some(live);
            }
            Err(ConnectError::Rejected(reason)) if is_credential_rejection(&reason) => {
                expire_credentials(&inner, credentials.as_ref(), &reason);
                return;
            }
            Err(err) => {
                failed_attempts += 1;
                warn!(tag = "[Channel]", error = %err, attempt = failed_attempts, "Reconnect failed");
                inner.dispatch(
                    events::names::CONNECT_ERROR,
                    InboundEvent::connect_error(&err.to_string()),
                );
            }
        }
    }
}
