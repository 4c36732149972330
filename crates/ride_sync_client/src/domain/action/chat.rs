/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Chat between rider and captain, scoped to one ride.
//!
//! A [`ChatSession`] joins the ride's chat room when created and leaves it when dropped.

use crate::channel::{
    events::{
        names, InboundEvent, MessageReceipt, OutgoingMessage, OutboundEvent, ReadReceipt, RideRef,
        TypingNotice, TypingSignal,
    },
    Channel, Subscription,
};
use crate::common::{types::*, utils::TaskGuard};
use crate::domain::types::ui::{UiEvent, UiNotifier};
use crate::tools::error::AppError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub typing_idle_timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        ChatSettings {
            typing_idle_timeout: Duration::from_millis(2000),
        }
    }
}

enum Arrival {
    New { unread: Option<usize> },
    Known { advanced: bool },
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
    unread: usize,
    focused: bool,
    counterpart_typing: bool,
}

struct ChatInner {
    channel: Arc<Channel>,
    ride_id: RideId,
    ui: UiNotifier,
    settings: ChatSettings,
    conversation: Mutex<Conversation>,
    typing: AtomicBool,
    typing_timer: Mutex<Option<TaskGuard>>,
}

pub struct ChatSession {
    inner: Arc<ChatInner>,
    _pump: TaskGuard,
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.inner.stop_typing();
        let leave = OutboundEvent::LeaveRideChat(RideRef {
            ride_id: self.inner.ride_id.to_owned(),
        });
        match self.inner.channel.emit(leave) {
            Ok(()) => info!(tag = "[Chat]", ride_id = %self.inner.ride_id, "Left ride chat"),
            Err(err) => {
                debug!(tag = "[Chat]", ride_id = %self.inner.ride_id, error = %err, "Leave not sent")
            }
        }
    }
}

impl ChatSession {
    pub fn join(
        channel: Arc<Channel>,
        ride_id: RideId,
        ui: UiNotifier,
        settings: ChatSettings,
    ) -> Self {
        let inner = Arc::new(ChatInner {
            channel,
            ride_id,
            ui,
            settings,
            conversation: Mutex::new(Conversation::default()),
            typing: AtomicBool::new(false),
            typing_timer: Mutex::new(None),
        });

        let subscription = inner.channel.subscribe(&[
            names::CONNECT,
            names::MESSAGE_HISTORY,
            names::RECEIVE_MESSAGE,
            names::USER_TYPING,
            names::MESSAGE_DELIVERED,
            names::MESSAGE_READ,
            names::MESSAGE_ERROR,
        ]);
        inner.enter_room();
        let pump = TaskGuard::spawn(pump(inner.clone(), subscription));

        ChatSession { inner, _pump: pump }
    }

    pub fn ride_id(&self) -> &RideId {
        &self.inner.ride_id
    }

    /// Sends `text` to the counterpart. Blank text is refused without touching the channel.
    pub fn send(&self, text: &str) -> Result<(), AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::EmptyMessage);
        }
        let identity = self.inner.channel.identity();
        self.inner
            .channel
            .emit(OutboundEvent::SendMessage(OutgoingMessage {
                ride_id: self.inner.ride_id.to_owned(),
                text: text.to_string(),
                sender: identity.role,
                sender_id: identity.party_id.to_owned(),
            }))?;
        self.inner.stop_typing();
        Ok(())
    }

    /// Call on every keystroke. Announces typing once, then withdraws it after the idle
    /// timeout unless another keystroke comes first.
    pub fn key_pressed(&self) {
        if !self.inner.typing.swap(true, Ordering::AcqRel) {
            self.inner.signal_typing(true);
        }
        let timer = TaskGuard::spawn(typing_timeout(
            Arc::downgrade(&self.inner),
            self.inner.settings.typing_idle_timeout,
        ));
        if let Ok(mut typing_timer) = self.inner.typing_timer.lock() {
            *typing_timer = Some(timer);
        }
    }

    pub fn mark_read(&self, message_id: &MessageId) -> Result<(), AppError> {
        let known = self
            .inner
            .conversation
            .lock()
            .map(|conversation| {
                conversation
                    .messages
                    .iter()
                    .any(|message| message.id == *message_id)
            })
            .unwrap_or(false);
        if !known {
            return Err(AppError::UnknownMessage(message_id.to_owned()));
        }
        self.inner.mark_read(message_id)
    }

    /// Focus resets the unread count.
    pub fn set_focused(&self, focused: bool) {
        let reset = match self.inner.conversation.lock() {
            Ok(mut conversation) => {
                conversation.focused = focused;
                let had_unread = conversation.unread > 0;
                if focused {
                    conversation.unread = 0;
                }
                focused && had_unread
            }
            Err(_) => false,
        };
        if reset {
            self.inner.ui.notify(UiEvent::ChatUnread { count: 0 });
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner
            .conversation
            .lock()
            .map(|conversation| conversation.messages.to_owned())
            .unwrap_or_default()
    }

    pub fn unread_count(&self) -> usize {
        self.inner
            .conversation
            .lock()
            .map(|conversation| conversation.unread)
            .unwrap_or_default()
    }

    pub fn counterpart_typing(&self) -> bool {
        self.inner
            .conversation
            .lock()
            .map(|conversation| conversation.counterpart_typing)
            .unwrap_or_default()
    }

    pub fn is_typing(&self) -> bool {
        self.inner.typing.load(Ordering::Acquire)
    }
}

impl ChatInner {
    fn enter_room(&self) {
        let join = OutboundEvent::JoinRideChat(RideRef {
            ride_id: self.ride_id.to_owned(),
        });
        match self.channel.emit(join) {
            Ok(()) => info!(tag = "[Chat]", ride_id = %self.ride_id, "Joined ride chat"),
            Err(err) => {
                warn!(tag = "[Chat]", ride_id = %self.ride_id, error = %err, "Join deferred to reconnect")
            }
        }
    }

    fn is_own(&self, message: &ChatMessage) -> bool {
        message.sender_id == self.channel.identity().party_id
    }

    fn signal_typing(&self, is_typing: bool) {
        // Typing signals are not retried.
        if let Err(err) = self.channel.emit(OutboundEvent::Typing(TypingSignal {
            ride_id: self.ride_id.to_owned(),
            is_typing,
        })) {
            debug!(tag = "[Chat]", error = %err, "Typing signal not sent");
        }
    }

    fn stop_typing(&self) {
        let timer = self
            .typing_timer
            .lock()
            .ok()
            .and_then(|mut typing_timer| typing_timer.take());
        drop(timer);
        if self.typing.swap(false, Ordering::AcqRel) {
            self.signal_typing(false);
        }
    }

    fn mark_read(&self, message_id: &MessageId) -> Result<(), AppError> {
        self.channel
            .emit(OutboundEvent::MarkMessageRead(ReadReceipt {
                message_id: message_id.to_owned(),
                ride_id: self.ride_id.to_owned(),
            }))
    }

    fn mark_read_quietly(&self, message_id: &MessageId) {
        if let Err(err) = self.mark_read(message_id) {
            debug!(tag = "[Chat]", message_id = %message_id, error = %err, "Read receipt not sent");
        }
    }

    /// Merges a history snapshot into the conversation. Known messages keep their place
    /// and only ever move their status forward; unknown ones are appended in order.
    fn on_history(&self, history: Vec<ChatMessage>) {
        let to_acknowledge: Vec<MessageId> = match self.conversation.lock() {
            Ok(mut conversation) => {
                for message in history
                    .into_iter()
                    .filter(|message| message.ride_id == self.ride_id)
                {
                    match conversation
                        .messages
                        .iter()
                        .position(|known| known.id == message.id)
                    {
                        Some(index) => {
                            conversation.messages[index].status.advance(message.status);
                        }
                        None => conversation.messages.push(message),
                    }
                }
                conversation
                    .messages
                    .iter()
                    .filter(|message| !self.is_own(message) && message.status != MessageStatus::Read)
                    .map(|message| message.id.to_owned())
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for message_id in to_acknowledge.iter() {
            self.mark_read_quietly(message_id);
        }
    }

    fn on_message(&self, message: ChatMessage) {
        if message.ride_id != self.ride_id {
            debug!(tag = "[Chat]", ride_id = %message.ride_id, "Message for another ride dropped");
            return;
        }
        let own = self.is_own(&message);
        let arrival = match self.conversation.lock() {
            Ok(mut conversation) => {
                match conversation
                    .messages
                    .iter()
                    .position(|known| known.id == message.id)
                {
                    Some(index) => Arrival::Known {
                        advanced: conversation.messages[index].status.advance(message.status),
                    },
                    None => {
                        conversation.messages.push(message.to_owned());
                        let unread = if !own && !conversation.focused {
                            conversation.unread += 1;
                            Some(conversation.unread)
                        } else {
                            None
                        };
                        Arrival::New { unread }
                    }
                }
            }
            Err(_) => return,
        };

        match arrival {
            Arrival::New { unread } => {
                if !own {
                    self.mark_read_quietly(&message.id);
                }
                self.ui.notify(UiEvent::ChatMessage { message });
                if let Some(count) = unread {
                    self.ui.notify(UiEvent::ChatUnread { count });
                }
            }
            Arrival::Known { advanced: true } => self.ui.notify(UiEvent::ChatMessageStatus {
                message_id: message.id,
                status: message.status,
            }),
            Arrival::Known { advanced: false } => {
                debug!(tag = "[Chat]", message_id = %message.id, "Message delivered again")
            }
        }
    }

    fn on_receipt(&self, receipt: MessageReceipt, status: MessageStatus) {
        if receipt
            .ride_id
            .as_ref()
            .is_some_and(|ride_id| *ride_id != self.ride_id)
        {
            return;
        }
        let advanced = match self.conversation.lock() {
            Ok(mut conversation) => match conversation
                .messages
                .iter_mut()
                .find(|message| message.id == receipt.message_id)
            {
                Some(message) => Ok(message.status.advance(status)),
                None => Err(AppError::UnknownMessage(receipt.message_id.to_owned())),
            },
            Err(err) => Err(AppError::InternalError(err.to_string())),
        };
        match advanced {
            Ok(true) => self.ui.notify(UiEvent::ChatMessageStatus {
                message_id: receipt.message_id,
                status,
            }),
            Ok(false) => {
                debug!(tag = "[Chat]", message_id = %receipt.message_id, status = %status, "Stale receipt")
            }
            Err(err) => debug!(tag = "[Chat]", error = %err, "Receipt dropped"),
        }
    }

    fn on_typing(&self, notice: TypingNotice) {
        if notice
            .ride_id
            .as_ref()
            .is_some_and(|ride_id| *ride_id != self.ride_id)
            || notice.user_id.as_ref() == Some(&self.channel.identity().party_id)
        {
            return;
        }
        let changed = match self.conversation.lock() {
            Ok(mut conversation) => {
                let changed = conversation.counterpart_typing != notice.is_typing;
                conversation.counterpart_typing = notice.is_typing;
                changed
            }
            Err(_) => false,
        };
        if changed {
            self.ui.notify(UiEvent::CounterpartTyping {
                is_typing: notice.is_typing,
            });
        }
    }
}

async fn pump(inner: Arc<ChatInner>, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            InboundEvent::Connect => inner.enter_room(),
            InboundEvent::MessageHistory(history) => inner.on_history(history),
            InboundEvent::ReceiveMessage(message) => inner.on_message(message),
            InboundEvent::UserTyping(notice) => inner.on_typing(notice),
            InboundEvent::MessageDelivered(receipt) => {
                inner.on_receipt(receipt, MessageStatus::Delivered)
            }
            InboundEvent::MessageRead(receipt) => inner.on_receipt(receipt, MessageStatus::Read),
            InboundEvent::MessageError(failure) => {
                warn!(tag = "[Chat]", ride_id = %inner.ride_id, error = %failure.message);
                inner.ui.notify(UiEvent::ChatError {
                    message: failure.message,
                });
            }
            _ => {}
        }
    }
}

async fn typing_timeout(inner: Weak<ChatInner>, idle: Duration) {
    tokio::time::sleep(idle).await;
    if let Some(inner) = inner.upgrade() {
        if inner.typing.swap(false, Ordering::AcqRel) {
            inner.signal_typing(false);
        }
    }
}
