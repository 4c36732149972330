/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Named events exchanged over the realtime channel.
//!
//! Both directions are adjacently tagged so that `{"event": <name>, "data": <payload>}`
//! maps one to one onto a socket.io event packet `["<name>", <payload>]`.

use crate::common::types::*;
use crate::tools::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod names {
    pub const CONNECT: &str = "connect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const DISCONNECT: &str = "disconnect";

    pub const NEW_RIDE: &str = "new-ride";
    pub const RIDE_STATUS_UPDATED: &str = "ride:status:updated";
    pub const CAPTAIN_LOCATION: &str = "captain-location";
    pub const MESSAGE_HISTORY: &str = "message-history";
    pub const RECEIVE_MESSAGE: &str = "receive-message";
    pub const USER_TYPING: &str = "user-typing";
    pub const MESSAGE_DELIVERED: &str = "message-delivered";
    pub const MESSAGE_READ: &str = "message-read";
    pub const MESSAGE_ERROR: &str = "message-error";

    pub const LIFECYCLE: [&str; 3] = [CONNECT, CONNECT_ERROR, DISCONNECT];
}

/// A raw named event as carried by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub name: String,
    pub payload: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum JoinRide {
    #[serde(rename_all = "camelCase")]
    Identity { user_id: PartyId, user_type: String },
    #[serde(rename_all = "camelCase")]
    Room { ride_id: RideId },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityUpdate {
    pub user_id: PartyId,
    pub is_available: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastSeenUpdate {
    pub user_id: PartyId,
    pub user_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub ride_id: RideId,
    pub lat: Latitude,
    pub lng: Longitude,
    pub accuracy: Option<Accuracy>,
    pub heading: Option<Direction>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideRef {
    pub ride_id: RideId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusSignal {
    pub ride_id: RideId,
    pub status: RideStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub ride_id: RideId,
    pub is_typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub ride_id: RideId,
    pub text: String,
    pub sender: Role,
    pub sender_id: PartyId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub ride_id: RideId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "join:ride")]
    JoinRide(JoinRide),
    #[serde(rename = "update:availability")]
    UpdateAvailability(AvailabilityUpdate),
    #[serde(rename = "update:lastSeen")]
    UpdateLastSeen(LastSeenUpdate),
    #[serde(rename = "update:location")]
    UpdateLocation(LocationUpdate),
    #[serde(rename = "ride:accept")]
    RideAccept(RideRef),
    #[serde(rename = "ride:status")]
    RideStatus(RideStatusSignal),
    #[serde(rename = "typing")]
    Typing(TypingSignal),
    #[serde(rename = "send-message")]
    SendMessage(OutgoingMessage),
    #[serde(rename = "join-ride-chat")]
    JoinRideChat(RideRef),
    #[serde(rename = "leave-ride-chat")]
    LeaveRideChat(RideRef),
    #[serde(rename = "mark-message-read")]
    MarkMessageRead(ReadReceipt),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusUpdate {
    pub status: RideStatus,
    #[serde(default)]
    pub ride_id: Option<RideId>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RideStatusUpdate {
    /// The full ride record, when the server attached one.
    pub fn ride(&self) -> Option<Ride> {
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value::<Ride>(data.to_owned()).ok())
    }

    pub fn ride_id(&self) -> Option<RideId> {
        self.ride_id.to_owned().or_else(|| {
            self.data.as_ref().and_then(|data| {
                data.get("_id")
                    .or_else(|| data.get("rideId"))
                    .and_then(Value::as_str)
                    .map(|id| RideId(id.to_string()))
            })
        })
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.to_owned().or_else(|| {
            self.data.as_ref().and_then(|data| {
                data.get("reason")
                    .or_else(|| data.get("cancellationReason"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartLocation {
    pub ride_id: RideId,
    pub lat: Latitude,
    pub lng: Longitude,
    #[serde(default)]
    pub accuracy: Option<Accuracy>,
    #[serde(default)]
    pub heading: Option<Direction>,
    #[serde(default)]
    pub timestamp: Option<TimeStamp>,
}

impl CounterpartLocation {
    pub fn to_sample(&self) -> LocationSample {
        LocationSample {
            latitude: self.lat,
            longitude: self.lng,
            accuracy: self.accuracy,
            heading: self.heading,
            timestamp: self.timestamp.unwrap_or_default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    #[serde(default)]
    pub ride_id: Option<RideId>,
    #[serde(default)]
    pub user_id: Option<PartyId>,
    pub is_typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceipt {
    pub message_id: MessageId,
    #[serde(default)]
    pub ride_id: Option<RideId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageFailure {
    #[serde(alias = "error")]
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LifecycleNotice {
    #[serde(default)]
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "connect_error")]
    ConnectError(LifecycleNotice),
    #[serde(rename = "disconnect")]
    Disconnect(LifecycleNotice),
    #[serde(rename = "new-ride")]
    NewRide(Box<Ride>),
    #[serde(rename = "ride:status:updated")]
    RideStatusUpdated(RideStatusUpdate),
    #[serde(rename = "captain-location")]
    CaptainLocation(CounterpartLocation),
    #[serde(rename = "message-history")]
    MessageHistory(Vec<ChatMessage>),
    #[serde(rename = "receive-message")]
    ReceiveMessage(ChatMessage),
    #[serde(rename = "user-typing")]
    UserTyping(TypingNotice),
    #[serde(rename = "message-delivered")]
    MessageDelivered(MessageReceipt),
    #[serde(rename = "message-read")]
    MessageRead(MessageReceipt),
    #[serde(rename = "message-error")]
    MessageError(MessageFailure),
}

impl OutboundEvent {
    pub fn to_wire(&self) -> Result<WireEvent, AppError> {
        let mut value =
            serde_json::to_value(self).map_err(|err| AppError::SerializationError(err.to_string()))?;
        let name = value
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::SerializationError("Missing event name".to_string()))?;
        let payload = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(WireEvent { name, payload })
    }
}

impl InboundEvent {
    pub fn from_wire(WireEvent { name, payload }: WireEvent) -> Result<InboundEvent, AppError> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("event".to_string(), Value::String(name.to_owned()));
        if name != names::CONNECT {
            envelope.insert("data".to_string(), payload);
        }
        serde_json::from_value(Value::Object(envelope))
            .map_err(|err| AppError::DeserializationError(format!("{name} : {err}")))
    }

    pub fn connect_error(reason: &str) -> InboundEvent {
        InboundEvent::ConnectError(LifecycleNotice {
            reason: reason.to_string(),
        })
    }

    pub fn disconnect(reason: &str) -> InboundEvent {
        InboundEvent::Disconnect(LifecycleNotice {
            reason: reason.to_string(),
        })
    }
}
