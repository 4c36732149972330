/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! What the ride components tell the UI layer. Nothing here renders.

use super::ride::RouteEstimate;
use crate::channel::ChannelState;
use crate::common::types::*;
use crate::tools::error::{AppError, ErrorBody};
use strum_macros::Display;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Panel {
    Home,
    /// Rider: ride requested, looking for a captain.
    LookingForDriver,
    /// Rider: a captain accepted.
    RideAccepted,
    /// Rider: the captain is on the way.
    WaitingForDriver,
    /// Captain: incoming request.
    NewRidePopup,
    /// Captain: waiting for the rider's code.
    ConfirmRide,
    /// Both: the ride is under way.
    RideActive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RideOutcome {
    Completed,
    Cancelled { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    ConnectionChanged(ChannelState),
    ReauthenticationRequired,
    PanelChanged(Panel),

    /// Shown before the server confirms the ride, withdrawn by `RideRequestFailed`.
    OtpGenerated { otp: Otp },
    RideRequested { ride: Ride },
    RideRequestFailed { error: ErrorBody },
    StatusChanged {
        ride_id: RideId,
        from: RideStatus,
        to: RideStatus,
    },
    RideCleared {
        ride_id: RideId,
        outcome: RideOutcome,
    },

    NewRideRequest { ride: Ride },
    RidePopupClosed { ride_id: RideId },
    OtpCountdown { remaining_seconds: u32, display: String },
    OtpRejected { message: String },
    /// The expired code's cancellation did not reach the server. The ride stays until
    /// the captain cancels it by hand.
    OtpExpiryCancelFailed { ride_id: RideId, error: ErrorBody },
    AvailabilityChanged { is_available: bool },

    CounterpartLocation {
        sample: LocationSample,
        estimate: Option<RouteEstimate>,
    },
    LocationUnavailable { message: String },

    ChatMessage { message: ChatMessage },
    ChatMessageStatus {
        message_id: MessageId,
        status: MessageStatus,
    },
    ChatUnread { count: usize },
    CounterpartTyping { is_typing: bool },
    ChatError { message: String },

    Error(ErrorBody),
}

/// Sending half of the UI notification stream. A gone receiver is not an error.
#[derive(Debug, Clone)]
pub struct UiNotifier {
    sender: mpsc::UnboundedSender<UiEvent>,
}

impl UiNotifier {
    pub fn channel() -> (UiNotifier, mpsc::UnboundedReceiver<UiEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (UiNotifier { sender }, receiver)
    }

    pub fn notify(&self, event: UiEvent) {
        let _ = self.sender.send(event);
    }

    pub fn error(&self, error: &AppError) {
        if matches!(error, AppError::CredentialExpired(_)) {
            self.notify(UiEvent::ReauthenticationRequired);
        }
        self.notify(UiEvent::Error(error.error_body()));
    }
}
