/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Rider side of the ride lifecycle: requesting, cancelling and following server pushes.

use super::lifecycle::RideContext;
use crate::channel::{
    events::{names, InboundEvent, JoinRide, OutboundEvent, RideStatusSignal},
    Channel, Subscription,
};
use crate::common::{
    types::*,
    utils::{generate_otp, InFlight, TaskGuard},
};
use crate::domain::{
    state_machine::DEFAULT_CANCELLATION_REASON,
    store::ActiveRide,
    types::{
        ride::CancelOutcome,
        ui::{Panel, UiEvent, UiNotifier},
    },
};
use crate::outbound::{external::RideApi, types::CreateRideRequest};
use crate::tools::error::AppError;
use serde_json::json;
use std::sync::{atomic::AtomicBool, Arc};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RiderSettings {
    pub currency: String,
}

impl Default for RiderSettings {
    fn default() -> Self {
        RiderSettings {
            currency: "INR".to_string(),
        }
    }
}

struct RiderState {
    ctx: RideContext,
    channel: Arc<Channel>,
    api: Arc<dyn RideApi>,
    settings: RiderSettings,
    request_in_flight: AtomicBool,
}

pub struct RiderOrchestrator {
    state: Arc<RiderState>,
    _listener: TaskGuard,
}

impl RiderOrchestrator {
    pub fn start(
        channel: Arc<Channel>,
        api: Arc<dyn RideApi>,
        ride: ActiveRide,
        ui: UiNotifier,
        settings: RiderSettings,
    ) -> Self {
        let state = Arc::new(RiderState {
            ctx: RideContext {
                role: Role::Rider,
                ride,
                ui,
            },
            channel,
            api,
            settings,
            request_in_flight: AtomicBool::new(false),
        });

        let mut subscribed = vec![names::RIDE_STATUS_UPDATED];
        subscribed.extend(names::LIFECYCLE);
        let subscription = state.channel.subscribe(&subscribed);
        let listener = TaskGuard::spawn(listen(state.clone(), subscription));

        RiderOrchestrator {
            state,
            _listener: listener,
        }
    }

    pub fn active_ride(&self) -> ActiveRide {
        self.state.ctx.ride.to_owned()
    }

    /// Creates a ride with a freshly generated start code.
    ///
    /// The code is announced to the UI before the server answers and withdrawn through
    /// `RideRequestFailed` when creation fails.
    pub async fn request_ride(
        &self,
        pickup: Place,
        destination: Place,
        vehicle_type: VehicleType,
        fare: Fare,
    ) -> Result<Ride, AppError> {
        let state = &self.state;
        if let Some(ride_id) = state.ctx.ride.ride_id() {
            return Err(AppError::ActiveRideExists(ride_id));
        }
        if pickup.point().is_none() {
            return Err(AppError::IncompleteLocation(format!(
                "Pickup '{}' has no coordinates",
                pickup.address
            )));
        }
        if destination.point().is_none() {
            return Err(AppError::IncompleteLocation(format!(
                "Destination '{}' has no coordinates",
                destination.address
            )));
        }

        let _in_flight = InFlight::acquire(&state.request_in_flight).ok_or_else(|| {
            AppError::InvalidRequest("A ride request is already in flight".to_string())
        })?;

        let otp = generate_otp();
        state.ctx.ui.notify(UiEvent::OtpGenerated {
            otp: otp.to_owned(),
        });

        let request = CreateRideRequest {
            pickup,
            destination,
            vehicle_type,
            fare,
            otp: otp.to_owned(),
        };

        match state.api.create_ride(request).await {
            Ok(created) => {
                let ride = Ride {
                    status: RideStatus::Requested,
                    otp: created.otp.to_owned().or(Some(otp)),
                    ..created
                };
                info!(tag = "[Ride Request]", ride_id = %ride.ride_id, vehicle_type = %vehicle_type, "Ride created");
                if let Err(err) = state.ctx.ride.claim(ride.to_owned()) {
                    error!(tag = "[Ride Request]", ride_id = %ride.ride_id, error = %err, "Another ride became active during creation");
                    state.ctx.ui.notify(UiEvent::RideRequestFailed {
                        error: err.error_body(),
                    });
                    return Err(err);
                }

                if let Err(err) = state.channel.emit(OutboundEvent::JoinRide(JoinRide::Room {
                    ride_id: ride.ride_id.to_owned(),
                })) {
                    warn!(tag = "[Ride Room]", ride_id = %ride.ride_id, error = %err, "Room join deferred to reconnect");
                }

                state.ctx.ui.notify(UiEvent::RideRequested {
                    ride: ride.to_owned(),
                });
                state
                    .ctx
                    .ui
                    .notify(UiEvent::PanelChanged(Panel::LookingForDriver));
                Ok(ride)
            }
            Err(err) => {
                error!(tag = "[Ride Request]", error = %err, "Ride creation failed");
                state.ctx.ui.notify(UiEvent::RideRequestFailed {
                    error: err.error_body(),
                });
                if matches!(err, AppError::CredentialExpired(_)) {
                    state.ctx.ui.notify(UiEvent::ReauthenticationRequired);
                }
                Err(err)
            }
        }
    }

    /// Cancels the active ride without waiting for the captain.
    ///
    /// Local state is cleared even when the server does not acknowledge.
    pub async fn cancel_ride(&self, reason: &str) -> Result<CancelOutcome, AppError> {
        let state = &self.state;
        let ride_id = state.ctx.ride.ride_id().ok_or(AppError::NoActiveRide)?;
        let reason = match reason.trim() {
            "" => DEFAULT_CANCELLATION_REASON.to_string(),
            reason => reason.to_string(),
        };

        if let Err(err) = state.channel.emit(OutboundEvent::RideStatus(RideStatusSignal {
            ride_id: ride_id.to_owned(),
            status: RideStatus::Cancelled,
            data: Some(json!({ "rideId": ride_id, "reason": reason })),
        })) {
            warn!(tag = "[Ride Cancel]", ride_id = %ride_id, error = %err, "Cancellation signal not sent");
        }

        state
            .ctx
            .apply_status(&ride_id, RideStatus::Cancelled, None, Some(reason.to_owned()));

        let server_acknowledged = match state.api.cancel_ride(&ride_id, &reason).await {
            Ok(()) => true,
            Err(err) => {
                error!(tag = "[Ride Cancel]", ride_id = %ride_id, error = %err, "Server did not acknowledge cancellation");
                state.ctx.ui.error(&err);
                false
            }
        };

        Ok(CancelOutcome {
            ride_id,
            reason,
            server_acknowledged,
        })
    }

    /// Fare per vehicle type, with distance and duration. Never touches ride state.
    pub async fn get_fare(
        &self,
        pickup: &Place,
        destination: &Place,
    ) -> Result<FareQuote, AppError> {
        if pickup.address.trim().is_empty() || destination.address.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "Pickup and destination are required".to_string(),
            ));
        }
        self.state.api.get_fare(pickup, destination).await
    }

    /// The fare to submit for `vehicle_type`, in the configured currency.
    pub fn fare_for(&self, quote: &FareQuote, vehicle_type: &VehicleType) -> Option<Fare> {
        quote.fare_for(vehicle_type, &self.state.settings.currency)
    }
}

async fn listen(state: Arc<RiderState>, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            InboundEvent::RideStatusUpdated(update) => {
                state.ctx.apply_update(update);
            }
            lifecycle => state.ctx.on_lifecycle(&state.channel, &lifecycle),
        }
    }
}
