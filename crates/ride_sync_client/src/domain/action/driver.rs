/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Captain side of the ride lifecycle.
//!
//! Besides following server pushes, the captain owns two timers: the start code
//! countdown, which cancels the ride when it reaches zero, and the liveness ping sent
//! while the captain is available.

use super::lifecycle::{merge_record, RideContext};
use crate::channel::{
    events::{
        names, AvailabilityUpdate, InboundEvent, LastSeenUpdate, OutboundEvent, RideRef,
        RideStatusSignal,
    },
    Channel, Subscription,
};
use crate::common::{
    types::*,
    utils::{format_countdown, validate_otp_format, InFlight, TaskGuard},
};
use crate::domain::{
    state_machine::Effect,
    store::ActiveRide,
    types::{
        ride::{AcceptOutcome, CancelOutcome},
        ui::{Panel, UiEvent, UiNotifier},
    },
};
use crate::outbound::external::RideApi;
use crate::tools::error::AppError;
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const OTP_EXPIRED_REASON: &str = "OTP expired";
pub const CAPTAIN_CANCELLATION_REASON: &str = "Cancelled by captain";

#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub otp_expiry_seconds: u32,
    pub liveness_ping_interval: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings {
            otp_expiry_seconds: 300,
            liveness_ping_interval: Duration::from_secs(5),
        }
    }
}

struct DriverState {
    ctx: RideContext,
    channel: Arc<Channel>,
    api: Arc<dyn RideApi>,
    settings: DriverSettings,
    popup: Mutex<Option<Ride>>,
    accept_in_flight: AtomicBool,
    available: AtomicBool,
    countdown: Mutex<Option<TaskGuard>>,
    liveness: Mutex<Option<TaskGuard>>,
}

pub struct DriverOrchestrator {
    state: Arc<DriverState>,
    _listener: TaskGuard,
}

impl Drop for DriverOrchestrator {
    fn drop(&mut self) {
        self.state.stop_countdown();
        self.state.stop_liveness();
    }
}

impl DriverOrchestrator {
    /// Starts following pushes for the captain session. The captain goes available
    /// unless `ride` already holds a ride.
    pub fn start(
        channel: Arc<Channel>,
        api: Arc<dyn RideApi>,
        ride: ActiveRide,
        ui: UiNotifier,
        settings: DriverSettings,
    ) -> Self {
        let state = Arc::new(DriverState {
            ctx: RideContext {
                role: Role::Driver,
                ride,
                ui,
            },
            channel,
            api,
            settings,
            popup: Mutex::new(None),
            accept_in_flight: AtomicBool::new(false),
            available: AtomicBool::new(false),
            countdown: Mutex::new(None),
            liveness: Mutex::new(None),
        });

        let mut subscribed = vec![names::NEW_RIDE, names::RIDE_STATUS_UPDATED];
        subscribed.extend(names::LIFECYCLE);
        let subscription = state.channel.subscribe(&subscribed);
        let listener = TaskGuard::spawn(listen(state.clone(), subscription));

        if !state.ctx.ride.is_active() {
            if let Err(err) = state.apply_availability(true) {
                debug!(tag = "[Availability]", error = %err, "Availability will be announced on connect");
            }
        }

        DriverOrchestrator {
            state,
            _listener: listener,
        }
    }

    pub fn active_ride(&self) -> ActiveRide {
        self.state.ctx.ride.to_owned()
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::Acquire)
    }

    /// The ride request currently offered to the captain.
    pub fn popup(&self) -> Option<Ride> {
        self.state
            .popup
            .lock()
            .ok()
            .and_then(|popup| popup.to_owned())
    }

    pub fn dismiss_popup(&self, ride_id: &RideId) -> bool {
        self.state.close_popup(ride_id)
    }

    /// Accepts the ride offered in the popup.
    ///
    /// While an earlier accept is still waiting for the server, nothing is sent and
    /// `AlreadyInFlight` is returned.
    pub async fn accept_ride(&self, ride_id: &RideId) -> Result<AcceptOutcome, AppError> {
        let state = &self.state;
        let offered = state
            .popup_ride(ride_id)
            .ok_or_else(|| AppError::RidePopupNotOpen(ride_id.to_owned()))?;

        let Some(_in_flight) = InFlight::acquire(&state.accept_in_flight) else {
            info!(tag = "[Ride Accept]", ride_id = %ride_id, "Accept already in flight");
            return Ok(AcceptOutcome::AlreadyInFlight);
        };

        if let Some(active) = state.ctx.ride.ride_id() {
            return Err(AppError::ActiveRideExists(active));
        }

        let confirmed = match state.api.confirm_ride(ride_id).await {
            Ok(confirmed) => confirmed,
            Err(err) => {
                error!(tag = "[Ride Accept]", ride_id = %ride_id, error = %err, "Confirmation failed");
                state.ctx.ui.error(&err);
                return Err(err);
            }
        };

        state.close_popup(ride_id);
        if let Err(err) = state.ctx.ride.claim(Ride {
            status: RideStatus::Requested,
            ..merge_record(offered, Some(confirmed))
        }) {
            error!(tag = "[Ride Accept]", ride_id = %ride_id, error = %err, "Another ride became active during confirmation");
            state.ctx.ui.error(&err);
            return Err(err);
        }

        if let Err(err) = state.channel.emit(OutboundEvent::RideAccept(RideRef {
            ride_id: ride_id.to_owned(),
        })) {
            warn!(tag = "[Ride Accept]", ride_id = %ride_id, error = %err, "Accept signal not sent");
        }

        state
            .ctx
            .apply_status(ride_id, RideStatus::Accepted, None, None);
        if let Err(err) = state.apply_availability(false) {
            warn!(tag = "[Availability]", error = %err, "Unavailability not announced");
        }
        state.start_countdown(ride_id);

        state
            .ctx
            .ride
            .snapshot()
            .map(AcceptOutcome::Accepted)
            .ok_or(AppError::NoActiveRide)
    }

    /// Starts the ride with the code the rider read out. Only the server checks the code.
    pub async fn start_ride(&self, ride_id: &RideId, otp: &Otp) -> Result<Ride, AppError> {
        let state = &self.state;
        let current = state.current(ride_id)?;
        if !matches!(
            current.status,
            RideStatus::Accepted | RideStatus::OnTheWay
        ) {
            return Err(AppError::InvalidRideStatus(
                ride_id.to_owned(),
                current.status,
            ));
        }
        validate_otp_format(otp)?;

        match state.api.start_ride(ride_id, otp).await {
            Ok(started) => {
                state.stop_countdown();
                if let Some(effects) =
                    state
                        .ctx
                        .apply_status(ride_id, RideStatus::InProgress, Some(started), None)
                {
                    state.after_transition(&effects);
                }
                state.ctx.ride.snapshot().ok_or(AppError::NoActiveRide)
            }
            Err(AppError::DomainRejection(message)) => {
                warn!(tag = "[Ride Start]", ride_id = %ride_id, reason = %message, "Start code rejected");
                state.ctx.ui.notify(UiEvent::OtpRejected {
                    message: message.to_owned(),
                });
                Err(AppError::DomainRejection(message))
            }
            Err(err) => {
                error!(tag = "[Ride Start]", ride_id = %ride_id, error = %err);
                state.ctx.ui.error(&err);
                Err(err)
            }
        }
    }

    /// Ends an in-progress ride and makes the captain available again.
    pub async fn end_ride(&self, ride_id: &RideId) -> Result<Ride, AppError> {
        let state = &self.state;
        let current = state.current(ride_id)?;
        if current.status != RideStatus::InProgress {
            return Err(AppError::InvalidRideStatus(
                ride_id.to_owned(),
                current.status,
            ));
        }

        let ended = state.api.end_ride(ride_id).await.map_err(|err| {
            error!(tag = "[Ride End]", ride_id = %ride_id, error = %err);
            state.ctx.ui.error(&err);
            err
        })?;

        let completed = Ride {
            status: RideStatus::Completed,
            ..merge_record(current, Some(ended))
        };
        if let Some(effects) = state
            .ctx
            .apply_status(ride_id, RideStatus::Completed, None, None)
        {
            state.after_transition(&effects);
        }
        Ok(completed)
    }

    /// Cancels the active ride on the server, then tells the rider.
    pub async fn cancel_ride(&self, reason: Option<&str>) -> Result<CancelOutcome, AppError> {
        self.state.cancel(reason).await
    }

    /// Goes on or off duty. Refused while the channel is down, so the server never
    /// disagrees with what the captain sees.
    pub fn set_availability(&self, is_available: bool) -> Result<(), AppError> {
        let state = &self.state;
        if is_available {
            if let Some(ride_id) = state.ctx.ride.ride_id() {
                return Err(AppError::ActiveRideExists(ride_id));
            }
        }
        if !state.channel.is_connected() {
            return Err(AppError::ChannelNotConnected);
        }
        state.apply_availability(is_available)
    }
}

impl DriverState {
    fn current(&self, ride_id: &RideId) -> Result<Ride, AppError> {
        self.ctx
            .ride
            .snapshot()
            .filter(|ride| ride.ride_id == *ride_id)
            .ok_or(AppError::NoActiveRide)
    }

    fn popup_ride(&self, ride_id: &RideId) -> Option<Ride> {
        self.popup
            .lock()
            .ok()
            .and_then(|popup| popup.to_owned())
            .filter(|ride| ride.ride_id == *ride_id)
    }

    fn open_popup(&self, mut ride: Ride) {
        if let Some(active) = self.ctx.ride.ride_id() {
            warn!(tag = "[New Ride]", active_ride_id = %active, ride_id = %ride.ride_id, "Ride already active, ignoring request");
            return;
        }
        let Ok(mut popup) = self.popup.lock() else {
            return;
        };
        if let Some(open) = popup.as_ref() {
            if open.ride_id != ride.ride_id {
                warn!(tag = "[New Ride]", open_ride_id = %open.ride_id, ride_id = %ride.ride_id, "Popup already open, ignoring request");
                return;
            }
        }
        info!(tag = "[New Ride]", ride_id = %ride.ride_id, "Ride request received");
        ride.status = RideStatus::Requested;
        *popup = Some(ride.to_owned());
        drop(popup);
        self.ctx.ui.notify(UiEvent::NewRideRequest { ride });
        self.ctx
            .ui
            .notify(UiEvent::PanelChanged(Panel::NewRidePopup));
    }

    fn close_popup(&self, ride_id: &RideId) -> bool {
        let closed = match self.popup.lock() {
            Ok(mut popup) if popup.as_ref().is_some_and(|open| open.ride_id == *ride_id) => {
                popup.take().is_some()
            }
            _ => false,
        };
        if closed {
            self.ctx.ui.notify(UiEvent::RidePopupClosed {
                ride_id: ride_id.to_owned(),
            });
        }
        closed
    }

    fn after_transition(self: &Arc<Self>, effects: &[Effect]) {
        if !matches!(
            self.ctx.ride.status(),
            Some(RideStatus::Accepted | RideStatus::OnTheWay)
        ) {
            self.stop_countdown();
        }
        if effects.contains(&Effect::RestoreAvailability) {
            if let Err(err) = self.apply_availability(true) {
                warn!(tag = "[Availability]", error = %err, "Availability not announced");
            }
        }
    }

    async fn cancel(self: &Arc<Self>, reason: Option<&str>) -> Result<CancelOutcome, AppError> {
        let ride_id = self.ctx.ride.ride_id().ok_or(AppError::NoActiveRide)?;
        let reason = reason
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .unwrap_or(CAPTAIN_CANCELLATION_REASON)
            .to_string();

        if let Err(err) = self.api.cancel_ride(&ride_id, &reason).await {
            error!(tag = "[Ride Cancel]", ride_id = %ride_id, error = %err, "Cancellation failed");
            self.ctx.ui.error(&err);
            return Err(err);
        }
        info!(tag = "[Ride Cancel]", ride_id = %ride_id, reason = %reason);
        self.stop_countdown();

        if let Err(err) = self.channel.emit(OutboundEvent::RideStatus(RideStatusSignal {
            ride_id: ride_id.to_owned(),
            status: RideStatus::Cancelled,
            data: Some(json!({ "rideId": ride_id, "reason": reason })),
        })) {
            warn!(tag = "[Ride Cancel]", ride_id = %ride_id, error = %err, "Cancellation signal not sent");
        }

        if let Some(effects) = self.ctx.apply_status(
            &ride_id,
            RideStatus::Cancelled,
            None,
            Some(reason.to_owned()),
        ) {
            self.after_transition(&effects);
        }

        Ok(CancelOutcome {
            ride_id,
            reason,
            server_acknowledged: true,
        })
    }

    /// Records availability locally, then tells the server.
    fn apply_availability(self: &Arc<Self>, is_available: bool) -> Result<(), AppError> {
        if self.available.swap(is_available, Ordering::AcqRel) != is_available {
            info!(tag = "[Availability]", is_available = is_available);
            self.ctx
                .ui
                .notify(UiEvent::AvailabilityChanged { is_available });
        }
        if is_available {
            self.start_liveness();
        } else {
            self.stop_liveness();
        }
        self.announce_availability()
    }

    fn announce_availability(&self) -> Result<(), AppError> {
        self.channel
            .emit(OutboundEvent::UpdateAvailability(AvailabilityUpdate {
                user_id: self.channel.identity().party_id.to_owned(),
                is_available: self.available.load(Ordering::Acquire),
            }))
    }

    fn start_countdown(self: &Arc<Self>, ride_id: &RideId) {
        let guard = TaskGuard::spawn(run_countdown(
            Arc::downgrade(self),
            ride_id.to_owned(),
            self.settings.otp_expiry_seconds,
        ));
        if let Ok(mut countdown) = self.countdown.lock() {
            *countdown = Some(guard);
        }
    }

    fn stop_countdown(&self) {
        let stopped = self
            .countdown
            .lock()
            .ok()
            .and_then(|mut countdown| countdown.take());
        drop(stopped);
    }

    fn start_liveness(self: &Arc<Self>) {
        let Ok(mut liveness) = self.liveness.lock() else {
            return;
        };
        if liveness.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *liveness = Some(TaskGuard::spawn(run_liveness(
            Arc::downgrade(self),
            self.settings.liveness_ping_interval,
        )));
    }

    fn stop_liveness(&self) {
        let stopped = self
            .liveness
            .lock()
            .ok()
            .and_then(|mut liveness| liveness.take());
        drop(stopped);
    }
}

async fn listen(state: Arc<DriverState>, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            InboundEvent::NewRide(ride) => state.open_popup(*ride),
            InboundEvent::RideStatusUpdated(update) => {
                if update.status == RideStatus::Cancelled {
                    if let Some(ride_id) = update.ride_id() {
                        state.close_popup(&ride_id);
                    }
                }
                if let Some(effects) = state.ctx.apply_update(update) {
                    state.after_transition(&effects);
                }
            }
            lifecycle => {
                state.ctx.on_lifecycle(&state.channel, &lifecycle);
                if matches!(lifecycle, InboundEvent::Connect) {
                    if let Err(err) = state.announce_availability() {
                        warn!(tag = "[Availability]", error = %err, "Availability not announced");
                    }
                }
            }
        }
    }
}

/// Publishes the remaining time once per second and cancels the ride when it reaches
/// zero. Deadlines are measured from the start, so a slow tick never shortens the wait.
async fn run_countdown(state: Weak<DriverState>, ride_id: RideId, expiry_seconds: u32) {
    let started = Instant::now();
    for elapsed in 0..=expiry_seconds {
        tokio::time::sleep_until(started + Duration::from_secs(u64::from(elapsed))).await;
        let Some(state) = state.upgrade() else {
            return;
        };
        if !state.ctx.ride.is_ride(&ride_id) {
            return;
        }
        let remaining = expiry_seconds - elapsed;
        state.ctx.ui.notify(UiEvent::OtpCountdown {
            remaining_seconds: remaining,
            display: format_countdown(remaining),
        });
        if remaining == 0 {
            warn!(tag = "[OTP Countdown]", ride_id = %ride_id, "Start code expired, cancelling ride");
            // Cancelling stops this countdown, so it runs on its own task.
            let ride_id = ride_id.to_owned();
            tokio::spawn(async move {
                if let Err(err) = state.cancel(Some(OTP_EXPIRED_REASON)).await {
                    error!(tag = "[OTP Countdown]", ride_id = %ride_id, error = %err, "Expiry cancellation failed");
                    state.ctx.ui.notify(UiEvent::OtpExpiryCancelFailed {
                        ride_id,
                        error: err.error_body(),
                    });
                }
            });
        }
    }
}

async fn run_liveness(state: Weak<DriverState>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            return;
        };
        if !state.available.load(Ordering::Acquire) {
            return;
        }
        if !state.channel.is_connected() {
            continue;
        }
        let identity = state.channel.identity();
        let ping = OutboundEvent::UpdateLastSeen(LastSeenUpdate {
            user_id: identity.party_id.to_owned(),
            user_type: identity.role.user_type().to_string(),
        });
        if let Err(err) = state.channel.emit(ping) {
            debug!(tag = "[Liveness]", error = %err, "Ping not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{
        memory::{MemoryConnection, MemoryTransport},
        ChannelManager, ChannelSettings,
    };
    use crate::common::credentials::MemoryCredentialStore;
    use crate::domain::types::ui::RideOutcome;
    use crate::outbound::memory::{MemoryRideApi, RideCall};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        driver: DriverOrchestrator,
        api: Arc<MemoryRideApi>,
        connection: MemoryConnection,
        events: UnboundedReceiver<UiEvent>,
    }

    async fn harness(api: MemoryRideApi) -> Harness {
        let (transport, mut server) = MemoryTransport::pair();
        let manager = ChannelManager::new(
            Arc::new(transport),
            Arc::new(MemoryCredentialStore::with_token(Role::Driver, "t-1")),
            ChannelSettings::default(),
        );
        let channel = manager
            .connect(SessionIdentity {
                role: Role::Driver,
                party_id: PartyId("captain-1".to_string()),
            })
            .await
            .unwrap();
        let mut connection = server.accept().await.unwrap();
        connection.expect_event("join:ride").await.unwrap();

        let api = Arc::new(api);
        let (ui, events) = UiNotifier::channel();
        let driver = DriverOrchestrator::start(
            Arc::new(channel),
            api.clone(),
            ActiveRide::default(),
            ui,
            DriverSettings::default(),
        );
        Harness {
            driver,
            api,
            connection,
            events,
        }
    }

    fn offered(id: &str) -> Ride {
        Ride {
            ride_id: RideId(id.to_string()),
            pickup: Place::new(
                "Navrangpura",
                Point {
                    lat: Latitude(23.02),
                    lon: Longitude(72.57),
                },
            ),
            destination: Place::new(
                "Law Garden",
                Point {
                    lat: Latitude(23.05),
                    lon: Longitude(72.60),
                },
            ),
            vehicle_type: Some(VehicleType::Car),
            fare: Some(Fare {
                amount: 150.0,
                currency: "INR".to_string(),
            }),
            otp: Some(Otp("482915".to_string())),
            distance: None,
            duration: None,
            status: RideStatus::Requested,
            rider_id: Some(PartyId("user-1".to_string())),
            driver_id: None,
        }
    }

    async fn until<F>(events: &mut UnboundedReceiver<UiEvent>, wanted: F) -> UiEvent
    where
        F: Fn(&UiEvent) -> bool,
    {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    }

    /// Offers `ride` through a `new-ride` push and waits for the popup.
    async fn offer(harness: &mut Harness, ride: Ride) {
        harness.api.seed(ride.to_owned());
        harness
            .connection
            .push(names::NEW_RIDE, serde_json::to_value(&ride).unwrap());
        until(&mut harness.events, |event| {
            matches!(event, UiEvent::NewRideRequest { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn test_second_offer_is_ignored_while_popup_open() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        harness
            .connection
            .push(names::NEW_RIDE, serde_json::to_value(offered("ride-2")).unwrap());
        harness
            .connection
            .push(names::NEW_RIDE, serde_json::to_value(offered("ride-1")).unwrap());
        until(&mut harness.events, |event| {
            matches!(event, UiEvent::NewRideRequest { .. })
        })
        .await;
        assert_eq!(
            harness.driver.popup().map(|ride| ride.ride_id),
            Some(RideId("ride-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_new_ride_is_ignored_while_a_ride_is_active() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        harness.driver.accept_ride(&ride_id).await.unwrap();

        harness.api.seed(offered("ride-2"));
        harness
            .connection
            .push(names::NEW_RIDE, serde_json::to_value(offered("ride-2")).unwrap());
        harness.connection.push(
            names::RIDE_STATUS_UPDATED,
            json!({ "status": "on-the-way", "rideId": "ride-1" }),
        );

        let mut offers = 0;
        loop {
            match harness.events.recv().await.unwrap() {
                UiEvent::NewRideRequest { .. } => offers += 1,
                UiEvent::StatusChanged { to: RideStatus::OnTheWay, .. } => break,
                _ => {}
            }
        }
        assert_eq!(offers, 0);
        assert_eq!(harness.driver.popup(), None);
        let active = harness.driver.active_ride().snapshot().unwrap();
        assert_eq!(active.ride_id, ride_id);
        assert_eq!(active.status, RideStatus::OnTheWay);
    }

    #[tokio::test]
    async fn test_accept_requires_open_popup() {
        let harness = harness(MemoryRideApi::new()).await;
        assert_eq!(
            harness
                .driver
                .accept_ride(&RideId("ride-9".to_string()))
                .await,
            Err(AppError::RidePopupNotOpen(RideId("ride-9".to_string())))
        );
        assert!(harness.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_accepts_send_one_request() {
        let mut harness = harness(MemoryRideApi::with_latency(Duration::from_millis(800))).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());

        let (first, second) = tokio::join!(
            harness.driver.accept_ride(&ride_id),
            harness.driver.accept_ride(&ride_id)
        );
        assert!(matches!(first, Ok(AcceptOutcome::Accepted(ride)) if ride.status == RideStatus::Accepted));
        assert_eq!(second, Ok(AcceptOutcome::AlreadyInFlight));
        let confirms = harness
            .api
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RideCall::Confirm(_)))
            .count();
        assert_eq!(confirms, 1);
        assert_eq!(
            harness.connection.expect_event("ride:accept").await,
            Some(json!({ "rideId": "ride-1" }))
        );
    }

    #[tokio::test]
    async fn test_accept_goes_unavailable_and_opens_confirm_panel() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        harness
            .driver
            .accept_ride(&RideId("ride-1".to_string()))
            .await
            .unwrap();
        assert!(!harness.driver.is_available());
        assert_eq!(harness.driver.popup(), None);
        until(&mut harness.events, |event| {
            *event == UiEvent::PanelChanged(Panel::ConfirmRide)
        })
        .await;
        assert_eq!(
            harness.connection.expect_event("update:availability").await,
            Some(json!({ "userId": "captain-1", "isAvailable": true }))
        );
        assert_eq!(
            harness.connection.expect_event("update:availability").await,
            Some(json!({ "userId": "captain-1", "isAvailable": false }))
        );
        assert_eq!(
            harness.driver.set_availability(true),
            Err(AppError::ActiveRideExists(RideId("ride-1".to_string())))
        );
    }

    #[tokio::test]
    async fn test_wrong_code_keeps_ride_and_reprompts() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        harness.driver.accept_ride(&ride_id).await.unwrap();

        assert_eq!(
            harness
                .driver
                .start_ride(&ride_id, &Otp("12a456".to_string()))
                .await,
            Err(AppError::InvalidOtpFormat)
        );
        assert!(!harness
            .api
            .calls()
            .iter()
            .any(|call| matches!(call, RideCall::Start(..))));

        let rejected = harness
            .driver
            .start_ride(&ride_id, &Otp("000000".to_string()))
            .await;
        assert!(matches!(rejected, Err(AppError::DomainRejection(_))));
        assert_eq!(
            harness.driver.active_ride().status(),
            Some(RideStatus::Accepted)
        );
        until(&mut harness.events, |event| {
            matches!(event, UiEvent::OtpRejected { .. })
        })
        .await;

        let started = harness
            .driver
            .start_ride(&ride_id, &Otp("482915".to_string()))
            .await
            .unwrap();
        assert_eq!(started.status, RideStatus::InProgress);
        assert_eq!(
            harness
                .driver
                .start_ride(&ride_id, &Otp("482915".to_string()))
                .await,
            Err(AppError::InvalidRideStatus(
                ride_id.to_owned(),
                RideStatus::InProgress
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_cancels_exactly_at_zero() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        harness.driver.accept_ride(&ride_id).await.unwrap();
        until(&mut harness.events, |event| {
            matches!(event, UiEvent::OtpCountdown { remaining_seconds: 300, display } if display == "5:00")
        })
        .await;

        tokio::time::advance(Duration::from_secs(299)).await;
        until(&mut harness.events, |event| {
            matches!(event, UiEvent::OtpCountdown { remaining_seconds: 1, display } if display == "0:01")
        })
        .await;
        assert!(!harness
            .api
            .calls()
            .iter()
            .any(|call| matches!(call, RideCall::Cancel(..))));
        assert!(harness.driver.active_ride().is_ride(&ride_id));

        tokio::time::advance(Duration::from_secs(1)).await;
        until(&mut harness.events, |event| {
            *event
                == UiEvent::RideCleared {
                    ride_id: ride_id.to_owned(),
                    outcome: RideOutcome::Cancelled {
                        reason: OTP_EXPIRED_REASON.to_string(),
                    },
                }
        })
        .await;
        assert!(harness
            .api
            .calls()
            .contains(&RideCall::Cancel(ride_id, OTP_EXPIRED_REASON.to_string())));
        assert!(harness.driver.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_expiry_cancel_is_reported_and_keeps_the_ride() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        harness.driver.accept_ride(&ride_id).await.unwrap();
        harness
            .api
            .fail_next(AppError::ExternalAPICallError("timeout".to_string()));
        until(&mut harness.events, |event| {
            matches!(event, UiEvent::OtpCountdown { remaining_seconds: 300, .. })
        })
        .await;

        tokio::time::advance(Duration::from_secs(300)).await;
        let reported = until(&mut harness.events, |event| {
            matches!(event, UiEvent::OtpExpiryCancelFailed { .. })
        })
        .await;
        assert!(matches!(
            reported,
            UiEvent::OtpExpiryCancelFailed { ride_id: failed, .. } if failed == ride_id
        ));
        assert_eq!(
            harness.driver.active_ride().status(),
            Some(RideStatus::Accepted)
        );

        let outcome = harness.driver.cancel_ride(None).await.unwrap();
        assert_eq!(outcome.ride_id, ride_id);
        assert!(!harness.driver.active_ride().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stops_the_countdown() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        harness.driver.accept_ride(&ride_id).await.unwrap();
        harness
            .driver
            .start_ride(&ride_id, &Otp("482915".to_string()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(
            harness.driver.active_ride().status(),
            Some(RideStatus::InProgress)
        );
        assert!(!harness
            .api
            .calls()
            .iter()
            .any(|call| matches!(call, RideCall::Cancel(..))));
    }

    #[tokio::test]
    async fn test_end_restores_availability() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        assert_eq!(
            harness.driver.end_ride(&ride_id).await,
            Err(AppError::NoActiveRide)
        );
        harness.driver.accept_ride(&ride_id).await.unwrap();
        harness
            .driver
            .start_ride(&ride_id, &Otp("482915".to_string()))
            .await
            .unwrap();
        let ended = harness.driver.end_ride(&ride_id).await.unwrap();
        assert_eq!(ended.status, RideStatus::Completed);
        assert!(!harness.driver.active_ride().is_active());
        assert!(harness.driver.is_available());
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_the_ride() {
        let mut harness = harness(MemoryRideApi::new()).await;
        offer(&mut harness, offered("ride-1")).await;
        let ride_id = RideId("ride-1".to_string());
        harness.driver.accept_ride(&ride_id).await.unwrap();

        harness
            .api
            .fail_next(AppError::ExternalAPICallError("timeout".to_string()));
        assert!(harness.driver.cancel_ride(None).await.is_err());
        assert!(harness.driver.active_ride().is_ride(&ride_id));

        let outcome = harness.driver.cancel_ride(None).await.unwrap();
        assert_eq!(outcome.reason, CAPTAIN_CANCELLATION_REASON);
        assert_eq!(
            harness.connection.expect_event("ride:status").await,
            Some(json!({
                "rideId": "ride-1",
                "status": "cancelled",
                "data": { "rideId": "ride-1", "reason": CAPTAIN_CANCELLATION_REASON }
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_ping_only_while_available() {
        let mut harness = harness(MemoryRideApi::new()).await;
        assert_eq!(
            harness.connection.expect_event("update:lastSeen").await,
            Some(json!({ "userId": "captain-1", "userType": "Captain" }))
        );
        harness.driver.set_availability(false).unwrap();
        harness.connection.drain();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(harness
            .connection
            .drain()
            .iter()
            .all(|event| event.name != "update:lastSeen"));
    }
}
