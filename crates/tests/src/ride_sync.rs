/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Rider and captain sessions played against one in-memory backend. The test body acts
//! as the realtime server, relaying what one side emits to the other.

use ride_sync_client::{
    channel::{
        memory::{connected_channel, MemoryConnection, MemoryServer},
        Channel, ChannelSettings,
    },
    common::types::*,
    domain::{
        action::{
            chat::{ChatSession, ChatSettings},
            driver::{DriverOrchestrator, DriverSettings, OTP_EXPIRED_REASON},
            rider::{RiderOrchestrator, RiderSettings},
            tracking::{RiderLocationTracker, TrackingSettings},
        },
        store::ActiveRide,
        types::{
            ride::{AcceptOutcome, RouteTarget},
            ui::{RideOutcome, UiEvent, UiNotifier},
        },
    },
    outbound::memory::{MemoryRideApi, RideCall},
    tools::error::AppError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Party<T> {
    session: T,
    channel: Arc<Channel>,
    ui: UiNotifier,
    connection: MemoryConnection,
    events: UnboundedReceiver<UiEvent>,
    _server: MemoryServer,
}

async fn connect(role: Role, party_id: &str) -> (Arc<Channel>, MemoryServer, MemoryConnection) {
    let (channel, server, connection) = connected_channel(
        SessionIdentity {
            role,
            party_id: PartyId(party_id.to_string()),
        },
        ChannelSettings::default(),
    )
    .await
    .expect("Channel did not connect");
    (Arc::new(channel), server, connection)
}

async fn rider_party(api: Arc<MemoryRideApi>) -> Party<RiderOrchestrator> {
    let (channel, server, connection) = connect(Role::Rider, "user-1").await;
    let (ui, events) = UiNotifier::channel();
    let session = RiderOrchestrator::start(
        channel.clone(),
        api,
        ActiveRide::default(),
        ui.clone(),
        RiderSettings::default(),
    );
    Party {
        session,
        channel,
        ui,
        connection,
        events,
        _server: server,
    }
}

async fn captain_party(
    api: Arc<MemoryRideApi>,
    settings: DriverSettings,
) -> Party<DriverOrchestrator> {
    let (channel, server, mut connection) = connect(Role::Driver, "captain-1").await;
    let (ui, events) = UiNotifier::channel();
    let session = DriverOrchestrator::start(
        channel.clone(),
        api,
        ActiveRide::default(),
        ui.clone(),
        settings,
    );
    assert_eq!(
        connection.expect_event("update:availability").await,
        Some(json!({ "userId": "captain-1", "isAvailable": true }))
    );
    Party {
        session,
        channel,
        ui,
        connection,
        events,
        _server: server,
    }
}

fn place(address: &str, lat: f64, lon: f64) -> Place {
    Place::new(
        address,
        Point {
            lat: Latitude(lat),
            lon: Longitude(lon),
        },
    )
}

fn inr(amount: f64) -> Fare {
    Fare {
        amount,
        currency: "INR".to_string(),
    }
}

/// Everything the UI received up to and including the first event `wanted` accepts.
async fn collect_until<F>(events: &mut UnboundedReceiver<UiEvent>, wanted: F) -> Vec<UiEvent>
where
    F: Fn(&UiEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.expect("UI stream closed");
        let done = wanted(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn until<F>(events: &mut UnboundedReceiver<UiEvent>, wanted: F) -> UiEvent
where
    F: Fn(&UiEvent) -> bool,
{
    let mut seen = collect_until(events, wanted).await;
    seen.pop().expect("UI stream closed")
}

fn push_status(connection: &MemoryConnection, ride_id: &RideId, status: RideStatus, data: Value) {
    assert!(connection.push(
        "ride:status:updated",
        json!({ "status": status, "rideId": ride_id, "data": data }),
    ));
}

fn status_changed_to(status: RideStatus) -> impl Fn(&UiEvent) -> bool {
    move |event| matches!(event, UiEvent::StatusChanged { to, .. } if *to == status)
}

fn is_cleared(event: &UiEvent) -> bool {
    matches!(event, UiEvent::RideCleared { .. })
}

async fn request_ride(rider: &mut Party<RiderOrchestrator>) -> Ride {
    let ride = rider
        .session
        .request_ride(
            place("Navrangpura", 23.02, 72.57),
            place("Law Garden", 23.05, 72.60),
            VehicleType::Car,
            inr(150.0),
        )
        .await
        .expect("Ride request failed");
    assert_eq!(
        rider.connection.expect_event("join:ride").await,
        Some(json!({ "rideId": ride.ride_id }))
    );
    ride
}

/// Offers `ride` to the captain, accepts it, and relays the acceptance to the rider.
async fn accept(
    api: &MemoryRideApi,
    rider: &mut Party<RiderOrchestrator>,
    captain: &mut Party<DriverOrchestrator>,
    ride: &Ride,
) {
    assert!(captain.connection.push("new-ride", json!(ride)));
    until(&mut captain.events, |event| {
        matches!(event, UiEvent::NewRideRequest { .. })
    })
    .await;

    let outcome = captain.session.accept_ride(&ride.ride_id).await.unwrap();
    assert!(
        matches!(outcome, AcceptOutcome::Accepted(ref accepted) if accepted.status == RideStatus::Accepted)
    );
    assert_eq!(
        captain.connection.expect_event("ride:accept").await,
        Some(json!({ "rideId": ride.ride_id }))
    );

    push_status(
        &rider.connection,
        &ride.ride_id,
        RideStatus::Accepted,
        json!(api.ride(&ride.ride_id)),
    );
    until(&mut rider.events, status_changed_to(RideStatus::Accepted)).await;
}

#[tokio::test]
async fn test_full_ride_reaches_completed_on_both_sides() {
    let api = Arc::new(MemoryRideApi::new());
    let mut rider = rider_party(api.clone()).await;
    let mut captain = captain_party(api.clone(), DriverSettings::default()).await;

    let ride = request_ride(&mut rider).await;
    assert_eq!(ride.status, RideStatus::Requested);
    assert_eq!(ride.fare, Some(inr(150.0)));
    accept(&api, &mut rider, &mut captain, &ride).await;
    assert!(!captain.session.is_available());

    let otp = ride.otp.to_owned().expect("Ride carries a start code");
    let started = captain.session.start_ride(&ride.ride_id, &otp).await.unwrap();
    assert_eq!(started.status, RideStatus::InProgress);
    push_status(
        &rider.connection,
        &ride.ride_id,
        RideStatus::InProgress,
        json!(api.ride(&ride.ride_id)),
    );
    until(&mut rider.events, status_changed_to(RideStatus::InProgress)).await;
    assert_eq!(
        rider.session.active_ride().status(),
        Some(RideStatus::InProgress)
    );

    let ended = captain.session.end_ride(&ride.ride_id).await.unwrap();
    assert_eq!(ended.status, RideStatus::Completed);
    assert_eq!(
        until(&mut captain.events, is_cleared).await,
        UiEvent::RideCleared {
            ride_id: ride.ride_id.to_owned(),
            outcome: RideOutcome::Completed,
        }
    );
    assert!(captain.session.is_available());
    assert!(!captain.session.active_ride().is_active());

    push_status(
        &rider.connection,
        &ride.ride_id,
        RideStatus::Completed,
        Value::Null,
    );
    assert_eq!(
        until(&mut rider.events, is_cleared).await,
        UiEvent::RideCleared {
            ride_id: ride.ride_id.to_owned(),
            outcome: RideOutcome::Completed,
        }
    );
    assert!(!rider.session.active_ride().is_active());

    let calls = api.calls();
    assert!(
        matches!(
            calls.as_slice(),
            [
                RideCall::Create(_),
                RideCall::Confirm(_),
                RideCall::Start(_, _),
                RideCall::End(_)
            ]
        ),
        "{:?}",
        calls
    );
}

#[tokio::test]
async fn test_rider_cancel_while_captain_on_the_way_frees_captain() {
    let api = Arc::new(MemoryRideApi::new());
    let mut rider = rider_party(api.clone()).await;
    let mut captain = captain_party(api.clone(), DriverSettings::default()).await;

    let ride = request_ride(&mut rider).await;
    accept(&api, &mut rider, &mut captain, &ride).await;

    push_status(&rider.connection, &ride.ride_id, RideStatus::OnTheWay, Value::Null);
    push_status(&captain.connection, &ride.ride_id, RideStatus::OnTheWay, Value::Null);
    until(&mut rider.events, status_changed_to(RideStatus::OnTheWay)).await;
    until(&mut captain.events, status_changed_to(RideStatus::OnTheWay)).await;

    let outcome = rider.session.cancel_ride("Changed plans").await.unwrap();
    assert!(outcome.server_acknowledged);
    assert_eq!(outcome.reason, "Changed plans");
    assert!(!rider.session.active_ride().is_active());

    let signal = rider
        .connection
        .expect_event("ride:status")
        .await
        .expect("Cancellation not emitted");
    assert_eq!(
        signal,
        json!({
            "rideId": ride.ride_id,
            "status": "cancelled",
            "data": { "rideId": ride.ride_id, "reason": "Changed plans" }
        })
    );

    assert!(captain.connection.push(
        "ride:status:updated",
        json!({ "status": "cancelled", "data": signal["data"] }),
    ));
    assert_eq!(
        until(&mut captain.events, is_cleared).await,
        UiEvent::RideCleared {
            ride_id: ride.ride_id.to_owned(),
            outcome: RideOutcome::Cancelled {
                reason: "Changed plans".to_string(),
            },
        }
    );
    until(&mut captain.events, |event| {
        matches!(event, UiEvent::AvailabilityChanged { is_available: true })
    })
    .await;
    assert!(captain.session.is_available());
    assert!(!captain.session.active_ride().is_active());
    assert_eq!(
        api.ride(&ride.ride_id).map(|ride| ride.status),
        Some(RideStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_positions_for_a_finished_ride_are_dropped() {
    let api = Arc::new(MemoryRideApi::new());
    let mut rider = rider_party(api.clone()).await;
    let tracker = RiderLocationTracker::start(
        &rider.channel,
        rider.session.active_ride(),
        rider.ui.clone(),
        TrackingSettings::default(),
    );

    let first = request_ride(&mut rider).await;
    assert!(rider.connection.push(
        "captain-location",
        json!({ "rideId": first.ride_id, "lat": 23.03, "lng": 72.58 }),
    ));
    match until(&mut rider.events, |event| {
        matches!(event, UiEvent::CounterpartLocation { .. })
    })
    .await
    {
        UiEvent::CounterpartLocation { sample, estimate } => {
            assert_eq!(sample.latitude, Latitude(23.03));
            let estimate = estimate.expect("Pickup has coordinates");
            assert_eq!(estimate.target, RouteTarget::Pickup);
            assert!(estimate.distance.0 > 0.0);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(tracker.latest().is_some());

    rider.session.cancel_ride("").await.unwrap();
    assert_eq!(tracker.latest(), None);

    assert!(rider.connection.push(
        "captain-location",
        json!({ "rideId": first.ride_id, "lat": 23.10, "lng": 72.65 }),
    ));
    let second = request_ride(&mut rider).await;
    assert_ne!(second.ride_id, first.ride_id);
    assert!(rider.connection.push(
        "captain-location",
        json!({ "rideId": second.ride_id, "lat": 23.04, "lng": 72.59 }),
    ));
    match until(&mut rider.events, |event| {
        matches!(event, UiEvent::CounterpartLocation { .. })
    })
    .await
    {
        UiEvent::CounterpartLocation { sample, .. } => {
            assert_eq!(sample.latitude, Latitude(23.04))
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        tracker.latest().map(|sample| sample.latitude),
        Some(Latitude(23.04))
    );
}

#[tokio::test(start_paused = true)]
async fn test_double_tap_on_accept_confirms_once() {
    let api = Arc::new(MemoryRideApi::with_latency(Duration::from_millis(200)));
    let ride = Ride {
        ride_id: RideId("ride-42".to_string()),
        pickup: place("Navrangpura", 23.02, 72.57),
        destination: place("Law Garden", 23.05, 72.60),
        vehicle_type: Some(VehicleType::Auto),
        fare: Some(inr(90.0)),
        otp: None,
        distance: None,
        duration: None,
        status: RideStatus::Requested,
        rider_id: Some(PartyId("user-1".to_string())),
        driver_id: None,
    };
    api.seed(ride.to_owned());
    let mut captain = captain_party(api.clone(), DriverSettings::default()).await;

    assert!(captain.connection.push("new-ride", json!(ride)));
    until(&mut captain.events, |event| {
        matches!(event, UiEvent::NewRideRequest { .. })
    })
    .await;

    let (first, second) = tokio::join!(
        captain.session.accept_ride(&ride.ride_id),
        captain.session.accept_ride(&ride.ride_id)
    );
    assert!(matches!(first, Ok(AcceptOutcome::Accepted(_))));
    assert_eq!(second, Ok(AcceptOutcome::AlreadyInFlight));

    let confirms = api
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RideCall::Confirm(_)))
        .count();
    assert_eq!(confirms, 1);
    assert_eq!(
        captain.session.accept_ride(&ride.ride_id).await,
        Err(AppError::RidePopupNotOpen(ride.ride_id.to_owned()))
    );
    assert_eq!(
        captain.session.active_ride().status(),
        Some(RideStatus::Accepted)
    );
}

#[tokio::test(start_paused = true)]
async fn test_expired_start_code_cancels_on_both_sides() {
    let api = Arc::new(MemoryRideApi::new());
    let mut rider = rider_party(api.clone()).await;
    let mut captain = captain_party(
        api.clone(),
        DriverSettings {
            otp_expiry_seconds: 3,
            ..DriverSettings::default()
        },
    )
    .await;

    let ride = request_ride(&mut rider).await;
    accept(&api, &mut rider, &mut captain, &ride).await;

    let seen = collect_until(&mut captain.events, is_cleared).await;
    let countdown: Vec<(u32, String)> = seen
        .iter()
        .filter_map(|event| match event {
            UiEvent::OtpCountdown {
                remaining_seconds,
                display,
            } => Some((*remaining_seconds, display.to_owned())),
            _ => None,
        })
        .collect();
    assert_eq!(
        countdown,
        vec![
            (3, "0:03".to_string()),
            (2, "0:02".to_string()),
            (1, "0:01".to_string()),
            (0, "0:00".to_string()),
        ]
    );
    assert_eq!(
        seen.last(),
        Some(&UiEvent::RideCleared {
            ride_id: ride.ride_id.to_owned(),
            outcome: RideOutcome::Cancelled {
                reason: OTP_EXPIRED_REASON.to_string(),
            },
        })
    );
    assert!(api
        .calls()
        .contains(&RideCall::Cancel(ride.ride_id.to_owned(), OTP_EXPIRED_REASON.to_string())));

    let signal = captain
        .connection
        .expect_event("ride:status")
        .await
        .expect("Cancellation not emitted");
    assert_eq!(signal["data"]["reason"], json!(OTP_EXPIRED_REASON));

    push_status(&rider.connection, &ride.ride_id, RideStatus::Cancelled, signal["data"].to_owned());
    assert_eq!(
        until(&mut rider.events, is_cleared).await,
        UiEvent::RideCleared {
            ride_id: ride.ride_id.to_owned(),
            outcome: RideOutcome::Cancelled {
                reason: OTP_EXPIRED_REASON.to_string(),
            },
        }
    );
}

#[tokio::test]
async fn test_chat_receipts_only_move_forward() {
    let ride_id = RideId("ride-7".to_string());
    let (rider_channel, _rider_server, mut rider_connection) = connect(Role::Rider, "user-1").await;
    let (captain_channel, _captain_server, mut captain_connection) =
        connect(Role::Driver, "captain-1").await;
    let (rider_ui, mut rider_events) = UiNotifier::channel();
    let (captain_ui, mut captain_events) = UiNotifier::channel();

    let rider_chat = ChatSession::join(
        rider_channel,
        ride_id.to_owned(),
        rider_ui,
        ChatSettings::default(),
    );
    let captain_chat = ChatSession::join(
        captain_channel,
        ride_id.to_owned(),
        captain_ui,
        ChatSettings::default(),
    );
    assert_eq!(
        rider_connection.expect_event("join-ride-chat").await,
        Some(json!({ "rideId": "ride-7" }))
    );
    assert!(captain_connection.expect_event("join-ride-chat").await.is_some());

    rider_chat.send("  Where are you?  ").unwrap();
    assert_eq!(
        rider_connection.expect_event("send-message").await,
        Some(json!({
            "rideId": "ride-7",
            "text": "Where are you?",
            "sender": "user",
            "senderId": "user-1"
        }))
    );

    let stored = json!({
        "_id": "m-1",
        "rideId": "ride-7",
        "senderId": "user-1",
        "sender": "user",
        "text": "Where are you?",
        "status": "sent"
    });
    assert!(rider_connection.push("receive-message", stored.to_owned()));
    assert!(captain_connection.push("receive-message", stored));

    until(&mut captain_events, |event| {
        matches!(event, UiEvent::ChatUnread { count: 1 })
    })
    .await;
    assert_eq!(captain_chat.unread_count(), 1);
    assert_eq!(
        captain_connection.expect_event("mark-message-read").await,
        Some(json!({ "messageId": "m-1", "rideId": "ride-7" }))
    );
    captain_chat.set_focused(true);
    assert_eq!(captain_chat.unread_count(), 0);

    until(&mut rider_events, |event| {
        matches!(event, UiEvent::ChatMessage { .. })
    })
    .await;
    assert_eq!(rider_chat.unread_count(), 0);

    assert!(rider_connection.push(
        "message-read",
        json!({ "messageId": "m-1", "rideId": "ride-7" }),
    ));
    until(&mut rider_events, |event| {
        matches!(event, UiEvent::ChatMessageStatus { status: MessageStatus::Read, .. })
    })
    .await;

    // A delivery receipt that lost the race with the read receipt.
    assert!(rider_connection.push(
        "message-delivered",
        json!({ "messageId": "m-1", "rideId": "ride-7" }),
    ));
    assert!(rider_connection.push(
        "user-typing",
        json!({ "rideId": "ride-7", "userId": "captain-1", "isTyping": true }),
    ));
    let seen = collect_until(&mut rider_events, |event| {
        matches!(event, UiEvent::CounterpartTyping { is_typing: true })
    })
    .await;
    assert!(!seen
        .iter()
        .any(|event| matches!(event, UiEvent::ChatMessageStatus { .. })));
    assert_eq!(rider_chat.messages()[0].status, MessageStatus::Read);
    assert!(rider_chat.counterpart_typing());
}
