/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Captain positions during a ride: published by the captain, followed by the rider.

use crate::channel::{
    events::{names, InboundEvent, LocationUpdate, OutboundEvent},
    Channel, Subscription,
};
use crate::common::{
    types::*,
    utils::{distance_between_in_meters, estimate_eta_minutes, format_distance, TaskGuard},
};
use crate::domain::{
    store::ActiveRide,
    types::{
        ride::{RouteEstimate, RouteTarget},
        ui::{UiEvent, UiNotifier},
    },
};
use crate::tools::error::AppError;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSettings {
    pub publish_interval: Duration,
    pub average_speed_kmph: f64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        TrackingSettings {
            publish_interval: Duration::from_millis(1000),
            average_speed_kmph: 30.0,
        }
    }
}

/// Forwards the captain's positions for the active ride, at most one per interval.
///
/// A sample arriving inside the interval replaces any held one and is sent when the
/// interval closes, so the last known position always goes out.
pub struct DriverLocationPublisher {
    task: TaskGuard,
}

impl DriverLocationPublisher {
    pub fn start<S>(
        channel: Arc<Channel>,
        ride: ActiveRide,
        ui: UiNotifier,
        samples: S,
        settings: TrackingSettings,
    ) -> Self
    where
        S: Stream<Item = Result<LocationSample, AppError>> + Send + Unpin + 'static,
    {
        DriverLocationPublisher {
            task: TaskGuard::spawn(publish(
                channel,
                ride,
                ui,
                samples,
                settings.publish_interval,
            )),
        }
    }

    /// False once the location source has ended.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn publish<S>(
    channel: Arc<Channel>,
    ride: ActiveRide,
    ui: UiNotifier,
    mut samples: S,
    interval: Duration,
) where
    S: Stream<Item = Result<LocationSample, AppError>> + Send + Unpin + 'static,
{
    let mut last_sent: Option<Instant> = None;
    let mut pending: Option<LocationSample> = None;

    loop {
        let flush_at = pending
            .as_ref()
            .and(last_sent)
            .map(|sent| sent + interval);

        tokio::select! {
            next = samples.next() => match next {
                Some(Ok(sample)) => {
                    let now = Instant::now();
                    if last_sent.map_or(true, |sent| now >= sent + interval) {
                        send_location(&channel, &ride, &sample);
                        last_sent = Some(now);
                        pending = None;
                    } else {
                        pending = Some(sample);
                    }
                }
                Some(Err(err)) => {
                    warn!(tag = "[Location]", error = %err, "Location unavailable");
                    ui.notify(UiEvent::LocationUnavailable {
                        message: err.message(),
                    });
                }
                None => {
                    if let (Some(sample), Some(at)) = (pending.take(), flush_at) {
                        tokio::time::sleep_until(at).await;
                        send_location(&channel, &ride, &sample);
                    }
                    debug!(tag = "[Location]", "Location source ended");
                    return;
                }
            },
            _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                if let Some(sample) = pending.take() {
                    send_location(&channel, &ride, &sample);
                    last_sent = Some(Instant::now());
                }
            }
        }
    }
}

fn send_location(channel: &Channel, ride: &ActiveRide, sample: &LocationSample) {
    let Some(ride_id) = ride.ride_id() else {
        debug!(tag = "[Location]", "No active ride, position not published");
        return;
    };
    let update = OutboundEvent::UpdateLocation(LocationUpdate {
        ride_id,
        lat: sample.latitude,
        lng: sample.longitude,
        accuracy: sample.accuracy,
        heading: sample.heading,
    });
    if let Err(err) = channel.emit(update) {
        debug!(tag = "[Location]", error = %err, "Position not published");
    }
}

/// Follows the captain's position for the rider's active ride.
pub struct RiderLocationTracker {
    latest: Arc<Mutex<Option<(RideId, LocationSample)>>>,
    ride: ActiveRide,
    _task: TaskGuard,
}

impl RiderLocationTracker {
    pub fn start(
        channel: &Channel,
        ride: ActiveRide,
        ui: UiNotifier,
        settings: TrackingSettings,
    ) -> Self {
        let latest = Arc::new(Mutex::new(None));
        let subscription = channel.subscribe(&[names::CAPTAIN_LOCATION]);
        let task = TaskGuard::spawn(follow(
            subscription,
            ride.to_owned(),
            ui,
            latest.clone(),
            settings.average_speed_kmph,
        ));
        RiderLocationTracker {
            latest,
            ride,
            _task: task,
        }
    }

    /// The most recent position for the ride that is active now.
    pub fn latest(&self) -> Option<LocationSample> {
        self.latest
            .lock()
            .ok()
            .and_then(|latest| latest.to_owned())
            .filter(|(ride_id, _)| self.ride.is_ride(ride_id))
            .map(|(_, sample)| sample)
    }
}

async fn follow(
    mut subscription: Subscription,
    ride: ActiveRide,
    ui: UiNotifier,
    latest: Arc<Mutex<Option<(RideId, LocationSample)>>>,
    average_speed_kmph: f64,
) {
    while let Some(event) = subscription.recv().await {
        let InboundEvent::CaptainLocation(update) = event else {
            continue;
        };
        let Some(active) = ride.snapshot().filter(|active| active.ride_id == update.ride_id)
        else {
            debug!(tag = "[Location]", ride_id = %update.ride_id, "Position for another ride dropped");
            continue;
        };

        let sample = update.to_sample();
        let estimate = route_estimate(&active, &sample, average_speed_kmph);
        if let Ok(mut latest) = latest.lock() {
            *latest = Some((active.ride_id.to_owned(), sample.to_owned()));
        }
        ui.notify(UiEvent::CounterpartLocation { sample, estimate });
    }
}

/// Distance and arrival time to the pickup, or to the destination once the ride started.
pub fn route_estimate(
    ride: &Ride,
    sample: &LocationSample,
    average_speed_kmph: f64,
) -> Option<RouteEstimate> {
    let (target, place) = match ride.status {
        RideStatus::InProgress => (RouteTarget::Destination, &ride.destination),
        _ => (RouteTarget::Pickup, &ride.pickup),
    };
    let distance = Meters(distance_between_in_meters(&sample.point(), &place.point()?));
    Some(RouteEstimate {
        target,
        distance,
        eta_minutes: estimate_eta_minutes(distance, average_speed_kmph),
        distance_display: format_distance(distance),
    })
}
