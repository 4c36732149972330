/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Status handling shared by the rider and captain orchestrators.

use crate::channel::{
    events::{InboundEvent, JoinRide, OutboundEvent, RideStatusUpdate},
    Channel, ChannelState,
};
use crate::common::types::*;
use crate::domain::{
    state_machine::{effects, transition, Effect, Transition},
    store::ActiveRide,
    types::ui::{UiEvent, UiNotifier},
};
use crate::tools::prometheus::PROTOCOL_ANOMALIES;
use tracing::{debug, info, warn};

/// What a status did to the store, reported once the lock is released.
enum Outcome {
    NoRide,
    OtherRide(RideId),
    Duplicate(RideStatus),
    Anomaly { current: RideStatus, error: String },
    Applied { from: RideStatus, to: RideStatus },
}

pub(crate) struct RideContext {
    pub role: Role,
    pub ride: ActiveRide,
    pub ui: UiNotifier,
}

impl RideContext {
    /// Applies a server-confirmed status to the active ride.
    ///
    /// Returns the effects that were performed, or `None` when the status was a duplicate,
    /// an anomaly or about another ride. Effects beyond panels and clearing are left to
    /// the caller.
    pub fn apply_status(
        &self,
        ride_id: &RideId,
        next: RideStatus,
        record: Option<Ride>,
        reason: Option<String>,
    ) -> Option<Vec<Effect>> {
        // The id check, the transition and the write happen under one lock.
        let outcome = self.ride.update(|slot| {
            let Some(current) = slot.as_ref() else {
                return Outcome::NoRide;
            };
            if current.ride_id != *ride_id {
                return Outcome::OtherRide(current.ride_id.to_owned());
            }
            match transition(current.status, next) {
                Ok(Transition::Duplicate(status)) => Outcome::Duplicate(status),
                Err(err) => Outcome::Anomaly {
                    current: current.status,
                    error: err.to_string(),
                },
                Ok(Transition::Applied { from, to }) => {
                    if to.is_terminal() {
                        *slot = None;
                    } else if let Some(current) = slot.take() {
                        let mut updated = merge_record(current, record);
                        updated.status = to;
                        *slot = Some(updated);
                    }
                    Outcome::Applied { from, to }
                }
            }
        })?;

        match outcome {
            Outcome::NoRide => {
                debug!(tag = "[Ride Status]", ride_id = %ride_id, status = %next, "No active ride, ignoring");
                None
            }
            Outcome::OtherRide(active_ride_id) => {
                warn!(tag = "[Ride Status]", active_ride_id = %active_ride_id, ride_id = %ride_id, status = %next, "Status for another ride, ignoring");
                None
            }
            Outcome::Duplicate(status) => {
                debug!(tag = "[Ride Status]", ride_id = %ride_id, status = %status, "Duplicate status");
                None
            }
            Outcome::Anomaly { current, error } => {
                warn!(tag = "[Protocol Anomaly]", role = %self.role, ride_id = %ride_id, current = %current, attempted = %next, error = %error);
                PROTOCOL_ANOMALIES
                    .with_label_values(&[
                        self.role.to_string().as_str(),
                        current.to_string().as_str(),
                        next.to_string().as_str(),
                    ])
                    .inc();
                None
            }
            Outcome::Applied { from, to } => {
                info!(tag = "[Ride Status]", role = %self.role, ride_id = %ride_id, from = %from, to = %to);
                self.ui.notify(UiEvent::StatusChanged {
                    ride_id: ride_id.to_owned(),
                    from,
                    to,
                });

                let effects = effects(self.role, to, reason);
                for effect in effects.iter() {
                    match effect {
                        Effect::ShowPanel(panel) => self.ui.notify(UiEvent::PanelChanged(*panel)),
                        Effect::ClearRide(outcome) => {
                            self.ui.notify(UiEvent::RideCleared {
                                ride_id: ride_id.to_owned(),
                                outcome: outcome.to_owned(),
                            });
                        }
                        Effect::RestoreAvailability => {}
                    }
                }
                Some(effects)
            }
        }
    }

    /// A `ride:status:updated` push. Pushes without a ride id concern the active ride.
    pub fn apply_update(&self, update: RideStatusUpdate) -> Option<Vec<Effect>> {
        let ride_id = update.ride_id().or_else(|| self.ride.ride_id())?;
        let record = update.ride();
        let reason = update.reason();
        self.apply_status(&ride_id, update.status, record, reason)
    }

    /// Reacts to the channel's own lifecycle events.
    pub fn on_lifecycle(&self, channel: &Channel, event: &InboundEvent) {
        match event {
            InboundEvent::Connect => {
                self.ui
                    .notify(UiEvent::ConnectionChanged(ChannelState::Connected));
                // Room membership does not survive a reconnect.
                if let Some(ride_id) = self.ride.ride_id() {
                    if let Err(err) =
                        channel.emit(OutboundEvent::JoinRide(JoinRide::Room { ride_id }))
                    {
                        warn!(tag = "[Ride Room]", error = %err, "Failed to rejoin ride room");
                    }
                }
            }
            InboundEvent::Disconnect(_) => {
                self.ui.notify(UiEvent::ConnectionChanged(channel.state()));
            }
            InboundEvent::ConnectError(notice) => {
                let state = channel.state();
                self.ui.notify(UiEvent::ConnectionChanged(state));
                if state == ChannelState::AuthExpired {
                    warn!(tag = "[Channel]", reason = %notice.reason, "Re-authentication required");
                    self.ui.notify(UiEvent::ReauthenticationRequired);
                }
            }
            _ => {}
        }
    }
}

/// The pushed or returned record wins, except for fields it leaves out.
pub(crate) fn merge_record(current: Ride, record: Option<Ride>) -> Ride {
    match record {
        Some(record) if record.ride_id == current.ride_id => Ride {
            vehicle_type: record.vehicle_type.or(current.vehicle_type),
            fare: record.fare.or(current.fare),
            otp: record.otp.or(current.otp),
            distance: record.distance.or(current.distance),
            duration: record.duration.or(current.duration),
            rider_id: record.rider_id.or(current.rider_id),
            driver_id: record.driver_id.or(current.driver_id),
            ..record
        },
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ui::{Panel, RideOutcome};

    fn ride(status: RideStatus) -> Ride {
        Ride {
            ride_id: RideId("ride-1".to_string()),
            pickup: Place::unresolved("A"),
            destination: Place::unresolved("B"),
            vehicle_type: Some(VehicleType::Car),
            fare: None,
            otp: Some(Otp("123456".to_string())),
            distance: None,
            duration: None,
            status,
            rider_id: None,
            driver_id: None,
        }
    }

    fn context(role: Role) -> (RideContext, tokio::sync::mpsc::UnboundedReceiver<UiEvent>) {
        let (ui, events) = UiNotifier::channel();
        (
            RideContext {
                role,
                ride: ActiveRide::default(),
                ui,
            },
            events,
        )
    }

    #[test]
    fn test_anomaly_leaves_ride_untouched() {
        let (ctx, mut events) = context(Role::Rider);
        ctx.ride.set(ride(RideStatus::Requested));
        let result = ctx.apply_status(
            &RideId("ride-1".to_string()),
            RideStatus::Completed,
            None,
            None,
        );
        assert_eq!(result, None);
        assert_eq!(ctx.ride.status(), Some(RideStatus::Requested));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_status_for_another_ride_is_ignored() {
        let (ctx, _events) = context(Role::Driver);
        ctx.ride.set(ride(RideStatus::Accepted));
        let result = ctx.apply_status(
            &RideId("ride-2".to_string()),
            RideStatus::Cancelled,
            None,
            None,
        );
        assert_eq!(result, None);
        assert_eq!(ctx.ride.status(), Some(RideStatus::Accepted));
    }

    #[test]
    fn test_cancellation_clears_and_reports_reason() {
        let (ctx, mut events) = context(Role::Rider);
        ctx.ride.set(ride(RideStatus::OnTheWay));
        ctx.apply_status(
            &RideId("ride-1".to_string()),
            RideStatus::Cancelled,
            None,
            Some("Driver unavailable".to_string()),
        );
        assert!(!ctx.ride.is_active());
        let received: Vec<UiEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(received.contains(&UiEvent::RideCleared {
            ride_id: RideId("ride-1".to_string()),
            outcome: RideOutcome::Cancelled {
                reason: "Driver unavailable".to_string()
            },
        }));
        assert!(received.contains(&UiEvent::PanelChanged(Panel::Home)));
    }

    #[test]
    fn test_concurrent_accept_cannot_resurrect_a_cancelled_ride() {
        let (ctx, mut events) = context(Role::Driver);
        let ride_id = RideId("ride-1".to_string());
        for _ in 0..2000 {
            ctx.ride.set(ride(RideStatus::Requested));
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    ctx.apply_status(&ride_id, RideStatus::Accepted, None, None);
                });
                scope.spawn(|| {
                    barrier.wait();
                    ctx.apply_status(&ride_id, RideStatus::Cancelled, None, Some("x".to_string()));
                });
            });
            assert!(!ctx.ride.is_active());
            while events.try_recv().is_ok() {}
        }
    }

    #[test]
    fn test_merge_keeps_fields_missing_from_record() {
        let mut record = ride(RideStatus::Accepted);
        record.otp = None;
        record.driver_id = Some(PartyId("captain-1".to_string()));
        let merged = merge_record(ride(RideStatus::Requested), Some(record));
        assert_eq!(merged.otp, Some(Otp("123456".to_string())));
        assert_eq!(merged.driver_id, Some(PartyId("captain-1".to_string())));
        assert_eq!(merged.status, RideStatus::Accepted);
    }
}
