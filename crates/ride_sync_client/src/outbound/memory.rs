/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! In-process ride backend keeping ride records the way the REST service does.
//! Rider and captain sessions may share one instance.

use super::external::RideApi;
use super::types::CreateRideRequest;
use crate::common::types::*;
use crate::tools::error::AppError;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum RideCall {
    Create(CreateRideRequest),
    Confirm(RideId),
    Start(RideId, Otp),
    End(RideId),
    Cancel(RideId, String),
    GetFare(String, String),
}

#[derive(Default)]
pub struct MemoryRideApi {
    rides: Mutex<FxHashMap<RideId, Ride>>,
    calls: Mutex<Vec<RideCall>>,
    failures: Mutex<VecDeque<AppError>>,
    latency: Option<Duration>,
    next_id: AtomicU64,
    fares: FxHashMap<VehicleType, f64>,
}

impl MemoryRideApi {
    pub fn new() -> Self {
        let mut fares = FxHashMap::default();
        fares.insert(VehicleType::Car, 150.0);
        fares.insert(VehicleType::Auto, 90.0);
        fares.insert(VehicleType::Moto, 60.0);
        MemoryRideApi {
            fares,
            ..Default::default()
        }
    }

    /// Every call waits `latency` before it is answered.
    pub fn with_latency(latency: Duration) -> Self {
        MemoryRideApi {
            latency: Some(latency),
            ..MemoryRideApi::new()
        }
    }

    /// Registers a ride created elsewhere, e.g. one announced through `new-ride`.
    pub fn seed(&self, ride: Ride) {
        if let Ok(mut rides) = self.rides.lock() {
            rides.insert(ride.ride_id.to_owned(), ride);
        }
    }

    /// The next call fails with `error` whatever it is.
    pub fn fail_next(&self, error: AppError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(error);
        }
    }

    pub fn calls(&self) -> Vec<RideCall> {
        self.calls
            .lock()
            .map(|calls| calls.to_owned())
            .unwrap_or_default()
    }

    pub fn ride(&self, ride_id: &RideId) -> Option<Ride> {
        self.rides
            .lock()
            .ok()
            .and_then(|rides| rides.get(ride_id).cloned())
    }

    async fn enter(&self, call: RideCall) -> Result<(), AppError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front())
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn update<F>(&self, ride_id: &RideId, change: F) -> Result<Ride, AppError>
    where
        F: FnOnce(&mut Ride) -> Result<(), AppError>,
    {
        let mut rides = self
            .rides
            .lock()
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        let ride = rides
            .get_mut(ride_id)
            .ok_or_else(|| AppError::DomainRejection("Ride not found".to_string()))?;
        change(ride)?;
        Ok(ride.to_owned())
    }
}

fn expect_status(ride: &Ride, allowed: &[RideStatus]) -> Result<(), AppError> {
    if allowed.contains(&ride.status) {
        Ok(())
    } else {
        Err(AppError::DomainRejection(format!(
            "Ride is {}",
            ride.status
        )))
    }
}

#[async_trait]
impl RideApi for MemoryRideApi {
    async fn create_ride(&self, request: CreateRideRequest) -> Result<Ride, AppError> {
        self.enter(RideCall::Create(request.to_owned())).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ride = Ride {
            ride_id: RideId(format!("ride-{id}")),
            pickup: request.pickup,
            destination: request.destination,
            vehicle_type: Some(request.vehicle_type),
            fare: Some(request.fare),
            otp: Some(request.otp),
            distance: None,
            duration: None,
            status: RideStatus::Requested,
            rider_id: None,
            driver_id: None,
        };
        self.seed(ride.to_owned());
        Ok(ride)
    }

    async fn confirm_ride(&self, ride_id: &RideId) -> Result<Ride, AppError> {
        self.enter(RideCall::Confirm(ride_id.to_owned())).await?;
        self.update(ride_id, |ride| {
            expect_status(ride, &[RideStatus::Requested])?;
            ride.status = RideStatus::Accepted;
            Ok(())
        })
    }

    async fn start_ride(&self, ride_id: &RideId, otp: &Otp) -> Result<Ride, AppError> {
        self.enter(RideCall::Start(ride_id.to_owned(), otp.to_owned()))
            .await?;
        self.update(ride_id, |ride| {
            expect_status(ride, &[RideStatus::Accepted, RideStatus::OnTheWay])?;
            if ride.otp.as_ref() != Some(otp) {
                return Err(AppError::DomainRejection("Invalid OTP".to_string()));
            }
            ride.status = RideStatus::InProgress;
            Ok(())
        })
    }

    async fn end_ride(&self, ride_id: &RideId) -> Result<Ride, AppError> {
        self.enter(RideCall::End(ride_id.to_owned())).await?;
        self.update(ride_id, |ride| {
            expect_status(ride, &[RideStatus::InProgress])?;
            ride.status = RideStatus::Completed;
            Ok(())
        })
    }

    async fn cancel_ride(&self, ride_id: &RideId, reason: &str) -> Result<(), AppError> {
        self.enter(RideCall::Cancel(ride_id.to_owned(), reason.to_string()))
            .await?;
        self.update(ride_id, |ride| {
            if ride.status.is_terminal() {
                return Err(AppError::DomainRejection(format!("Ride is {}", ride.status)));
            }
            ride.status = RideStatus::Cancelled;
            Ok(())
        })
        .map(|_| ())
    }

    async fn get_fare(&self, pickup: &Place, destination: &Place) -> Result<FareQuote, AppError> {
        self.enter(RideCall::GetFare(
            pickup.address.to_owned(),
            destination.address.to_owned(),
        ))
        .await?;
        Ok(FareQuote {
            fares: self.fares.to_owned(),
            distance: Some(Meters(4533.0)),
            duration: Some(Seconds(720.0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateRideRequest {
        CreateRideRequest {
            pickup: Place::unresolved("A"),
            destination: Place::unresolved("B"),
            vehicle_type: VehicleType::Car,
            fare: Fare {
                amount: 150.0,
                currency: "INR".to_string(),
            },
            otp: Otp("123456".to_string()),
        }
    }

    #[tokio::test]
    async fn test_start_requires_matching_code() {
        let api = MemoryRideApi::new();
        let ride = api.create_ride(request()).await.unwrap();
        api.confirm_ride(&ride.ride_id).await.unwrap();
        assert_eq!(
            api.start_ride(&ride.ride_id, &Otp("654321".to_string())).await,
            Err(AppError::DomainRejection("Invalid OTP".to_string()))
        );
        let started = api
            .start_ride(&ride.ride_id, &Otp("123456".to_string()))
            .await
            .unwrap();
        assert_eq!(started.status, RideStatus::InProgress);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let api = MemoryRideApi::new();
        api.fail_next(AppError::ExternalAPICallError("down".to_string()));
        assert!(api.create_ride(request()).await.is_err());
        assert!(api.create_ride(request()).await.is_ok());
        assert_eq!(api.calls().len(), 2);
    }
}
