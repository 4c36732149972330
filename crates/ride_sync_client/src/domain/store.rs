/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use crate::common::types::*;
use crate::tools::error::AppError;
use std::sync::{Arc, RwLock};

/// The single active ride of a client session.
///
/// Every component holds a clone; only the orchestrators mutate it.
#[derive(Debug, Clone, Default)]
pub struct ActiveRide {
    inner: Arc<RwLock<Option<Ride>>>,
}

impl ActiveRide {
    pub fn snapshot(&self) -> Option<Ride> {
        self.inner.read().ok().and_then(|ride| ride.to_owned())
    }

    pub fn ride_id(&self) -> Option<RideId> {
        self.inner
            .read()
            .ok()
            .and_then(|ride| ride.as_ref().map(|ride| ride.ride_id.to_owned()))
    }

    pub fn status(&self) -> Option<RideStatus> {
        self.inner
            .read()
            .ok()
            .and_then(|ride| ride.as_ref().map(|ride| ride.status))
    }

    pub fn is_active(&self) -> bool {
        self.ride_id().is_some()
    }

    pub fn is_ride(&self, ride_id: &RideId) -> bool {
        self.ride_id().as_ref() == Some(ride_id)
    }

    #[cfg(test)]
    pub(crate) fn set(&self, ride: Ride) {
        if let Ok(mut current) = self.inner.write() {
            *current = Some(ride);
        }
    }

    #[cfg(test)]
    pub(crate) fn clear(&self) -> Option<Ride> {
        self.inner.write().ok().and_then(|mut current| current.take())
    }

    /// Runs `change` under the write lock. Read-check-write sequences go through here so
    /// that two writers never interleave.
    pub(crate) fn update<T, F>(&self, change: F) -> Option<T>
    where
        F: FnOnce(&mut Option<Ride>) -> T,
    {
        self.inner.write().ok().map(|mut current| change(&mut current))
    }

    /// Installs `ride` unless another ride is already active.
    pub(crate) fn claim(&self, ride: Ride) -> Result<(), AppError> {
        self.update(|current| match current {
            Some(active) => Err(AppError::ActiveRideExists(active.ride_id.to_owned())),
            None => {
                *current = Some(ride);
                Ok(())
            }
        })
        .unwrap_or_else(|| Err(AppError::InternalError("Ride store poisoned".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ride(id: &str) -> Ride {
        Ride {
            ride_id: RideId(id.to_string()),
            pickup: Place::unresolved("A"),
            destination: Place::unresolved("B"),
            vehicle_type: None,
            fare: None,
            otp: None,
            distance: None,
            duration: None,
            status: RideStatus::Requested,
            rider_id: None,
            driver_id: None,
        }
    }

    #[test]
    fn test_clones_share_the_same_ride() {
        let store = ActiveRide::default();
        let reader = store.clone();
        assert!(!reader.is_active());
        store.set(ride("ride-1"));
        assert!(reader.is_ride(&RideId("ride-1".to_string())));
        assert_eq!(reader.status(), Some(RideStatus::Requested));
        assert_eq!(store.clear().map(|ride| ride.ride_id), Some(RideId("ride-1".to_string())));
        assert_eq!(reader.snapshot(), None);
    }

    #[test]
    fn test_claim_refuses_while_a_ride_is_active() {
        let store = ActiveRide::default();
        assert_eq!(store.claim(ride("ride-1")), Ok(()));
        assert_eq!(
            store.claim(ride("ride-2")),
            Err(AppError::ActiveRideExists(RideId("ride-1".to_string())))
        );
        assert!(store.is_ride(&RideId("ride-1".to_string())));
    }
}
