/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
use crate::common::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideRequest {
    pub pickup: Place,
    pub destination: Place,
    pub vehicle_type: VehicleType,
    pub fare: Fare,
    pub otp: Otp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideIdRequest {
    pub ride_id: RideId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelRideRequest {
    pub ride_id: RideId,
    pub reason: String,
}

/// Ride endpoints answer with either `{ ride: {...} }` or the bare record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RidePayload {
    Wrapped { ride: Ride },
    Bare(Ride),
}

impl RidePayload {
    pub fn into_ride(self) -> Ride {
        match self {
            RidePayload::Wrapped { ride } | RidePayload::Bare(ride) => ride,
        }
    }
}
