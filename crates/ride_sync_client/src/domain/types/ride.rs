/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
use crate::common::types::*;

#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    Accepted(Ride),
    /// An earlier accept for the same popup has not returned yet; nothing was sent.
    AlreadyInFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub ride_id: RideId,
    pub reason: String,
    /// False when the REST cancellation failed. Local state is cleared either way.
    pub server_acknowledged: bool,
}

/// Live estimate of the captain's distance and arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEstimate {
    pub target: RouteTarget,
    pub distance: Meters,
    pub eta_minutes: u64,
    pub distance_display: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Pickup,
    Destination,
}
