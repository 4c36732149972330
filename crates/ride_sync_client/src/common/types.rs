/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Deserialize, Serialize, Clone, Debug, Eq, Hash, PartialEq)]
pub struct RideId(pub String);
#[derive(Deserialize, Serialize, Clone, Debug, Eq, Hash, PartialEq)]
pub struct PartyId(pub String);
#[derive(Deserialize, Serialize, Clone, Debug, Eq, Hash, PartialEq)]
pub struct MessageId(pub String);
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct Token(pub String);
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct Otp(pub String);
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Copy)]
pub struct Latitude(pub f64);
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Copy)]
pub struct Longitude(pub f64);
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, PartialOrd, Copy)]
pub struct Accuracy(pub f64);
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Copy)]
pub struct Direction(pub f64);
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Hash, Ord)]
pub struct TimeStamp(pub DateTime<Utc>);
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, PartialOrd, Copy)]
pub struct Meters(pub f64);
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, PartialOrd, Copy)]
pub struct Seconds(pub f64);

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Tokens and codes never go to the logs in clear.
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(****)")
    }
}

impl TimeStamp {
    pub fn now() -> Self {
        TimeStamp(Utc::now())
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        TimeStamp::now()
    }
}

/// The two parties of a ride. On the wire the driver is the "captain".
#[derive(
    Debug, Clone, Copy, EnumString, EnumIter, Display, Serialize, Deserialize, Eq, Hash, PartialEq,
)]
pub enum Role {
    #[strum(serialize = "user")]
    #[serde(rename = "user", alias = "User", alias = "rider")]
    Rider,
    #[strum(serialize = "captain")]
    #[serde(rename = "captain", alias = "Captain", alias = "driver")]
    Driver,
}

impl Role {
    pub fn user_type(&self) -> &'static str {
        match self {
            Role::Rider => "User",
            Role::Driver => "Captain",
        }
    }

    pub fn counterpart(&self) -> Role {
        match self {
            Role::Rider => Role::Driver,
            Role::Driver => Role::Rider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub role: Role,
    pub party_id: PartyId,
}

#[derive(
    Debug, Clone, Copy, EnumString, EnumIter, Display, Serialize, Deserialize, Eq, Hash, PartialEq,
)]
pub enum VehicleType {
    #[strum(serialize = "car")]
    #[serde(rename = "car")]
    Car,
    #[strum(serialize = "moto")]
    #[serde(rename = "moto")]
    Moto,
    #[strum(serialize = "auto")]
    #[serde(rename = "auto")]
    Auto,
}

#[derive(
    Debug, Clone, Copy, Default, EnumString, EnumIter, Display, Serialize, Deserialize, Eq, Hash,
    PartialEq,
)]
pub enum RideStatus {
    #[default]
    #[strum(serialize = "requested")]
    #[serde(rename = "requested")]
    Requested,
    #[strum(serialize = "accepted")]
    #[serde(rename = "accepted")]
    Accepted,
    #[strum(serialize = "on-the-way")]
    #[serde(rename = "on-the-way")]
    OnTheWay,
    #[strum(serialize = "in-progress")]
    #[serde(rename = "in-progress")]
    InProgress,
    #[strum(serialize = "completed")]
    #[serde(rename = "completed")]
    Completed,
    #[strum(serialize = "cancelled")]
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Display,
)]
pub enum MessageStatus {
    #[default]
    #[strum(serialize = "sent")]
    #[serde(rename = "sent")]
    Sent,
    #[strum(serialize = "delivered")]
    #[serde(rename = "delivered")]
    Delivered,
    #[strum(serialize = "read")]
    #[serde(rename = "read")]
    Read,
}

impl MessageStatus {
    /// Moves forward to `next`, never backward. Returns whether the status changed.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub lat: Latitude,
    pub lon: Longitude,
}

/// GeoJSON point as exchanged with the server, `[lng, lat]` ordered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeoJsonPoint {
    #[serde(rename = "type")]
    pub geometry_type: String,
    pub coordinates: Vec<f64>,
}

impl From<Point> for GeoJsonPoint {
    fn from(Point { lat, lon }: Point) -> Self {
        let (Latitude(lat), Longitude(lon)) = (lat, lon);
        GeoJsonPoint {
            geometry_type: "Point".to_string(),
            coordinates: vec![lon, lat],
        }
    }
}

impl GeoJsonPoint {
    pub fn to_point(&self) -> Option<Point> {
        match self.coordinates.as_slice() {
            [lon, lat] if lat.is_finite() && lon.is_finite() => Some(Point {
                lat: Latitude(*lat),
                lon: Longitude(*lon),
            }),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Place {
    pub address: String,
    #[serde(default)]
    pub coordinates: Option<GeoJsonPoint>,
}

impl Place {
    pub fn new(address: &str, point: Point) -> Self {
        Place {
            address: address.to_string(),
            coordinates: Some(point.into()),
        }
    }

    pub fn unresolved(address: &str) -> Self {
        Place {
            address: address.to_string(),
            coordinates: None,
        }
    }

    pub fn point(&self) -> Option<Point> {
        self.coordinates.as_ref().and_then(GeoJsonPoint::to_point)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Fare {
    pub amount: f64,
    pub currency: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    #[serde(rename = "_id", alias = "rideId")]
    pub ride_id: RideId,
    pub pickup: Place,
    pub destination: Place,
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
    #[serde(default)]
    pub fare: Option<Fare>,
    #[serde(default)]
    pub otp: Option<Otp>,
    #[serde(default)]
    pub distance: Option<Meters>,
    #[serde(default)]
    pub duration: Option<Seconds>,
    #[serde(default)]
    pub status: RideStatus,
    #[serde(default, alias = "userId")]
    pub rider_id: Option<PartyId>,
    #[serde(default, alias = "captainId")]
    pub driver_id: Option<PartyId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LocationSample {
    pub latitude: Latitude,
    pub longitude: Longitude,
    pub accuracy: Option<Accuracy>,
    pub heading: Option<Direction>,
    pub timestamp: TimeStamp,
}

impl LocationSample {
    pub fn point(&self) -> Point {
        Point {
            lat: self.latitude,
            lon: self.longitude,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id", alias = "id")]
    pub id: MessageId,
    pub ride_id: RideId,
    pub sender_id: PartyId,
    #[serde(rename = "sender")]
    pub sender_role: Role,
    pub text: String,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub timestamp: TimeStamp,
}

/// Envelope used by every ride endpoint.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FareQuote {
    #[serde(rename = "fare", alias = "fares")]
    pub fares: FxHashMap<VehicleType, f64>,
    #[serde(default)]
    pub distance: Option<Meters>,
    #[serde(default)]
    pub duration: Option<Seconds>,
}

impl FareQuote {
    pub fn fare_for(&self, vehicle_type: &VehicleType, currency: &str) -> Option<Fare> {
        self.fares.get(vehicle_type).map(|amount| Fare {
            amount: *amount,
            currency: currency.to_string(),
        })
    }
}
