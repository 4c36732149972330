/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
use super::types::*;
use crate::tools::error::AppError;
use rand::Rng;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

pub const OTP_LENGTH: usize = 6;

/// Six ASCII digits, uniformly drawn from `000000..=999999`.
pub fn generate_otp() -> Otp {
    let mut rng = rand::thread_rng();
    let code: String = (0..OTP_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    Otp(code)
}

pub fn validate_otp_format(Otp(otp): &Otp) -> Result<(), AppError> {
    if otp.len() == OTP_LENGTH && otp.bytes().all(|byte| byte.is_ascii_digit()) {
        Ok(())
    } else {
        Err(AppError::InvalidOtpFormat)
    }
}

fn deg2rad(degrees: f64) -> f64 {
    degrees * PI / 180.0
}

pub fn distance_between_in_meters(latlong1: &Point, latlong2: &Point) -> f64 {
    // Calculating using haversine formula
    // Radius of Earth in meters
    let r: f64 = 6371000.0;

    let Latitude(lat1) = latlong1.lat;
    let Longitude(lon1) = latlong1.lon;
    let Latitude(lat2) = latlong2.lat;
    let Longitude(lon2) = latlong2.lon;

    let dlat = deg2rad(lat2 - lat1);
    let dlon = deg2rad(lon2 - lon1);

    let rlat1 = deg2rad(lat1);
    let rlat2 = deg2rad(lat2);

    let sq = |x: f64| x * x;

    // Calculated distance is real (not imaginary) when 0 <= h <= 1
    let h = sq((dlat / 2.0).sin()) + rlat1.cos() * rlat2.cos() * sq((dlon / 2.0).sin());

    2.0 * r * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Whole minutes needed to cover `distance` at `average_speed_kmph`, rounded to nearest.
pub fn estimate_eta_minutes(Meters(distance): Meters, average_speed_kmph: f64) -> u64 {
    if average_speed_kmph <= 0.0 || distance <= 0.0 {
        return 0;
    }
    let hours = distance / (average_speed_kmph * 1000.0);
    (hours * 60.0).round() as u64
}

pub fn format_distance(Meters(meters): Meters) -> String {
    if meters <= 0.0 {
        return "0 km".to_string();
    }
    let kilometers = meters / 1000.0;
    if kilometers < 1.0 {
        format!("{} m", meters.round())
    } else {
        format!("{:.1} km", kilometers)
    }
}

pub fn format_duration(Seconds(seconds): Seconds) -> String {
    if seconds <= 0.0 {
        return "0 min".to_string();
    }
    let minutes = (seconds / 60.0).round() as u64;
    if minutes < 60 {
        format!("{minutes} min")
    } else {
        format!("{} hr {} min", minutes / 60, minutes % 60)
    }
}

/// `m:ss`, as shown next to the code entry field.
pub fn format_countdown(remaining_seconds: u32) -> String {
    format!("{}:{:02}", remaining_seconds / 60, remaining_seconds % 60)
}

/// Owns a spawned task and aborts it when dropped.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        TaskGuard(tokio::spawn(future))
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Held while a request is outstanding; a second `acquire` fails until it is dropped.
#[derive(Debug)]
pub struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
