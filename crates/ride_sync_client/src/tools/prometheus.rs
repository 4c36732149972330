/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
#![allow(clippy::expect_used)]

use crate::tools::error::AppError;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

pub static CALL_EXTERNAL_API: once_cell::sync::Lazy<HistogramVec> =
    once_cell::sync::Lazy::new(|| {
        register_histogram_vec!(
            opts!("external_request_duration", "Call external API requests").into(),
            &["method", "host", "service", "status"]
        )
        .expect("Failed to register call external API metrics")
    });

pub static CHANNEL_EVENTS: once_cell::sync::Lazy<IntCounterVec> =
    once_cell::sync::Lazy::new(|| {
        register_int_counter_vec!(
            opts!("channel_events", "Realtime channel events"),
            &["direction", "event"]
        )
        .expect("Failed to register channel events metrics")
    });

pub static PROTOCOL_ANOMALIES: once_cell::sync::Lazy<IntCounterVec> =
    once_cell::sync::Lazy::new(|| {
        register_int_counter_vec!(
            opts!("protocol_anomalies", "Discarded ride status events"),
            &["role", "current", "attempted"]
        )
        .expect("Failed to register protocol anomalies metrics")
    });

pub static CHANNEL_RECONNECTS: once_cell::sync::Lazy<IntCounter> =
    once_cell::sync::Lazy::new(|| {
        register_int_counter!("channel_reconnects", "Channel reconnection attempts")
            .expect("Failed to register channel reconnects metrics")
    });

/// Macro that observes the duration of external API calls and logs metrics related to the external request.
///
/// # Arguments
///
/// * `$method` - The HTTP method of the request (e.g., GET, POST).
/// * `$host` - The scheme, host and port of the server.
/// * `$path` - The path of the endpoint.
/// * `$status` - The HTTP status code of the response, or `UNKNOWN`.
/// * `$start` - The time when the request was sent.
#[macro_export]
macro_rules! call_external_api {
    ($method:expr, $host:expr, $path:expr, $status:expr, $start:expr) => {
        let duration = $start.elapsed().as_secs_f64();
        $crate::tools::prometheus::CALL_EXTERNAL_API
            .with_label_values(&[$method, $host, $path, $status])
            .observe(duration);
    };
}

/// Counts one realtime event in the given direction (`inbound` / `outbound`).
#[macro_export]
macro_rules! channel_event {
    ($direction:expr, $event:expr) => {
        $crate::tools::prometheus::CHANNEL_EVENTS
            .with_label_values(&[$direction, $event])
            .inc();
    };
}

/// Every registered metric in the prometheus text format.
pub fn metrics_snapshot() -> Result<String, AppError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|err| AppError::InternalError(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| AppError::InternalError(err.to_string()))
}
