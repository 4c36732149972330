/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use crate::call_external_api;
use crate::common::types::ApiResponse;
use crate::tools::error::AppError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::str::FromStr;
use tracing::{error, info};
use uuid::Uuid;

/// Sends a JSON request to a ride endpoint and unwraps the `{success, data, message}` envelope.
///
/// # Arguments
///
/// * `client` - Shared `reqwest` client, carrying the request timeout.
/// * `method` - The HTTP method (e.g., GET, POST) for the request.
/// * `url` - The target URL, query string included.
/// * `headers` - Header key-value pairs. Header values are not logged.
/// * `body` - An optional request body, serialized to JSON.
///
/// # Returns
///
/// * `Ok(T)` with the envelope's `data` when the server reports success.
/// * `Err(AppError::CredentialExpired)` on HTTP 401.
/// * `Err(AppError::DomainRejection)` when the server answers with an explanatory `message`.
/// * `Err(AppError::ExternalAPICallError)` when the request could not be completed.
pub async fn call_api<T, U>(
    client: &Client,
    method: Method,
    url: &Url,
    headers: Vec<(&str, &str)>,
    body: Option<U>,
) -> Result<T, AppError>
where
    T: DeserializeOwned,
    U: Serialize + Debug,
{
    let start_time = std::time::Instant::now();

    let mut header_map = HeaderMap::new();

    for (header_key, header_value) in headers {
        let header_name = HeaderName::from_str(header_key)
            .map_err(|_| AppError::InvalidRequest(format!("Invalid Header Name : {header_key}")))?;
        let header_value = HeaderValue::from_str(header_value)
            .map_err(|_| AppError::InvalidRequest(format!("Invalid Header Value : {header_key}")))?;

        header_map.insert(header_name, header_value);
    }

    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        header_map.insert("x-request-id", value);
    }

    let mut request = client
        .request(method.to_owned(), url.to_owned())
        .headers(header_map.to_owned());

    if let Some(body) = &body {
        let body = serde_json::to_string(body)
            .map_err(|err| AppError::SerializationError(err.to_string()))?;
        request = request.body(body);
    }

    let resp = request.send().await;

    let url_str = format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or(""),
        url.port_or_known_default().unwrap_or(80)
    );

    let status = match resp.as_ref() {
        Ok(resp) => resp.status().as_str().to_string(),
        Err(err) => err
            .status()
            .map(|status| status.to_string())
            .unwrap_or("UNKNOWN".to_string()),
    };

    call_external_api!(
        method.as_str(),
        url_str.as_str(),
        url.path(),
        status.as_str(),
        start_time
    );

    let resp = match resp {
        Ok(resp) => resp,
        Err(err) => {
            error!(tag = "[OUTGOING API - ERROR]", request_id = %request_id, request_method = %method, request_body = format!("{:?}", body), request_url = %url_str, request_path = %url.path(), error = format!("{:?}", err), latency = format!("{:?}ms", start_time.elapsed().as_millis()));
            return Err(AppError::ExternalAPICallError(err.to_string()));
        }
    };

    let http_status = resp.status();

    if http_status == StatusCode::UNAUTHORIZED {
        error!(tag = "[OUTGOING API - UNAUTHORIZED]", request_id = %request_id, request_method = %method, request_url = %url_str, request_path = %url.path(), latency = format!("{:?}ms", start_time.elapsed().as_millis()));
        return Err(AppError::CredentialExpired(http_status.to_string()));
    }

    let text = resp
        .text()
        .await
        .map_err(|err| AppError::ExternalAPICallError(err.to_string()))?;

    let envelope = serde_json::from_str::<ApiResponse<T>>(&text);

    if http_status.is_success() {
        info!(tag = "[OUTGOING API]", request_id = %request_id, request_method = %method, request_body = format!("{:?}", body), request_url = %url_str, request_path = %url.path(), status = %http_status, latency = format!("{:?}ms", start_time.elapsed().as_millis()));
    } else {
        error!(tag = "[OUTGOING API - ERROR]", request_id = %request_id, request_method = %method, request_body = format!("{:?}", body), request_url = %url_str, request_path = %url.path(), status = %http_status, response = %text, latency = format!("{:?}ms", start_time.elapsed().as_millis()));
    }

    unwrap_envelope(http_status, envelope)
}

fn unwrap_envelope<T: DeserializeOwned>(
    http_status: StatusCode,
    envelope: Result<ApiResponse<T>, serde_json::Error>,
) -> Result<T, AppError> {
    match envelope {
        Ok(ApiResponse {
            data: Some(data), ..
        }) if http_status.is_success() => Ok(data),
        // Bodies like `{ success: true, message: "Ride cancelled" }` carry no data.
        Ok(ApiResponse { success: true, .. }) if http_status.is_success() => {
            serde_json::from_value::<T>(serde_json::Value::Null)
                .map_err(|err| AppError::DeserializationError(err.to_string()))
        }
        Ok(ApiResponse {
            message: Some(message),
            ..
        }) if !message.trim().is_empty() => Err(AppError::DomainRejection(message)),
        Ok(_) if http_status.is_success() => Err(AppError::DeserializationError(
            "Missing data in successful response".to_string(),
        )),
        Ok(_) => Err(AppError::ExternalAPICallError(http_status.to_string())),
        Err(err) if http_status.is_success() => {
            Err(AppError::DeserializationError(err.to_string()))
        }
        Err(_) => Err(AppError::ExternalAPICallError(http_status.to_string())),
    }
}
