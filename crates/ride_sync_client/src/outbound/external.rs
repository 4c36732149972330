/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
use super::types::*;
use crate::common::{credentials::CredentialStore, types::*};
use crate::tools::{callapi::call_api, error::AppError};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};
use tracing::warn;

/// The ride endpoints of the server of record.
#[async_trait]
pub trait RideApi: Send + Sync {
    async fn create_ride(&self, request: CreateRideRequest) -> Result<Ride, AppError>;
    async fn confirm_ride(&self, ride_id: &RideId) -> Result<Ride, AppError>;
    async fn start_ride(&self, ride_id: &RideId, otp: &Otp) -> Result<Ride, AppError>;
    async fn end_ride(&self, ride_id: &RideId) -> Result<Ride, AppError>;
    async fn cancel_ride(&self, ride_id: &RideId, reason: &str) -> Result<(), AppError>;
    async fn get_fare(&self, pickup: &Place, destination: &Place) -> Result<FareQuote, AppError>;
}

pub struct HttpRideApi {
    client: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpRideApi {
    pub fn new(
        base_url: Url,
        request_timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| AppError::InvalidConfiguration(err.to_string()))?;
        Ok(HttpRideApi {
            client,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(&format!("api/ride/{path}"))
            .map_err(|err| AppError::InvalidConfiguration(err.to_string()))
    }

    async fn authorized<T, U>(&self, method: Method, url: Url, body: Option<U>) -> Result<T, AppError>
    where
        T: DeserializeOwned,
        U: Serialize + Debug + Send,
    {
        let Token(token) = self
            .credentials
            .active_token()
            .ok_or(AppError::MissingCredential)?;
        let authorization = format!("Bearer {token}");

        let result = call_api::<T, U>(
            &self.client,
            method,
            &url,
            vec![
                ("content-type", "application/json"),
                ("authorization", authorization.as_str()),
            ],
            body,
        )
        .await;

        if let Err(AppError::CredentialExpired(_)) = &result {
            warn!(tag = "[Ride API]", path = %url.path(), "Credential rejected, clearing stored tokens");
            self.credentials.clear_all()?;
        }

        result
    }
}

#[async_trait]
impl RideApi for HttpRideApi {
    async fn create_ride(&self, request: CreateRideRequest) -> Result<Ride, AppError> {
        self.authorized::<RidePayload, CreateRideRequest>(
            Method::POST,
            self.endpoint("create")?,
            Some(request),
        )
        .await
        .map(RidePayload::into_ride)
    }

    async fn confirm_ride(&self, ride_id: &RideId) -> Result<Ride, AppError> {
        self.authorized::<RidePayload, RideIdRequest>(
            Method::POST,
            self.endpoint("confirm")?,
            Some(RideIdRequest {
                ride_id: ride_id.to_owned(),
            }),
        )
        .await
        .map(RidePayload::into_ride)
    }

    async fn start_ride(&self, ride_id: &RideId, otp: &Otp) -> Result<Ride, AppError> {
        let mut url = self.endpoint("start")?;
        url.query_pairs_mut()
            .append_pair("rideId", &ride_id.0)
            .append_pair("otp", &otp.0);
        self.authorized::<RidePayload, String>(Method::POST, url, None)
            .await
            .map(RidePayload::into_ride)
    }

    async fn end_ride(&self, ride_id: &RideId) -> Result<Ride, AppError> {
        self.authorized::<RidePayload, RideIdRequest>(
            Method::POST,
            self.endpoint("end")?,
            Some(RideIdRequest {
                ride_id: ride_id.to_owned(),
            }),
        )
        .await
        .map(RidePayload::into_ride)
    }

    async fn cancel_ride(&self, ride_id: &RideId, reason: &str) -> Result<(), AppError> {
        self.authorized::<Option<serde_json::Value>, CancelRideRequest>(
            Method::POST,
            self.endpoint("cancel")?,
            Some(CancelRideRequest {
                ride_id: ride_id.to_owned(),
                reason: reason.to_string(),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_fare(&self, pickup: &Place, destination: &Place) -> Result<FareQuote, AppError> {
        let mut url = self.endpoint("get-fare")?;
        url.query_pairs_mut()
            .append_pair("pickup", &pickup.address)
            .append_pair("destination", &destination.address);
        self.authorized::<FareQuote, String>(Method::GET, url, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::credentials::MemoryCredentialStore;

    #[test]
    fn test_endpoints_live_under_ride_api() {
        let api = HttpRideApi::new(
            Url::parse("http://127.0.0.1:4000").unwrap(),
            Duration::from_secs(1),
            Arc::new(MemoryCredentialStore::default()),
        )
        .unwrap();
        assert_eq!(
            api.endpoint("get-fare").unwrap().as_str(),
            "http://127.0.0.1:4000/api/ride/get-fare"
        );
    }

    #[tokio::test]
    async fn test_calls_without_credential_fail_before_dialing() {
        let api = HttpRideApi::new(
            Url::parse("http://127.0.0.1:9").unwrap(),
            Duration::from_secs(1),
            Arc::new(MemoryCredentialStore::default()),
        )
        .unwrap();
        let result = api.end_ride(&RideId("ride-1".to_string())).await;
        assert_eq!(result, Err(AppError::MissingCredential));
    }
}
