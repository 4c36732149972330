/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use crate::common::types::{MessageId, RideId, RideStatus};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_message: String,
    pub error_code: String,
}

/// Coarse classification used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Validation,
    ProtocolAnomaly,
    Transport,
    DomainRejection,
    Internal,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AppError {
    #[error("No credential available for the session")]
    MissingCredential,
    #[error("Credential expired : {0}")]
    CredentialExpired(String),
    #[error("Incomplete location : {0}")]
    IncompleteLocation(String),
    #[error("Message text is empty")]
    EmptyMessage,
    #[error("Invalid ride start code")]
    InvalidOtpFormat,
    #[error("Invalid request : {0}")]
    InvalidRequest(String),
    #[error("Ride {0} is already active")]
    ActiveRideExists(RideId),
    #[error("No active ride")]
    NoActiveRide,
    #[error("No open popup for ride {0}")]
    RidePopupNotOpen(RideId),
    #[error("Invalid ride status : RideId - {0}, Ride Status - {1}")]
    InvalidRideStatus(RideId, RideStatus),
    #[error("Protocol anomaly : {0}")]
    ProtocolAnomaly(String),
    #[error("Unknown chat message : {0}")]
    UnknownMessage(MessageId),
    #[error("External API call failed : {0}")]
    ExternalAPICallError(String),
    #[error("Channel is not connected")]
    ChannelNotConnected,
    #[error("Channel closed : {0}")]
    ChannelClosed(String),
    #[error("Location unavailable : {0}")]
    LocationUnavailable(String),
    #[error("Request rejected : {0}")]
    DomainRejection(String),
    #[error("Serialization failed : {0}")]
    SerializationError(String),
    #[error("Deserialization failed : {0}")]
    DeserializationError(String),
    #[error("Invalid configuration : {0}")]
    InvalidConfiguration(String),
    #[error("Internal error : {0}")]
    InternalError(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::MissingCredential | AppError::CredentialExpired(_) => {
                ErrorKind::Authentication
            }
            AppError::IncompleteLocation(_)
            | AppError::EmptyMessage
            | AppError::InvalidOtpFormat
            | AppError::InvalidRequest(_)
            | AppError::ActiveRideExists(_)
            | AppError::NoActiveRide
            | AppError::RidePopupNotOpen(_)
            | AppError::InvalidRideStatus(_, _)
            | AppError::UnknownMessage(_) => ErrorKind::Validation,
            AppError::ProtocolAnomaly(_) => ErrorKind::ProtocolAnomaly,
            AppError::ExternalAPICallError(_)
            | AppError::ChannelNotConnected
            | AppError::ChannelClosed(_)
            | AppError::LocationUnavailable(_)
            | AppError::DeserializationError(_) => ErrorKind::Transport,
            AppError::DomainRejection(_) => ErrorKind::DomainRejection,
            AppError::SerializationError(_)
            | AppError::InvalidConfiguration(_)
            | AppError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Whether the user may simply try again. Only meaningful for read-only queries;
    /// state-changing commands are never retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ExternalAPICallError(_)
                | AppError::ChannelNotConnected
                | AppError::ChannelClosed(_)
        )
    }

    pub fn message(&self) -> String {
        match self {
            AppError::MissingCredential | AppError::CredentialExpired(_) => {
                "Session expired. Please login again.".to_string()
            }
            AppError::IncompleteLocation(_) => {
                "Please select pickup and destination locations".to_string()
            }
            AppError::EmptyMessage => "Message cannot be empty".to_string(),
            AppError::InvalidOtpFormat => "Please enter the 6-digit OTP".to_string(),
            AppError::ExternalAPICallError(_) => {
                "No response from server. Please check your internet connection.".to_string()
            }
            AppError::ChannelNotConnected | AppError::ChannelClosed(_) => {
                "Connection error. Please check your internet connection.".to_string()
            }
            AppError::LocationUnavailable(_) => {
                "Failed to get your location. Please check your location settings.".to_string()
            }
            AppError::DomainRejection(reason) => reason.to_string(),
            err => err.to_string(),
        }
    }

    pub fn code(&self) -> String {
        match self {
            AppError::MissingCredential => "MISSING_CREDENTIAL",
            AppError::CredentialExpired(_) => "TOKEN_EXPIRED",
            AppError::IncompleteLocation(_) => "INCOMPLETE_LOCATION",
            AppError::EmptyMessage => "EMPTY_MESSAGE",
            AppError::InvalidOtpFormat => "INVALID_OTP_FORMAT",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::ActiveRideExists(_) => "ACTIVE_RIDE_EXISTS",
            AppError::NoActiveRide => "NO_ACTIVE_RIDE",
            AppError::RidePopupNotOpen(_) => "RIDE_POPUP_NOT_OPEN",
            AppError::InvalidRideStatus(_, _) => "INVALID_RIDE_STATUS",
            AppError::ProtocolAnomaly(_) => "PROTOCOL_ANOMALY",
            AppError::UnknownMessage(_) => "UNKNOWN_MESSAGE",
            AppError::ExternalAPICallError(_) => "EXTERNAL_API_CALL_ERROR",
            AppError::ChannelNotConnected => "CHANNEL_NOT_CONNECTED",
            AppError::ChannelClosed(_) => "CHANNEL_CLOSED",
            AppError::LocationUnavailable(_) => "LOCATION_UNAVAILABLE",
            AppError::DomainRejection(_) => "DOMAIN_REJECTION",
            AppError::SerializationError(_) => "SERIALIZATION_ERROR",
            AppError::DeserializationError(_) => "DESERIALIZATION_ERROR",
            AppError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            AppError::InternalError(_) => "INTERNAL_ERROR",
        }
        .to_string()
    }

    pub fn error_body(&self) -> ErrorBody {
        ErrorBody {
            error_message: self.message(),
            error_code: self.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(AppError::MissingCredential.kind(), ErrorKind::Authentication);
        assert_eq!(
            AppError::IncompleteLocation("pickup".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            AppError::DomainRejection("Invalid OTP".to_string()).kind(),
            ErrorKind::DomainRejection
        );
        assert_eq!(AppError::ChannelNotConnected.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_only_transport_failures_are_retryable() {
        assert!(AppError::ExternalAPICallError("timeout".to_string()).is_retryable());
        assert!(!AppError::DomainRejection("Invalid OTP".to_string()).is_retryable());
        assert!(!AppError::EmptyMessage.is_retryable());
    }

    #[test]
    fn test_domain_rejection_keeps_server_message() {
        let err = AppError::DomainRejection("Invalid OTP".to_string());
        assert_eq!(
            err.error_body(),
            ErrorBody {
                error_message: "Invalid OTP".to_string(),
                error_code: "DOMAIN_REJECTION".to_string(),
            }
        );
    }
}
