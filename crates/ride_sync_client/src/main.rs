/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
use ride_sync_client::{
    channel::{socketio::SocketIoTransport, ChannelManager},
    common::{
        credentials::FileCredentialStore,
        types::{PartyId, Role, SessionIdentity},
    },
    domain::{
        action::{driver::DriverOrchestrator, rider::RiderOrchestrator},
        store::ActiveRide,
        types::ui::{UiEvent, UiNotifier},
    },
    environment::AppConfig,
    outbound::external::HttpRideApi,
    tools::{error::AppError, logger::setup_tracing, prometheus::metrics_snapshot},
};
use std::{env::var, str::FromStr, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

const ROLE_ENV: &str = "RIDE_SYNC_ROLE";
const PARTY_ID_ENV: &str = "RIDE_SYNC_PARTY_ID";

fn session_identity() -> Result<SessionIdentity, AppError> {
    let role = var(ROLE_ENV).unwrap_or_else(|_| "user".to_string());
    let role = Role::from_str(&role)
        .map_err(|_| AppError::InvalidConfiguration(format!("{ROLE_ENV} : {role}")))?;
    let party_id = var(PARTY_ID_ENV)
        .map_err(|_| AppError::InvalidConfiguration(format!("{PARTY_ID_ENV} is not set")))?;
    Ok(SessionIdentity {
        role,
        party_id: PartyId(party_id),
    })
}

#[tokio::main]
async fn start_client() -> Result<(), AppError> {
    let app_config = AppConfig::from_env()?;

    let _guard = setup_tracing(app_config.logger_cfg.to_owned())?;

    let identity = session_identity()?;
    let credentials = Arc::new(FileCredentialStore::open(&app_config.credentials_path)?);
    let transport = SocketIoTransport::new(&app_config.channel_url()?, app_config.request_timeout())?;
    let api = Arc::new(HttpRideApi::new(
        app_config.api_base_url()?,
        app_config.request_timeout(),
        credentials.clone(),
    )?);

    let manager = ChannelManager::new(
        Arc::new(transport),
        credentials,
        app_config.channel_settings(),
    );
    let channel = Arc::new(manager.connect(identity.to_owned()).await?);

    let (ui, mut ui_events) = UiNotifier::channel();
    let ride = ActiveRide::default();

    // Orchestrators stop their tasks when dropped, so both stay bound until shutdown.
    let (_rider, _driver) = match identity.role {
        Role::Rider => (
            Some(RiderOrchestrator::start(
                channel,
                api,
                ride,
                ui,
                app_config.rider_settings(),
            )),
            None,
        ),
        Role::Driver => (
            None,
            Some(DriverOrchestrator::start(
                channel,
                api,
                ride,
                ui,
                app_config.driver_settings(),
            )),
        ),
    };

    info!(tag = "[Session]", role = %identity.role, party_id = %identity.party_id.0, "Started");

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|err| AppError::InternalError(err.to_string()))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|err| AppError::InternalError(err.to_string()))?;

    loop {
        tokio::select! {
            event = ui_events.recv() => match event {
                Some(UiEvent::ReauthenticationRequired) => {
                    warn!(tag = "[Session]", "Credential expired, log in again");
                    break;
                }
                Some(UiEvent::Error(body)) => error!(tag = "[UI Event]", code = %body.error_code, message = %body.error_message),
                Some(event) => info!(tag = "[UI Event]", "{:?}", event),
                None => break,
            },
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    match metrics_snapshot() {
        Ok(metrics) => info!(tag = "[Metrics]", "{}", metrics),
        Err(err) => warn!(tag = "[Metrics]", error = %err, "Metrics not gathered"),
    }
    info!(tag = "[Session]", "Shutting down");
    Ok(())
}

fn main() {
    if let Err(err) = start_client() {
        eprintln!("ride-sync-client : {err}");
        std::process::exit(1);
    }
}
