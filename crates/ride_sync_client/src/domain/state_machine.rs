/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! Ride statuses and the transitions both parties apply to server-confirmed changes.
//!
//! ```text
//! requested -> accepted -> on-the-way -> in-progress -> completed
//!     \____________\____________\______________\______> cancelled
//! ```

use super::types::ui::{Panel, RideOutcome};
use crate::common::types::{RideStatus, Role};
use crate::tools::error::AppError;

pub const DEFAULT_CANCELLATION_REASON: &str = "Ride cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: RideStatus, to: RideStatus },
    /// The status already held was delivered again.
    Duplicate(RideStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ShowPanel(Panel),
    ClearRide(RideOutcome),
    RestoreAvailability,
}

/// States from which `next` may be entered.
pub fn valid_prior_states(next: RideStatus) -> &'static [RideStatus] {
    match next {
        RideStatus::Requested => &[],
        RideStatus::Accepted => &[RideStatus::Requested],
        RideStatus::OnTheWay => &[RideStatus::Accepted],
        RideStatus::InProgress => &[RideStatus::Accepted, RideStatus::OnTheWay],
        RideStatus::Completed => &[RideStatus::InProgress],
        RideStatus::Cancelled => &[
            RideStatus::Requested,
            RideStatus::Accepted,
            RideStatus::OnTheWay,
            RideStatus::InProgress,
        ],
    }
}

pub fn transition(current: RideStatus, next: RideStatus) -> Result<Transition, AppError> {
    if current == next {
        Ok(Transition::Duplicate(current))
    } else if valid_prior_states(next).contains(&current) {
        Ok(Transition::Applied {
            from: current,
            to: next,
        })
    } else {
        Err(AppError::ProtocolAnomaly(format!(
            "Cannot move from {current} to {next}"
        )))
    }
}

/// What a role must do after entering `status`.
pub fn effects(role: Role, status: RideStatus, reason: Option<String>) -> Vec<Effect> {
    match (status, role) {
        (RideStatus::Requested, Role::Rider) => vec![Effect::ShowPanel(Panel::LookingForDriver)],
        (RideStatus::Requested, Role::Driver) => vec![Effect::ShowPanel(Panel::NewRidePopup)],
        (RideStatus::Accepted, Role::Rider) => vec![Effect::ShowPanel(Panel::RideAccepted)],
        (RideStatus::Accepted, Role::Driver) => vec![Effect::ShowPanel(Panel::ConfirmRide)],
        (RideStatus::OnTheWay, Role::Rider) => vec![Effect::ShowPanel(Panel::WaitingForDriver)],
        (RideStatus::OnTheWay, Role::Driver) => vec![],
        (RideStatus::InProgress, _) => vec![Effect::ShowPanel(Panel::RideActive)],
        (RideStatus::Completed, role) => terminal(role, RideOutcome::Completed),
        (RideStatus::Cancelled, role) => terminal(
            role,
            RideOutcome::Cancelled {
                reason: reason.unwrap_or_else(|| DEFAULT_CANCELLATION_REASON.to_string()),
            },
        ),
    }
}

fn terminal(role: Role, outcome: RideOutcome) -> Vec<Effect> {
    let mut effects = vec![Effect::ClearRide(outcome), Effect::ShowPanel(Panel::Home)];
    if role == Role::Driver {
        effects.push(Effect::RestoreAvailability);
    }
    effects
}
