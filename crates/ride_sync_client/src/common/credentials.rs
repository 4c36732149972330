/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use super::types::{Role, Token};
use crate::tools::error::AppError;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};
use tracing::{info, warn};

/// Bearer token slots, one per role.
pub trait CredentialStore: Send + Sync {
    fn get(&self, role: Role) -> Option<Token>;
    fn set(&self, role: Role, token: Token) -> Result<(), AppError>;
    fn clear_all(&self) -> Result<(), AppError>;

    /// The token attached to the channel handshake and to every REST call.
    /// The rider slot wins when both are filled.
    fn active_token(&self) -> Option<Token> {
        self.get(Role::Rider).or_else(|| self.get(Role::Driver))
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct TokenSlots {
    user_token: Option<Token>,
    captain_token: Option<Token>,
}

impl TokenSlots {
    fn slot(&mut self, role: Role) -> &mut Option<Token> {
        match role {
            Role::Rider => &mut self.user_token,
            Role::Driver => &mut self.captain_token,
        }
    }

    fn get(&self, role: Role) -> Option<Token> {
        match role {
            Role::Rider => self.user_token.clone(),
            Role::Driver => self.captain_token.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slots: RwLock<TokenSlots>,
}

impl MemoryCredentialStore {
    pub fn with_token(role: Role, token: &str) -> Self {
        let mut slots = TokenSlots::default();
        *slots.slot(role) = Some(Token(token.to_string()));
        MemoryCredentialStore {
            slots: RwLock::new(slots),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, role: Role) -> Option<Token> {
        self.slots.read().ok().and_then(|slots| slots.get(role))
    }

    fn set(&self, role: Role, token: Token) -> Result<(), AppError> {
        let mut slots = self
            .slots
            .write()
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        *slots.slot(role) = Some(token);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), AppError> {
        let mut slots = self
            .slots
            .write()
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        *slots = TokenSlots::default();
        Ok(())
    }
}

/// Durable token storage backed by a small JSON document on disk.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    slots: RwLock<TokenSlots>,
}

impl FileCredentialStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let slots = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<TokenSlots>(&content).map_err(|err| {
                AppError::DeserializationError(format!("{} : {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TokenSlots::default(),
            Err(err) => return Err(AppError::InternalError(err.to_string())),
        };
        info!(tag = "[Credential Store]", path = %path.display(), "Opened");
        Ok(FileCredentialStore {
            path,
            slots: RwLock::new(slots),
        })
    }

    fn persist(&self, slots: &TokenSlots) -> Result<(), AppError> {
        let content = serde_json::to_string_pretty(slots)
            .map_err(|err| AppError::SerializationError(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| AppError::InternalError(err.to_string()))?;
            }
        }
        std::fs::write(&self.path, content).map_err(|err| {
            warn!(tag = "[Credential Store]", error = %err, "Failed to persist tokens");
            AppError::InternalError(err.to_string())
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, role: Role) -> Option<Token> {
        self.slots.read().ok().and_then(|slots| slots.get(role))
    }

    fn set(&self, role: Role, token: Token) -> Result<(), AppError> {
        let mut slots = self
            .slots
            .write()
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        *slots.slot(role) = Some(token);
        self.persist(&slots)
    }

    fn clear_all(&self) -> Result<(), AppError> {
        let mut slots = self
            .slots
            .write()
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        *slots = TokenSlots::default();
        self.persist(&slots)
    }
}
