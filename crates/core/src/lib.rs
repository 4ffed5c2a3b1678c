#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod protocol;

/// Maximum length of a room identifier.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Mutation authority inside a room. Ordered: `Viewer < Editor < Admin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Viewer,
    Editor,
    Admin,
}

impl Role {
    #[must_use]
    pub fn can_edit(self) -> bool {
        self >= Role::Editor
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            _ => Err(CoreError::InvalidRole),
        }
    }
}

/// Identity established at token issuance; immutable for a socket's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid room id")]
    InvalidRoomId,
    #[error("invalid role")]
    InvalidRole,
}

/// Room ids are `[A-Za-z0-9_-]{1,64}`.
pub fn validate_room_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() || id.len() > MAX_ROOM_ID_LEN {
        return Err(CoreError::InvalidRoomId);
    }
    let ok = id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidRoomId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_order_matches_authority() {
        assert!(Role::Viewer < Role::Editor);
        assert!(Role::Editor < Role::Admin);
        assert!(!Role::Viewer.can_edit());
        assert!(Role::Editor.can_edit());
        assert!(Role::Admin.can_edit());
    }

    #[test]
    fn role_serde_uses_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&Role::Admin).expect("encode"),
            "\"admin\""
        );
        let role: Role = serde_json::from_str("\"editor\"").expect("decode");
        assert_eq!(role, Role::Editor);
        assert!(serde_json::from_str::<Role>("\"owner\"").is_err());
    }

    #[test]
    fn role_from_str_round_trips() {
        for role in [Role::Viewer, Role::Editor, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().expect("parse"), role);
        }
        assert!("Admin".parse::<Role>().is_err());
    }

    #[test]
    fn validate_room_id_cases() {
        let long_ok = "x".repeat(64);
        let too_long = "x".repeat(65);
        let valid = ["a", "room-1", "ROOM_2", long_ok.as_str()];
        for id in valid {
            assert!(validate_room_id(id).is_ok(), "{id}");
        }

        let invalid = ["", too_long.as_str(), "a/b", "a.b", "room 1", "café"];
        for id in invalid {
            assert!(validate_room_id(id).is_err(), "{id}");
        }
    }

    #[test]
    fn user_identity_wire_field_names() {
        let user = UserIdentity {
            user_id: "u-1".to_owned(),
            username: "alice".to_owned(),
            role: Role::Admin,
        };
        let encoded = serde_json::to_value(&user).expect("encode");
        assert_eq!(encoded["userId"], "u-1");
        assert_eq!(encoded["role"], "admin");
    }
}
