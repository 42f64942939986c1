use std::fmt;

use serde::{Deserialize, Serialize};

/// Roles that control which routes and operations a principal can access.
///
/// The hierarchy is a single linearly ordered set; access checks compare
/// numeric levels rather than enumerating role pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Unauthenticated caller.
    Public,
    /// Any authenticated account.
    User,
    /// A household member.
    Resident,
    /// Full administrative access.
    Admin,
}

impl Role {
    /// Parse a role from a string, ignoring case.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "public" => Some(Self::Public),
            "user" => Some(Self::User),
            "resident" => Some(Self::Resident),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Numeric level used for ordering comparisons.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::User => 1,
            Self::Resident => 2,
            Self::Admin => 3,
        }
    }

    /// Check whether this role satisfies the given requirement.
    #[must_use]
    pub fn satisfies(self, required: Self) -> bool {
        self.level() >= required.level()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::User => write!(f, "user"),
            Self::Resident => write!(f, "resident"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_is_linear() {
        assert!(Role::Admin.satisfies(Role::Resident));
        assert!(Role::Resident.satisfies(Role::User));
        assert!(Role::User.satisfies(Role::Public));
        assert!(!Role::User.satisfies(Role::Resident));
        assert!(!Role::Public.satisfies(Role::User));
        assert!(Role::Resident.satisfies(Role::Resident));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Role::from_str_loose("Admin"), Some(Role::Admin));
        assert_eq!(Role::from_str_loose("RESIDENT"), Some(Role::Resident));
        assert_eq!(Role::from_str_loose("guest"), None);
    }

    #[test]
    fn serde_round_trip_lowercase() {
        let json = serde_json::to_string(&Role::Resident).unwrap();
        assert_eq!(json, "\"resident\"");
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Role::Resident);
    }
}
