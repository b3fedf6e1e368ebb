//! String-backed identifier newtypes.
//!
//! Every identifier orders by its string value, which is what the planner
//! relies on for ascending-ID tie breaks.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier (UUID v4).
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifies a deployable service.
    ServiceId
);
string_id!(
    /// Identifies the project owning services and environments.
    ProjectId
);
string_id!(
    /// Identifies a target environment (maps to one cluster namespace).
    EnvironmentId
);
string_id!(
    /// Identifies a built release artifact.
    ReleaseId
);
string_id!(
    /// Identifies one deployment attempt.
    DeploymentId
);
string_id!(
    /// Identifies a deployment group.
    GroupId
);
string_id!(DependencyId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_by_string_value() {
        let mut ids = vec![
            ServiceId::from("worker"),
            ServiceId::from("api"),
            ServiceId::from("db"),
        ];
        ids.sort();
        let names: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "worker"]);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(DeploymentId::generate(), DeploymentId::generate());
    }

    #[test]
    fn serializes_as_bare_string() {
        let json = serde_json::to_string(&GroupId::from("g-1")).unwrap();
        assert_eq!(json, "\"g-1\"");
    }
}
