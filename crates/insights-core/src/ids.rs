use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Locally minted id. Remote ids arrive through `from_raw`.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ThreadId, "thread");
branded_id!(RunId, "run");
branded_id!(ToolCallId, "call");
branded_id!(FileId, "file");
branded_id!(AssistantId, "asst");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_has_prefix() {
        let id = ThreadId::new();
        assert!(id.as_str().starts_with("thread_"), "got: {id}");
    }

    #[test]
    fn run_id_has_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"), "got: {id}");
    }

    #[test]
    fn tool_call_id_has_prefix() {
        let id = ToolCallId::new();
        assert!(id.as_str().starts_with("call_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_keeps_remote_value() {
        let id = ThreadId::from_raw("thread_abc123");
        assert_eq!(id.as_str(), "thread_abc123");
        assert_eq!(id.to_string(), "thread_abc123");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ToolCallId::from_raw("call_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""call_1""#);
        let parsed: ToolCallId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
