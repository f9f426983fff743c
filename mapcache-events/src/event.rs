//! Event record.

use chrono::{DateTime, Utc};
use mapcache_core::DesiredAction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of cache mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Update,
    Delete,
    DeleteAll,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Update => "update",
            Action::Delete => "delete",
            Action::DeleteAll => "delete-all",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    /// Display form of the key; empty for `DeleteAll`.
    pub key: String,
    pub value: Option<String>,
    pub desired_action: DesiredAction,
    pub last_error: Option<String>,
}

impl Event {
    /// Event stamped with the current time.
    pub fn new(action: Action, key: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            key: key.into(),
            value: None,
            desired_action: DesiredAction::Ok,
            last_error: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_desired_action(mut self, action: DesiredAction) -> Self {
        self.desired_action = action;
        self
    }

    /// Record `error`, if any, by its display form.
    pub fn with_error<E: fmt::Display>(mut self, error: Option<&E>) -> Self {
        self.last_error = error.map(ToString::to_string);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} key={}",
            self.timestamp.to_rfc3339(),
            self.action,
            self.key
        )?;
        if let Some(value) = &self.value {
            write!(f, " value={}", value)?;
        }
        write!(f, " state={}", self.desired_action)?;
        if let Some(err) = &self.last_error {
            write!(f, " error=\"{}\"", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapcache_core::MapError;

    #[test]
    fn test_action_strings() {
        assert_eq!(Action::Update.to_string(), "update");
        assert_eq!(Action::Delete.to_string(), "delete");
        assert_eq!(Action::DeleteAll.to_string(), "delete-all");
    }

    #[test]
    fn test_event_display() {
        let event = Event::new(Action::Update, "10.0.0.1")
            .with_value("42")
            .with_desired_action(DesiredAction::Insert)
            .with_error(Some(&MapError::DeletionPending));
        let line = event.to_string();
        assert!(line.contains("update key=10.0.0.1"));
        assert!(line.contains("value=42"));
        assert!(line.contains("state=to-be-inserted"));
        assert!(line.contains("error=\"deletion pending\""));
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new(Action::DeleteAll, "");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "delete-all");
        assert_eq!(json["desired_action"], "ok");
        assert!(json["value"].is_null());
    }
}
