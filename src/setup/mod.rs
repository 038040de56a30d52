//! Setup Flow
//!
//! TigerStyle: Typed view over the remote's interactive setup wizard.
//!
//! The remote models driver configuration as a server-driven wizard. Every
//! response carries a string `state` and a loosely typed list of form
//! fields. This module turns that into:
//! - [`SetupSessionState`]: an explicit state enum
//! - [`SessionSnapshot`]: state plus a closed set of [`Field`] variants
//! - [`SetupSession`]: begin / read / advance / end for one driver
//!
//! Field lookups live in [`fields`].

pub mod fields;
mod session;

pub use fields::{first_choice, has_field, label_value, textarea_value};
pub use session::{setup_inputs, SetupSession};

use crate::remote::{localized_text, RemoteError};
use serde_json::Value;
use std::fmt;

// =============================================================================
// Types
// =============================================================================

/// State of a remote setup session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupSessionState {
    NotStarted,
    WaitUserAction,
    Processing,
    SetupComplete,
    SetupError,
    /// A value the protocol does not define (empty when the field was missing)
    Unknown(String),
}

impl SetupSessionState {
    /// Parse the remote's `state` string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "NOT_STARTED" => Self::NotStarted,
            "WAIT_USER_ACTION" => Self::WaitUserAction,
            "PROCESSING" => Self::Processing,
            "SETUP_COMPLETE" | "OK" => Self::SetupComplete,
            "SETUP_ERROR" | "ERROR" => Self::SetupError,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::WaitUserAction => "WAIT_USER_ACTION",
            Self::Processing => "PROCESSING",
            Self::SetupComplete => "SETUP_COMPLETE",
            Self::SetupError => "SETUP_ERROR",
            Self::Unknown(raw) => raw,
        }
    }

    /// The session will not move on without another request.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Processing | Self::NotStarted)
    }
}

impl fmt::Display for SetupSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.as_str().is_empty() {
            write!(f, "<missing>")
        } else {
            write!(f, "{}", self.as_str())
        }
    }
}

/// Typed value slot of a setup form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Dropdown with its selected value
    Dropdown(Option<String>),
    /// Multi-line text
    Textarea(Option<String>),
    /// Read-only label text
    Label(Option<String>),
    /// Any other widget (checkbox, number, ...)
    Other,
}

/// One form field of a setup page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: String,
    pub value: FieldValue,
}

impl Field {
    fn from_setting(setting: &Value) -> Option<Self> {
        let id = setting.get("id")?.as_str()?.to_string();
        let field = setting.get("field");
        let slot = |kind: &str| field.and_then(|f| f.get(kind));

        let value = if let Some(dropdown) = slot("dropdown") {
            FieldValue::Dropdown(dropdown.get("value").and_then(scalar_text))
        } else if let Some(textarea) = slot("textarea") {
            FieldValue::Textarea(textarea.get("value").and_then(scalar_text))
        } else if let Some(label) = slot("label") {
            FieldValue::Label(label.get("value").and_then(localized_text))
        } else {
            FieldValue::Other
        };

        Some(Self { id, value })
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One read of a setup session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SetupSessionState,
    pub fields: Vec<Field>,
    /// Error text declared by the driver, if any
    pub error: Option<String>,
}

impl SessionSnapshot {
    /// Interpret a raw setup response. Never fails; missing structure
    /// yields an empty field list.
    pub fn from_response(response: &Value) -> Self {
        let state = SetupSessionState::parse(
            response.get("state").and_then(Value::as_str).unwrap_or(""),
        );

        let fields = response
            .pointer("/require_user_action/input/settings")
            .and_then(Value::as_array)
            .map(|settings| settings.iter().filter_map(Field::from_setting).collect())
            .unwrap_or_default();

        let error = response.get("error").and_then(|e| match e {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            other => localized_text(other).or_else(|| Some(other.to_string())),
        });

        Self { state, fields, error }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failures while driving a setup flow
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("setup for {driver_id}: expected state {expected}, got {actual}")]
    UnexpectedState {
        driver_id: String,
        expected: SetupSessionState,
        actual: SetupSessionState,
    },

    #[error("setup for {driver_id}: field '{field}' missing from response")]
    MissingField { driver_id: String, field: String },

    #[error("malformed payload: {0}")]
    Data(String),
}

impl FlowError {
    /// Connection-level failure underneath the flow.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_transport())
    }
}

// =============================================================================
// Tests
// =============================================================================
