use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::settings::ServerSettings;

/// The two callers the gate knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A machine submitting a status report.
    Report,
    /// A client reading fleet status.
    View,
}

/// Static shared-secret check for reports and views.
#[derive(Clone)]
pub struct AccessGate {
    report_key: String,
    view_key: String,
}

impl AccessGate {
    pub fn new(report_key: impl Into<String>, view_key: impl Into<String>) -> Self {
        Self {
            report_key: report_key.into(),
            view_key: view_key.into(),
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(settings.report_key.clone(), settings.view_key.clone())
    }

    /// Check a presented key for `role`. An unset key rejects every request.
    pub fn check(&self, role: Role, presented: Option<&str>) -> Result<(), ApiError> {
        let expected = match role {
            Role::Report => &self.report_key,
            Role::View => &self.view_key,
        };

        match presented {
            Some(key) if !expected.is_empty() && keys_match(expected, key) => Ok(()),
            _ => {
                log::warn!("Rejected {role:?} request with invalid key");
                Err(ApiError::InvalidCredential)
            }
        }
    }
}

impl std::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate").finish_non_exhaustive()
    }
}

/// Constant time over the key bytes; a length mismatch fails without a byte scan.
fn keys_match(expected: &str, presented: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}
