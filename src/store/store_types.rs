use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreditAccount {
    pub user_id: String,
    pub credits: u64,
    pub total_generations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_credit_refresh_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl UserCreditAccount {
    pub fn new(user_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            credits: 0,
            total_generations: 0,
            last_credit_refresh_ms: None,
            email: None,
            display_name: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Fills identity fields that are still empty. Returns whether anything changed.
    pub fn absorb_identity(&mut self, identity: &AccountIdentity) -> bool {
        let mut changed = false;
        if self.email.is_none() {
            if let Some(email) = identity.email() {
                self.email = Some(email.to_string());
                changed = true;
            }
        }
        if self.display_name.is_none() {
            if let Some(name) = identity.display_name() {
                self.display_name = Some(name.to_string());
                changed = true;
            }
        }
        changed
    }
}

/// Denormalized identity metadata. Blank values are treated as absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AccountIdentity {
    pub fn email(&self) -> Option<&str> {
        non_blank(self.email.as_deref())
    }

    pub fn display_name(&self) -> Option<&str> {
        non_blank(self.display_name.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.email().is_none() && self.display_name().is_none()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditRequestStatus {
    Pending,
    Approved,
    Denied,
}

impl CreditRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for CreditRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditRequestStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown credit request status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub id: i64,
    pub user_id: String,
    pub message: String,
    pub status: CreditRequestStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at_ms: Option<u64>,
    #[serde(default)]
    pub credits_granted: u64,
}

/// Reviewer decision. `credits` is only applied for approvals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReview {
    pub status: CreditRequestStatus,
    #[serde(default)]
    pub credits: u64,
}

impl CreditReview {
    pub fn approve(credits: u64) -> Self {
        Self {
            status: CreditRequestStatus::Approved,
            credits,
        }
    }

    pub fn deny() -> Self {
        Self {
            status: CreditRequestStatus::Denied,
            credits: 0,
        }
    }

    pub fn granted_credits(&self) -> u64 {
        match self.status {
            CreditRequestStatus::Approved => self.credits,
            CreditRequestStatus::Pending | CreditRequestStatus::Denied => 0,
        }
    }
}
