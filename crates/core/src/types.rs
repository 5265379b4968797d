use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Customer profile persisted by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub timezone: String,
    pub birthday: NaiveDate,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Gender recorded for a customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// Parses a gender case-insensitively, ignoring surrounding whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("male") {
            Some(Self::Male)
        } else if value.eq_ignore_ascii_case("female") {
            Some(Self::Female)
        } else {
            None
        }
    }

    /// Returns the canonical database representation for the gender.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a create request as received over the wire.
///
/// Missing fields decode to empty strings so that the validator, not the
/// decoder, reports which field is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateCustomerRequest {
    pub first_name: String,
    pub last_name: String,
    pub gender: String,
    pub timezone: Option<String>,
    pub birthday: String,
    pub user_id: String,
}

/// Body of a partial update request. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCustomerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthday: Option<String>,
}

/// Validated and normalized create payload, ready to be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub timezone: String,
    pub birthday: NaiveDate,
    pub user_id: Uuid,
}

impl NewCustomer {
    /// Builds the persisted record using server-assigned identity and timestamp.
    pub fn into_customer(self, id: Uuid, created_at: DateTime<Utc>) -> Customer {
        Customer {
            id,
            first_name: self.first_name,
            last_name: self.last_name,
            gender: self.gender,
            timezone: self.timezone,
            birthday: self.birthday,
            user_id: self.user_id,
            created_at,
        }
    }
}

/// Validated partial update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<Gender>,
    pub timezone: Option<String>,
    pub birthday: Option<NaiveDate>,
}
