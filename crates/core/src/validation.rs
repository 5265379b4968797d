use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    CreateCustomerRequest, CustomerChanges, Gender, NewCustomer, UpdateCustomerRequest,
};

pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_AGE_YEARS: i32 = 150;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const BIRTHDAY_FORMAT: &str = "%Y-%m-%d";

/// First rule violation found in a client payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    field: &'static str,
    message: String,
}

impl ValidationError {
    pub fn new<S: Into<String>>(field: &'static str, message: S) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Validates a full create payload and returns its normalized form.
///
/// `today` is the current UTC calendar date and bounds the birthday.
pub fn validate_create(
    request: &CreateCustomerRequest,
    today: NaiveDate,
) -> Result<NewCustomer, ValidationError> {
    let first_name = required_name("first_name", &request.first_name)?;
    let last_name = required_name("last_name", &request.last_name)?;

    if request.gender.trim().is_empty() {
        return Err(ValidationError::new("gender", "gender is required"));
    }
    let gender = checked_gender("gender", &request.gender)?;

    let timezone = checked_timezone(request.timezone.as_deref())?;

    if request.birthday.trim().is_empty() {
        return Err(ValidationError::new("birthday", "birthday is required"));
    }
    let birthday = checked_birthday(&request.birthday, today)?;

    let user_id = checked_user_id(&request.user_id)?;

    Ok(NewCustomer {
        first_name,
        last_name,
        gender,
        timezone,
        birthday,
        user_id,
    })
}

/// Validates a partial update. Absent fields are neither checked nor changed.
pub fn validate_update(
    request: &UpdateCustomerRequest,
    today: NaiveDate,
) -> Result<CustomerChanges, ValidationError> {
    let first_name = request
        .first_name
        .as_deref()
        .map(|value| present_name("first_name", value))
        .transpose()?;
    let last_name = request
        .last_name
        .as_deref()
        .map(|value| present_name("last_name", value))
        .transpose()?;

    let gender = match request.gender.as_deref() {
        Some(value) if value.trim().is_empty() => {
            return Err(ValidationError::new("gender", "gender cannot be empty"));
        }
        Some(value) => Some(checked_gender("gender", value)?),
        None => None,
    };

    let timezone = match request.timezone.as_deref() {
        Some(value) => Some(checked_timezone(Some(value))?),
        None => None,
    };

    let birthday = request
        .birthday
        .as_deref()
        .map(|value| checked_birthday(value, today))
        .transpose()?;

    Ok(CustomerChanges {
        first_name,
        last_name,
        gender,
        timezone,
        birthday,
    })
}

fn required_name(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, format!("{field} is required")));
    }
    bounded_name(field, trimmed)
}

fn present_name(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(
            field,
            format!("{field} cannot be empty"),
        ));
    }
    bounded_name(field, trimmed)
}

fn bounded_name(field: &'static str, trimmed: &str) -> Result<String, ValidationError> {
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationError::new(
            field,
            format!("{field} too long, max {MAX_NAME_CHARS} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

fn checked_gender(field: &'static str, value: &str) -> Result<Gender, ValidationError> {
    Gender::parse(value)
        .ok_or_else(|| ValidationError::new(field, "gender must be male or female"))
}

/// Blank or absent timezones fall back to [`DEFAULT_TIMEZONE`].
fn checked_timezone(value: Option<&str>) -> Result<String, ValidationError> {
    let trimmed = value.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Ok(DEFAULT_TIMEZONE.to_string());
    }
    trimmed.parse::<Tz>().map_err(|_| {
        ValidationError::new(
            "timezone",
            format!("timezone must be a valid IANA time zone name (got {trimmed})"),
        )
    })?;
    Ok(trimmed.to_string())
}

fn checked_birthday(value: &str, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let date = parse_birthday(value).ok_or_else(|| {
        ValidationError::new(
            "birthday",
            "birthday must be in format YYYY-MM-DD (e.g., 1990-05-15)",
        )
    })?;

    if date > today {
        return Err(ValidationError::new(
            "birthday",
            "birthday cannot be in the future",
        ));
    }

    if date < earliest_birthday(today) {
        return Err(ValidationError::new(
            "birthday",
            "birthday is too far in the past",
        ));
    }

    Ok(date)
}

/// Same calendar day [`MAX_AGE_YEARS`] years before `today`.
///
/// A Feb 29 `today` maps to Mar 1 when the target year has no leap day.
fn earliest_birthday(today: NaiveDate) -> NaiveDate {
    let year = today.year() - MAX_AGE_YEARS;
    today
        .with_year(year)
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
        .unwrap_or(NaiveDate::MIN)
}

/// Parses a zero-padded `YYYY-MM-DD` date with no surrounding text.
fn parse_birthday(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(idx, byte)| match idx {
            4 | 7 => *byte == b'-',
            _ => byte.is_ascii_digit(),
        });
    if !shaped {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, BIRTHDAY_FORMAT).ok()
}

fn checked_user_id(value: &str) -> Result<Uuid, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("user_id", "user_id is required"));
    }
    Uuid::parse_str(trimmed)
        .map_err(|_| ValidationError::new("user_id", "user_id must be a valid UUID"))
}
