use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, extract::Validate};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), AppError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(AppError::validation(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(())
}

/// Matches the `users.email` column width.
const MAX_EMAIL_LEN: usize = 255;

fn check_email(email: &str) -> Result<(), AppError> {
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err(AppError::validation(format!(
            "email must be at most {MAX_EMAIL_LEN} characters"
        )));
    }
    if !is_valid_email(email) {
        return Err(AppError::validation("email is invalid"));
    }
    Ok(())
}

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl Validate for RegisterRequest {
    fn validate(&self) -> Result<(), AppError> {
        check_len("username", &self.username, 3, 32)?;
        check_len("password", &self.password, 6, 32)?;
        check_email(&self.email)
    }
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl Validate for LoginRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.username.is_empty() {
            return Err(AppError::validation("username is required"));
        }
        if self.password.is_empty() {
            return Err(AppError::validation("password is required"));
        }
        Ok(())
    }
}

/// Partial profile update. Absent fields stay untouched; a present but empty
/// field is a validation error, never "absent".
#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Validate for UpdateUserRequest {
    fn validate(&self) -> Result<(), AppError> {
        if let Some(email) = &self.email {
            check_email(email)?;
        }
        if let Some(password) = &self.password {
            check_len("password", password, 6, 32)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
