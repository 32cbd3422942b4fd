use serde::Serialize;

use crate::error::{ClientError, format_http_error_or};
use crate::transport::{AuthenticatedTransport, HttpMethod, RequestOptions};
use crate::types::AuthResponse;

pub const LOGIN_PATH: &str = "/auth/login";
pub const SIGNUP_PATH: &str = "/auth/signup";

const LOGIN_FAILED: &str = "Login failed";
const SIGNUP_FAILED: &str = "Signup failed";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignupRequest<'a> {
    email: &'a str,
    password: &'a str,
    password_confirm: &'a str,
    name: &'a str,
}

pub fn normalize_email(raw: &str) -> Result<String, ClientError> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(ClientError::InvalidInput("email must not be empty"));
    }
    Ok(normalized)
}

fn require_password(password: &str) -> Result<&str, ClientError> {
    if password.is_empty() {
        return Err(ClientError::InvalidInput("password must not be empty"));
    }
    Ok(password)
}

pub(crate) async fn login(
    transport: &AuthenticatedTransport,
    email: &str,
    password: &str,
) -> Result<AuthResponse, ClientError> {
    let email = normalize_email(email)?;
    let password = require_password(password)?;
    let body = LoginRequest {
        email: &email,
        password,
    };
    authenticate(transport, LOGIN_PATH, &body, LOGIN_FAILED).await
}

pub(crate) async fn signup(
    transport: &AuthenticatedTransport,
    email: &str,
    password: &str,
    name: &str,
) -> Result<AuthResponse, ClientError> {
    let email = normalize_email(email)?;
    let password = require_password(password)?;
    let body = SignupRequest {
        email: &email,
        password,
        password_confirm: password,
        name: name.trim(),
    };
    authenticate(transport, SIGNUP_PATH, &body, SIGNUP_FAILED).await
}

async fn authenticate<B>(
    transport: &AuthenticatedTransport,
    path: &str,
    body: &B,
    fallback: &str,
) -> Result<AuthResponse, ClientError>
where
    B: Serialize,
{
    let options = RequestOptions::json(HttpMethod::Post, body)?;
    let response = transport.request_anonymous(path, options).await?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(|error| ClientError::Read {
        message: error.to_string(),
    })?;
    if !status.is_success() {
        tracing::debug!(path, status = status.as_u16(), "authentication rejected");
        return Err(format_http_error_or(status, &bytes, fallback));
    }
    serde_json::from_slice::<AuthResponse>(&bytes).map_err(|error| ClientError::Decode {
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_lowercases_and_trims() {
        let normalized = normalize_email("  Ada@Example.COM ").expect("valid email");
        assert_eq!(normalized, "ada@example.com");
    }

    #[test]
    fn empty_credentials_are_rejected_locally() {
        assert!(matches!(
            normalize_email("   "),
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            require_password(""),
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[test]
    fn signup_body_repeats_password_confirmation() {
        let body = SignupRequest {
            email: "a@b.c",
            password: "pw",
            password_confirm: "pw",
            name: "Ada",
        };
        let encoded = serde_json::to_value(&body).expect("encode signup");
        assert_eq!(
            encoded,
            serde_json::json!({
                "email": "a@b.c",
                "password": "pw",
                "passwordConfirm": "pw",
                "name": "Ada",
            })
        );
    }
}
