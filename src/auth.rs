use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_OWNER_LEN;

/// Shared-secret login. The startup `user` becomes the actor that owns
/// reservations, so it must be usable as an owner id; the password is the
/// same for everyone.
#[derive(Debug)]
pub struct RoombookAuthSource {
    password: String,
}

impl RoombookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// `Err` with the rejection reason when `user` cannot own reservations.
pub fn check_user(user: Option<&str>) -> Result<&str, &'static str> {
    match user {
        None => Err("a user name is required"),
        Some(u) if u.trim().is_empty() => Err("a user name is required"),
        Some(u) if u.len() > MAX_OWNER_LEN => Err("user name too long"),
        Some(u) => Ok(u),
    }
}

#[async_trait]
impl AuthSource for RoombookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(reason) = check_user(login.user().as_deref()) {
            tracing::warn!("login rejected: {reason}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                reason.into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
