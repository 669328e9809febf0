use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::engine::EngineError;

/// The authenticated identity an operation runs as. On the wire this is the
/// login user name; the core trusts it as the identity provider's uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub uid: String,
}

impl Caller {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }

    /// The uid, or Unauthorized for an anonymous caller.
    pub fn require(&self) -> Result<&str, EngineError> {
        let uid = self.uid.trim();
        if uid.is_empty() {
            return Err(EngineError::Unauthorized("sign in required"));
        }
        Ok(uid)
    }
}

/// Shared-secret password check; the user name is taken as the caller uid.
#[derive(Debug)]
pub struct AgendaAuthSource {
    password: String,
}

impl AgendaAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for AgendaAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
