use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared server password. The login user name only selects the acting
/// identity; permissions come from the user record in the catalog.
#[derive(Debug)]
pub struct VenueBookAuthSource {
    password: String,
}

impl VenueBookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for VenueBookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
