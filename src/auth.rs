use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::engine::Engine;

/// Cleartext credentials for the startup handshake.
///
/// A registered, enabled account logs in with its own password. Any other
/// login uses the server's bootstrap password and ends up anonymous, which
/// is enough to register.
pub struct RoomBookAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl RoomBookAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }

    fn expected(&self, user: Option<&str>) -> String {
        user.and_then(|email| self.engine.credential_for(email))
            .unwrap_or_else(|| self.password.clone())
    }
}

impl std::fmt::Debug for RoomBookAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomBookAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for RoomBookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = self.expected(login.user());
        Ok(Password::new(None, expected.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Principal, RequestContext};
    use crate::model::*;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_auth");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn registered_user_uses_own_password() {
        let engine = Arc::new(Engine::new(test_wal_path("own.wal")).unwrap());
        engine
            .register_user(
                &RequestContext::new(Principal::anonymous()),
                NewUser {
                    id: None,
                    name: Some("Ana".into()),
                    email: Some("Ana@Example.com".into()),
                    password: Some("ana-secret".into()),
                    roles: Some(Roles::single(Role::Profesor)),
                },
            )
            .await
            .unwrap();

        let source = RoomBookAuthSource::new(engine, "bootstrap".into());
        assert_eq!(source.expected(Some("ana@example.com")), "ana-secret");
        assert_eq!(source.expected(Some("nobody@example.com")), "bootstrap");
        assert_eq!(source.expected(None), "bootstrap");
    }
}
