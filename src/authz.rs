use tokio_util::sync::CancellationToken;

use crate::engine::EngineError;
use crate::model::{Role, Roles};

/// Identity the request acts as. Anonymous principals carry no email and no roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    email: Option<String>,
    roles: Roles,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(email: impl Into<String>, roles: Roles) -> Self {
        Self {
            email: Some(email.into()),
            roles,
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn roles(&self) -> &Roles {
        &self.roles
    }

    pub fn is_authenticated(&self) -> bool {
        self.email.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.is_authenticated() && self.roles.is_admin()
    }

    /// Emails compare case-insensitively.
    pub fn is(&self, email: &str) -> bool {
        self.email
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(email))
    }
}

/// Route-level operation classes. Which roles may call an operation at all,
/// independent of who owns the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    ReadCatalog,
    ManageCatalog,
    Bookings,
    Users,
}

impl Action {
    fn allowed_roles(self) -> &'static [Role] {
        match self {
            Action::Register => &[],
            Action::ReadCatalog | Action::Bookings | Action::Users => &[Role::Admin, Role::Profesor],
            Action::ManageCatalog => &[Role::Admin],
        }
    }
}

pub fn require(principal: &Principal, action: Action) -> Result<(), EngineError> {
    if action == Action::Register {
        return Ok(());
    }
    if !principal.is_authenticated() {
        return Err(EngineError::Unauthenticated);
    }
    if action.allowed_roles().iter().any(|r| principal.roles.has(*r)) {
        Ok(())
    } else {
        Err(EngineError::Forbidden("role not permitted for this operation"))
    }
}

/// Administrators may mutate anything; everyone else only what `owner_email` says they own.
pub fn can_mutate(principal: &Principal, owner_email: &str) -> bool {
    principal.is_admin() || principal.is(owner_email)
}

pub fn authorize_mutation(principal: &Principal, owner_email: &str) -> Result<(), EngineError> {
    if can_mutate(principal, owner_email) {
        Ok(())
    } else {
        Err(EngineError::Forbidden("only the owner or an administrator may modify this"))
    }
}

/// Per-request state threaded through the engine: who is asking, and whether they still care.
#[derive(Debug, Clone)]
pub struct RequestContext {
    principal: Principal,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self::with_cancel(principal, CancellationToken::new())
    }

    pub fn with_cancel(principal: Principal, cancel: CancellationToken) -> Self {
        Self { principal, cancel }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn ensure_active(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
