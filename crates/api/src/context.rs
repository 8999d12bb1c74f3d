use fieldstock_core::UserId;

/// The user on whose behalf a request runs.
///
/// Inserted by [`crate::middleware::actor_middleware`]; present on every route except
/// `/health`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActorContext {
    user_id: UserId,
}

impl ActorContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
