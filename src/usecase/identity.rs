use crate::repo::AuthProvider;

/// Resolves who the current operation acts for. `None` means nobody is
/// signed in and the operation must do nothing.
pub trait IdentityGate: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

impl<A: AuthProvider + ?Sized> IdentityGate for A {
    fn current_user_id(&self) -> Option<String> {
        self.current_user().map(|user| user.uid)
    }
}
