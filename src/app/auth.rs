use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;

use crate::domain::task::User;
use crate::error::AuthError;
use crate::repo::AuthProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    Working,
    SignedIn(User),
    Failed(AuthError),
}

#[derive(Debug, Clone, Copy)]
enum Flow {
    Login,
    Signup,
}

/// Sign-in/sign-up front for an auth provider, with its outcome kept as
/// observable state.
pub struct AuthModel {
    provider: Arc<dyn AuthProvider>,
    state: watch::Sender<AuthState>,
}

impl AuthModel {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        let initial = match provider.current_user() {
            Some(user) => AuthState::SignedIn(user),
            None => AuthState::SignedOut,
        };
        let (state, _) = watch::channel(initial);
        Self { provider, state }
    }

    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        self.authenticate(Flow::Login, email, password).await
    }

    pub async fn signup(&self, email: &str, password: &str) -> Result<User, AuthError> {
        self.authenticate(Flow::Signup, email, password).await
    }

    pub fn sign_out(&self) {
        self.provider.sign_out();
        self.state.send_replace(AuthState::SignedOut);
        info!("signed out");
    }

    async fn authenticate(&self, flow: Flow, email: &str, password: &str) -> Result<User, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.trim().is_empty() {
            return Err(self.fail(AuthError::Validation(
                "email and password must not be empty".into(),
            )));
        }

        self.state.send_replace(AuthState::Working);
        let outcome = match flow {
            Flow::Login => self.provider.sign_in_with_password(email, password).await,
            Flow::Signup => self.provider.create_user(email, password).await,
        };
        match outcome {
            Ok(user) => {
                info!("{flow:?} succeeded for {}", user.email);
                self.state.send_replace(AuthState::SignedIn(user.clone()));
                Ok(user)
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn fail(&self, err: AuthError) -> AuthError {
        warn!("authentication failed: {err}");
        self.state.send_replace(AuthState::Failed(err.clone()));
        err
    }
}
