use std::fmt;

use log::{info, warn};

use crate::{
    backend::{login_request, parse_token_response, refresh_request, HttpTransport},
    config::{AccountCredentials, BackendConfig},
    error::AuthError,
};

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    access_token: String,
    refresh_token: String,
}

impl Session {
    pub(crate) fn new(access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }

    pub(crate) fn access_token(&self) -> &str {
        &self.access_token
    }

    pub(crate) fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct SessionManager {
    backend: BackendConfig,
    session: Option<Session>,
}

impl SessionManager {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            session: None,
        }
    }

    pub fn set_backend(&mut self, backend: BackendConfig) {
        if backend != self.backend {
            self.backend = backend;
            self.session = None;
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub(crate) fn bearer(&self) -> Option<&str> {
        self.session.as_ref().map(Session::access_token)
    }

    pub fn invalidate(&mut self) {
        if self.session.take().is_some() {
            info!("backend session cleared");
        }
    }

    /// Password grant. A failure leaves any existing session untouched.
    pub fn login(
        &mut self,
        transport: &mut dyn HttpTransport,
        account: &AccountCredentials,
    ) -> Result<(), AuthError> {
        let response = transport.post(&login_request(&self.backend, account))?;
        let session = parse_token_response(&response)?;
        self.session = Some(session);
        info!("logged in as {}", account.email);
        Ok(())
    }

    /// Refresh-token grant. Any failure drops the whole session so the next
    /// cycle starts over with a login.
    pub fn refresh(&mut self, transport: &mut dyn HttpTransport) -> Result<(), AuthError> {
        let Some(current) = self.session.take() else {
            return Err(AuthError::NoSession);
        };

        let result = transport
            .post(&refresh_request(&self.backend, current.refresh_token()))
            .map_err(AuthError::from)
            .and_then(|response| parse_token_response(&response));

        match result {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                warn!("session refresh failed, session cleared: {err}");
                Err(err)
            }
        }
    }

    pub fn ensure_logged_in(
        &mut self,
        transport: &mut dyn HttpTransport,
        account: &AccountCredentials,
    ) -> bool {
        match self.try_ensure(transport, account) {
            Ok(()) => true,
            Err(err) => {
                warn!("authentication failed: {err}");
                false
            }
        }
    }

    pub(crate) fn try_ensure(
        &mut self,
        transport: &mut dyn HttpTransport,
        account: &AccountCredentials,
    ) -> Result<(), AuthError> {
        if self.session.is_some() {
            self.refresh(transport)
        } else {
            self.login(transport, account)
        }
    }
}
