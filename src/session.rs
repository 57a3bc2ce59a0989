use std::fmt;

/// Explicit per-caller context: which logical database the device works
/// against and the bearer token for remote calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    database_id: String,
    token: Option<String>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("database_id", &self.database_id)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Session {
    pub fn new(database_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into().trim().to_string(),
            token: None,
        }
    }

    /// Attach the bearer token. Blank tokens leave the session unauthenticated.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}
