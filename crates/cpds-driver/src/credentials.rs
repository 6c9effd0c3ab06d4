//! Connection credentials.

use std::fmt;

/// Username and password used to open a physical connection.
///
/// Both parts are optional: a source may accept anonymous connections or
/// take its credentials from its own configuration. The password is never
/// printed by the `Debug` implementation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    /// Create credentials from an optional username and password.
    #[must_use]
    pub fn new(username: Option<&str>, password: Option<&str>) -> Self {
        Self {
            username: username.map(str::to_owned),
            password: password.map(str::to_owned),
        }
    }

    /// Credentials with neither username nor password.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// The username, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The password, if any.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether `password` equals the stored password (`None` matches `None`).
    #[must_use]
    pub fn password_matches(&self, password: Option<&str>) -> bool {
        self.password.as_deref() == password
    }

    /// Return a copy of these credentials with a different password.
    #[must_use]
    pub fn with_password(&self, password: Option<&str>) -> Self {
        Self {
            username: self.username.clone(),
            password: password.map(str::to_owned),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_matches_is_null_safe() {
        let creds = Credentials::new(Some("app"), None);
        assert!(creds.password_matches(None));
        assert!(!creds.password_matches(Some("")));

        let creds = Credentials::new(Some("app"), Some("secret"));
        assert!(creds.password_matches(Some("secret")));
        assert!(!creds.password_matches(Some("other")));
        assert!(!creds.password_matches(None));
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new(Some("app"), Some("hunter2"));
        let printed = format!("{creds:?}");
        assert!(printed.contains("app"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_with_password_keeps_username() {
        let creds = Credentials::new(Some("app"), Some("old")).with_password(Some("new"));
        assert_eq!(creds.username(), Some("app"));
        assert_eq!(creds.password(), Some("new"));
    }
}
