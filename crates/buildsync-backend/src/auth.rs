//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Backend authentication schemes."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::fmt;
use std::path::Path;

use buildsync_common::settings::load_token;
use buildsync_common::StartupError;
use reqwest::RequestBuilder;

/// How requests to the backend are authenticated.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Basic { user: String, token: String },
    Bearer { token: String },
}

impl AuthConfig {
    /// Pick the auth scheme from the configured token files.
    ///
    /// Basic auth wins when both files are configured. Having neither is an error.
    pub fn from_files(
        user: &str,
        token_file: Option<&Path>,
        bearer_token_file: Option<&Path>,
    ) -> Result<Self, StartupError> {
        if let Some(path) = token_file {
            return Ok(Self::Basic {
                user: user.to_owned(),
                token: load_token(path)?,
            });
        }
        if let Some(path) = bearer_token_file {
            return Ok(Self::Bearer {
                token: load_token(path)?,
            });
        }
        Err(StartupError::MissingAuth)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Bearer { .. } => "bearer",
        }
    }

    pub(crate) fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            AuthConfig::Basic { user, token } => request.basic_auth(user, Some(token)),
            AuthConfig::Bearer { token } => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("token", &"<redacted>")
                .finish(),
            AuthConfig::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn token_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn basic_auth_preferred_over_bearer() {
        let basic = token_file("  secret\n");
        let bearer = token_file("bearer-secret");
        let auth =
            AuthConfig::from_files("trigger", Some(basic.path()), Some(bearer.path())).unwrap();
        assert_eq!(
            auth,
            AuthConfig::Basic {
                user: "trigger".into(),
                token: "secret".into()
            }
        );
    }

    #[test]
    fn bearer_used_when_only_bearer_configured() {
        let bearer = token_file("bearer-secret\n");
        let auth = AuthConfig::from_files("trigger", None, Some(bearer.path())).unwrap();
        assert_eq!(auth.scheme(), "bearer");
        assert!(!format!("{auth:?}").contains("bearer-secret"));
    }

    #[test]
    fn missing_configuration_is_fatal() {
        assert!(matches!(
            AuthConfig::from_files("trigger", None, None),
            Err(StartupError::MissingAuth)
        ));
    }

    #[test]
    fn unreadable_token_file_is_fatal() {
        let err = AuthConfig::from_files("trigger", Some(Path::new("/nonexistent/token")), None)
            .unwrap_err();
        assert!(matches!(err, StartupError::Credential { .. }));
    }
}
