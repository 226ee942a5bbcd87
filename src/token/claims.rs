use serde::{Deserialize, Serialize};

/// Audience of interactive session tokens.
pub const SESSION: &str = "websession";

/// Audience of authorization grant tokens.
pub const GRANT: &str = "authorization_grant";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    // Session tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdesc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issysadmin: Option<bool>,

    // Authorization grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

impl Claims {
    /// Session claims for `subject`; times and issuer are filled in on issue.
    #[must_use]
    pub fn session(subject: &str, userdesc: &str, issysadmin: bool) -> Self {
        Self {
            sub: subject.to_string(),
            aud: SESSION.to_string(),
            userdesc: Some(userdesc.to_string()),
            issysadmin: Some(issysadmin),
            ..Self::default()
        }
    }

    /// Authorization grant claims for `subject`.
    #[must_use]
    pub fn grant(subject: &str, client_id: &str, scope: &str, rtype: &str, redirect: &str) -> Self {
        Self {
            sub: subject.to_string(),
            aud: GRANT.to_string(),
            client_id: Some(client_id.to_string()),
            scope: Some(scope.to_string()),
            rtype: Some(rtype.to_string()),
            redirect: Some(redirect.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_sysadmin(&self) -> bool {
        self.issysadmin.unwrap_or(false)
    }
}
