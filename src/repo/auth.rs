//! Request authentication for package repositories.

use reqwest::RequestBuilder;

/// How requests against a repository are authenticated
#[derive(Debug, Clone, Default)]
pub enum Authenticator {
    #[default]
    Noop,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

impl Authenticator {
    /// Attaches the credentials to an outgoing request
    pub fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authenticator::Noop => request,
            Authenticator::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Authenticator::Bearer { token } => request.bearer_auth(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::AUTHORIZATION;

    fn build(auth: &Authenticator) -> reqwest::Request {
        let request = reqwest::Client::new().get("http://localhost/index.yaml");
        auth.authenticate(request).build().unwrap()
    }

    #[test]
    fn noop_adds_no_header() {
        let request = build(&Authenticator::Noop);
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn basic_auth_encodes_credentials() {
        let request = build(&Authenticator::Basic {
            username: "user".into(),
            password: "pass".into(),
        });
        let header = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(header.to_str().unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn bearer_auth_sets_token() {
        let request = build(&Authenticator::Bearer { token: "abc123".into() });
        let header = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer abc123");
    }
}
