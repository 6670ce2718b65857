use crate::{Error, Result};
use rand::Rng;
use rsip::{
    headers::auth::{Algorithm, AuthQop, Qop},
    prelude::ToTypedHeader,
    services::DigestGenerator,
    typed::{Authorization, ProxyAuthorization},
    Header,
};
use tracing::warn;

/// Digest credential from configuration: a plaintext password or a
/// pre-computed `MD5(username:realm:password)`.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: Option<String>,
    pub ha1: Option<String>,
}

/// One 401/407 challenge, normalized from either authenticate header.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub stale: bool,
    pub algorithm: Algorithm,
    pub qop: Option<Qop>,
    /// True when the challenge arrived as `Proxy-Authenticate`.
    pub proxy: bool,
}

impl DigestChallenge {
    /// Pull the challenge out of a 401/407 response.
    pub fn from_response(resp: &rsip::Response) -> Result<Self> {
        for header in resp.headers.iter() {
            match header {
                Header::WwwAuthenticate(h) => {
                    let typed = h.typed()?;
                    return Ok(Self::from_typed(typed, false));
                }
                Header::ProxyAuthenticate(h) => {
                    let typed = h.typed()?;
                    return Ok(Self::from_typed(typed.0, true));
                }
                _ => {}
            }
        }
        Err(Error::Error(format!(
            "no challenge in {} response",
            resp.status_code
        )))
    }

    fn from_typed(typed: rsip::typed::WwwAuthenticate, proxy: bool) -> Self {
        DigestChallenge {
            realm: typed.realm.clone(),
            nonce: typed.nonce.clone(),
            opaque: typed.opaque.clone(),
            stale: typed
                .stale
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            algorithm: typed.algorithm.unwrap_or_default(),
            qop: typed.qop.clone(),
            proxy,
        }
    }
}

/// Digest state for one request sender: challenge, credential and
/// the strictly increasing nonce count.
pub struct DigestAuth {
    credential: Credential,
    challenge: DigestChallenge,
    nc: u32,
    cnonce: String,
}

fn random_cnonce() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

impl DigestAuth {
    pub fn new(credential: Credential, challenge: DigestChallenge) -> Self {
        Self {
            credential,
            challenge,
            nc: 0,
            cnonce: random_cnonce(),
        }
    }

    pub fn challenge(&self) -> &DigestChallenge {
        &self.challenge
    }

    /// Whether this stack can answer the challenge at all.
    pub fn supported(&self) -> bool {
        if matches!(self.challenge.qop, Some(Qop::AuthInt)) {
            warn!("qop=auth-int is not supported");
            return false;
        }
        match self.challenge.algorithm {
            Algorithm::Md5 | Algorithm::Md5Sess => true,
            other => {
                // ha1 credentials bind us to MD5 families
                if self.credential.ha1.is_some() {
                    warn!("algorithm {:?} unusable with ha1 credential", other);
                    false
                } else {
                    self.credential.password.is_some()
                }
            }
        }
    }

    /// Build the `Authorization`/`Proxy-Authorization` header for the
    /// given request line, bumping `nc`.
    pub fn authorization(&mut self, method: &rsip::Method, uri: &rsip::Uri) -> Header {
        self.nc += 1;

        let auth_qop = match self.challenge.qop {
            Some(Qop::Auth) | Some(Qop::AuthInt) => Some(AuthQop::Auth {
                cnonce: self.cnonce.clone(),
                nc: self.nc as u8,
            }),
            None => None,
        };

        let response = match (&self.credential.password, &self.credential.ha1) {
            (Some(password), _) => DigestGenerator {
                username: self.credential.username.as_str(),
                password: password.as_str(),
                algorithm: self.challenge.algorithm,
                nonce: self.challenge.nonce.as_str(),
                method,
                qop: auth_qop.as_ref(),
                uri,
                realm: self.challenge.realm.as_str(),
            }
            .compute(),
            (None, Some(ha1)) => self.compute_from_ha1(ha1, method, uri),
            (None, None) => String::new(),
        };

        let authorization = Authorization {
            scheme: rsip::headers::auth::Scheme::Digest,
            username: self.credential.username.clone(),
            realm: self.challenge.realm.clone(),
            nonce: self.challenge.nonce.clone(),
            uri: uri.clone(),
            response,
            algorithm: Some(self.challenge.algorithm),
            opaque: self.challenge.opaque.clone(),
            qop: auth_qop,
        };

        if self.challenge.proxy {
            ProxyAuthorization(authorization).into()
        } else {
            authorization.into()
        }
    }

    /// RFC 2617 computation starting from a stored HA1.
    fn compute_from_ha1(&self, ha1: &str, method: &rsip::Method, uri: &rsip::Uri) -> String {
        let ha1 = match self.challenge.algorithm {
            Algorithm::Md5Sess => md5_hex(&format!(
                "{}:{}:{}",
                ha1, self.challenge.nonce, self.cnonce
            )),
            _ => ha1.to_string(),
        };
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        match self.challenge.qop {
            Some(_) => md5_hex(&format!(
                "{}:{}:{:08x}:{}:auth:{}",
                ha1, self.challenge.nonce, self.nc, self.cnonce, ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, self.challenge.nonce, ha2)),
        }
    }
}

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(qop: Option<Qop>, stale: Option<&str>) -> DigestChallenge {
        DigestChallenge {
            realm: "a".into(),
            nonce: "n".into(),
            opaque: None,
            stale: stale.map(|s| s.eq_ignore_ascii_case("true")).unwrap_or(false),
            algorithm: Algorithm::Md5,
            qop,
            proxy: false,
        }
    }

    #[test]
    fn test_ha1_digest_with_qop() {
        let credential = Credential {
            username: "alice".into(),
            password: None,
            ha1: Some(md5_hex("alice:a:secret")),
        };
        let mut auth = DigestAuth::new(credential, challenge(Some(Qop::Auth), None));
        let uri = rsip::Uri::try_from("sip:example.com").unwrap();
        let header = auth.authorization(&rsip::Method::Register, &uri);

        // nc starts at 1 and the response is the RFC 2617 formula
        let line = header.to_string();
        assert!(line.contains("nc=00000001"), "line: {}", line);
        let cnonce = auth.cnonce.clone();
        let ha1 = md5_hex("alice:a:secret");
        let ha2 = md5_hex("REGISTER:sip:example.com");
        let expected = md5_hex(&format!("{}:n:00000001:{}:auth:{}", ha1, cnonce, ha2));
        assert!(line.contains(&expected), "line: {}", line);
    }

    #[test]
    fn test_nc_increases_per_nonce() {
        let credential = Credential {
            username: "alice".into(),
            password: Some("secret".into()),
            ha1: None,
        };
        let mut auth = DigestAuth::new(credential, challenge(Some(Qop::Auth), None));
        let uri = rsip::Uri::try_from("sip:example.com").unwrap();
        let first = auth.authorization(&rsip::Method::Register, &uri).to_string();
        let second = auth.authorization(&rsip::Method::Register, &uri).to_string();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn test_password_and_ha1_agree() {
        let uri = rsip::Uri::try_from("sip:example.com").unwrap();
        let mut with_password = DigestAuth::new(
            Credential {
                username: "alice".into(),
                password: Some("secret".into()),
                ha1: None,
            },
            challenge(None, None),
        );
        let mut with_ha1 = DigestAuth::new(
            Credential {
                username: "alice".into(),
                password: None,
                ha1: Some(md5_hex("alice:a:secret")),
            },
            challenge(None, None),
        );
        let a = with_password
            .authorization(&rsip::Method::Register, &uri)
            .to_string();
        let b = with_ha1
            .authorization(&rsip::Method::Register, &uri)
            .to_string();
        let response_of = |line: &str| {
            let start = line.find("response=").expect("response param");
            line[start..start + 9 + 34].to_string()
        };
        assert_eq!(response_of(&a), response_of(&b));
    }

    #[test]
    fn test_auth_int_unsupported() {
        let auth = DigestAuth::new(
            Credential {
                username: "alice".into(),
                password: Some("secret".into()),
                ha1: None,
            },
            challenge(Some(Qop::AuthInt), None),
        );
        assert!(!auth.supported());
    }
}
