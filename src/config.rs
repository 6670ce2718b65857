use crate::{transaction::random_text, Error, Result};
use rand::Rng;

pub const DEFAULT_REGISTER_EXPIRES: u32 = 600;
pub const DEFAULT_NO_ANSWER_TIMEOUT: u64 = 60;
pub const MAX_NO_ANSWER_TIMEOUT: u64 = 600;
pub const DEFAULT_RECOVERY_MIN_INTERVAL: u64 = 2;
pub const DEFAULT_RECOVERY_MAX_INTERVAL: u64 = 30;

/// One candidate WebSocket server. Higher weight wins; ties are
/// broken uniformly at random.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ws_uri: String,
    pub weight: u16,
}

impl ServerConfig {
    pub fn new(ws_uri: &str) -> Self {
        Self {
            ws_uri: ws_uri.to_string(),
            weight: 0,
        }
    }

    pub fn with_weight(ws_uri: &str, weight: u16) -> Self {
        Self {
            ws_uri: ws_uri.to_string(),
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    pub urls: String,
    pub username: String,
    pub credential: String,
}

/// User agent configuration.
///
/// `ws_servers` and `uri` are mandatory; everything else has a
/// default. Every option is validated by [`UaConfig::validate`] and a
/// single invalid option aborts initialization with
/// [`Error::Configuration`].
#[derive(Debug, Clone)]
pub struct UaConfig {
    /// Candidate WebSocket servers, tried by weight.
    pub ws_servers: Vec<ServerConfig>,
    /// Address-of-record of this UA, e.g. `sip:alice@example.com`.
    pub uri: String,
    pub display_name: Option<String>,
    /// Digest username; defaults to the AOR user part.
    pub authorization_user: Option<String>,
    pub password: Option<String>,
    /// Pre-computed `MD5(user:realm:password)` alternative to `password`.
    pub ha1: Option<String>,
    /// Auto-register when the transport connects.
    pub register: bool,
    /// Requested Contact expiry in seconds.
    pub register_expires: u32,
    /// Cancel an unanswered incoming ring after this many seconds.
    pub no_answer_timeout: u64,
    /// Enable RFC 4028 session timers.
    pub session_timers: bool,
    pub connection_recovery_min_interval: u64,
    pub connection_recovery_max_interval: u64,
    /// Add preloaded Route headers from `routes` on every request.
    pub use_preloaded_route: bool,
    pub routes: Vec<String>,
    /// NAT workaround: advertise TCP in Via instead of WS.
    pub hack_via_tcp: bool,
    /// NAT workaround: random test-net IP in Contact instead of a
    /// `.invalid` domain.
    pub hack_ip_in_contact: bool,
    /// Handed to the media engine untouched.
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServerConfig>,
    pub user_agent: String,
}

impl Default for UaConfig {
    fn default() -> Self {
        Self {
            ws_servers: vec![],
            uri: String::new(),
            display_name: None,
            authorization_user: None,
            password: None,
            ha1: None,
            register: true,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            no_answer_timeout: DEFAULT_NO_ANSWER_TIMEOUT,
            session_timers: true,
            connection_recovery_min_interval: DEFAULT_RECOVERY_MIN_INTERVAL,
            connection_recovery_max_interval: DEFAULT_RECOVERY_MAX_INTERVAL,
            use_preloaded_route: false,
            routes: vec![],
            hack_via_tcp: false,
            hack_ip_in_contact: false,
            stun_servers: vec![],
            turn_servers: vec![],
            user_agent: concat!("websip/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Validated, parsed settings derived from a [`UaConfig`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: UaConfig,
    pub uri: rsip::Uri,
    pub user: String,
    pub domain: String,
    pub authorization_user: String,
    /// Host placed in Via and Contact, `<random>.invalid` by default.
    pub via_host: String,
    pub contact_uri: rsip::Uri,
    /// `urn:uuid:...` advertised as `+sip.instance`.
    pub instance_id: String,
    pub routes: Vec<rsip::Uri>,
}

impl UaConfig {
    pub fn validate(&self) -> Result<Settings> {
        if self.ws_servers.is_empty() {
            return Err(Error::Configuration("ws_servers: empty".into()));
        }
        for server in &self.ws_servers {
            let lower = server.ws_uri.to_ascii_lowercase();
            if !(lower.starts_with("ws://") || lower.starts_with("wss://")) {
                return Err(Error::Configuration(format!(
                    "ws_servers: not a WebSocket URI: {}",
                    server.ws_uri
                )));
            }
            let host = &server.ws_uri[lower.find("://").unwrap() + 3..];
            if host.is_empty() || host.starts_with('/') {
                return Err(Error::Configuration(format!(
                    "ws_servers: missing host: {}",
                    server.ws_uri
                )));
            }
        }

        let uri = rsip::Uri::try_from(self.uri.as_str())
            .map_err(|e| Error::Configuration(format!("uri: {}", e)))?;
        let user = match &uri.auth {
            Some(auth) => auth.user.clone(),
            None => return Err(Error::Configuration("uri: missing user part".into())),
        };
        let domain = uri.host_with_port.host.to_string().to_lowercase();

        if let (Some(_), Some(_)) = (&self.password, &self.ha1) {
            return Err(Error::Configuration(
                "password/ha1: both set, pick one".into(),
            ));
        }

        if self.register_expires == 0 {
            return Err(Error::Configuration("register_expires: must be > 0".into()));
        }
        if self.no_answer_timeout == 0 || self.no_answer_timeout > MAX_NO_ANSWER_TIMEOUT {
            return Err(Error::Configuration(format!(
                "no_answer_timeout: must be within 1..={}",
                MAX_NO_ANSWER_TIMEOUT
            )));
        }
        if self.connection_recovery_min_interval == 0 {
            return Err(Error::Configuration(
                "connection_recovery_min_interval: must be > 0".into(),
            ));
        }
        if self.connection_recovery_max_interval < self.connection_recovery_min_interval {
            return Err(Error::Configuration(
                "connection_recovery_max_interval: smaller than min_interval".into(),
            ));
        }

        let mut routes = vec![];
        if self.use_preloaded_route {
            for route in &self.routes {
                let parsed = rsip::Uri::try_from(route.as_str())
                    .map_err(|e| Error::Configuration(format!("routes: {}", e)))?;
                routes.push(parsed);
            }
        }

        let via_host = if self.hack_ip_in_contact {
            // random RFC 5735 test-net address
            let octet = rand::rng().random_range(1u8..=254);
            format!("192.0.2.{}", octet)
        } else {
            format!("{}.invalid", random_text(12).to_lowercase())
        };

        let contact_uri = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: Some(rsip::auth::Auth {
                user: random_text(8).to_lowercase(),
                password: None,
            }),
            host_with_port: rsip::Domain::from(via_host.clone()).into(),
            params: vec![rsip::Param::Transport(rsip::transport::Transport::Ws)],
            ..Default::default()
        };

        Ok(Settings {
            authorization_user: self
                .authorization_user
                .clone()
                .unwrap_or_else(|| user.clone()),
            instance_id: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            config: self.clone(),
            uri,
            user,
            domain,
            via_host,
            contact_uri,
            routes,
        })
    }
}

impl Settings {
    pub fn registrar_uri(&self) -> rsip::Uri {
        rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            host_with_port: rsip::Domain::from(self.domain.clone()).into(),
            ..Default::default()
        }
    }

    pub fn credential(&self) -> Option<crate::auth::Credential> {
        if self.config.password.is_none() && self.config.ha1.is_none() {
            return None;
        }
        Some(crate::auth::Credential {
            username: self.authorization_user.clone(),
            password: self.config.password.clone(),
            ha1: self.config.ha1.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> UaConfig {
        UaConfig {
            ws_servers: vec![ServerConfig::new("wss://sip.example.com")],
            uri: "sip:alice@example.com".into(),
            password: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let settings = base_config().validate().expect("valid config");
        assert_eq!(settings.user, "alice");
        assert_eq!(settings.domain, "example.com");
        assert_eq!(settings.authorization_user, "alice");
        assert!(settings.via_host.ends_with(".invalid"));
        assert!(settings.instance_id.starts_with("urn:uuid:"));
    }

    #[test]
    fn test_mandatory_options() {
        let mut config = base_config();
        config.ws_servers.clear();
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(msg)) if msg.contains("ws_servers")
        ));

        let mut config = base_config();
        config.uri = "sip:example.com".into();
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(msg)) if msg.contains("uri")
        ));
    }

    #[test]
    fn test_single_invalid_option_aborts() {
        let mut config = base_config();
        config.ws_servers.push(ServerConfig::new("http://nope"));
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.no_answer_timeout = 601;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.connection_recovery_max_interval = 1;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.ha1 = Some("cafe".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hack_ip_in_contact() {
        let mut config = base_config();
        config.hack_ip_in_contact = true;
        let settings = config.validate().expect("valid config");
        assert!(settings.via_host.starts_with("192.0.2."));
    }
}
