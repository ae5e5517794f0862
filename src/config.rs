use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result};

use crate::ldap_protocol::START_TLS_OID;

/// OID of the "Who am I?" extended operation (RFC 4532).
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ldap: LdapConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub extended: ExtendedConfig,
}

/// Transport security towards the directory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    Ldaps,
    Starttls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    pub host: String,
    /// Defaults to 389, or 636 for ldaps.
    pub port: Option<u16>,
    #[serde(default)]
    pub security: SecurityMode,
    /// Skip server certificate verification (tests / internal network only).
    pub trust_all: Option<bool>,
    /// Extra PEM CA bundle for verifying the server certificate.
    pub ca_file: Option<String>,
    /// Connect (TCP + TLS handshake) timeout in seconds (default 5).
    pub network_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Identity used when the caller supplies no credentials.
    pub default_bind_dn: Option<String>,
    pub default_password: Option<String>,
    /// When true, caller-supplied user names are SASL PLAIN authentication ids instead of bind DNs.
    #[serde(default)]
    pub authzid_type_is_id: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedConfig {
    /// Extended operations whose response value is text rather than bytes.
    #[serde(default = "default_string_valued_oids")]
    pub string_valued_oids: Vec<String>,
}

fn default_string_valued_oids() -> Vec<String> {
    vec![WHO_AM_I_OID.to_string()]
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            string_valued_oids: default_string_valued_oids(),
        }
    }
}

impl ExtendedConfig {
    pub fn is_string_valued(&self, oid: &str) -> bool {
        self.string_valued_oids.iter().any(|o| o == oid)
    }
}

impl LdapConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.security {
            SecurityMode::Ldaps => 636,
            _ => 389,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout.unwrap_or(5))
    }
}

impl GatewayConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Read config file {:?}", path))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ldap.host.trim().is_empty() {
            anyhow::bail!("ldap.host must not be empty");
        }
        if self.extended.string_valued_oids.iter().any(|oid| oid == START_TLS_OID) {
            anyhow::bail!("StartTLS has no response value and cannot be listed in extended.string_valued_oids");
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ldap: LdapConfig {
                host: "127.0.0.1".to_string(),
                port: Some(389),
                security: SecurityMode::None,
                trust_all: None,
                ca_file: None,
                network_timeout: Some(5),
            },
            auth: AuthConfig::default(),
            extended: ExtendedConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.ldap.address(), "127.0.0.1:389");
        assert_eq!(config.ldap.security, SecurityMode::None);
        assert_eq!(config.ldap.connect_timeout(), Duration::from_secs(5));
        assert!(!config.auth.authzid_type_is_id);
        assert!(config.extended.is_string_valued(WHO_AM_I_OID));
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
ldap:
  host: "ldap.example.com"
  security: starttls
  ca_file: "/etc/ssl/ca.pem"
  network_timeout: 10
auth:
  default_bind_dn: "cn=gateway,dc=example,dc=com"
  default_password: "secret"
  authzid_type_is_id: true
extended:
  string_valued_oids:
    - "1.3.6.1.4.1.4203.1.11.3"
    - "1.2.3.4"
"#;
        let config = GatewayConfig::from_str(yaml).unwrap();
        assert_eq!(config.ldap.host, "ldap.example.com");
        assert_eq!(config.ldap.port(), 389);
        assert_eq!(config.ldap.security, SecurityMode::Starttls);
        assert_eq!(config.ldap.ca_file, Some("/etc/ssl/ca.pem".to_string()));
        assert_eq!(config.ldap.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.auth.default_bind_dn, Some("cn=gateway,dc=example,dc=com".to_string()));
        assert_eq!(config.auth.default_password, Some("secret".to_string()));
        assert!(config.auth.authzid_type_is_id);
        assert!(config.extended.is_string_valued("1.2.3.4"));
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
ldap:
  host: "localhost"
  security: ldaps
"#;
        let config = GatewayConfig::from_str(yaml).unwrap();
        assert_eq!(config.ldap.address(), "localhost:636");
        assert_eq!(config.auth.default_bind_dn, None);
        assert_eq!(config.extended.string_valued_oids, vec![WHO_AM_I_OID.to_string()]);
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
ldap:
  host: "127.0.0.1"
  port: 1389
  trust_all: true
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ldap.address(), "127.0.0.1:1389");
        assert_eq!(config.ldap.trust_all, Some(true));
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        let yaml = "invalid: yaml: content: [";
        assert!(GatewayConfig::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_str_unknown_security() {
        let yaml = "ldap:\n  host: x\n  security: ssl\n";
        assert!(GatewayConfig::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_empty_host_rejected() {
        assert!(GatewayConfig::from_str("ldap:\n  host: \"\"\n").is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(GatewayConfig::from_file("/nonexistent/path/config.yaml").is_err());
    }
}
