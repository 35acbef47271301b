//! SASL credential-exchange capability (RFC 4422).
//!
//! Mechanism internals (DIGEST-MD5, GSSAPI, ...) live behind
//! [`CredentialExchange`]; the engine only drives the challenge/response
//! loop and, when the mechanism negotiates one, installs its
//! confidentiality layer into the byte pipeline. `PlainExchange` is the
//! one mechanism shipped here (RFC 4616, no security layer).

use crate::error::LdapError;

type Result<T> = std::result::Result<T, LdapError>;

/// A pluggable SASL mechanism driven by the bind sequencer.
///
/// Call order: `initialize` once before any bytes hit the wire (it may
/// contact a naming or ticket service), then `evaluate` for each server
/// challenge until `is_complete`. After a successful bind, `is_secure`
/// decides whether `wrap`/`unwrap` are installed as the connection's
/// security layer. `dispose` releases mechanism-held secrets.
pub trait CredentialExchange: Send {
    /// IANA-registered mechanism name sent in the bind request.
    fn mechanism(&self) -> &str;

    /// Prepare the exchange for `server_name` and produce the initial
    /// response, if the mechanism is client-first.
    fn initialize(&mut self, server_name: &str) -> Result<Option<Vec<u8>>>;

    /// Feed one server challenge; returns the next client response, if any.
    fn evaluate(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Whether the exchange has finished on the client side.
    fn is_complete(&self) -> bool;

    /// Whether a confidentiality/integrity layer was negotiated and must be
    /// installed once the bind succeeds.
    fn is_secure(&self) -> bool;

    /// Protect one outbound buffer. Only called when `is_secure()`.
    fn wrap(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Verify and unprotect one inbound buffer. Only called when
    /// `is_secure()`. Integrity failures must be reported as errors, never
    /// swallowed.
    fn unwrap(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Drop negotiated keys and any cached credentials.
    fn dispose(&mut self);
}

/// SASL PLAIN (RFC 4616): single client-first message
/// `[authzid] NUL authcid NUL passwd`, no security layer.
pub struct PlainExchange {
    authzid: Option<String>,
    authcid: String,
    password: String,
    complete: bool,
}

impl PlainExchange {
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: None,
            authcid: authcid.into(),
            password: password.into(),
            complete: false,
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }
}

impl CredentialExchange for PlainExchange {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn initialize(&mut self, _server_name: &str) -> Result<Option<Vec<u8>>> {
        let mut message = Vec::new();
        if let Some(authzid) = &self.authzid {
            message.extend_from_slice(authzid.as_bytes());
        }
        message.push(0);
        message.extend_from_slice(self.authcid.as_bytes());
        message.push(0);
        message.extend_from_slice(self.password.as_bytes());
        self.complete = true;
        Ok(Some(message))
    }

    fn evaluate(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        if !challenge.is_empty() {
            return Err(LdapError::security(
                "PLAIN mechanism received an unexpected server challenge",
            ));
        }
        Ok(None)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn wrap(&mut self, _plaintext: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Err(LdapError::security("PLAIN negotiates no security layer"))
    }

    fn unwrap(&mut self, _ciphertext: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Err(LdapError::security("PLAIN negotiates no security layer"))
    }

    fn dispose(&mut self) {
        // Best effort: overwrite the password before drop.
        unsafe {
            for b in self.password.as_bytes_mut() {
                *b = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_layout() {
        let mut exchange = PlainExchange::new("jdoe", "hunter2");
        let initial = exchange.initialize("ldap.example.com").unwrap().unwrap();
        assert_eq!(initial, b"\0jdoe\0hunter2");
        assert!(exchange.is_complete());
        assert!(!exchange.is_secure());
    }

    #[test]
    fn plain_with_authzid() {
        let mut exchange = PlainExchange::new("jdoe", "hunter2").with_authzid("admin");
        let initial = exchange.initialize("ldap.example.com").unwrap().unwrap();
        assert_eq!(initial, b"admin\0jdoe\0hunter2");
    }

    #[test]
    fn plain_rejects_challenge() {
        let mut exchange = PlainExchange::new("jdoe", "hunter2");
        exchange.initialize("ldap.example.com").unwrap();
        assert!(exchange.evaluate(b"challenge").is_err());
        assert!(exchange.evaluate(b"").unwrap().is_none());
    }

    #[test]
    fn dispose_scrubs_password() {
        let mut exchange = PlainExchange::new("jdoe", "hunter2");
        exchange.dispose();
        assert_eq!(exchange.password.as_bytes(), &[0u8; 7]);
    }
}
