//! SASL confidentiality transform for the byte pipeline.
//!
//! Sits between the codec and the raw transport once a bind negotiates a
//! security layer: outbound BER frames are wrapped into 4-byte
//! length-prefixed SASL buffers (RFC 4422 §3.7), inbound SASL buffers are
//! verified and unwrapped back into the plaintext frame stream. Each
//! direction keeps a reusable scratch buffer, grown on demand and never
//! shrunk, so steady-state traffic does not allocate.

use crate::error::LdapError;
use crate::sasl::CredentialExchange;
use bytes::BytesMut;

type Result<T> = std::result::Result<T, LdapError>;

pub struct SaslSecurityLayer {
    exchange: Box<dyn CredentialExchange>,
    /// Outbound scratch: length prefix + protected payload.
    write_scratch: Vec<u8>,
    /// Inbound scratch: one unwrapped buffer at a time.
    read_scratch: Vec<u8>,
    /// Upper bound on a peer-declared SASL buffer length.
    max_buffer: usize,
}

impl SaslSecurityLayer {
    pub fn new(exchange: Box<dyn CredentialExchange>, max_buffer: usize) -> Self {
        Self {
            exchange,
            write_scratch: Vec::new(),
            read_scratch: Vec::new(),
            max_buffer,
        }
    }

    /// Protect one outbound frame. Returns the wire bytes (length prefix
    /// included); the slice borrows the layer's scratch and is valid until
    /// the next `protect` call.
    pub fn protect(&mut self, plaintext: &[u8]) -> Result<&[u8]> {
        self.write_scratch.clear();
        self.write_scratch.extend_from_slice(&[0u8; 4]);
        self.exchange.wrap(plaintext, &mut self.write_scratch)?;
        let payload_len = self.write_scratch.len() - 4;
        if payload_len > u32::MAX as usize {
            return Err(LdapError::security("wrapped buffer exceeds u32 framing"));
        }
        self.write_scratch[..4].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(&self.write_scratch)
    }

    /// Consume complete SASL buffers from `ciphertext`, appending the
    /// verified plaintext to `plain_out`. Leaves partial buffers in place
    /// for the next read. Integrity failures propagate as security errors.
    pub fn unprotect(&mut self, ciphertext: &mut BytesMut, plain_out: &mut BytesMut) -> Result<()> {
        loop {
            if ciphertext.len() < 4 {
                return Ok(());
            }
            let declared =
                u32::from_be_bytes([ciphertext[0], ciphertext[1], ciphertext[2], ciphertext[3]])
                    as usize;
            if declared > self.max_buffer {
                return Err(LdapError::security(format!(
                    "peer SASL buffer of {declared} bytes exceeds limit of {}",
                    self.max_buffer
                )));
            }
            if ciphertext.len() < 4 + declared {
                return Ok(());
            }
            let buffer = ciphertext.split_to(4 + declared);
            self.read_scratch.clear();
            self.exchange.unwrap(&buffer[4..], &mut self.read_scratch)?;
            plain_out.extend_from_slice(&self.read_scratch);
        }
    }

    pub fn dispose(&mut self) {
        self.exchange.dispose();
    }
}

impl Drop for SaslSecurityLayer {
    fn drop(&mut self) {
        self.exchange.dispose();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Toy mechanism for pipeline tests: XOR "cipher" with a one-byte
    /// additive checksum so tampering is detectable. One challenge leg.
    pub struct XorExchange {
        pub key: u8,
        pub complete: bool,
        pub secure: bool,
    }

    impl XorExchange {
        pub fn new(key: u8, secure: bool) -> Self {
            Self {
                key,
                complete: false,
                secure,
            }
        }
    }

    impl CredentialExchange for XorExchange {
        fn mechanism(&self) -> &str {
            "X-XOR-TEST"
        }

        fn initialize(&mut self, _server_name: &str) -> Result<Option<Vec<u8>>> {
            Ok(Some(vec![self.key]))
        }

        fn evaluate(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>> {
            if challenge == &b"done"[..] {
                self.complete = true;
                Ok(None)
            } else {
                Ok(Some(challenge.iter().map(|b| b ^ self.key).collect()))
            }
        }

        fn is_complete(&self) -> bool {
            self.complete
        }

        fn is_secure(&self) -> bool {
            self.secure
        }

        fn wrap(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
            let mut sum = 0u8;
            for &b in plaintext {
                let c = b ^ self.key;
                sum = sum.wrapping_add(c);
                out.push(c);
            }
            out.push(sum);
            Ok(())
        }

        fn unwrap(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<()> {
            let (check, body) = ciphertext
                .split_last()
                .ok_or_else(|| LdapError::security("empty SASL buffer"))?;
            let mut sum = 0u8;
            for &c in body {
                sum = sum.wrapping_add(c);
                out.push(c ^ self.key);
            }
            if sum != *check {
                return Err(LdapError::security("SASL integrity check failed"));
            }
            Ok(())
        }

        fn dispose(&mut self) {}
    }
}
