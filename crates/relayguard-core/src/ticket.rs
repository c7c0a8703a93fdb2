//! Ticket codec
//!
//! A ticket binds a decision to its token set: `<timestamp_base32>
//! <token>...`, symmetric-encrypted under a process-wide secret and
//! emitted URL-safe. It is the only way a later complaint can be
//! attributed, so decode authenticates before it trusts anything.
//!
//! Encryption is encrypt-then-MAC: an SHA-256 counter keystream XORed
//! over the plaintext, authenticated by a truncated HMAC-SHA256 tag.
//! The timestamp doubles as the nonce; the issuing counter makes it
//! unique process-wide.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use relayguard_common::constants::TICKET_TTL_SECS;
use relayguard_common::{TicketError, Token};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 8;

/// Ticket encoder/decoder holding the derived keys
pub struct TicketCodec {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    last_micros: AtomicI64,
}

impl TicketCodec {
    /// Derive the cipher and MAC keys from the configured secret
    pub fn new(secret: &str) -> Self {
        Self {
            enc_key: derive_key(b"relayguard-enc", secret),
            mac_key: derive_key(b"relayguard-mac", secret),
            last_micros: AtomicI64::new(0),
        }
    }

    /// Next ticket timestamp: current microseconds, bumped to stay
    /// strictly monotonic across concurrent issuers
    pub fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut last = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_micros.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    /// Issue a ticket for a token set
    pub fn issue(&self, tokens: &[Token]) -> (i64, String) {
        let timestamp = self.next_timestamp();
        (timestamp, self.encode(timestamp, tokens))
    }

    /// Encode a ticket at an explicit timestamp
    pub fn encode(&self, timestamp: i64, tokens: &[Token]) -> String {
        let mut plaintext = to_radix32(timestamp);
        for token in tokens {
            plaintext.push(' ');
            plaintext.push_str(&token.to_string());
        }

        let nonce = timestamp.to_be_bytes();
        let mut body = plaintext.into_bytes();
        self.apply_keystream(&nonce, &mut body);

        let tag = self.tag(&nonce, &body);

        let mut out = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        out.extend_from_slice(&tag);
        URL_SAFE_NO_PAD.encode(out)
    }

    /// Decode and authenticate a ticket, enforcing the age bound
    pub fn decode(&self, ticket: &str) -> Result<(i64, Vec<Token>), TicketError> {
        let data = URL_SAFE_NO_PAD
            .decode(ticket.trim())
            .map_err(|_| TicketError::Undecodable)?;
        if data.len() < NONCE_LEN + TAG_LEN + 1 {
            return Err(TicketError::Undecodable);
        }

        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("HMAC accepts any key size");
        mac.update(nonce);
        mac.update(body);
        mac.verify_truncated_left(tag)
            .map_err(|_| TicketError::Undecodable)?;

        let nonce_bytes: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| TicketError::Undecodable)?;
        let mut plain = body.to_vec();
        self.apply_keystream(&nonce_bytes, &mut plain);
        let plain = String::from_utf8(plain).map_err(|_| TicketError::Undecodable)?;

        let mut fields = plain.split(' ');
        let timestamp =
            from_radix32(fields.next().unwrap_or("")).ok_or(TicketError::Undecodable)?;

        let age_secs = (Utc::now().timestamp_micros() - timestamp) / 1_000_000;
        if age_secs > TICKET_TTL_SECS {
            return Err(TicketError::Expired);
        }

        let mut tokens = Vec::new();
        for field in fields {
            let token: Token = field.parse().map_err(|_| TicketError::Undecodable)?;
            tokens.push(token);
        }

        Ok((timestamp, tokens))
    }

    fn apply_keystream(&self, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        for (block_index, chunk) in data.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(self.enc_key);
            hasher.update(nonce);
            hasher.update((block_index as u32).to_be_bytes());
            let block = hasher.finalize();
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }

    fn tag(&self, nonce: &[u8], body: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("HMAC accepts any key size");
        mac.update(nonce);
        mac.update(body);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }
}

fn derive_key(label: &[u8], secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

const RADIX32: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

fn to_radix32(mut value: i64) -> String {
    if value <= 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(RADIX32[(value % 32) as usize]);
        value /= 32;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn from_radix32(text: &str) -> Option<i64> {
    if text.is_empty() {
        return None;
    }
    let mut value: i64 = 0;
    for c in text.bytes() {
        let digit = RADIX32.iter().position(|&r| r == c)? as i64;
        value = value.checked_mul(32)?.checked_add(digit)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Vec<Token> {
        vec![
            "192.0.2.5".parse().unwrap(),
            ".mx.example.com".parse().unwrap(),
            "@example.com".parse().unwrap(),
            ">bob@test.tld".parse().unwrap(),
        ]
    }

    #[test]
    fn test_roundtrip() {
        let codec = TicketCodec::new("test secret");
        let (timestamp, ticket) = codec.issue(&tokens());

        let (decoded_ts, decoded) = codec.decode(&ticket).unwrap();
        assert_eq!(decoded_ts, timestamp);
        assert_eq!(decoded, tokens());
    }

    #[test]
    fn test_expired_ticket() {
        let codec = TicketCodec::new("test secret");
        let old = Utc::now().timestamp_micros() - (6 * 24 * 3600) * 1_000_000;
        let ticket = codec.encode(old, &tokens());

        assert_eq!(codec.decode(&ticket), Err(TicketError::Expired));
    }

    #[test]
    fn test_tampered_ticket_rejected() {
        let codec = TicketCodec::new("test secret");
        let (_, ticket) = codec.issue(&tokens());

        let mut bytes = URL_SAFE_NO_PAD.decode(&ticket).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);

        assert_eq!(codec.decode(&tampered), Err(TicketError::Undecodable));
        assert_eq!(codec.decode("not a ticket"), Err(TicketError::Undecodable));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let codec = TicketCodec::new("one secret");
        let other = TicketCodec::new("another secret");
        let (_, ticket) = codec.issue(&tokens());

        assert_eq!(other.decode(&ticket), Err(TicketError::Undecodable));
    }

    #[test]
    fn test_timestamps_strictly_monotonic() {
        let codec = TicketCodec::new("test secret");
        let mut last = 0;
        for _ in 0..1000 {
            let ts = codec.next_timestamp();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_radix32_roundtrip() {
        for value in [0, 1, 31, 32, 1_700_000_000_000_000i64] {
            assert_eq!(from_radix32(&to_radix32(value)), Some(value.max(0)));
        }
        assert_eq!(from_radix32("!!!"), None);
    }
}
