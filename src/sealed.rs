use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::accounts::KeyValueStore;

pub const SEAL_KEY_BYTES: usize = 32;
const SEAL_NONCE_BYTES: usize = 12;
const SEAL_ENVELOPE_VERSION: u8 = 1;

pub type SealKey = [u8; SEAL_KEY_BYTES];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

/// Store wrapper that encrypts every value at rest when a key is configured.
///
/// Values written before a key existed are still readable as plaintext and
/// get sealed on their next write.
pub struct SealedStore<S> {
    inner: S,
    key: Option<SealKey>,
}

impl<S> SealedStore<S> {
    pub fn new(inner: S, key: Option<SealKey>) -> Self {
        Self { inner, key }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for SealedStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.inner.get(key).await? else {
            return Ok(None);
        };

        match (&self.key, serde_json::from_str::<SealedEnvelope>(&raw)) {
            (Some(seal_key), Ok(envelope)) => match open_envelope(&envelope, seal_key) {
                Ok(plaintext) => Ok(Some(plaintext)),
                Err(error) => {
                    warn!("discarding unreadable sealed value for '{key}': {error:#}");
                    Ok(None)
                }
            },
            (None, Ok(_)) => {
                warn!("'{key}' is sealed but no seal key is configured; ignoring it");
                Ok(None)
            }
            (_, Err(_)) => Ok(Some(raw)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        match &self.key {
            Some(seal_key) => {
                let sealed = seal_value(value, seal_key)
                    .with_context(|| format!("seal value for '{key}'"))?;
                self.inner.set(key, &sealed).await
            }
            None => self.inner.set(key, value).await,
        }
    }
}

pub fn seal_value(value: &str, seal_key: &SealKey) -> Result<String> {
    let mut buffer = value.as_bytes().to_vec();

    let unbound_key = UnboundKey::new(&AES_256_GCM, seal_key)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let mut nonce_bytes = [0u8; SEAL_NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("generate random nonce"))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut buffer,
    )
    .map_err(|_| anyhow!("encrypt stored value"))?;

    let envelope = SealedEnvelope {
        version: SEAL_ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&buffer),
    };

    serde_json::to_string(&envelope).context("serialize sealed envelope")
}

pub fn open_value(raw: &str, seal_key: &SealKey) -> Result<String> {
    let envelope: SealedEnvelope =
        serde_json::from_str(raw).context("parse sealed envelope")?;
    open_envelope(&envelope, seal_key)
}

fn open_envelope(envelope: &SealedEnvelope, seal_key: &SealKey) -> Result<String> {
    if envelope.version != SEAL_ENVELOPE_VERSION {
        return Err(anyhow!(
            "unsupported sealed envelope version {}",
            envelope.version
        ));
    }

    let nonce_vec = hex_decode(&envelope.nonce_hex).context("decode envelope nonce")?;
    let nonce_bytes: [u8; SEAL_NONCE_BYTES] = nonce_vec
        .try_into()
        .map_err(|_| anyhow!("invalid nonce length in sealed envelope"))?;
    let mut ciphertext =
        hex_decode(&envelope.ciphertext_hex).context("decode envelope ciphertext")?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, seal_key)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| anyhow!("decrypt stored value"))?;

    String::from_utf8(plaintext.to_vec()).context("sealed value is not utf8")
}

pub fn parse_seal_key_hex(raw: &str) -> Result<SealKey> {
    let decoded = hex_decode(raw).context("decode seal key hex")?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("seal key must be {SEAL_KEY_BYTES} bytes"))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let value = raw.trim();
    if value.len() % 2 != 0 {
        return Err(anyhow!("hex string length must be even"));
    }

    value
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = decode_hex_nibble(pair[0]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            let lo = decode_hex_nibble(pair[1]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
