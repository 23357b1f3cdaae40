//! TP-Link Kasa smart plug, local protocol.
//!
//! JSON commands over TCP port 9999. Each frame is a 4-byte big-endian length
//! followed by the payload "encrypted" with an autokey XOR cipher whose
//! initial key is 171.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::PowerSwitch;
use crate::error::DeliveryError;

pub const KASA_PORT: u16 = 9999;
const INITIAL_KEY: u8 = 171;
const MAX_RESPONSE_LEN: usize = 64 * 1024;

/// Frame `plaintext` for the wire.
pub fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    // ---
    let mut out = Vec::with_capacity(plaintext.len() + 4);
    out.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    let mut key = INITIAL_KEY;
    for &b in plaintext {
        key ^= b;
        out.push(key);
    }
    out
}

/// Decode a payload (without its length prefix).
pub fn decrypt(ciphertext: &[u8]) -> Vec<u8> {
    // ---
    let mut key = INITIAL_KEY;
    ciphertext
        .iter()
        .map(|&c| {
            let p = key ^ c;
            key = c;
            p
        })
        .collect()
}

pub struct KasaPlug {
    host: String,
    port: u16,
    timeout: Duration,
}

impl KasaPlug {
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_port(host, KASA_PORT)
    }

    pub fn with_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(5),
        }
    }

    fn device_error(&self, message: impl Into<String>) -> DeliveryError {
        DeliveryError::Device {
            host: self.host.clone(),
            message: message.into(),
        }
    }

    /// Send one command and return the decoded JSON reply.
    pub async fn request(&self, command: &Value) -> Result<Value, DeliveryError> {
        // ---
        tokio::time::timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| DeliveryError::Timeout("kasa", self.timeout))?
    }

    async fn exchange(&self, command: &Value) -> Result<Value, DeliveryError> {
        // ---
        let io = |e: std::io::Error| self.device_error(e.to_string());

        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(io)?;
        stream
            .write_all(&encrypt(command.to_string().as_bytes()))
            .await
            .map_err(io)?;

        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.map_err(io)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_RESPONSE_LEN {
            return Err(self.device_error(format!("response of {len} bytes is too large")));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.map_err(io)?;
        serde_json::from_slice(&decrypt(&payload))
            .map_err(|e| self.device_error(format!("invalid reply: {e}")))
    }
}

#[async_trait]
impl PowerSwitch for KasaPlug {
    fn describe(&self) -> String {
        format!("kasa://{}:{}", self.host, self.port)
    }

    async fn set_power(&self, on: bool) -> Result<(), DeliveryError> {
        // ---
        let command = json!({ "system": { "set_relay_state": { "state": u8::from(on) } } });
        let reply = self.request(&command).await?;

        match reply["system"]["set_relay_state"]["err_code"].as_i64() {
            Some(0) => Ok(()),
            Some(code) => {
                let message = format!("set_relay_state failed with err_code {code}");
                Err(self.device_error(message))
            }
            None => Err(self.device_error(format!("unexpected reply: {reply}"))),
        }
    }
}
