//! JSON codec for the LED characteristic
//!
//! Commands are written as a flat JSON object:
//! ```text
//! {"command":"ON"|"OFF"|"BLINK","color":"green","bleKey":"9F64","times"?:n,"interval"?:s,"duration"?:n}
//! ```
//!
//! `times`/`interval` are only present for repeating commands, `duration` only when the
//! peripheral should turn the LED off by itself. Reads return a bare `on`/`off` token.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CommandKind, LedColor, LedCommand, LedState};

/// Largest value a single attribute write may carry
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct WireCommand {
    command: CommandKind,
    color: LedColor,
    #[serde(rename = "bleKey")]
    ble_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    times: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
}

/// Encode a command into the bytes written to the characteristic
pub fn encode(command: &LedCommand) -> Result<Bytes, CodecError> {
    let repeating = command.repeat_count > 0;
    let wire = WireCommand {
        command: command.kind,
        color: command.color,
        ble_key: command.key.clone(),
        times: repeating.then_some(command.repeat_count),
        interval: repeating.then_some(command.interval_secs),
        duration: (command.duration_secs > 0).then_some(command.duration_secs),
    };

    let payload = serde_json::to_vec(&wire)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a command payload (the peripheral's side of the channel)
pub fn decode_command(payload: &[u8]) -> Result<LedCommand, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let wire: WireCommand = serde_json::from_slice(payload)?;
    Ok(LedCommand {
        kind: wire.command,
        color: wire.color,
        repeat_count: wire.times.unwrap_or(0),
        interval_secs: wire.interval.unwrap_or(0.0),
        duration_secs: wire.duration.unwrap_or(0),
        key: wire.ble_key,
    })
}

/// Decode the state token read back from the characteristic.
///
/// Anything other than `on`/`off` is reported as [`LedState::Unknown`], never as an error.
pub fn decode_state(value: &[u8]) -> LedState {
    let Ok(text) = std::str::from_utf8(value) else {
        return LedState::Unknown;
    };

    match text.trim().trim_matches('"').to_ascii_lowercase().as_str() {
        "on" => LedState::On,
        "off" => LedState::Off,
        _ => LedState::Unknown,
    }
}

/// Token the peripheral answers with for a given state
pub fn encode_state(state: LedState) -> Bytes {
    match state {
        LedState::On => Bytes::from_static(b"on"),
        LedState::Off => Bytes::from_static(b"off"),
        LedState::Unknown => Bytes::from_static(b"unknown"),
    }
}
