//! Reunion DB commands and responses, with their byte-exact wire codec.
//!
//! Binary layout (all numeric fields big-endian):
//!
//! ```text
//! FetchState      = 0x01 || epoch(8) || t1_hash(32)
//! SendT1          = 0x02 || epoch(8) || payload_len(4) || payload
//! SendT2          = 0x03 || epoch(8) || src(32) || dst(32) || payload_len(4) || payload
//! SendT3          = 0x04 || epoch(8) || src(32) || dst(32) || payload_len(4) || payload
//! MessageResponse = 0x11 || error_code(1)
//! StateResponse   = 0x12 || error_code(1) || truncated(1) || payload_len(4) || payload
//! ```

use crate::error::{ReunionError, Result};

/// SHA-256 digest of a wire T-message; the stable identifier of a peer
/// attempt within an epoch.
pub type ExchangeHash = [u8; 32];

/// Response status code meaning success
pub const RESPONSE_STATUS_OK: u8 = 0;

const FETCH_STATE_TAG: u8 = 0x01;
const SEND_T1_TAG: u8 = 0x02;
const SEND_T2_TAG: u8 = 0x03;
const SEND_T3_TAG: u8 = 0x04;
const MESSAGE_RESPONSE_TAG: u8 = 0x11;
const STATE_RESPONSE_TAG: u8 = 0x12;

/// Request the board state relevant to our T1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchState {
    pub epoch: u64,
    pub t1_hash: ExchangeHash,
}

/// Publish a T1 on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendT1 {
    pub epoch: u64,
    pub payload: Vec<u8>,
}

/// Publish a T2 addressed from our T1 to a foreign T1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendT2 {
    pub epoch: u64,
    pub src_t1_hash: ExchangeHash,
    pub dst_t1_hash: ExchangeHash,
    pub payload: Vec<u8>,
}

/// Publish a T3 addressed from our T1 to a foreign T1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendT3 {
    pub epoch: u64,
    pub src_t1_hash: ExchangeHash,
    pub dst_t1_hash: ExchangeHash,
    pub payload: Vec<u8>,
}

/// A command submitted to the Reunion DB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FetchState(FetchState),
    SendT1(SendT1),
    SendT2(SendT2),
    SendT3(SendT3),
}

/// Response to a `SendT1` / `SendT2` / `SendT3` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub error_code: u8,
}

/// Response to a `FetchState` command. `payload` decodes to a
/// `RequestedReunionState`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateResponse {
    pub error_code: u8,
    pub truncated: bool,
    pub payload: Vec<u8>,
}

/// A response received from the Reunion DB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Message(MessageResponse),
    State(StateResponse),
}

fn put_payload(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

impl Command {
    /// Encode this command into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Command::FetchState(cmd) => {
                buf.push(FETCH_STATE_TAG);
                buf.extend_from_slice(&cmd.epoch.to_be_bytes());
                buf.extend_from_slice(&cmd.t1_hash);
            }
            Command::SendT1(cmd) => {
                buf.push(SEND_T1_TAG);
                buf.extend_from_slice(&cmd.epoch.to_be_bytes());
                put_payload(&mut buf, &cmd.payload);
            }
            Command::SendT2(cmd) => {
                buf.push(SEND_T2_TAG);
                buf.extend_from_slice(&cmd.epoch.to_be_bytes());
                buf.extend_from_slice(&cmd.src_t1_hash);
                buf.extend_from_slice(&cmd.dst_t1_hash);
                put_payload(&mut buf, &cmd.payload);
            }
            Command::SendT3(cmd) => {
                buf.push(SEND_T3_TAG);
                buf.extend_from_slice(&cmd.epoch.to_be_bytes());
                buf.extend_from_slice(&cmd.src_t1_hash);
                buf.extend_from_slice(&cmd.dst_t1_hash);
                put_payload(&mut buf, &cmd.payload);
            }
        }
        buf
    }

    /// Decode a command from its wire form. Rejects unknown tags, short
    /// buffers and trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Command> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let cmd = match tag {
            FETCH_STATE_TAG => Command::FetchState(FetchState {
                epoch: r.u64()?,
                t1_hash: r.hash()?,
            }),
            SEND_T1_TAG => Command::SendT1(SendT1 {
                epoch: r.u64()?,
                payload: r.payload()?,
            }),
            SEND_T2_TAG => Command::SendT2(SendT2 {
                epoch: r.u64()?,
                src_t1_hash: r.hash()?,
                dst_t1_hash: r.hash()?,
                payload: r.payload()?,
            }),
            SEND_T3_TAG => Command::SendT3(SendT3 {
                epoch: r.u64()?,
                src_t1_hash: r.hash()?,
                dst_t1_hash: r.hash()?,
                payload: r.payload()?,
            }),
            other => {
                return Err(ReunionError::InvalidMessage(format!(
                    "unknown command tag: {:#04x}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(cmd)
    }

    /// Epoch the command is bound to.
    pub fn epoch(&self) -> u64 {
        match self {
            Command::FetchState(cmd) => cmd.epoch,
            Command::SendT1(cmd) => cmd.epoch,
            Command::SendT2(cmd) => cmd.epoch,
            Command::SendT3(cmd) => cmd.epoch,
        }
    }
}

impl Response {
    /// Encode this response into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Message(resp) => {
                buf.push(MESSAGE_RESPONSE_TAG);
                buf.push(resp.error_code);
            }
            Response::State(resp) => {
                buf.push(STATE_RESPONSE_TAG);
                buf.push(resp.error_code);
                buf.push(resp.truncated as u8);
                put_payload(&mut buf, &resp.payload);
            }
        }
        buf
    }

    /// Decode a response from its wire form.
    pub fn decode(buf: &[u8]) -> Result<Response> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let resp = match tag {
            MESSAGE_RESPONSE_TAG => Response::Message(MessageResponse {
                error_code: r.u8()?,
            }),
            STATE_RESPONSE_TAG => Response::State(StateResponse {
                error_code: r.u8()?,
                truncated: match r.u8()? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(ReunionError::InvalidMessage(format!(
                            "invalid truncated flag: {}",
                            other
                        )))
                    }
                },
                payload: r.payload()?,
            }),
            other => {
                return Err(ReunionError::InvalidMessage(format!(
                    "unknown response tag: {:#04x}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(resp)
    }
}

/// Sequential big-endian reader over a wire buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ReunionError::InvalidMessage(
                "short wire buffer".to_string(),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("length checked");
        Ok(u64::from_be_bytes(bytes))
    }

    fn hash(&mut self) -> Result<ExchangeHash> {
        let bytes: [u8; 32] = self.take(32)?.try_into().expect("length checked");
        Ok(bytes)
    }

    fn payload(&mut self) -> Result<Vec<u8>> {
        let len: [u8; 4] = self.take(4)?.try_into().expect("length checked");
        let len = u32::from_be_bytes(len) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(ReunionError::InvalidMessage(format!(
                "{} trailing bytes after wire message",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let commands = vec![
            Command::FetchState(FetchState {
                epoch: 7,
                t1_hash: [1u8; 32],
            }),
            Command::SendT1(SendT1 {
                epoch: 7,
                payload: vec![0xAA; 124],
            }),
            Command::SendT2(SendT2 {
                epoch: 7,
                src_t1_hash: [2u8; 32],
                dst_t1_hash: [3u8; 32],
                payload: vec![0xBB; 60],
            }),
            Command::SendT3(SendT3 {
                epoch: 7,
                src_t1_hash: [2u8; 32],
                dst_t1_hash: [3u8; 32],
                payload: vec![0xCC; 31],
            }),
        ];
        for cmd in commands {
            let wire = cmd.encode();
            assert_eq!(Command::decode(&wire).unwrap(), cmd);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            Response::Message(MessageResponse { error_code: 0 }),
            Response::Message(MessageResponse { error_code: 3 }),
            Response::State(StateResponse {
                error_code: 0,
                truncated: true,
                payload: vec![1, 2, 3],
            }),
        ];
        for resp in responses {
            let wire = resp.encode();
            assert_eq!(Response::decode(&wire).unwrap(), resp);
        }
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // unknown tag
        assert!(Command::decode(&[0xFF]).is_err());
        assert!(Response::decode(&[0xFF]).is_err());
        // short buffer
        assert!(Command::decode(&[SEND_T1_TAG, 0, 0]).is_err());
        // trailing bytes
        let mut wire = Command::FetchState(FetchState {
            epoch: 1,
            t1_hash: [0u8; 32],
        })
        .encode();
        wire.push(0);
        assert!(Command::decode(&wire).is_err());
        // bad truncated flag
        let wire = vec![STATE_RESPONSE_TAG, 0, 2, 0, 0, 0, 0];
        assert!(Response::decode(&wire).is_err());
    }

    #[test]
    fn test_fetch_state_wire_layout() {
        let cmd = Command::FetchState(FetchState {
            epoch: 0x0102030405060708,
            t1_hash: [9u8; 32],
        });
        let wire = cmd.encode();
        assert_eq!(wire.len(), 1 + 8 + 32);
        assert_eq!(wire[0], FETCH_STATE_TAG);
        assert_eq!(wire[1..9], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(wire[9..], [9u8; 32]);
    }
}
