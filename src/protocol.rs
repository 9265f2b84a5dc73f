//! Wire codec for the queue-server socket.
//!
//! Every message starts with an 8-byte ASCII header (space-padded). Request
//! headers other than `PING    ` are followed by an 8-byte big-endian content
//! length and that many bytes of UTF-8 JSON. Responses carry a status header
//! (`OK      ` / `ERROR   `); a successful non-ping response appends a
//! length-prefixed JSON payload.
//!
//! There is no framing-level error recovery: a connection that desyncs is
//! closed by whichever side notices.

use std::collections::HashMap;
use std::io::{self, Read};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 8;
pub const LENGTH_LEN: usize = 8;

/// Upper bound on a single frame body. Anything larger is treated as a
/// framing mismatch, not a legitimate request.
pub const MAX_FRAME: u64 = 32 * 1024 * 1024;

/// Request headers recognized by the queue server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    NewTask,
    JobStatus,
    JobResult,
    Ping,
}

impl Header {
    pub const fn as_bytes(self) -> &'static [u8; HEADER_LEN] {
        match self {
            Header::NewTask => b"NEW TASK",
            Header::JobStatus => b"JOB STAT",
            Header::JobResult => b"JOB RES ",
            Header::Ping => b"PING    ",
        }
    }

    pub fn parse(raw: &[u8]) -> Option<Header> {
        let raw: &[u8; HEADER_LEN] = raw.try_into().ok()?;
        match raw {
            b"NEW TASK" => Some(Header::NewTask),
            b"JOB STAT" => Some(Header::JobStatus),
            b"JOB RES " => Some(Header::JobResult),
            b"PING    " => Some(Header::Ping),
            _ => None,
        }
    }

    /// Whether a length prefix and body follow this header on the wire.
    pub fn has_body(self) -> bool {
        !matches!(self, Header::Ping)
    }
}

/// Response status headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Error,
}

impl StatusCode {
    pub const fn as_bytes(self) -> &'static [u8; HEADER_LEN] {
        match self {
            StatusCode::Ok => b"OK      ",
            StatusCode::Error => b"ERROR   ",
        }
    }

    pub fn parse(raw: &[u8]) -> Option<StatusCode> {
        let raw: &[u8; HEADER_LEN] = raw.try_into().ok()?;
        match raw {
            b"OK      " => Some(StatusCode::Ok),
            b"ERROR   " => Some(StatusCode::Error),
            _ => None,
        }
    }
}

/// `NEW TASK` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub cmd: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// `NEW TASK` reply payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "jobId")]
    pub job_id: u64,
}

/// `JOB STAT` / `JOB RES ` request payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobQuery {
    #[serde(rename = "jobId")]
    pub job_id: u64,
}

/// `JOB STAT` reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Length-prefix a JSON payload: 8-byte big-endian length followed by the
/// serialized bytes.
pub fn encode_frame<T: Serialize>(payload: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = Vec::with_capacity(LENGTH_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode a full client request: header plus, when the header carries one,
/// a length-prefixed payload.
pub fn encode_request<T: Serialize>(header: Header, payload: &T) -> serde_json::Result<Vec<u8>> {
    let mut message = Vec::from(*header.as_bytes());
    if header.has_body() {
        message.extend_from_slice(&encode_frame(payload)?);
    }
    Ok(message)
}

/// Read the declared number of payload bytes, blocking until all are
/// available. A short read surfaces as an error.
pub fn read_body(stream: &mut impl Read, length: u64) -> io::Result<Vec<u8>> {
    if length > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("declared frame length {length} exceeds the {MAX_FRAME}-byte cap"),
        ));
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Read an 8-byte big-endian length prefix followed by the body.
pub fn read_frame(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_LEN];
    stream.read_exact(&mut prefix)?;
    read_body(stream, u64::from_be_bytes(prefix))
}

/// Read a length-prefixed JSON payload into `T`.
pub fn read_json<T: DeserializeOwned>(stream: &mut impl Read) -> io::Result<T> {
    let body = read_frame(stream)?;
    serde_json::from_slice(&body)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_exactly_eight_bytes() {
        for header in [
            Header::NewTask,
            Header::JobStatus,
            Header::JobResult,
            Header::Ping,
        ] {
            assert_eq!(header.as_bytes().len(), HEADER_LEN);
            assert_eq!(Header::parse(header.as_bytes()), Some(header));
        }
        for code in [StatusCode::Ok, StatusCode::Error] {
            assert_eq!(code.as_bytes().len(), HEADER_LEN);
            assert_eq!(StatusCode::parse(code.as_bytes()), Some(code));
        }
    }

    #[test]
    fn unknown_header_does_not_parse() {
        assert_eq!(Header::parse(b"BOGUS   "), None);
        assert_eq!(StatusCode::parse(b"NEW TASK"), None);
    }

    #[test]
    fn frame_layout_is_length_then_json() {
        let frame = encode_frame(&JobQuery { job_id: 3 }).unwrap();
        let body = br#"{"jobId":3}"#;
        assert_eq!(&frame[..LENGTH_LEN], &(body.len() as u64).to_be_bytes());
        assert_eq!(&frame[LENGTH_LEN..], body);
    }

    #[test]
    fn ping_request_is_header_only() {
        let message = encode_request(Header::Ping, &()).unwrap();
        assert_eq!(message, b"PING    ");
    }

    #[test]
    fn submit_request_starts_with_header() {
        let request = SubmitRequest {
            cmd: vec!["/bin/echo".into(), "hi".into()],
            cwd: "/tmp".into(),
            env: HashMap::new(),
        };
        let message = encode_request(Header::NewTask, &request).unwrap();
        assert_eq!(&message[..HEADER_LEN], b"NEW TASK");
        let declared = u64::from_be_bytes(message[8..16].try_into().unwrap());
        assert_eq!(declared as usize, message.len() - 16);
    }

    #[test]
    fn read_json_roundtrips() {
        let frame = encode_frame(&SubmitResponse { job_id: 41 }).unwrap();
        let parsed: SubmitResponse = read_json(&mut frame.as_slice()).unwrap();
        assert_eq!(parsed.job_id, 41);
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        let err = read_frame(&mut frame.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn short_body_is_an_error() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&8u64.to_be_bytes());
        frame.extend_from_slice(b"abc");
        assert!(read_frame(&mut frame.as_slice()).is_err());
    }
}
