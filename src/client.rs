//! Synchronous client stubs for the queue-server protocol.
//!
//! Each call opens a fresh TCP connection, performs one exchange, and closes.
//! Calls block without a timeout; callers that need one should wrap the call
//! or configure their own socket.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::command::ProcessOutput;
use crate::errors::ServerError;
use crate::protocol::{
    self, Header, JobQuery, StatusCode, StatusResponse, SubmitRequest, SubmitResponse, HEADER_LEN,
};
use crate::records::JobStatus;

/// Send a new job to the queue server; returns the assigned job id.
pub fn submit_job(
    addr: SocketAddr,
    cmd: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<u64, ServerError> {
    debug!(?cmd, cwd = %cwd.display(), "submitting job to queue server");
    let request = SubmitRequest {
        cmd: cmd.to_vec(),
        cwd: cwd.to_string_lossy().into_owned(),
        env: env.clone(),
    };
    let reply: SubmitResponse = exchange(addr, Header::NewTask, &request)?;
    Ok(reply.job_id)
}

/// Ask the queue server for a job's current status.
pub fn get_job_status(addr: SocketAddr, job_id: u64) -> Result<JobStatus, ServerError> {
    let reply: StatusResponse = exchange(addr, Header::JobStatus, &JobQuery { job_id })?;
    reply
        .status
        .parse()
        .map_err(|_| ServerError::Protocol(format!("unrecognized status {:?}", reply.status)))
}

/// Fetch the output triple of a finished job.
pub fn get_job_output(addr: SocketAddr, job_id: u64) -> Result<ProcessOutput, ServerError> {
    exchange(addr, Header::JobResult, &JobQuery { job_id })
}

/// Whether the queue server is up and answering pings. Any socket error
/// yields `false`.
pub fn check_connection(addr: SocketAddr) -> bool {
    fn ping(addr: SocketAddr) -> std::io::Result<bool> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(Header::Ping.as_bytes())?;
        let mut reply = [0u8; HEADER_LEN];
        stream.read_exact(&mut reply)?;
        Ok(StatusCode::parse(&reply) == Some(StatusCode::Ok))
    }
    ping(addr).unwrap_or(false)
}

/// One request/response round trip on a fresh connection.
fn exchange<Q: serde::Serialize, R: DeserializeOwned>(
    addr: SocketAddr,
    header: Header,
    payload: &Q,
) -> Result<R, ServerError> {
    let message = protocol::encode_request(header, payload)
        .map_err(|err| ServerError::Protocol(format!("cannot encode request: {err}")))?;

    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(&message)?;

    let mut status = [0u8; HEADER_LEN];
    stream.read_exact(&mut status)?;
    match StatusCode::parse(&status) {
        Some(StatusCode::Ok) => {}
        Some(StatusCode::Error) => return Err(ServerError::ErrorReply),
        None => {
            return Err(ServerError::Protocol(format!(
                "unrecognized status header {status:?}"
            )))
        }
    }

    protocol::read_json(&mut stream).map_err(|err| match err.kind() {
        std::io::ErrorKind::InvalidData => {
            ServerError::Protocol(format!("invalid server response: {err}"))
        }
        _ => ServerError::Io(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // The stubs are exercised against a live queue in tests/queue.rs; here we
    // only cover the pure failure paths.

    #[test]
    fn check_connection_is_false_without_a_server() {
        // Port 1 is essentially never listening.
        assert!(!check_connection("127.0.0.1:1".parse().unwrap()));
    }

    #[test]
    fn submit_to_a_dead_server_is_an_io_error() {
        let err = submit_job(
            "127.0.0.1:1".parse().unwrap(),
            &["/bin/true".to_string()],
            Path::new("/tmp"),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::Io(_)));
    }
}
