//! Non-blocking queue server: a single thread multiplexing every client
//! socket with poll(2).
//!
//! The loop owns all sockets for their entire lifetime. Requests are parsed
//! from per-connection read buffers, handled synchronously, and answered
//! through per-connection write queues so a slow reader never stalls the
//! loop. Job ids are assigned here and nowhere else, which makes them
//! strictly increasing in submission order.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::command::LocalCommand;
use crate::pool::{JobChannel, WorkItem};
use crate::protocol::{
    self, Header, JobQuery, StatusCode, StatusResponse, SubmitRequest, SubmitResponse,
    HEADER_LEN, LENGTH_LEN, MAX_FRAME,
};

const READBUF: usize = 8 * 1024;

/// Job table: id to command entry. Inserted by the server thread; command
/// internals are mutated by whichever worker runs the job.
pub struct JobTable {
    entries: Mutex<HashMap<u64, Arc<LocalCommand>>>,
}

impl JobTable {
    pub fn new() -> Self {
        JobTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, job_id: u64) -> Option<Arc<LocalCommand>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
    }

    fn insert(&self, job_id: u64, command: Arc<LocalCommand>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, command);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection state: accumulated request bytes and queued reply bytes.
struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    write_queue: VecDeque<Vec<u8>>,
    write_pos: usize,
    /// Set when the connection has desynced; close once replies are flushed.
    close_after_flush: bool,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Connection {
            stream,
            read_buf: Vec::new(),
            write_queue: VecDeque::new(),
            write_pos: 0,
            close_after_flush: false,
        }
    }

    fn wants_write(&self) -> bool {
        !self.write_queue.is_empty()
    }
}

pub struct QueueServer {
    listener: Mutex<Option<TcpListener>>,
    addr: SocketAddr,
    jobs: Arc<JobTable>,
    channel: Arc<JobChannel>,
    running: AtomicBool,
}

impl QueueServer {
    /// Bind the listening socket eagerly so the OS-assigned address is known
    /// before the loop starts.
    pub fn bind(
        addr: SocketAddr,
        jobs: Arc<JobTable>,
        channel: Arc<JobChannel>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        Ok(QueueServer {
            listener: Mutex::new(Some(listener)),
            addr,
            jobs,
            channel,
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the loop: clear the running flag, then open a throwaway
    /// connection so the selector wakes up and notices. Safe to call more
    /// than once and from any thread.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        debug!("poking server to stop");
        let mut poke = self.addr;
        if poke.ip().is_unspecified() {
            poke.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        // A refused connection means the loop is already gone.
        let _ = TcpStream::connect(poke);
    }

    /// Run the multiplexing loop until shutdown. Consumes the listener; the
    /// socket is closed when the loop returns.
    pub fn run(&self) -> io::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "server already started"))?;
        listener.set_nonblocking(true)?;

        let mut conns: Vec<Connection> = Vec::new();
        let mut next_job_id: u64 = 1;
        self.running.store(true, Ordering::Release);
        info!(addr = %self.addr, "ready to accept connections");

        while self.is_running() {
            let mut fds = Vec::with_capacity(conns.len() + 1);
            fds.push(libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for conn in &conns {
                let mut events = libc::POLLIN;
                if conn.wants_write() {
                    events |= libc::POLLOUT;
                }
                fds.push(libc::pollfd {
                    fd: conn.stream.as_raw_fd(),
                    events,
                    revents: 0,
                });
            }

            // SAFETY: fds points at a valid, exclusively owned slice of
            // pollfd for the duration of the call.
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "poll failed");
                return Err(err);
            }

            if fds[0].revents & libc::POLLIN != 0 {
                self.accept_ready(&listener, &mut conns);
            }

            // Sockets accepted above were not polled this round; only walk
            // the entries that have revents.
            let polled = fds.len() - 1;
            let mut alive = vec![true; polled];
            for (i, conn) in conns.iter_mut().take(polled).enumerate() {
                let revents = fds[i + 1].revents;
                if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    alive[i] = false;
                    continue;
                }
                if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                    alive[i] = self.read_ready(conn, &mut next_job_id);
                }
                if alive[i] && revents & libc::POLLOUT != 0 {
                    alive[i] = write_ready(conn);
                }
                if alive[i] && conn.close_after_flush && !conn.wants_write() {
                    alive[i] = false;
                }
            }
            let mut keep = alive.into_iter();
            conns.retain(|_| keep.next().unwrap_or(true));
        }

        drop(conns);
        drop(listener);
        info!("server socket closed");
        Ok(())
    }

    fn accept_ready(&self, listener: &TcpListener, conns: &mut Vec<Connection>) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!(error = %err, "cannot make client socket non-blocking");
                        continue;
                    }
                    debug!(%peer, "client connected");
                    conns.push(Connection::new(stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Pull everything available off the socket and answer any complete
    /// requests. Returns whether the connection stays open.
    fn read_ready(&self, conn: &mut Connection, next_job_id: &mut u64) -> bool {
        let mut buf = [0u8; READBUF];
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => return conn.wants_write(),
                Ok(n) => conn.read_buf.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                    debug!(error = %err, "connection reset by peer");
                    return false;
                }
                Err(err) => {
                    warn!(error = %err, "read failed, dropping connection");
                    return false;
                }
            }
        }
        self.drain_frames(conn, next_job_id);
        true
    }

    /// Parse complete frames out of the read buffer. An unknown header or an
    /// oversize length is a framing mismatch: reply `ERROR   ` and close once
    /// it is flushed, since the byte stream can no longer be trusted.
    fn drain_frames(&self, conn: &mut Connection, next_job_id: &mut u64) {
        while !conn.close_after_flush {
            if conn.read_buf.len() < HEADER_LEN {
                return;
            }
            let header = match Header::parse(&conn.read_buf[..HEADER_LEN]) {
                Some(header) => header,
                None => {
                    warn!(header = ?&conn.read_buf[..HEADER_LEN], "unknown request header");
                    conn.write_queue
                        .push_back(StatusCode::Error.as_bytes().to_vec());
                    conn.close_after_flush = true;
                    return;
                }
            };

            if !header.has_body() {
                conn.read_buf.drain(..HEADER_LEN);
                conn.write_queue.push_back(StatusCode::Ok.as_bytes().to_vec());
                continue;
            }

            if conn.read_buf.len() < HEADER_LEN + LENGTH_LEN {
                return;
            }
            let declared = u64::from_be_bytes(
                conn.read_buf[HEADER_LEN..HEADER_LEN + LENGTH_LEN]
                    .try_into()
                    .expect("slice is eight bytes"),
            );
            if declared > MAX_FRAME {
                warn!(declared, "frame length exceeds cap");
                conn.write_queue
                    .push_back(StatusCode::Error.as_bytes().to_vec());
                conn.close_after_flush = true;
                return;
            }
            let total = HEADER_LEN + LENGTH_LEN + declared as usize;
            if conn.read_buf.len() < total {
                return;
            }

            let reply = self.handle_request(
                header,
                &conn.read_buf[HEADER_LEN + LENGTH_LEN..total],
                next_job_id,
            );
            conn.read_buf.drain(..total);
            conn.write_queue.push_back(reply);
        }
    }

    /// Dispatch one request to its handler; every outcome maps to reply
    /// bytes, so a bad request can never take down the loop.
    fn handle_request(&self, header: Header, body: &[u8], next_job_id: &mut u64) -> Vec<u8> {
        match header {
            Header::Ping => StatusCode::Ok.as_bytes().to_vec(),
            Header::NewTask => match serde_json::from_slice::<SubmitRequest>(body) {
                Ok(request) => {
                    let command = Arc::new(LocalCommand::new(
                        request.cmd,
                        request.cwd.into(),
                        request.env,
                    ));
                    let job_id = *next_job_id;
                    *next_job_id += 1;
                    self.jobs.insert(job_id, Arc::clone(&command));
                    self.channel.push(WorkItem::Run(command));
                    info!(job_id, "job accepted");
                    ok_reply(&SubmitResponse { job_id })
                }
                Err(err) => {
                    warn!(error = %err, "malformed submit payload");
                    StatusCode::Error.as_bytes().to_vec()
                }
            },
            Header::JobStatus => match serde_json::from_slice::<JobQuery>(body) {
                Ok(query) => match self.jobs.get(query.job_id) {
                    Some(command) => ok_reply(&StatusResponse {
                        status: command.status().as_str().to_string(),
                    }),
                    None => {
                        debug!(job_id = query.job_id, "status query for unknown job");
                        StatusCode::Error.as_bytes().to_vec()
                    }
                },
                Err(err) => {
                    warn!(error = %err, "malformed status payload");
                    StatusCode::Error.as_bytes().to_vec()
                }
            },
            Header::JobResult => match serde_json::from_slice::<JobQuery>(body) {
                Ok(query) => match self.jobs.get(query.job_id).as_deref().and_then(LocalCommand::output) {
                    Some(output) => ok_reply(output),
                    None => {
                        debug!(job_id = query.job_id, "result not available");
                        StatusCode::Error.as_bytes().to_vec()
                    }
                },
                Err(err) => {
                    warn!(error = %err, "malformed result payload");
                    StatusCode::Error.as_bytes().to_vec()
                }
            },
        }
    }
}

/// `OK      ` plus a length-prefixed JSON payload; serialization trouble
/// degrades to `ERROR   `.
fn ok_reply<T: serde::Serialize>(payload: &T) -> Vec<u8> {
    match protocol::encode_frame(payload) {
        Ok(frame) => {
            let mut reply = StatusCode::Ok.as_bytes().to_vec();
            reply.extend_from_slice(&frame);
            reply
        }
        Err(err) => {
            error!(error = %err, "cannot serialize response");
            StatusCode::Error.as_bytes().to_vec()
        }
    }
}

/// Drain the write queue as far as the socket allows. Returns whether the
/// connection stays open.
fn write_ready(conn: &mut Connection) -> bool {
    while let Some(front) = conn.write_queue.front() {
        match conn.stream.write(&front[conn.write_pos..]) {
            Ok(0) => return false,
            Ok(n) => {
                conn.write_pos += n;
                if conn.write_pos == front.len() {
                    conn.write_queue.pop_front();
                    conn.write_pos = 0;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "write failed, dropping connection");
                return false;
            }
        }
    }
    true
}
