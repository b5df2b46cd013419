//! Connection server
//!
//! Clients connect over a Unix stream socket. An acceptor thread hands every
//! accepted connection to its own thread, which registers the descriptor,
//! serves request frames until the peer goes away and deregisters it again.
//! A failing request is answered with an error reply; only I/O failures and
//! unrecoverable framing errors end a connection, never the daemon.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, Registration};
use crate::error::{EardError, Result};
use crate::monitor::ReportedMetrics;
use crate::observability::{EardMetrics, StructuredLogger};
use crate::policy::{PolicyEngine, RiskState};
use crate::protocol::{
    read_frame, response_type, write_frame, FreqArgs, Header, PidArgs, Reply, Request, RiskArgs,
    MAX_PAYLOAD_SIZE, TYPE_COMMAND,
};

const PEER_LOCAL: &str = "local";

fn applied(freq: Option<u64>) -> Result<Reply> {
    Reply::with_body(&json!({ "applied_freq": freq }))
}

/// Executes decoded requests against the daemon components
pub struct Dispatcher {
    connections: ConnectionManager,
    engine: Arc<PolicyEngine>,
    reported: Arc<ReportedMetrics>,
    metrics: EardMetrics,
}

impl Dispatcher {
    pub fn new(
        connections: ConnectionManager,
        engine: Arc<PolicyEngine>,
        reported: Arc<ReportedMetrics>,
    ) -> Self {
        Self {
            connections,
            engine,
            reported,
            metrics: EardMetrics::new(),
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Answer one frame; the returned code is the reply's response type
    pub fn handle_frame(&self, header: Header, payload: &[u8]) -> (u32, Reply) {
        self.metrics.inc_requests(header.code);
        let kind = response_type(header.code);

        match Request::decode(header, payload).and_then(|request| self.dispatch(request)) {
            Ok(reply) => (kind, reply),
            Err(e) => {
                self.metrics.inc_request_errors(e.kind().as_str());
                warn!(code = header.code, error = %e, "Request failed");
                (kind, Reply::failure(&e))
            }
        }
    }

    pub fn dispatch(&self, request: Request) -> Result<Reply> {
        match request {
            Request::NewJob(job) => Reply::with_body(&self.engine.new_job(job)?),
            Request::EndJob(PidArgs { pid }) => {
                self.engine.end_job(pid)?;
                Ok(Reply::ack())
            }
            Request::MaxFreq(FreqArgs { freq }) => applied(self.engine.set_max_freq(freq)?),
            Request::NewTh(args) => {
                self.engine.set_policy_th(args.policy, args.th)?;
                Ok(Reply::ack())
            }
            Request::SetFreq(FreqArgs { freq }) => applied(self.engine.set_frequency(freq)?),
            Request::RestoreConf => applied(self.engine.restore_conf()?),
            Request::Ping => Ok(Reply::ack()),
            Request::Status => Reply::with_body(&self.engine.status_report()?),
            Request::AppNodeStatus(query) => {
                if let Some(report) = query.report {
                    self.connections.report_status(report)?;
                }
                match query.ip {
                    Some(ip) => Reply::with_body(&vec![self.connections.status(&ip)?]),
                    None => Reply::with_body(&self.connections.status_all()?),
                }
            }
            Request::SetPower(request) => {
                self.engine.set_powercap(request)?;
                Ok(Reply::ack())
            }
            Request::SetRisk(RiskArgs { risk }) => {
                applied(self.engine.set_risk(RiskState::from_raw(risk))?)
            }
            Request::GetPower(PidArgs { pid }) => {
                Reply::with_body(&self.engine.get_powercap(pid)?)
            }
            Request::LoopReport(report) => applied(self.engine.on_loop_event(
                report.pid,
                report.event,
                report.signature,
            )?),
            Request::MetricsReport(sample) => {
                self.reported.push(sample)?;
                Ok(Reply::ack())
            }
        }
    }
}

type OpenStreams = Arc<Mutex<HashMap<RawFd, UnixStream>>>;

/// Unix socket server, bound but not yet accepting
pub struct ConnectionServer {
    listener: UnixListener,
    path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    logger: StructuredLogger,
}

impl ConnectionServer {
    /// Bind the socket, replacing a stale socket file left at `path`
    pub fn bind(path: impl AsRef<Path>, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Connection server bound");

        Ok(Self {
            listener,
            path,
            dispatcher,
            logger: StructuredLogger::new("eard"),
        })
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start accepting in a background thread
    pub fn start(self) -> Result<ServerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let streams: OpenStreams = Arc::new(Mutex::new(HashMap::new()));

        let ConnectionServer {
            listener,
            path,
            dispatcher,
            logger,
        } = self;

        let acceptor = {
            let stop = stop.clone();
            let streams = streams.clone();
            thread::Builder::new()
                .name("eard-acceptor".to_string())
                .spawn(move || accept_loop(listener, dispatcher, logger, stop, streams))?
        };

        Ok(ServerHandle {
            path,
            stop,
            streams,
            acceptor: Some(acceptor),
        })
    }
}

fn accept_loop(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    logger: StructuredLogger,
    stop: Arc<AtomicBool>,
    streams: OpenStreams,
) {
    for incoming in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match incoming {
            Ok(stream) => spawn_connection(stream, &dispatcher, &logger, &streams),
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
    debug!("Acceptor stopped");
}

fn spawn_connection(
    stream: UnixStream,
    dispatcher: &Arc<Dispatcher>,
    logger: &StructuredLogger,
    streams: &OpenStreams,
) {
    let fd = stream.as_raw_fd();
    if let Err(e) = dispatcher
        .connections()
        .attach(fd, Registration::new(PEER_LOCAL))
    {
        warn!(fd, error = %e, "Connection rejected");
        return;
    }
    logger.log_connection(fd, PEER_LOCAL, true);

    if let (Ok(clone), Ok(mut open)) = (stream.try_clone(), streams.lock()) {
        open.insert(fd, clone);
    }

    let spawned = {
        let dispatcher = dispatcher.clone();
        let logger = logger.clone();
        let streams = streams.clone();
        thread::Builder::new()
            .name(format!("eard-conn-{}", fd))
            .spawn(move || {
                let mut stream = stream;
                serve_connection(&mut stream, fd, &dispatcher);
                close_connection(fd, &dispatcher, &logger, &streams);
                // Closed only after deregistration, so the number cannot be reused early
                drop(stream);
            })
    };

    if let Err(e) = spawned {
        warn!(fd, error = %e, "Connection thread not started");
        close_connection(fd, dispatcher, logger, streams);
    }
}

fn close_connection(
    fd: RawFd,
    dispatcher: &Dispatcher,
    logger: &StructuredLogger,
    streams: &OpenStreams,
) {
    if let Err(e) = dispatcher.connections().detach(fd) {
        debug!(fd, error = %e, "Connection already detached");
    }
    if let Ok(mut open) = streams.lock() {
        open.remove(&fd);
    }
    logger.log_connection(fd, PEER_LOCAL, false);
}

fn serve_connection(stream: &mut UnixStream, fd: RawFd, dispatcher: &Dispatcher) {
    loop {
        let (header, payload) = match read_frame(stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_connection_fatal() => {
                debug!(fd, error = %e, "Connection lost");
                break;
            }
            Err(e) => {
                // The stream cannot be resynchronised after a bad header
                warn!(fd, error = %e, "Dropping connection after framing error");
                if let Err(e) = send_reply(stream, TYPE_COMMAND, &Reply::failure(&e)) {
                    debug!(fd, error = %e, "Error reply not delivered");
                }
                break;
            }
        };

        let (kind, reply) = dispatcher.handle_frame(header, &payload);
        if let Err(e) = send_reply(stream, kind, &reply) {
            debug!(fd, error = %e, "Reply not delivered");
            break;
        }
    }
}

/// Only I/O errors are returned; a reply too large for one frame is swapped
/// for an error reply so the client is not left waiting.
fn send_reply(stream: &mut UnixStream, kind: u32, reply: &Reply) -> Result<()> {
    let bytes = reply.encode()?;
    if bytes.len() > MAX_PAYLOAD_SIZE {
        let e = EardError::invalid(format!(
            "reply of {} bytes exceeds {} byte frame limit",
            bytes.len(),
            MAX_PAYLOAD_SIZE
        ));
        warn!(kind, error = %e, "Reply replaced by error");
        return write_frame(stream, kind, &Reply::failure(&e).encode()?);
    }
    write_frame(stream, kind, &bytes)
}

/// Running server
pub struct ServerHandle {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    streams: OpenStreams,
    acceptor: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, close open connections and remove the socket file
    pub fn shutdown(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);

        // Wake the acceptor blocked in accept()
        if let Err(e) = UnixStream::connect(&self.path) {
            debug!(error = %e, "Wake-up connect failed");
        }
        if let Some(acceptor) = self.acceptor.take() {
            acceptor
                .join()
                .map_err(|_| EardError::Io(io::Error::new(io::ErrorKind::Other, "acceptor panicked")))?;
        }

        if let Ok(mut open) = self.streams.lock() {
            for (fd, stream) in open.drain() {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!(fd, error = %e, "Stream already closed");
                }
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.path.display(), "Connection server stopped");
        Ok(())
    }
}
