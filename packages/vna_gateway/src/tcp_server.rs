//! Text command server: one OS thread per connection.
//!
//! The accept loop also owns the shared port. Each connection thread peeks
//! at the first bytes; WebSocket handshakes (`GET `) are handed to the event
//! loop, everything else is a line-oriented command session.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::CommandInterpreter;
use crate::websocket::Handoff;

const HTTP_PREFIX: &[u8; 4] = b"GET ";

/// How long a connection may dribble a partial `GET ` before it is
/// treated as a text session
const SNIFF_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Text,
    Http,
}

/// Classify a connection from its first bytes without consuming them.
pub fn sniff(stream: &TcpStream) -> io::Result<Protocol> {
    let mut buf = [0u8; 4];
    let deadline = Instant::now() + SNIFF_WINDOW;
    loop {
        let n = stream.peek(&mut buf)?;
        if n == 0 || buf[..n] != HTTP_PREFIX[..n] {
            return Ok(Protocol::Text);
        }
        if n == HTTP_PREFIX.len() {
            return Ok(Protocol::Http);
        }
        if Instant::now() >= deadline {
            return Ok(Protocol::Text);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub struct TcpCommandServer {
    listener: TcpListener,
    interpreter: Arc<CommandInterpreter>,
    handoff: Option<Handoff>,
}

impl TcpCommandServer {
    /// `handoff` receives HTTP connections; without one they are served
    /// as text sessions.
    pub fn new(
        listener: TcpListener,
        interpreter: Arc<CommandInterpreter>,
        handoff: Option<Handoff>,
    ) -> Self {
        Self {
            listener,
            interpreter,
            handoff,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop on its own thread
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tcp-accept".to_string())
            .spawn(move || self.serve())
    }

    pub fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Command server listening on {}", addr);
        }

        for incoming in self.listener.incoming() {
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    thread::sleep(Duration::from_millis(50));
                    continue;
                }
            };

            let interpreter = self.interpreter.clone();
            let handoff = self.handoff.clone();
            let spawned = thread::Builder::new()
                .name("tcp-conn".to_string())
                .spawn(move || handle_connection(stream, &interpreter, handoff.as_ref()));
            if let Err(e) = spawned {
                warn!("Failed to start connection thread: {}", e);
            }
        }
    }
}

fn handle_connection(stream: TcpStream, interpreter: &CommandInterpreter, handoff: Option<&Handoff>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let protocol = match sniff(&stream) {
        Ok(p) => p,
        Err(e) => {
            debug!(peer = %peer, "Connection lost before first byte: {}", e);
            return;
        }
    };

    if protocol == Protocol::Http {
        if let Some(handoff) = handoff {
            debug!(peer = %peer, "Handing connection to WebSocket gateway");
            if handoff.send(stream).is_err() {
                warn!(peer = %peer, "WebSocket gateway is not running, dropping connection");
            }
            return;
        }
    }

    info!(peer = %peer, "Command session opened");
    match run_session(stream, interpreter) {
        Ok(()) => info!(peer = %peer, "Command session closed"),
        Err(e) => info!(peer = %peer, "Command session ended: {}", e),
    }
}

/// Serve newline-terminated commands until EOF, QUIT/EXIT or an I/O error.
pub fn run_session(stream: TcpStream, interpreter: &CommandInterpreter) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }

        let Some(outcome) = interpreter.handle_line(&line) else {
            continue;
        };

        for response in outcome.to_lines() {
            writeln!(writer, "{}", response)?;
            writer.flush()?;
        }

        if outcome.closes_connection() {
            return Ok(());
        }
    }
}
