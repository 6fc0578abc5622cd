//! Command interpreter shared by the text and WebSocket transports.
//!
//! Parsing turns a text line or a JSON request into a [`Command`];
//! [`CommandInterpreter::execute`] applies it to the job registry and
//! returns an [`Outcome`], which each transport renders its own way.

use job_registry::{JobId, JobRegistry, JobSummary, Launcher, RegistryError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::telemetry::{TelemetrySample, TelemetrySampler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Status,
    /// Arguments appended to the launcher's command line
    Run(Vec<String>),
    Stop(JobId),
    Quit,
    GetRsl,
}

impl Command {
    /// Parse one line of the text protocol. Blank lines yield `Ok(None)`.
    pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_uppercase().as_str() {
            "PING" => Command::Ping,
            "STATUS" => Command::Status,
            "QUIT" | "EXIT" => Command::Quit,
            "GET_RSL" => Command::GetRsl,
            "RUN" => Command::Run(split_args(rest)?),
            "STOP" => Command::Stop(parse_job_id(rest)?),
            _ => return Err(CommandError::Unknown),
        };
        Ok(Some(command))
    }

    /// Parse one WebSocket text frame. Only `cmd` selects the command;
    /// other fields are looked at only by the commands that use them.
    pub fn from_json(text: &str) -> Result<Command, CommandError> {
        let request: Map<String, Value> =
            serde_json::from_str(text).map_err(|_| CommandError::InvalidJson)?;
        let verb = request
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(CommandError::Unknown)?;

        let command = match verb.to_ascii_uppercase().as_str() {
            "PING" => Command::Ping,
            "STATUS" => Command::Status,
            "QUIT" | "EXIT" => Command::Quit,
            "GET_RSL" => Command::GetRsl,
            "RUN" => Command::Run(run_args(request.get("args"))?),
            "STOP" => Command::Stop(job_ref(request.get("id"))?),
            _ => return Err(CommandError::Unknown),
        };
        Ok(command)
    }
}

/// `args` as a shell-style string or a list of strings
fn run_args(value: Option<&Value>) -> Result<Vec<String>, CommandError> {
    let args = match value {
        Some(Value::String(line)) => split_args(line)?,
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()
            .ok_or(CommandError::MissingArgs)?,
        _ => return Err(CommandError::MissingArgs),
    };
    if args.iter().all(|a| a.trim().is_empty()) {
        return Err(CommandError::MissingArgs);
    }
    Ok(args)
}

/// `id` as a number or a numeric string
fn job_ref(value: Option<&Value>) -> Result<JobId, CommandError> {
    match value {
        None | Some(Value::Null) => Err(CommandError::MissingArgs),
        Some(Value::String(s)) => parse_job_id(s),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(JobId)
            .ok_or_else(|| CommandError::InvalidJobId(n.to_string())),
        Some(other) => Err(CommandError::InvalidJobId(other.to_string())),
    }
}

/// Shell-style split, so quoted paths with spaces stay one argument
fn split_args(rest: &str) -> Result<Vec<String>, CommandError> {
    let args = shlex::split(rest).ok_or(CommandError::UnbalancedQuotes)?;
    if args.is_empty() {
        return Err(CommandError::MissingArgs);
    }
    Ok(args)
}

fn parse_job_id(rest: &str) -> Result<JobId, CommandError> {
    if rest.trim().is_empty() {
        return Err(CommandError::MissingArgs);
    }
    rest.parse()
        .map_err(|_| CommandError::InvalidJobId(rest.trim().to_string()))
}

/// Result of executing one command
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pong,
    Status(Vec<JobSummary>),
    Started(JobId),
    Stopped(JobId),
    NotFound,
    Bye,
    Rsl(TelemetrySample),
    Error(String),
}

impl From<CommandError> for Outcome {
    fn from(err: CommandError) -> Self {
        Outcome::Error(err.to_string())
    }
}

/// JSON reply sent over the WebSocket
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Reply {
    Response { response: String },
    Rsl { rsl: f64, timestamp: f64 },
    Error { error: String },
}

impl Outcome {
    /// The connection is closed after this outcome is sent
    pub fn closes_connection(&self) -> bool {
        matches!(self, Outcome::Bye)
    }

    /// Text protocol rendering, one entry per response line
    pub fn to_lines(&self) -> Vec<String> {
        match self {
            Outcome::Status(jobs) if jobs.is_empty() => vec!["NO_JOBS".to_string()],
            Outcome::Status(jobs) => jobs
                .iter()
                .map(|job| format!("PID:{} CMD:{}", job.id, job.command_line))
                .collect(),
            Outcome::Rsl(sample) => vec![format!("RSL {:.2} {:.3}", sample.rsl, sample.timestamp)],
            Outcome::Error(message) => vec![format!("ERROR: {}", message)],
            other => vec![other.response_text()],
        }
    }

    pub fn to_reply(&self) -> Reply {
        match self {
            Outcome::Rsl(sample) => Reply::Rsl {
                rsl: sample.rsl,
                timestamp: sample.timestamp,
            },
            Outcome::Error(message) => Reply::Error {
                error: message.clone(),
            },
            Outcome::Status(_) => Reply::Response {
                response: self.to_lines().join("\n"),
            },
            other => Reply::Response {
                response: other.response_text(),
            },
        }
    }

    fn response_text(&self) -> String {
        match self {
            Outcome::Pong => "PONG".to_string(),
            Outcome::Started(id) => format!("STARTED {}", id),
            Outcome::Stopped(id) => format!("STOPPED {}", id),
            Outcome::NotFound => "NOT_FOUND".to_string(),
            Outcome::Bye => "BYE".to_string(),
            _ => self.to_lines().join("\n"),
        }
    }
}

/// Applies commands to the shared job registry
pub struct CommandInterpreter {
    registry: Arc<JobRegistry>,
    launcher: Launcher,
    sampler: Arc<TelemetrySampler>,
}

impl CommandInterpreter {
    pub fn new(registry: Arc<JobRegistry>, launcher: Launcher, sampler: Arc<TelemetrySampler>) -> Self {
        Self {
            registry,
            launcher,
            sampler,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Execute a command. `Run` spawns and `GetRsl` may read the
    /// instrument, so this blocks; async callers use `spawn_blocking`.
    pub fn execute(&self, command: Command) -> Outcome {
        debug!("Executing {:?}", command);
        match command {
            Command::Ping => Outcome::Pong,
            Command::Status => Outcome::Status(self.registry.list()),
            Command::Quit => Outcome::Bye,
            Command::GetRsl => Outcome::Rsl(self.sampler.sample()),
            Command::Run(args) => match self.registry.spawn(&self.launcher, &args) {
                Ok(id) => Outcome::Started(id),
                Err(e) => {
                    warn!("RUN failed: {}", e);
                    Outcome::Error(e.to_string())
                }
            },
            Command::Stop(id) => match self.registry.terminate(id) {
                Ok(()) => Outcome::Stopped(id),
                Err(RegistryError::NotFound(_)) => Outcome::NotFound,
                Err(e) => Outcome::Error(e.to_string()),
            },
        }
    }

    /// Handle one text line; `None` for blank lines
    pub fn handle_line(&self, line: &str) -> Option<Outcome> {
        match Command::parse_line(line) {
            Ok(Some(command)) => Some(self.execute(command)),
            Ok(None) => None,
            Err(e) => Some(e.into()),
        }
    }

    /// Handle one WebSocket text frame
    pub fn handle_json(&self, text: &str) -> Outcome {
        match Command::from_json(text) {
            Ok(command) => self.execute(command),
            Err(e) => e.into(),
        }
    }
}
