//! Debugger backend capabilities
//!
//! The analyzers never talk to a debugger process directly. They consume two
//! injected capabilities:
//!
//! - [`CommandBackend`]: run one textual command, get its output or an error.
//!   The backend is stateful and fragile; it may crash or hang mid-command.
//! - [`Introspector`]: given an object address, return a structured
//!   field/array/string tree.
//!
//! [`DebuggerSession`] wraps a command backend and turns every call into a
//! [`CommandOutcome`], so no stage ever sees a raw backend error. Failed
//! commands land in a crash log that is surfaced once in the final report.

use crate::address::Address;
use crate::config::InspectLimits;
use crate::error::{BackendError, IntrospectionError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Runs one command at a time against a debugger
pub trait CommandBackend {
    /// Execute `command`, giving up after `timeout`.
    ///
    /// Implementations must report a crash or timeout as an error value and
    /// never panic the caller.
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<String, BackendError>;
}

/// Structured view of a runtime object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectTree {
    Null,
    Primitive {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        type_name: Option<String>,
        value: String,
    },
    String {
        value: String,
        #[serde(default)]
        truncated: bool,
    },
    Object {
        type_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<Address>,
        #[serde(default)]
        fields: Vec<ObjectField>,
    },
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        length: u64,
        #[serde(default)]
        elements: Vec<ObjectTree>,
    },
    /// Placeholder substituted when introspection failed
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectField {
    pub name: String,
    pub value: ObjectTree,
}

impl ObjectTree {
    /// Look up a direct field by name
    pub fn field(&self, name: &str) -> Option<&ObjectTree> {
        match self {
            ObjectTree::Object { fields, .. } => {
                fields.iter().find(|f| f.name == name).map(|f| &f.value)
            }
            _ => None,
        }
    }

    /// Render a leaf as text; `None` for null, unavailable and empty values
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            ObjectTree::Null | ObjectTree::Unavailable { .. } => return None,
            ObjectTree::Primitive { value, .. } | ObjectTree::String { value, .. } => value.clone(),
            ObjectTree::Object { type_name, address, .. } => match address {
                Some(addr) => format!("{type_name} @ {addr}"),
                None => type_name.clone(),
            },
            ObjectTree::Array { element_type, length, .. } => format!(
                "{}[{}]",
                element_type.as_deref().unwrap_or("object"),
                length
            ),
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Text of a named field
    pub fn field_text(&self, name: &str) -> Option<String> {
        self.field(name).and_then(ObjectTree::as_text)
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, ObjectTree::Unavailable { .. })
    }
}

/// Deep object inspection by address
pub trait Introspector {
    fn inspect_object(
        &mut self,
        address: Address,
        type_handle: Option<Address>,
        limits: InspectLimits,
    ) -> Result<ObjectTree, IntrospectionError>;
}

/// Inspect an object, substituting a placeholder on failure. Never retried.
pub fn inspect_or_placeholder(
    introspector: &mut dyn Introspector,
    address: Address,
    type_handle: Option<Address>,
    limits: InspectLimits,
) -> ObjectTree {
    match introspector.inspect_object(address, type_handle, limits) {
        Ok(tree) => tree,
        Err(e) => {
            tracing::debug!("introspection of {} failed: {}", address, e);
            ObjectTree::Unavailable {
                reason: e.to_string(),
            }
        }
    }
}

/// Introspector for backends without object inspection
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIntrospection;

impl Introspector for NoIntrospection {
    fn inspect_object(
        &mut self,
        _address: Address,
        _type_handle: Option<Address>,
        _limits: InspectLimits,
    ) -> Result<ObjectTree, IntrospectionError> {
        Err(IntrospectionError::Unavailable(
            "backend has no object introspection".to_string(),
        ))
    }
}

/// Result of one backend command, as seen by the stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Output(String),
    /// The backend answered, but this data category is not supported or not loaded
    Unavailable {
        command: String,
        phrase: &'static str,
    },
    /// The backend crashed or timed out; treated as "no data"
    Failed { command: String, reason: String },
}

impl CommandOutcome {
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandOutcome::Output(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_output(self) -> Option<String> {
        match self {
            CommandOutcome::Output(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CommandOutcome::Failed { .. })
    }
}

/// Phrases that mean "this category of data is not available here"
const UNAVAILABLE_PHRASES: &[&str] = &[
    "is not a valid command",
    "unrecognized command",
    "command not found",
    "not supported",
    "no export",
    "sos not loaded",
    "runtime module is not loaded",
    "failed to find runtime",
    "unable to find module",
    "no clr runtime",
    "not loaded",
];

/// Only the head of the output is checked; long listings may legitimately
/// mention these phrases further down.
const UNAVAILABLE_SCAN_LINES: usize = 3;

/// Labels that introduce a debugger diagnostic rather than a record field
const DIAGNOSTIC_LABELS: &[&str] = &["error", "warning", "sos"];

/// `Message: ...`, `Exception type: ...` and similar: the value is program
/// data and may say "not supported" without the command having failed.
fn is_record_field(line: &str) -> bool {
    let Some((label, _)) = line.split_once(':') else {
        return false;
    };
    let label = label.trim();
    !label.is_empty()
        && !DIAGNOSTIC_LABELS.contains(&label)
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')'))
}

/// Detect a "not supported / not loaded" answer
pub fn detect_unavailable(output: &str) -> Option<&'static str> {
    let head: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(UNAVAILABLE_SCAN_LINES)
        .map(str::to_ascii_lowercase)
        .filter(|l| !is_record_field(l))
        .collect();

    UNAVAILABLE_PHRASES
        .iter()
        .copied()
        .find(|phrase| head.iter().any(|line| line.contains(phrase)))
}

/// One command that crashed or timed out during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub command: String,
    pub reason: String,
}

/// Command channel for one analysis run
pub struct DebuggerSession<'a> {
    backend: &'a mut dyn CommandBackend,
    timeout: Duration,
    crash_log: Vec<CrashRecord>,
    commands_run: usize,
}

impl<'a> DebuggerSession<'a> {
    pub fn new(backend: &'a mut dyn CommandBackend, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            crash_log: Vec::new(),
            commands_run: 0,
        }
    }

    /// Run one command; crashes and timeouts are recorded, never propagated
    pub fn run(&mut self, command: &str) -> CommandOutcome {
        self.commands_run += 1;
        let started = Instant::now();

        let result = self.backend.execute(command, self.timeout);
        let elapsed = started.elapsed();

        let output = match result {
            Ok(_) if elapsed > self.timeout => {
                return self.record_failure(
                    command,
                    BackendError::TimedOut {
                        command: command.to_string(),
                        timeout: self.timeout,
                    }
                    .to_string(),
                );
            }
            Ok(output) => output,
            Err(BackendError::NotRecorded(_)) => {
                // Nothing was attempted, so nothing crashed
                tracing::debug!("no output recorded for '{}'", command);
                return CommandOutcome::Unavailable {
                    command: command.to_string(),
                    phrase: "not recorded",
                };
            }
            Err(e) => return self.record_failure(command, e.to_string()),
        };

        match detect_unavailable(&output) {
            Some(phrase) => {
                tracing::debug!("'{}' unavailable: {}", command, phrase);
                CommandOutcome::Unavailable {
                    command: command.to_string(),
                    phrase,
                }
            }
            None => CommandOutcome::Output(output),
        }
    }

    fn record_failure(&mut self, command: &str, reason: String) -> CommandOutcome {
        tracing::warn!("backend command '{}' failed: {}", command, reason);
        self.crash_log.push(CrashRecord {
            command: command.to_string(),
            reason: reason.clone(),
        });
        CommandOutcome::Failed {
            command: command.to_string(),
            reason,
        }
    }

    pub fn crash_log(&self) -> &[CrashRecord] {
        &self.crash_log
    }

    pub fn commands_run(&self) -> usize {
        self.commands_run
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
