//! Recorded debugger transcripts
//!
//! A transcript is a JSON file holding the output of each command a real
//! debugger session produced, the commands that crashed or hung, and the
//! object trees the introspector returned:
//!
//! ```json
//! {
//!   "commands": { "clrthreads": "ThreadCount: 1\n..." },
//!   "crashes": ["dumpheap -stat"],
//!   "timeouts": ["syncblk"],
//!   "objects": { "0x7f001000": { "kind": "object", "type_name": "System.Exception", "fields": [] } }
//! }
//! ```
//!
//! [`ReplayBackend`] and [`ReplayIntrospector`] serve a transcript back to
//! the pipeline so an analysis can run offline.

use crate::address::{parse_address, Address};
use crate::backend::{CommandBackend, Introspector, ObjectField, ObjectTree};
use crate::config::InspectLimits;
use crate::error::{BackendError, IntrospectionError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Transcript {
    pub commands: BTreeMap<String, String>,
    pub crashes: Vec<String>,
    pub timeouts: Vec<String>,
    pub objects: BTreeMap<String, ObjectTree>,
}

/// Collapse runs of whitespace and drop a leading `!` so `!clrthreads`,
/// `clrthreads` and `clrthreads ` all address the same recording
fn command_key(command: &str) -> String {
    command
        .trim()
        .trim_start_matches('!')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl Transcript {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("transcript is not valid JSON")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read transcript {}", path.display()))?;
        Self::from_json_str(&contents)
            .with_context(|| format!("failed to parse transcript {}", path.display()))
    }

    /// Split into the two capabilities the pipeline consumes
    pub fn into_parts(self) -> (ReplayBackend, ReplayIntrospector) {
        let introspector = ReplayIntrospector::new(&self.objects);
        (ReplayBackend::new(self), introspector)
    }
}

/// Command backend answering from a transcript
pub struct ReplayBackend {
    outputs: HashMap<String, String>,
    crashes: Vec<String>,
    timeouts: Vec<String>,
    executed: Vec<String>,
}

impl ReplayBackend {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            outputs: transcript
                .commands
                .into_iter()
                .map(|(command, output)| (command_key(&command), output))
                .collect(),
            crashes: transcript.crashes.iter().map(|c| command_key(c)).collect(),
            timeouts: transcript.timeouts.iter().map(|c| command_key(c)).collect(),
            executed: Vec::new(),
        }
    }

    /// Commands asked for so far, in order
    pub fn executed(&self) -> &[String] {
        &self.executed
    }
}

impl CommandBackend for ReplayBackend {
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<String, BackendError> {
        let key = command_key(command);
        self.executed.push(key.clone());

        if self.crashes.contains(&key) {
            return Err(BackendError::Crashed {
                command: command.to_string(),
                reason: "recorded crash".to_string(),
            });
        }
        if self.timeouts.contains(&key) {
            return Err(BackendError::TimedOut {
                command: command.to_string(),
                timeout,
            });
        }
        self.outputs
            .get(&key)
            .cloned()
            .ok_or_else(|| BackendError::NotRecorded(command.to_string()))
    }
}

/// Introspector answering from a transcript's recorded object trees
pub struct ReplayIntrospector {
    objects: HashMap<u64, ObjectTree>,
}

impl ReplayIntrospector {
    pub fn new(objects: &BTreeMap<String, ObjectTree>) -> Self {
        let mut parsed = HashMap::new();
        for (key, tree) in objects {
            match parse_address(key) {
                Some(address) => {
                    parsed.insert(address, tree.clone());
                }
                None => tracing::warn!("ignoring recorded object with bad address '{}'", key),
            }
        }
        Self { objects: parsed }
    }
}

/// Apply inspection limits to a recorded tree
fn limit(tree: &ObjectTree, limits: &InspectLimits, depth: u32) -> ObjectTree {
    match tree {
        ObjectTree::String { value, truncated } => {
            let max = limits.max_string_length as usize;
            if value.chars().count() > max {
                ObjectTree::String {
                    value: value.chars().take(max).collect(),
                    truncated: true,
                }
            } else {
                ObjectTree::String {
                    value: value.clone(),
                    truncated: *truncated,
                }
            }
        }
        ObjectTree::Object { .. } | ObjectTree::Array { .. } if depth >= limits.max_depth => {
            ObjectTree::Unavailable {
                reason: format!("depth limit {} reached", limits.max_depth),
            }
        }
        ObjectTree::Object {
            type_name,
            address,
            fields,
        } => ObjectTree::Object {
            type_name: type_name.clone(),
            address: *address,
            fields: fields
                .iter()
                .map(|f| ObjectField {
                    name: f.name.clone(),
                    value: limit(&f.value, limits, depth + 1),
                })
                .collect(),
        },
        ObjectTree::Array {
            element_type,
            length,
            elements,
        } => ObjectTree::Array {
            element_type: element_type.clone(),
            length: *length,
            elements: elements
                .iter()
                .take(limits.max_array_elements as usize)
                .map(|e| limit(e, limits, depth + 1))
                .collect(),
        },
        other => other.clone(),
    }
}

impl Introspector for ReplayIntrospector {
    fn inspect_object(
        &mut self,
        address: Address,
        _type_handle: Option<Address>,
        limits: InspectLimits,
    ) -> Result<ObjectTree, IntrospectionError> {
        self.objects
            .get(&address.0)
            .map(|tree| limit(tree, &limits, 0))
            .ok_or(IntrospectionError::NotInspectable(address.0))
    }
}
