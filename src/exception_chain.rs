//! Exception chain walker
//!
//! Builds the outer → inner exception chain from `printexception -nested`
//! output, enriched through object introspection:
//!
//! - every section after the first is one inner exception
//! - node addresses go into a visited set seeded with the root; a repeated
//!   address ends the chain with a single node flagged `is_cycle`
//! - a hard depth cap bounds the walk even on acyclic chains
//! - when the text runs out but the last node advertises an inner exception
//!   address, the walk continues through introspection alone
//!
//! Introspection failures never stop the walk; the node keeps whatever the
//! text gave it.

use crate::address::Address;
use crate::backend::{inspect_or_placeholder, Introspector, ObjectTree};
use crate::config::{AnalyzerConfig, InspectLimits};
use crate::decoders::exception::format_hresult;
use crate::decoders::{decode_exception, split_nested_sections, ExceptionRecord};
use crate::exception_category::ExceptionCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One exception in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionNode {
    /// 0 for the outermost exception
    pub depth: usize,
    pub type_name: Option<String>,
    pub message: Option<String>,
    pub hresult: Option<String>,
    pub address: Option<Address>,
    pub source: Option<String>,
    pub category: ExceptionCategory,
    /// Category-specific fields (`_fileName`, `_className`, ...)
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stack_trace: Vec<String>,
    /// Terminal node standing in for an address already seen in the chain
    #[serde(default)]
    pub is_cycle: bool,
    pub inner: Option<Box<ExceptionNode>>,
}

impl ExceptionNode {
    fn from_record(record: ExceptionRecord, depth: usize) -> Self {
        let category = record
            .type_name
            .as_deref()
            .map(ExceptionCategory::classify)
            .unwrap_or(ExceptionCategory::Unrecognized);
        ExceptionNode {
            depth,
            type_name: record.type_name,
            message: record.message,
            hresult: record.hresult,
            address: record.address,
            source: None,
            category,
            custom_fields: BTreeMap::new(),
            stack_trace: record.stack_trace,
            is_cycle: false,
            inner: None,
        }
    }

    fn cycle_marker(address: Address, type_name: Option<String>, depth: usize) -> Self {
        ExceptionNode {
            depth,
            category: type_name
                .as_deref()
                .map(ExceptionCategory::classify)
                .unwrap_or(ExceptionCategory::Unrecognized),
            type_name,
            message: Some(format!("cycle: exception {address} already appears in the chain")),
            hresult: None,
            address: Some(address),
            source: None,
            custom_fields: BTreeMap::new(),
            stack_trace: Vec::new(),
            is_cycle: true,
            inner: None,
        }
    }

    /// Walk outermost to innermost
    pub fn iter(&self) -> impl Iterator<Item = &ExceptionNode> {
        std::iter::successors(Some(self), |node| node.inner.as_deref())
    }

    /// Number of nodes in the chain, cycle marker included
    pub fn chain_len(&self) -> usize {
        self.iter().count()
    }

    /// Innermost exception, usually the root cause
    pub fn innermost(&self) -> &ExceptionNode {
        self.iter().last().unwrap_or(self)
    }

    pub fn has_cycle(&self) -> bool {
        self.iter().any(|node| node.is_cycle)
    }
}

/// Pending node plus the inner address its text advertised
struct Pending {
    node: ExceptionNode,
    inner_address: Option<Address>,
}

/// Walks nested exception output with cycle and depth protection
pub struct ExceptionChainWalker<'a> {
    introspector: &'a mut dyn Introspector,
    limits: InspectLimits,
    max_depth: usize,
}

impl<'a> ExceptionChainWalker<'a> {
    pub fn new(introspector: &'a mut dyn Introspector, config: &AnalyzerConfig) -> Self {
        Self {
            introspector,
            limits: config.inspect_limits,
            max_depth: config.max_exception_depth,
        }
    }

    /// Build the chain; `None` when the text holds no recognizable exception
    pub fn walk(&mut self, text: &str) -> Option<ExceptionNode> {
        let mut records = split_nested_sections(text)
            .into_iter()
            .filter_map(|section| match decode_exception(&section) {
                (record, true) => Some(record),
                (_, false) => None,
            });

        let root = records.next()?;
        let mut visited: HashSet<u64> = HashSet::new();
        if let Some(address) = root.address {
            visited.insert(address.0);
        }

        let mut chain = vec![self.enrich(root, 0)];
        let mut cycle: Option<ExceptionNode> = None;

        for record in records {
            if chain.len() >= self.max_depth {
                tracing::debug!(max_depth = self.max_depth, "exception chain truncated");
                break;
            }
            if let Some(address) = record.address {
                if !visited.insert(address.0) {
                    cycle = Some(ExceptionNode::cycle_marker(
                        address,
                        record.type_name,
                        chain.len(),
                    ));
                    break;
                }
            }
            let depth = chain.len();
            chain.push(self.enrich(record, depth));
        }

        // Text exhausted: keep following advertised inner addresses
        while cycle.is_none() && chain.len() < self.max_depth {
            let Some(address) = chain.last().and_then(|p| p.inner_address) else {
                break;
            };
            if !visited.insert(address.0) {
                cycle = Some(ExceptionNode::cycle_marker(address, None, chain.len()));
                break;
            }
            let tree =
                inspect_or_placeholder(&mut *self.introspector, address, None, self.limits);
            let Some(pending) = node_from_tree(&tree, address, chain.len()) else {
                break;
            };
            chain.push(extract_fields(pending, &tree));
        }

        link(chain, cycle)
    }

    /// Backfill message/source/hresult and category fields from the object
    fn enrich(&mut self, record: ExceptionRecord, depth: usize) -> Pending {
        let inner_address = record.inner_address;
        let pending = Pending {
            node: ExceptionNode::from_record(record, depth),
            inner_address,
        };
        let Some(address) = pending.node.address else {
            return pending;
        };
        let tree = inspect_or_placeholder(&mut *self.introspector, address, None, self.limits);
        extract_fields(pending, &tree)
    }
}

fn extract_fields(mut pending: Pending, tree: &ObjectTree) -> Pending {
    if !tree.is_available() {
        return pending;
    }
    let node = &mut pending.node;
    if node.message.is_none() {
        node.message = tree.field_text("_message");
    }
    if node.source.is_none() {
        node.source = tree.field_text("_source");
    }
    if node.hresult.is_none() {
        node.hresult = tree.field_text("_HResult").and_then(|v| format_hresult(&v, 10));
    }
    for field in node.category.extra_fields() {
        if let Some(value) = tree.field_text(field) {
            node.custom_fields.insert(field.to_string(), value);
        }
    }
    if pending.inner_address.is_none() {
        pending.inner_address = inner_address_of(tree);
    }
    pending
}

fn inner_address_of(tree: &ObjectTree) -> Option<Address> {
    match tree.field("_innerException")? {
        ObjectTree::Object { address, .. } => *address,
        ObjectTree::Primitive { value, .. } => Address::parse(value).filter(|a| a.0 != 0),
        _ => None,
    }
}

fn node_from_tree(tree: &ObjectTree, address: Address, depth: usize) -> Option<Pending> {
    let ObjectTree::Object { type_name, .. } = tree else {
        return None;
    };
    let record = ExceptionRecord {
        address: Some(address),
        type_name: Some(type_name.clone()),
        ..Default::default()
    };
    Some(Pending {
        node: ExceptionNode::from_record(record, depth),
        inner_address: None,
    })
}

/// Turn the flat list into the linked chain, outermost first
fn link(chain: Vec<Pending>, cycle: Option<ExceptionNode>) -> Option<ExceptionNode> {
    chain.into_iter().rev().fold(cycle, |inner, pending| {
        let mut node = pending.node;
        node.inner = inner.map(Box::new);
        Some(node)
    })
}
