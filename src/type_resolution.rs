//! Type/member resolution diagnostics
//!
//! For "method not found" / "could not load type" style failures this
//! module answers: does the type exist in the crashed process, and what
//! members does it actually have?
//!
//! 1. An ordered list of message patterns (most specific first) extracts the
//!    type, member and signature from the exception message.
//! 2. The type is looked up by name; its member table is dumped.
//! 3. If the lookup fails and the name is generic, any concrete
//!    instantiation with the same base name and arity found in the heap
//!    histogram stands in for it.
//! 4. Exact and similar member names are computed and a diagnosis is picked
//!    from a fixed decision table.

use crate::address::Address;
use crate::backend::DebuggerSession;
use crate::config::AnalyzerConfig;
use crate::decoders::{
    decode_heap_histogram, decode_member_table, decode_type_lookup, MemberTable, TypeLookup,
};
use crate::model::{HeapHistogram, MemberInfo};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// What the failure message says was missing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRequest {
    pub type_name: String,
    pub member_name: Option<String>,
    pub signature: Option<String>,
    pub assembly: Option<String>,
}

type Extractor = fn(&regex::Captures<'_>) -> MemberRequest;

fn method_not_found(caps: &regex::Captures<'_>) -> MemberRequest {
    let member = caps["member"].to_string();
    MemberRequest {
        type_name: caps["type"].to_string(),
        signature: Some(format!("{} {}({})", &caps["ret"], member, &caps["args"])),
        member_name: Some(member),
        assembly: None,
    }
}

fn type_and_member(caps: &regex::Captures<'_>) -> MemberRequest {
    MemberRequest {
        type_name: caps["type"].to_string(),
        member_name: Some(caps["member"].to_string()),
        signature: None,
        assembly: None,
    }
}

fn type_only(caps: &regex::Captures<'_>) -> MemberRequest {
    MemberRequest {
        type_name: caps["type"].to_string(),
        member_name: None,
        signature: None,
        assembly: caps.name("asm").map(|m| m.as_str().to_string()),
    }
}

/// Message patterns, most specific first
const MESSAGE_PATTERNS: &[(&str, Extractor)] = &[
    (
        r"Method not found: '(?P<ret>\S+) (?P<type>[^'\s(]+?)\.(?P<member>\.?[^.'(]+)\((?P<args>[^)]*)\)'",
        method_not_found,
    ),
    (
        r"Field not found: '(?P<type>[^'\s]+)\.(?P<member>[^.'\s]+)'",
        type_and_member,
    ),
    (
        r"Could not load type '(?P<type>[^']+)' from assembly '(?P<asm>[^',]+)",
        type_only,
    ),
    (
        r"(?:Member|Method|Field) '(?P<type>[^'\s]+)\.(?P<member>[^.'\s]+)' not found",
        type_and_member,
    ),
];

fn compiled_patterns() -> &'static [(regex::Regex, Extractor)] {
    static PATTERNS: OnceLock<Vec<(regex::Regex, Extractor)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        MESSAGE_PATTERNS
            .iter()
            .filter_map(|(pattern, extract)| match regex::Regex::new(pattern) {
                Ok(re) => Some((re, *extract)),
                Err(e) => {
                    tracing::warn!("invalid message pattern {}: {}", pattern, e);
                    None
                }
            })
            .collect()
    })
}

/// Extract the missing type/member from an exception message; first match wins
///
/// # Example
/// ```
/// use crashlens::type_resolution::parse_member_request;
///
/// let request = parse_member_request(
///     "Method not found: 'Void MyApp.Loader.Load(System.String)'.",
/// )
/// .unwrap();
/// assert_eq!(request.type_name, "MyApp.Loader");
/// assert_eq!(request.member_name.as_deref(), Some("Load"));
/// ```
pub fn parse_member_request(message: &str) -> Option<MemberRequest> {
    compiled_patterns()
        .iter()
        .find_map(|(re, extract)| re.captures(message).map(|caps| extract(&caps)))
}

/// A generic type name split into base name, arity and arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericName {
    pub base: String,
    pub arity: usize,
    /// Empty for open definitions such as ``List`1``
    pub arguments: Vec<String>,
}

/// Split on commas not nested inside brackets
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' | '<' => depth += 1,
            ']' | '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Parse ``List`1[[System.String, System.Private.CoreLib]]``,
/// ``Dictionary`2`` or `Dictionary<System.String, System.Int32>`
pub fn parse_generic(name: &str) -> Option<GenericName> {
    let name = name.trim();

    if let Some(tick) = name.find('`') {
        let base = name[..tick].to_string();
        let rest = &name[tick + 1..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let arity: usize = digits.parse().ok()?;
        let args_text = rest[digits.len()..].trim();
        let arguments = args_text
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .map(|inner| {
                split_top_level(inner)
                    .into_iter()
                    .map(|arg| {
                        let arg = arg.trim_start_matches('[').trim_end_matches(']');
                        // "[System.String, System.Private.CoreLib]" → "System.String"
                        split_top_level(arg).first().copied().unwrap_or(arg).to_string()
                    })
                    .collect()
            })
            .unwrap_or_default();
        return Some(GenericName {
            base,
            arity,
            arguments,
        });
    }

    let open = name.find('<')?;
    let inner = name[open + 1..].strip_suffix('>')?;
    let arguments: Vec<String> = split_top_level(inner)
        .into_iter()
        .map(str::to_string)
        .collect();
    Some(GenericName {
        base: name[..open].to_string(),
        arity: arguments.len(),
        arguments,
    })
}

/// Type lookup and member dumps, as needed by the resolution engine
pub trait TypeCatalog {
    fn find_type(&mut self, name: &str) -> Option<TypeLookup>;
    fn dump_members(&mut self, method_table: Address) -> Option<MemberTable>;
    fn heap_histogram(&mut self) -> Option<HeapHistogram>;
}

/// [`TypeCatalog`] over `name2ee`, `dumpmt -md` and `dumpheap -stat`
pub struct SessionTypeCatalog<'s, 'a> {
    session: &'s mut DebuggerSession<'a>,
    heap: Option<HeapHistogram>,
}

impl<'s, 'a> SessionTypeCatalog<'s, 'a> {
    pub fn new(session: &'s mut DebuggerSession<'a>) -> Self {
        Self {
            session,
            heap: None,
        }
    }

    /// Reuse a histogram an earlier stage already decoded
    pub fn with_heap(mut self, heap: Option<HeapHistogram>) -> Self {
        self.heap = heap;
        self
    }

    /// Hand the histogram, if one was fetched, to later stages
    pub fn into_heap(self) -> Option<HeapHistogram> {
        self.heap
    }
}

impl TypeCatalog for SessionTypeCatalog<'_, '_> {
    fn find_type(&mut self, name: &str) -> Option<TypeLookup> {
        let output = self.session.run(&format!("name2ee *!{name}")).into_output()?;
        match decode_type_lookup(&output) {
            (lookup, true) => Some(lookup),
            (_, false) => None,
        }
    }

    fn dump_members(&mut self, method_table: Address) -> Option<MemberTable> {
        let output = self
            .session
            .run(&format!("dumpmt -md {:016x}", method_table.0))
            .into_output()?;
        match decode_member_table(&output) {
            (table, true) => Some(table),
            (_, false) => None,
        }
    }

    fn heap_histogram(&mut self) -> Option<HeapHistogram> {
        if self.heap.is_none() {
            let output = self.session.run("dumpheap -stat").into_output()?;
            if let (heap, true) = decode_heap_histogram(&output) {
                self.heap = Some(heap);
            }
        }
        self.heap.clone()
    }
}

/// Decision table outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    ExactMatchFound,
    SimilarMatchesFound,
    NoMatch,
    TypeNotFound,
    NoMemberRequested,
    /// Type found but its member table could not be read
    MembersUnavailable,
}

impl Diagnosis {
    fn decide(
        type_found: bool,
        requested: bool,
        members_known: bool,
        exact: bool,
        similar: bool,
    ) -> Self {
        match (type_found, requested, members_known, exact, similar) {
            (false, _, _, _, _) => Diagnosis::TypeNotFound,
            (true, false, _, _, _) => Diagnosis::NoMemberRequested,
            (true, true, false, _, _) => Diagnosis::MembersUnavailable,
            (true, true, true, true, _) => Diagnosis::ExactMatchFound,
            (true, true, true, false, true) => Diagnosis::SimilarMatchesFound,
            (true, true, true, false, false) => Diagnosis::NoMatch,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Diagnosis::ExactMatchFound => {
                "The member exists on the loaded type. The caller was likely compiled \
                 against a different signature or assembly version."
            }
            Diagnosis::SimilarMatchesFound => {
                "The member is missing but similarly named members exist. It was likely \
                 renamed, or the caller expects a different API version."
            }
            Diagnosis::NoMatch => {
                "The member is missing from the loaded type. It was likely removed by \
                 trimming or is absent from this assembly version."
            }
            Diagnosis::TypeNotFound => {
                "The type was not found in any loaded module. The assembly may be missing \
                 or a different version, or the type was trimmed."
            }
            Diagnosis::NoMemberRequested => {
                "The type was found; the failure message names no specific member."
            }
            Diagnosis::MembersUnavailable => {
                "The type was found but its member table could not be read. Whether the \
                 member exists is unknown."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeResolutionReport {
    pub failed_type: String,
    pub expected_member: Option<String>,
    pub expected_signature: Option<String>,
    pub assembly: Option<String>,
    pub type_found: bool,
    pub method_table: Option<Address>,
    /// Concrete instantiation used when the generic definition was not found
    pub resolved_via: Option<String>,
    pub actual_members: Vec<MemberInfo>,
    /// Member count before capping
    pub total_members: usize,
    /// False when the member table could not be read; the member lists are then empty
    pub members_available: bool,
    pub exact_match: bool,
    pub similar_matches: Vec<String>,
    pub diagnosis: Diagnosis,
    pub diagnosis_text: String,
    pub generic_arguments: Vec<String>,
}

/// Resolves missing types and members against the live type system
pub struct TypeResolver {
    max_members: usize,
}

impl TypeResolver {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            max_members: config.max_members,
        }
    }

    /// Diagnose a resolution failure; `None` when the message names no type
    pub fn resolve(
        &self,
        message: &str,
        catalog: &mut dyn TypeCatalog,
    ) -> Option<TypeResolutionReport> {
        let request = parse_member_request(message)?;
        Some(self.resolve_request(request, catalog))
    }

    pub fn resolve_request(
        &self,
        request: MemberRequest,
        catalog: &mut dyn TypeCatalog,
    ) -> TypeResolutionReport {
        let generic = parse_generic(&request.type_name);

        let mut resolved_via = None;
        let mut lookup = catalog.find_type(&request.type_name);
        if lookup.is_none() {
            if let Some(generic) = &generic {
                lookup = find_instantiation(catalog, generic).map(|(name, lookup)| {
                    resolved_via = Some(name);
                    lookup
                });
            }
        }

        let method_table = lookup.as_ref().and_then(|l| l.method_table);
        let members = method_table
            .and_then(|mt| catalog.dump_members(mt))
            .map(|table| table.members);
        let members_available = members.is_some();
        let members = members.unwrap_or_default();

        let requested = request.member_name.as_deref();
        let exact_match = requested.is_some_and(|r| members.iter().any(|m| m.name == r));
        let similar_matches = requested
            .map(|r| similar_members(&members, r))
            .unwrap_or_default();

        let total_members = members.len();
        let actual_members = cap_members(members, requested, &similar_matches, self.max_members);

        let diagnosis = Diagnosis::decide(
            method_table.is_some(),
            requested.is_some(),
            members_available,
            exact_match,
            !similar_matches.is_empty(),
        );

        TypeResolutionReport {
            failed_type: request.type_name,
            expected_member: request.member_name,
            expected_signature: request.signature,
            assembly: request.assembly,
            type_found: method_table.is_some(),
            method_table,
            resolved_via,
            actual_members,
            total_members,
            members_available,
            exact_match,
            similar_matches,
            diagnosis,
            diagnosis_text: diagnosis.text().to_string(),
            generic_arguments: generic.map(|g| g.arguments).unwrap_or_default(),
        }
    }
}

/// Any heap-resident instantiation with the same base name and arity
fn find_instantiation(
    catalog: &mut dyn TypeCatalog,
    generic: &GenericName,
) -> Option<(String, TypeLookup)> {
    let heap = catalog.heap_histogram()?;
    let entry = heap.entries.iter().find(|entry| {
        entry.method_table.is_some()
            && parse_generic(&entry.type_name)
                .is_some_and(|g| g.base == generic.base && g.arity == generic.arity)
    })?;
    tracing::debug!(
        "resolving {} through instantiation {}",
        generic.base,
        entry.type_name
    );
    Some((
        entry.type_name.clone(),
        TypeLookup {
            method_table: entry.method_table,
            eeclass: None,
            name: Some(entry.type_name.clone()),
            module: None,
        },
    ))
}

/// Distinct member names containing, or contained in, the requested name
fn similar_members(members: &[MemberInfo], requested: &str) -> Vec<String> {
    let wanted = requested.to_lowercase();
    let mut similar: Vec<String> = Vec::new();
    for member in members {
        if member.name == requested || similar.contains(&member.name) {
            continue;
        }
        let name = member.name.to_lowercase();
        if name.contains(&wanted) || (name.len() >= 3 && wanted.contains(&name)) {
            similar.push(member.name.clone());
        }
    }
    similar
}

/// Cap the member list, keeping exact and similar matches first
fn cap_members(
    members: Vec<MemberInfo>,
    requested: Option<&str>,
    similar: &[String],
    max: usize,
) -> Vec<MemberInfo> {
    if members.len() <= max {
        return members;
    }
    let priority = |m: &MemberInfo| {
        if requested == Some(m.name.as_str()) {
            0
        } else if similar.contains(&m.name) {
            1
        } else {
            2
        }
    };
    let mut ranked = members;
    ranked.sort_by_key(priority);
    ranked.truncate(max);
    ranked
}
