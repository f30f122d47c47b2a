//! Ahead-of-time compilation and trimming classifier
//!
//! Decides whether the crashed process was ahead-of-time compiled, and if
//! the crash is a resolution failure, how likely trimming is to blame.
//!
//! The on-demand compiler module is a veto: when it is loaded the process is
//! not ahead-of-time compiled, whatever the frames say. Otherwise frames are
//! scanned against ordered symbol and module patterns, at most one indicator
//! per pattern, and a parallel scan records reflection/dynamic-code usage
//! with a qualitative risk level. Confidence comes from the named
//! [`EvidenceWeights`] table.

use crate::config::{AnalyzerConfig, AotThresholds, EvidenceWeights};
use crate::exception_category::ExceptionCategory;
use crate::model::{FrameField, Module, Thread};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Module name fragments of the on-demand compiler
pub const ON_DEMAND_COMPILER_MODULES: &[&str] = &["clrjit", "mscorjit"];

/// Symbols only ahead-of-time compiled binaries carry, most specific first
pub const AOT_SYMBOL_PATTERNS: &[&str] = &[
    "__managed__Main",
    "__managed__Startup",
    "S_P_CoreLib_",
    "RhpNewFast",
    "RhpNewArray",
    "RhpGcAlloc",
    "RhpThrowEx",
    "RhpReversePInvoke",
    "RhpPInvoke",
    "RhThrowEx",
    "Rhp",
];

/// Module names linked into ahead-of-time compiled binaries
pub const AOT_MODULE_PATTERNS: &[&str] = &[
    "Runtime.WorkstationGC",
    "Runtime.ServerGC",
    "libbootstrapperdll",
    "libbootstrapper",
];

/// Qualitative risk of a reflection or dynamic-code call under trimming
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Reflection/dynamic-code API fragments, most specific first
pub const REFLECTION_PATTERNS: &[(&str, RiskLevel)] = &[
    ("System.Reflection.Emit", RiskLevel::High),
    ("DynamicMethod", RiskLevel::High),
    ("ILGenerator", RiskLevel::High),
    ("Expression.Compile", RiskLevel::High),
    ("MakeGenericType", RiskLevel::High),
    ("MakeGenericMethod", RiskLevel::High),
    ("Assembly.Load", RiskLevel::High),
    ("Activator.CreateInstance", RiskLevel::High),
    ("Type.GetType", RiskLevel::High),
    ("RuntimeMethodInfo.Invoke", RiskLevel::Medium),
    ("MethodBase.Invoke", RiskLevel::Medium),
    ("PropertyInfo.GetValue", RiskLevel::Medium),
    ("GetMethod", RiskLevel::Medium),
    ("GetProperty", RiskLevel::Medium),
    ("GetField", RiskLevel::Medium),
    ("JsonSerializer", RiskLevel::Medium),
    ("GetCustomAttribute", RiskLevel::Low),
    ("Enum.GetValues", RiskLevel::Low),
    ("System.Reflection", RiskLevel::Low),
];

/// Where an indicator was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorSource {
    FrameFunction,
    FrameModule,
    FrameSource,
    ModuleList,
}

impl From<FrameField> for IndicatorSource {
    fn from(field: FrameField) -> Self {
        match field {
            FrameField::Function => IndicatorSource::FrameFunction,
            FrameField::Module => IndicatorSource::FrameModule,
            FrameField::Source => IndicatorSource::FrameSource,
        }
    }
}

/// Position of a frame in the thread set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    pub thread: String,
    pub frame_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AotIndicator {
    pub source: IndicatorSource,
    pub pattern: String,
    pub matched: String,
    pub frame: Option<FrameRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionUsage {
    pub pattern: String,
    pub risk: RiskLevel,
    pub function: String,
    pub frame: FrameRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimmingAnalysis {
    pub category: ExceptionCategory,
    pub likely_trimmed: bool,
    pub confidence: Confidence,
    /// Raw evidence score behind `confidence`
    pub score: u32,
    pub evidence: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AotClassification {
    pub is_aot: bool,
    pub has_on_demand_compiler: bool,
    /// False when no module list was available; the veto could not be checked
    pub module_list_available: bool,
    /// Compiler present, yet at least `min_indicators_with_compiler` indicators
    pub mixed_evidence: bool,
    pub indicators: Vec<AotIndicator>,
    pub reflection_usage: Vec<ReflectionUsage>,
    pub trimming: Option<TrimmingAnalysis>,
}

/// Is any on-demand compiler module loaded?
pub fn has_on_demand_compiler(modules: &[Module]) -> bool {
    modules.iter().any(|module| {
        let name = module.normalized_name();
        let path = module.path.as_deref().unwrap_or("").to_ascii_lowercase();
        ON_DEMAND_COMPILER_MODULES
            .iter()
            .any(|pattern| name.contains(pattern) || path.contains(pattern))
    })
}

pub struct AotClassifier {
    thresholds: AotThresholds,
    weights: EvidenceWeights,
}

impl AotClassifier {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            thresholds: config.aot,
            weights: config.evidence_weights,
        }
    }

    /// Classify the process from its modules and correlated threads
    ///
    /// `exception_type` is the triggering exception; trimming analysis is
    /// only produced for resolution failures.
    pub fn classify(
        &self,
        modules: &[Module],
        threads: &[Thread],
        exception_type: Option<&str>,
    ) -> AotClassification {
        let module_list_available = !modules.is_empty();
        let has_compiler = has_on_demand_compiler(modules);

        let mut indicators = scan_frames(threads);
        indicators.extend(scan_modules(modules));
        let reflection_usage = scan_reflection(threads);

        let count = indicators.len();
        let (is_aot, mixed_evidence) = if has_compiler {
            (false, count >= self.thresholds.min_indicators_with_compiler)
        } else {
            (count >= self.thresholds.min_indicators_without_compiler, false)
        };

        if mixed_evidence {
            tracing::debug!(
                indicators = count,
                "ahead-of-time indicators alongside an on-demand compiler"
            );
        }

        let mut classification = AotClassification {
            is_aot,
            has_on_demand_compiler: has_compiler,
            module_list_available,
            mixed_evidence,
            indicators,
            reflection_usage,
            trimming: None,
        };

        let category = exception_type
            .map(ExceptionCategory::classify)
            .unwrap_or(ExceptionCategory::Unrecognized);
        if category.is_resolution_failure() {
            classification.trimming = Some(self.trimming_analysis(&classification, category));
        }
        classification
    }

    /// Weighted evidence score; each term is capped by the weight table
    pub fn score(&self, classification: &AotClassification) -> u32 {
        let w = &self.weights;
        let compiler_absent =
            classification.module_list_available && !classification.has_on_demand_compiler;
        let indicators = (classification.indicators.len() as u32).min(w.indicator_cap);
        let reflection = (classification.reflection_usage.len() as u32).min(w.reflection_cap);

        let mut score = indicators * w.per_indicator + reflection * w.per_reflection_usage;
        if classification.is_aot {
            score += w.aot_classified;
        }
        if compiler_absent {
            score += w.compiler_absent;
        }
        score
    }

    fn confidence(&self, score: u32) -> Confidence {
        if score >= self.weights.high_threshold {
            Confidence::High
        } else if score >= self.weights.medium_threshold {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    fn trimming_analysis(
        &self,
        classification: &AotClassification,
        category: ExceptionCategory,
    ) -> TrimmingAnalysis {
        let score = self.score(classification);
        let confidence = self.confidence(score);

        let mut evidence = Vec::new();
        if classification.is_aot {
            evidence.push("process classified as ahead-of-time compiled".to_string());
        }
        if classification.module_list_available && !classification.has_on_demand_compiler {
            evidence.push("no on-demand compiler module is loaded".to_string());
        }
        if !classification.indicators.is_empty() {
            let patterns: Vec<&str> = classification
                .indicators
                .iter()
                .map(|i| i.pattern.as_str())
                .collect();
            evidence.push(format!(
                "{} ahead-of-time indicator(s): {}",
                patterns.len(),
                patterns.join(", ")
            ));
        }
        if classification.mixed_evidence {
            evidence.push(
                "ahead-of-time indicators alongside a loaded compiler (precompiled code in a JIT process)"
                    .to_string(),
            );
        }
        for usage in &classification.reflection_usage {
            evidence.push(format!(
                "{:?}-risk reflection in {} (thread {}, frame {})",
                usage.risk, usage.function, usage.frame.thread, usage.frame.frame_index
            ));
        }

        let mut recommendations: Vec<String> = category
            .remediation()
            .map(|text| vec![text.to_string()])
            .unwrap_or_default();
        if classification
            .reflection_usage
            .iter()
            .any(|u| u.risk == RiskLevel::High)
        {
            recommendations.push(
                "Replace dynamic code generation and name-based type loading with \
                 source generators or statically referenced types."
                    .to_string(),
            );
        }
        if classification.is_aot {
            recommendations.push(
                "Rebuild with trim analysis warnings enabled and resolve every \
                 IL2026/IL3050 warning on the failing call path."
                    .to_string(),
            );
        }

        TrimmingAnalysis {
            category,
            likely_trimmed: confidence >= Confidence::Medium,
            confidence,
            score,
            evidence,
            recommendations,
        }
    }
}

fn thread_label(thread: &Thread) -> String {
    thread.id.to_string()
}

/// One indicator per pattern; a value already claimed by a more specific
/// pattern is not counted again
fn scan_frames(threads: &[Thread]) -> Vec<AotIndicator> {
    let mut claimed: HashSet<String> = HashSet::new();
    let mut indicators = Vec::new();

    for pattern in AOT_SYMBOL_PATTERNS {
        let hit = threads.iter().find_map(|thread| {
            thread.call_stack.iter().find_map(|frame| {
                frame
                    .searchable_text()
                    .find(|(_, text)| text.contains(pattern) && !claimed.contains(*text))
                    .map(|(field, text)| AotIndicator {
                        source: field.into(),
                        pattern: pattern.to_string(),
                        matched: text.to_string(),
                        frame: Some(FrameRef {
                            thread: thread_label(thread),
                            frame_index: frame.index,
                        }),
                    })
            })
        });
        if let Some(indicator) = hit {
            claimed.insert(indicator.matched.clone());
            indicators.push(indicator);
        }
    }
    indicators
}

fn scan_modules(modules: &[Module]) -> Vec<AotIndicator> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut indicators = Vec::new();
    for pattern in AOT_MODULE_PATTERNS {
        let hit = modules
            .iter()
            .find(|m| m.name.contains(pattern) && !claimed.contains(m.name.as_str()));
        if let Some(module) = hit {
            claimed.insert(module.name.as_str());
            indicators.push(AotIndicator {
                source: IndicatorSource::ModuleList,
                pattern: pattern.to_string(),
                matched: module.name.clone(),
                frame: None,
            });
        }
    }
    indicators
}

fn scan_reflection(threads: &[Thread]) -> Vec<ReflectionUsage> {
    let mut claimed: HashSet<String> = HashSet::new();
    let mut usages = Vec::new();
    for (pattern, risk) in REFLECTION_PATTERNS {
        let hit = threads.iter().find_map(|thread| {
            thread.call_stack.iter().find_map(|frame| {
                let function = frame.function.as_deref()?;
                (function.contains(pattern) && !claimed.contains(function)).then(|| {
                    ReflectionUsage {
                        pattern: pattern.to_string(),
                        risk: *risk,
                        function: function.to_string(),
                        frame: FrameRef {
                            thread: thread_label(thread),
                            frame_index: frame.index,
                        },
                    }
                })
            })
        });
        if let Some(usage) = hit {
            claimed.insert(usage.function.clone());
            usages.push(usage);
        }
    }
    usages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Frame, ThreadId};

    fn thread_with(functions: &[&str]) -> Thread {
        Thread {
            id: ThreadId::parse("1"),
            state: "stopped".to_string(),
            call_stack: functions
                .iter()
                .enumerate()
                .map(|(index, f)| Frame {
                    index,
                    function: Some(f.to_string()),
                    module: Some("myapp".to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn module(name: &str) -> Module {
        Module {
            name: name.to_string(),
            path: Some(format!("/usr/lib/{name}")),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_indicator_without_compiler_is_aot() {
        let threads = vec![thread_with(&["main", "S_P_CoreLib_System_Environment__FailFast"])];
        let modules = vec![module("myapp"), module("libc.so.6")];
        let result = AotClassifier::new(&AnalyzerConfig::default()).classify(&modules, &threads, None);
        assert!(result.is_aot);
        assert!(!result.has_on_demand_compiler);
        assert_eq!(result.indicators.len(), 1);
        assert_eq!(result.indicators[0].source, IndicatorSource::FrameFunction);
        assert_eq!(result.indicators[0].frame.as_ref().unwrap().frame_index, 1);
    }

    #[test]
    fn test_compiler_vetoes_any_number_of_indicators() {
        let threads = vec![thread_with(&[
            "S_P_CoreLib_X",
            "RhpNewFast",
            "RhpThrowEx",
            "__managed__Main",
        ])];
        let modules = vec![module("myapp"), module("libclrjit.so")];
        let result = AotClassifier::new(&AnalyzerConfig::default()).classify(&modules, &threads, None);
        assert!(!result.is_aot);
        assert!(result.has_on_demand_compiler);
        assert_eq!(result.indicators.len(), 4);
        assert!(result.mixed_evidence);
    }

    #[test]
    fn test_one_indicator_per_pattern() {
        let threads = vec![
            thread_with(&["RhpNewFast", "RhpNewFast", "RhpNewFast"]),
            thread_with(&["RhpNewFast"]),
        ];
        let result =
            AotClassifier::new(&AnalyzerConfig::default()).classify(&[module("app")], &threads, None);
        // RhpNewFast once; the generic Rhp pattern finds nothing unclaimed
        assert_eq!(result.indicators.len(), 1);
        assert_eq!(result.indicators[0].pattern, "RhpNewFast");
    }

    #[test]
    fn test_no_indicators_not_aot() {
        let threads = vec![thread_with(&["main", "MyApp.Program.Main()"])];
        let result =
            AotClassifier::new(&AnalyzerConfig::default()).classify(&[module("app")], &threads, None);
        assert!(!result.is_aot);
        assert!(result.trimming.is_none());
    }

    #[test]
    fn test_reflection_usage_is_informational() {
        let threads = vec![thread_with(&[
            "System.RuntimeType.GetMethod(System.String)",
            "System.Reflection.Emit.DynamicMethod.CreateDelegate()",
        ])];
        let modules = vec![module("libclrjit.so")];
        let result = AotClassifier::new(&AnalyzerConfig::default()).classify(&modules, &threads, None);
        assert!(!result.is_aot);
        assert_eq!(result.reflection_usage.len(), 2);
        assert_eq!(result.reflection_usage[0].risk, RiskLevel::High);
        assert_eq!(result.reflection_usage[1].risk, RiskLevel::Medium);
    }

    #[test]
    fn test_trimming_analysis_for_resolution_failure() {
        let threads = vec![thread_with(&[
            "RhpThrowEx",
            "S_P_CoreLib_System_Activator__CreateInstance",
            "System.Activator.CreateInstance(System.Type)",
        ])];
        let modules = vec![module("myapp")];
        let result = AotClassifier::new(&AnalyzerConfig::default()).classify(
            &modules,
            &threads,
            Some("System.MissingMethodException"),
        );
        let trimming = result.trimming.unwrap();
        assert_eq!(trimming.category, ExceptionCategory::MissingMethod);
        // 3 (aot) + 2 (no compiler) + 2 indicators + 1 reflection
        assert_eq!(trimming.score, 8);
        assert_eq!(trimming.confidence, Confidence::High);
        assert!(trimming.likely_trimmed);
        assert!(trimming.recommendations.len() >= 2);
    }

    #[test]
    fn test_missing_module_list_does_not_count_as_absence() {
        let threads = vec![thread_with(&["main"])];
        let classifier = AotClassifier::new(&AnalyzerConfig::default());
        let result = classifier.classify(&[], &threads, Some("System.TypeLoadException"));
        assert!(!result.module_list_available);
        let trimming = result.trimming.unwrap();
        assert_eq!(trimming.score, 0);
        assert_eq!(trimming.confidence, Confidence::Low);
        assert!(!trimming.likely_trimmed);
    }

    #[test]
    fn test_thresholds_are_overridable() {
        let config = AnalyzerConfig {
            aot: AotThresholds {
                min_indicators_without_compiler: 2,
                min_indicators_with_compiler: 5,
            },
            ..Default::default()
        };
        let threads = vec![thread_with(&["RhpNewFast"])];
        let result = AotClassifier::new(&config).classify(&[module("app")], &threads, None);
        assert!(!result.is_aot);
    }
}
