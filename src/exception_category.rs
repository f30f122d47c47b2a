//! Exception categories
//!
//! Exception type names are mapped to a closed set of diagnostic categories
//! through a declarative substring table. The table is ordered most specific
//! first (`FileLoadException` before `LoadException`-like fallbacks,
//! `PlatformNotSupported` before `NotSupported`), and the first hit wins.
//!
//! Each category also carries the object fields worth extracting from an
//! exception of that kind, and for resolution failures a fixed remediation
//! text used by the trimming diagnosis.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionCategory {
    FileNotFound,
    FileLoad,
    TypeLoad,
    MissingMethod,
    MissingField,
    MissingMember,
    InvalidCast,
    NullReference,
    Argument,
    ObjectDisposed,
    InvalidOperation,
    PlatformNotSupported,
    NotSupported,
    OutOfMemory,
    StackOverflow,
    Timeout,
    Aggregate,
    TypeInitialization,
    TargetInvocation,
    Unrecognized,
}

/// Substring → category, most specific first
pub const CATEGORY_TABLE: &[(&str, ExceptionCategory)] = &[
    ("FileNotFoundException", ExceptionCategory::FileNotFound),
    ("DllNotFoundException", ExceptionCategory::FileNotFound),
    ("FileLoadException", ExceptionCategory::FileLoad),
    ("BadImageFormatException", ExceptionCategory::FileLoad),
    ("TypeLoadException", ExceptionCategory::TypeLoad),
    ("EntryPointNotFoundException", ExceptionCategory::MissingMethod),
    ("MissingMethodException", ExceptionCategory::MissingMethod),
    ("MissingFieldException", ExceptionCategory::MissingField),
    ("MissingMemberException", ExceptionCategory::MissingMember),
    ("InvalidCastException", ExceptionCategory::InvalidCast),
    ("NullReferenceException", ExceptionCategory::NullReference),
    ("ArgumentNullException", ExceptionCategory::Argument),
    ("ArgumentOutOfRangeException", ExceptionCategory::Argument),
    ("ArgumentException", ExceptionCategory::Argument),
    ("ObjectDisposedException", ExceptionCategory::ObjectDisposed),
    ("InvalidOperationException", ExceptionCategory::InvalidOperation),
    ("PlatformNotSupportedException", ExceptionCategory::PlatformNotSupported),
    ("NotSupportedException", ExceptionCategory::NotSupported),
    ("InsufficientMemoryException", ExceptionCategory::OutOfMemory),
    ("OutOfMemoryException", ExceptionCategory::OutOfMemory),
    ("StackOverflowException", ExceptionCategory::StackOverflow),
    ("TimeoutException", ExceptionCategory::Timeout),
    ("AggregateException", ExceptionCategory::Aggregate),
    ("TypeInitializationException", ExceptionCategory::TypeInitialization),
    ("TargetInvocationException", ExceptionCategory::TargetInvocation),
];

impl ExceptionCategory {
    /// Classify an exception type name; never fails
    ///
    /// # Example
    /// ```
    /// use crashlens::exception_category::ExceptionCategory;
    ///
    /// assert_eq!(
    ///     ExceptionCategory::classify("System.IO.FileNotFoundException"),
    ///     ExceptionCategory::FileNotFound
    /// );
    /// assert_eq!(
    ///     ExceptionCategory::classify("MyApp.CustomError"),
    ///     ExceptionCategory::Unrecognized
    /// );
    /// ```
    pub fn classify(type_name: &str) -> Self {
        CATEGORY_TABLE
            .iter()
            .find(|(fragment, _)| type_name.contains(fragment))
            .map(|(_, category)| *category)
            .unwrap_or(ExceptionCategory::Unrecognized)
    }

    /// Object fields to pull from an exception of this category
    pub fn extra_fields(self) -> &'static [&'static str] {
        match self {
            ExceptionCategory::FileNotFound | ExceptionCategory::FileLoad => {
                &["_fileName", "_fusionLog"]
            }
            ExceptionCategory::TypeLoad => &["_className", "_assemblyName"],
            ExceptionCategory::MissingMethod
            | ExceptionCategory::MissingField
            | ExceptionCategory::MissingMember => &["ClassName", "MemberName", "Signature"],
            ExceptionCategory::Argument => &["_paramName"],
            ExceptionCategory::ObjectDisposed => &["_objectName"],
            ExceptionCategory::TypeInitialization => &["_typeName"],
            _ => &[],
        }
    }

    /// Failures to find a type, member or assembly at run time
    pub fn is_resolution_failure(self) -> bool {
        matches!(
            self,
            ExceptionCategory::FileNotFound
                | ExceptionCategory::FileLoad
                | ExceptionCategory::TypeLoad
                | ExceptionCategory::MissingMethod
                | ExceptionCategory::MissingField
                | ExceptionCategory::MissingMember
        )
    }

    /// Remediation for a resolution failure in an ahead-of-time compiled
    /// or trimmed deployment
    pub fn remediation(self) -> Option<&'static str> {
        let text = match self {
            ExceptionCategory::FileNotFound | ExceptionCategory::FileLoad => {
                "Assembly could not be loaded. Ensure it is referenced at build time and \
                 not loaded dynamically by path; mark it with <TrimmerRootAssembly> if it \
                 is only reached through reflection."
            }
            ExceptionCategory::TypeLoad => {
                "Type was removed or never compiled. Preserve it with \
                 [DynamicallyAccessedMembers] on the reflection call site or a \
                 <TrimmerRootDescriptor> entry."
            }
            ExceptionCategory::MissingMethod => {
                "Method was trimmed or has no compiled body. Annotate the reflection target \
                 with [DynamicDependency] or [DynamicallyAccessedMembers(PublicMethods)] and \
                 check for generic instantiations created only at run time."
            }
            ExceptionCategory::MissingField => {
                "Field was trimmed. Annotate the accessing type with \
                 [DynamicallyAccessedMembers(PublicFields | NonPublicFields)]."
            }
            ExceptionCategory::MissingMember => {
                "Member was trimmed. Use source-generated serializers or annotate the type \
                 with [DynamicallyAccessedMembers(All)]."
            }
            _ => return None,
        };
        Some(text)
    }
}

impl fmt::Display for ExceptionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCategory::FileNotFound => "file-not-found",
            ExceptionCategory::FileLoad => "file-load",
            ExceptionCategory::TypeLoad => "type-load",
            ExceptionCategory::MissingMethod => "missing-method",
            ExceptionCategory::MissingField => "missing-field",
            ExceptionCategory::MissingMember => "missing-member",
            ExceptionCategory::InvalidCast => "invalid-cast",
            ExceptionCategory::NullReference => "null-reference",
            ExceptionCategory::Argument => "argument",
            ExceptionCategory::ObjectDisposed => "object-disposed",
            ExceptionCategory::InvalidOperation => "invalid-operation",
            ExceptionCategory::PlatformNotSupported => "platform-not-supported",
            ExceptionCategory::NotSupported => "not-supported",
            ExceptionCategory::OutOfMemory => "out-of-memory",
            ExceptionCategory::StackOverflow => "stack-overflow",
            ExceptionCategory::Timeout => "timeout",
            ExceptionCategory::Aggregate => "aggregate",
            ExceptionCategory::TypeInitialization => "type-initialization",
            ExceptionCategory::TargetInvocation => "target-invocation",
            ExceptionCategory::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_entries_precede_general_ones() {
        assert_eq!(
            ExceptionCategory::classify("System.PlatformNotSupportedException"),
            ExceptionCategory::PlatformNotSupported
        );
        assert_eq!(
            ExceptionCategory::classify("System.NotSupportedException"),
            ExceptionCategory::NotSupported
        );
        assert_eq!(
            ExceptionCategory::classify("System.ArgumentNullException"),
            ExceptionCategory::Argument
        );
    }

    #[test]
    fn test_table_has_no_shadowed_entries() {
        // A later fragment containing an earlier one would never be reached
        for (i, (later, _)) in CATEGORY_TABLE.iter().enumerate() {
            for (earlier, _) in &CATEGORY_TABLE[..i] {
                assert!(
                    !later.contains(earlier),
                    "{later} is shadowed by earlier entry {earlier}"
                );
            }
        }
    }

    #[test]
    fn test_unrecognized_extracts_nothing() {
        let category = ExceptionCategory::classify("Contoso.WidgetException");
        assert_eq!(category, ExceptionCategory::Unrecognized);
        assert!(category.extra_fields().is_empty());
        assert!(category.remediation().is_none());
    }

    #[test]
    fn test_resolution_failures_have_remediation() {
        for (_, category) in CATEGORY_TABLE {
            assert_eq!(
                category.is_resolution_failure(),
                category.remediation().is_some(),
                "{category}"
            );
        }
    }

    #[test]
    fn test_file_not_found_fields() {
        assert_eq!(
            ExceptionCategory::FileNotFound.extra_fields(),
            &["_fileName", "_fusionLog"]
        );
    }
}
