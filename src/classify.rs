//! Use-site policy: which annotation a protocol occurrence receives.

use crate::registry::ProtocolRegistry;
use std::collections::BTreeSet;
use std::fmt;

/// Annotation chosen for one use site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// Leave the site alone
    Unchanged,
    /// `some P`
    Opaque,
    /// `any P`
    Existential,
}

impl Annotation {
    /// Text inserted before the identifier.
    pub fn prefix(self) -> &'static str {
        match self {
            Annotation::Unchanged => "",
            Annotation::Opaque => "some ",
            Annotation::Existential => "any ",
        }
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end())
    }
}

/// Capability answering whether a name is a concrete runtime class.
pub trait ClassLookup {
    fn is_class(&self, name: &str) -> bool;
}

/// Class lookup backed by a fixed set of names.
#[derive(Debug, Clone, Default)]
pub struct KnownClasses {
    names: BTreeSet<String>,
}

impl KnownClasses {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ClassLookup for KnownClasses {
    fn is_class(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// The some/any decision function.
pub struct SitePolicy<C = KnownClasses> {
    classes: C,
}

impl<C: ClassLookup> SitePolicy<C> {
    pub fn new(classes: C) -> Self {
        Self { classes }
    }

    pub fn is_class(&self, name: &str) -> bool {
        self.classes.is_class(name)
    }

    /// Decide the annotation for `identifier` in syntactic `context` whose
    /// inferred type text is `type_text`.
    ///
    /// Pure: the same inputs always produce the same answer.
    pub fn decide(
        &self,
        identifier: &str,
        context: &str,
        type_text: &str,
        registry: &ProtocolRegistry,
    ) -> Annotation {
        // Concrete classes never take an annotation, and a one-letter name is
        // almost always a generic parameter.
        if self.classes.is_class(identifier) || identifier.chars().count() == 1 {
            return Annotation::Unchanged;
        }

        let opaque = context.ends_with("parameter")
            && !is_nested(identifier, type_text)
            && !registry.is_system(identifier)
            && !identifier.starts_with("Any");

        if opaque {
            Annotation::Opaque
        } else {
            Annotation::Existential
        }
    }
}

impl Default for SitePolicy<KnownClasses> {
    fn default() -> Self {
        Self::new(KnownClasses::default())
    }
}

/// Whether the identifier sits inside a container, optional or generic
/// argument, or the type is a closure.
fn is_nested(identifier: &str, type_text: &str) -> bool {
    if type_text.contains(") ->") || type_text.contains(") throws ->") {
        return true;
    }

    type_text
        .match_indices(identifier)
        .filter(|(start, _)| {
            type_text[..*start]
                .chars()
                .next_back()
                .map_or(true, |c| !is_ident_char(c))
        })
        .any(|(start, matched)| {
            matches!(
                type_text[start + matched.len()..].chars().next(),
                Some(']' | '>' | '?')
            )
        })
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProtocolOrigin;

    const PARAM: &str = "source.lang.swift.decl.var.parameter";
    const LOCAL: &str = "source.lang.swift.decl.var.local";

    fn registry() -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::with_system_seeds();
        registry.insert("Worker", ProtocolOrigin::File("Worker.swift".into()));
        registry.insert("AnyWorker", ProtocolOrigin::File("Worker.swift".into()));
        registry.insert("Cancellable", ProtocolOrigin::System("$s7Combine11CancellableP".into()));
        registry
    }

    #[test]
    fn test_parameter_user_protocol_is_opaque() {
        let policy = SitePolicy::default();
        assert_eq!(
            policy.decide("Worker", PARAM, "Worker", &registry()),
            Annotation::Opaque
        );
    }

    #[test]
    fn test_non_parameter_is_existential() {
        let policy = SitePolicy::default();
        assert_eq!(
            policy.decide("Worker", LOCAL, "Worker", &registry()),
            Annotation::Existential
        );
    }

    #[test]
    fn test_nested_positions_are_existential() {
        let policy = SitePolicy::default();
        let registry = registry();
        for type_text in [
            "[Worker]",
            "[String: Worker]",
            "Array<Worker>",
            "Worker?",
            "(Worker) -> Void",
            "(Int) throws -> Worker",
        ] {
            assert_eq!(
                policy.decide("Worker", PARAM, type_text, &registry),
                Annotation::Existential,
                "{type_text}"
            );
        }
    }

    #[test]
    fn test_longer_identifier_does_not_count_as_nested() {
        assert!(!is_nested("Worker", "CoWorker?"));
        assert!(!is_nested("Worker", "Workers]"));
        assert!(is_nested("Worker", "Module.Worker>"));
    }

    #[test]
    fn test_system_protocols_are_existential() {
        let policy = SitePolicy::default();
        let registry = registry();
        assert_eq!(policy.decide("Error", PARAM, "Error", &registry), Annotation::Existential);
        assert_eq!(
            policy.decide("Cancellable", PARAM, "Cancellable", &registry),
            Annotation::Existential
        );
        assert_eq!(
            policy.decide("NSCopying", PARAM, "NSCopying", &registry),
            Annotation::Existential
        );
    }

    #[test]
    fn test_type_erased_wrapper_prefix_is_existential() {
        let policy = SitePolicy::default();
        assert_eq!(
            policy.decide("AnyWorker", PARAM, "AnyWorker", &registry()),
            Annotation::Existential
        );
    }

    #[test]
    fn test_classes_and_generic_params_are_left_alone() {
        let policy = SitePolicy::new(KnownClasses::new(["Worker"]));
        assert_eq!(
            policy.decide("Worker", PARAM, "Worker", &registry()),
            Annotation::Unchanged
        );
        assert_eq!(policy.decide("T", PARAM, "T", &registry()), Annotation::Unchanged);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let policy = SitePolicy::default();
        let registry = registry();
        let first = policy.decide("Worker", PARAM, "Worker", &registry);
        for _ in 0..10 {
            assert_eq!(policy.decide("Worker", PARAM, "Worker", &registry), first);
        }
    }

    #[test]
    fn test_annotation_display() {
        assert_eq!(Annotation::Opaque.to_string(), "some");
        assert_eq!(Annotation::Existential.prefix(), "any ");
        assert_eq!(Annotation::Unchanged.to_string(), "");
    }
}
