//! The [`Semantics`] policy bundle.
//!
//! A semantics bundle fixes five orthogonal axes that control how a batch is
//! executed: safety (when the server acknowledges), consistency, atomicity,
//! ordering, and persistency. Bundles are built from a [`Template`] and then
//! adjusted with the `with_*` builders; binding one to a batch copies it, so
//! a bound bundle can no longer be changed.

use serde::{Deserialize, Serialize};

/// How strongly the server must acknowledge an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Safety {
    /// Fire and forget: no server reply.
    None,
    /// Reply once the server has received the operation.
    Network,
    /// Reply once the server has durably persisted the operation.
    Storage,
}

/// When updates become visible to other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    Immediate,
    Session,
    Eventual,
}

/// Granularity at which operations apply atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atomicity {
    None,
    Operation,
    Batch,
}

/// How strictly operation order is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ordering {
    Strict,
    SemiRelaxed,
    Relaxed,
}

/// When data must reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistency {
    Immediate,
    Eventual,
}

/// Predefined semantics bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Template {
    /// Network safety, immediate consistency, semi-relaxed ordering.
    Default,
    /// POSIX-like: strict ordering and per-operation atomicity.
    Posix,
    /// Scratch data: no safety, eventual consistency and persistency.
    TemporaryLocal,
}

/// An immutable bundle of execution-policy axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semantics {
    safety: Safety,
    consistency: Consistency,
    atomicity: Atomicity,
    ordering: Ordering,
    persistency: Persistency,
}

impl Semantics {
    /// Build a bundle from a predefined template.
    pub fn from_template(template: Template) -> Self {
        match template {
            Template::Default => Self {
                safety: Safety::Network,
                consistency: Consistency::Immediate,
                atomicity: Atomicity::None,
                ordering: Ordering::SemiRelaxed,
                persistency: Persistency::Immediate,
            },
            Template::Posix => Self {
                safety: Safety::Network,
                consistency: Consistency::Immediate,
                atomicity: Atomicity::Operation,
                ordering: Ordering::Strict,
                persistency: Persistency::Immediate,
            },
            Template::TemporaryLocal => Self {
                safety: Safety::None,
                consistency: Consistency::Eventual,
                atomicity: Atomicity::None,
                ordering: Ordering::Relaxed,
                persistency: Persistency::Eventual,
            },
        }
    }

    pub fn with_safety(mut self, safety: Safety) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_atomicity(mut self, atomicity: Atomicity) -> Self {
        self.atomicity = atomicity;
        self
    }

    pub fn with_ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_persistency(mut self, persistency: Persistency) -> Self {
        self.persistency = persistency;
        self
    }

    pub fn safety(&self) -> Safety {
        self.safety
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    pub fn ordering(&self) -> Ordering {
        self.ordering
    }

    pub fn persistency(&self) -> Persistency {
        self.persistency
    }
}

impl Default for Semantics {
    fn default() -> Self {
        Self::from_template(Template::Default)
    }
}
