//! Builder for virtual machine creation requests.

use crate::error::{Error, Result};
use std::fmt;

/// Virtual hardware generation of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Generation {
    /// BIOS firmware, emulated devices
    One,
    /// UEFI firmware, synthetic devices only
    #[default]
    Two,
}

impl Generation {
    /// `VirtualSystemSubType` marker for this generation.
    pub fn sub_type(&self) -> &'static str {
        match self {
            Generation::One => "Microsoft:Hyper-V:SubType:1",
            Generation::Two => "Microsoft:Hyper-V:SubType:2",
        }
    }

    pub fn from_sub_type(sub_type: &str) -> Option<Self> {
        match sub_type {
            "Microsoft:Hyper-V:SubType:1" => Some(Generation::One),
            "Microsoft:Hyper-V:SubType:2" => Some(Generation::Two),
            _ => None,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::One => write!(f, "1"),
            Generation::Two => write!(f, "2"),
        }
    }
}

/// Everything [`Manager::create_vm`](crate::Manager::create_vm) needs.
///
/// # Example
///
/// ```
/// use halyard_core::{CreateVmRequest, Generation};
///
/// let request = CreateVmRequest::new("build-agent")
///     .memory_mb(4096)
///     .cpus(4)
///     .note("owner: ci")
///     .note("expires: never")
///     .generation(Generation::One);
///
/// assert!(request.validate().is_ok());
/// assert_eq!(request.joined_notes().as_deref(), Some("owner: ci\nexpires: never"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVmRequest {
    pub name: String,
    /// Startup memory in megabytes.
    /// Default: 1024
    pub memory_mb: u64,
    /// Virtual processor count.
    /// Default: 1
    pub cpus: u32,
    /// Hide processor features newer than the baseline, for migration
    /// between hosts with different processors.
    pub limit_cpu_features: bool,
    pub notes: Vec<String>,
    pub generation: Generation,
}

impl CreateVmRequest {
    /// Start a request with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_mb: 1024,
            cpus: 1,
            limit_cpu_features: false,
            notes: Vec::new(),
            generation: Generation::default(),
        }
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn cpus(mut self, count: u32) -> Self {
        self.cpus = count;
        self
    }

    pub fn limit_cpu_features(mut self, limit: bool) -> Self {
        self.limit_cpu_features = limit;
        self
    }

    /// Append one line of notes.
    pub fn note(mut self, line: impl Into<String>) -> Self {
        self.notes.push(line.into());
        self
    }

    /// Replace the notes.
    pub fn notes<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notes = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    /// Check the request before any remote call is made.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRequest("name is required".into()));
        }
        if self.memory_mb == 0 {
            return Err(Error::InvalidRequest("memory_mb must be > 0".into()));
        }
        if self.cpus == 0 {
            return Err(Error::InvalidRequest("cpus must be > 0".into()));
        }
        Ok(())
    }

    /// Notes as the single block the service stores.
    ///
    /// The settings data only honors the first element of its `Notes`
    /// array, so every line is joined with `\n` into one element.
    pub fn joined_notes(&self) -> Option<String> {
        if self.notes.is_empty() {
            return None;
        }
        Some(self.notes.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request = CreateVmRequest::new("test");
        assert_eq!(request.memory_mb, 1024);
        assert_eq!(request.cpus, 1);
        assert!(!request.limit_cpu_features);
        assert_eq!(request.generation, Generation::Two);
        assert!(request.joined_notes().is_none());
    }

    #[test]
    fn test_validation() {
        assert!(CreateVmRequest::new(" ").validate().is_err());
        assert!(CreateVmRequest::new("a").memory_mb(0).validate().is_err());
        assert!(CreateVmRequest::new("a").cpus(0).validate().is_err());
        assert!(CreateVmRequest::new("a").validate().is_ok());
    }

    #[test]
    fn test_notes_join_into_one_block() {
        let request = CreateVmRequest::new("a").notes(["one"]);
        assert_eq!(request.joined_notes().as_deref(), Some("one"));

        let lines = ["first", "second", "", "fourth"];
        let request = CreateVmRequest::new("a").notes(lines);
        let joined = request.joined_notes().unwrap();
        assert_eq!(joined, "first\nsecond\n\nfourth");
        assert_eq!(joined.split('\n').collect::<Vec<_>>(), lines);
    }

    #[test]
    fn test_generation_sub_type() {
        for generation in [Generation::One, Generation::Two] {
            assert_eq!(Generation::from_sub_type(generation.sub_type()), Some(generation));
        }
        assert_eq!(Generation::from_sub_type("Microsoft:Hyper-V:SubType:3"), None);
    }
}
