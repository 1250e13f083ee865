//! Object paths: the string locators the management service uses to name
//! instances.
//!
//! ```text
//! \\HOST\root\virtualization\v2:Msvm_ComputerSystem.CreationClassName="Msvm_ComputerSystem",Name="4D2A..."
//! └─────┘└────────────────────┘ └──────────────────┘ └────────────────────── keys ──────────────────────┘
//!  server       namespace              class
//! ```
//!
//! Server and namespace are optional (relative paths), a path without keys
//! names a class, and `Class=@` names a singleton instance.

use crate::error::{Result, WmiError};
use std::fmt;
use std::str::FromStr;

/// Value of a key property inside an object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    String(String),
    Integer(i64),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Integer(v) => write!(f, "{v}"),
            KeyValue::String(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
        }
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::String(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Integer(v)
    }
}

/// A parsed object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    server: Option<String>,
    namespace: Option<String>,
    class: String,
    keys: Vec<(String, KeyValue)>,
    singleton: bool,
}

impl ObjectPath {
    /// Relative path naming `class` (no keys yet).
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            server: None,
            namespace: None,
            class: class.into(),
            keys: Vec::new(),
            singleton: false,
        }
    }

    /// Qualify the path with a server and namespace.
    pub fn with_namespace(mut self, server: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self.namespace = Some(namespace.into());
        self
    }

    /// Append a key property.
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.keys.push((name.into(), value.into()));
        self
    }

    /// Mark the path as naming the class's singleton instance.
    pub fn singleton(mut self) -> Self {
        self.keys.clear();
        self.singleton = true;
        self
    }

    /// Parse a path string.
    pub fn parse(input: &str) -> Result<Self> {
        Parser::new(input).parse()
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn keys(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.keys.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up a key by name (case-insensitive, like the service).
    pub fn key(&self, name: &str) -> Option<&KeyValue> {
        self.keys
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    /// True if the path names a class rather than an instance.
    pub fn is_class(&self) -> bool {
        !self.singleton && self.keys.is_empty()
    }

    /// True if both paths name the same instance, ignoring server,
    /// namespace, key order, and the case of class and key names.
    pub fn same_object(&self, other: &ObjectPath) -> bool {
        self.class.eq_ignore_ascii_case(&other.class)
            && self.singleton == other.singleton
            && self.keys.len() == other.keys.len()
            && self
                .keys
                .iter()
                .all(|(name, value)| other.key(name) == Some(value))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(server) = &self.server {
            write!(f, "\\\\{server}\\")?;
        }
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}:")?;
        }
        f.write_str(&self.class)?;
        if self.singleton {
            return f.write_str("=@");
        }
        for (i, (name, value)) in self.keys.iter().enumerate() {
            let sep = if i == 0 { '.' } else { ',' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for ObjectPath {
    type Err = WmiError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

struct Parser<'a> {
    input: &'a str,
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            rest: input.trim(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> WmiError {
        WmiError::MalformedPath {
            path: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(mut self) -> Result<ObjectPath> {
        if self.rest.is_empty() {
            return Err(self.error("empty path"));
        }

        let mut path = ObjectPath::new(String::new());

        if let Some(after) = self
            .rest
            .strip_prefix("\\\\")
            .or_else(|| self.rest.strip_prefix("//"))
        {
            let end = after
                .find(['\\', '/'])
                .ok_or_else(|| self.error("server is not followed by a namespace"))?;
            if end == 0 {
                return Err(self.error("empty server name"));
            }
            path.server = Some(after[..end].to_string());
            self.rest = &after[end + 1..];
            if !self.head().contains(':') {
                return Err(self.error("missing ':' after namespace"));
            }
        }

        if let Some(colon) = self.head().find(':') {
            let namespace = &self.rest[..colon];
            if namespace.is_empty() {
                return Err(self.error("empty namespace"));
            }
            path.namespace = Some(namespace.to_string());
            self.rest = &self.rest[colon + 1..];
        }

        path.class = self.identifier("class name")?;

        if self.rest.is_empty() {
            return Ok(path);
        }
        if self.rest == "=@" {
            path.singleton = true;
            return Ok(path);
        }
        self.rest = self
            .rest
            .strip_prefix('.')
            .ok_or_else(|| self.error(format!("unexpected {:?} after class name", self.rest)))?;

        loop {
            let name = self.identifier("key name")?;
            self.rest = self
                .rest
                .strip_prefix('=')
                .ok_or_else(|| self.error(format!("key {name} has no value")))?;
            let value = self.key_value()?;
            path.keys.push((name, value));

            if self.rest.is_empty() {
                return Ok(path);
            }
            self.rest = self
                .rest
                .strip_prefix(',')
                .ok_or_else(|| self.error(format!("unexpected {:?} after key value", self.rest)))?;
        }
    }

    /// Portion of the remaining input before any quoted key value.
    fn head(&self) -> &'a str {
        match self.rest.find('"') {
            Some(i) => &self.rest[..i],
            None => self.rest,
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return Err(self.error(format!("missing {what}")));
        }
        let ident = self.rest[..end].to_string();
        self.rest = &self.rest[end..];
        Ok(ident)
    }

    fn key_value(&mut self) -> Result<KeyValue> {
        if let Some(quoted) = self.rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => value.push(escaped),
                        None => break,
                    },
                    '"' => {
                        self.rest = &quoted[i + 1..];
                        return Ok(KeyValue::String(value));
                    }
                    _ => value.push(c),
                }
            }
            return Err(self.error("unterminated string value"));
        }

        let end = self.rest.find(',').unwrap_or(self.rest.len());
        let raw = &self.rest[..end];
        let value = raw
            .parse::<i64>()
            .map_err(|_| self.error(format!("invalid key value {raw:?}")))?;
        self.rest = &self.rest[end..];
        Ok(KeyValue::Integer(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM_PATH: &str = r#"\\HV01\root\virtualization\v2:Msvm_ComputerSystem.CreationClassName="Msvm_ComputerSystem",Name="4D2A-11"#;

    #[test]
    fn test_parse_full_path() {
        let input = format!("{SYSTEM_PATH}\"");
        let path = ObjectPath::parse(&input).unwrap();
        assert_eq!(path.server(), Some("HV01"));
        assert_eq!(path.namespace(), Some(r"root\virtualization\v2"));
        assert_eq!(path.class(), "Msvm_ComputerSystem");
        assert_eq!(
            path.key("name"),
            Some(&KeyValue::String("4D2A-11".to_string()))
        );
        assert_eq!(path.keys().count(), 2);
        assert_eq!(path.to_string(), input);
    }

    #[test]
    fn test_parse_relative_and_class_paths() {
        let path = ObjectPath::parse(r#"Msvm_ConcreteJob.InstanceID="job:1""#).unwrap();
        assert_eq!(path.namespace(), None);
        assert_eq!(path.key("InstanceID"), Some(&KeyValue::from("job:1")));

        let class = ObjectPath::parse(r"root\virtualization\v2:Msvm_VirtualSystemSettingData").unwrap();
        assert!(class.is_class());
        assert_eq!(class.namespace(), Some(r"root\virtualization\v2"));
    }

    #[test]
    fn test_parse_singleton_and_integer_keys() {
        let path = ObjectPath::parse("Win32_OperatingSystem=@").unwrap();
        assert!(path.is_singleton());
        assert_eq!(path.to_string(), "Win32_OperatingSystem=@");

        let path = ObjectPath::parse("Win32_Process.Handle=42").unwrap();
        assert_eq!(path.key("Handle"), Some(&KeyValue::Integer(42)));
    }

    #[test]
    fn test_escaped_quotes_round_trip() {
        let path = ObjectPath::new("Msvm_Thing").with_key("Id", r#"a"b\c"#);
        let rendered = path.to_string();
        assert_eq!(rendered, r#"Msvm_Thing.Id="a\"b\\c""#);
        assert_eq!(ObjectPath::parse(&rendered).unwrap(), path);
    }

    #[test]
    fn test_malformed_paths() {
        for input in [
            "",
            "   ",
            r"\\HV01",
            r"\\HV01\root\virtualization\v2",
            r"\\\root:Msvm_X",
            ":Msvm_X",
            "Msvm_X.",
            "Msvm_X.Name",
            r#"Msvm_X.Name="open"#,
            "Msvm_X.Name=abc",
            r#"Msvm_X.Name="a"Extra"#,
            "Msvm X",
        ] {
            assert!(
                matches!(ObjectPath::parse(input), Err(WmiError::MalformedPath { .. })),
                "expected {input:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_same_object_ignores_qualification_and_order() {
        let a = ObjectPath::new("Msvm_ComputerSystem")
            .with_namespace("HV01", r"root\virtualization\v2")
            .with_key("CreationClassName", "Msvm_ComputerSystem")
            .with_key("Name", "X");
        let b = ObjectPath::parse(r#"msvm_computersystem.name="X",CreationClassName="Msvm_ComputerSystem""#)
            .unwrap();
        assert!(a.same_object(&b));

        let c = ObjectPath::new("Msvm_ComputerSystem").with_key("Name", "Y");
        assert!(!a.same_object(&c));
    }
}
