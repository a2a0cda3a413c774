//! Typed, dotted-key machine descriptor (the `.vmx` format)
//!
//! A descriptor is a flat list of `key = "value"` lines. Keys are stored as
//! opaque dotted strings (`ide1:0.present`); [`Vmx::section`] offers nested
//! lookup over the dotted storage without building a tree.
//!
//! String values use VMware's `|XX` hex escapes for `|`, `"` and control
//! characters, so any string survives a write/read cycle on one line.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::ops::Index;
use std::path::{Path, PathBuf};

/// File extension of descriptor files
pub const EXTENSION: &str = "vmx";

/// A typed scalar value in a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    /// Integers are digit-only literals; negative numbers are strings.
    Int(u64),
    Str(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Renders the value the way it is written to disk
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "\"TRUE\""),
            Value::Bool(false) => write!(f, "\"FALSE\""),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "\"{}\"", escape(s)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(u64::from(i))
    }
}

/// Negative numbers have no digit-only literal and are kept as strings.
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        u64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(i.to_string()))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Value::Str(p.to_string_lossy().into_owned())
    }
}

/// Classify a raw (already unquoted) value by its literal form.
pub fn parse_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = raw.parse::<u64>() {
            return Value::Int(i);
        }
    }
    Value::Str(raw.to_string())
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '|' || c == '"' || c.is_ascii_control() {
            out.push_str(&format!("|{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Decode `|XX` escapes; a `|` not followed by two hex digits is literal.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('|') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let decoded = tail
            .get(..2)
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .filter(u8::is_ascii);
        match decoded {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &tail[2..];
            }
            None => {
                out.push('|');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Strip one pair of matching quotes and decode escapes inside them.
fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return unescape(&raw[1..raw.len() - 1]);
        }
    }
    raw.to_string()
}

/// A machine descriptor bound to its path on disk
#[derive(Debug, Clone)]
pub struct Vmx {
    pathname: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl Vmx {
    /// Bind a descriptor to `{directory}/{instance_id}.vmx` without touching disk.
    pub fn new(directory: impl AsRef<Path>, instance_id: &str) -> Self {
        Self {
            pathname: descriptor_path(directory.as_ref(), instance_id),
            entries: BTreeMap::new(),
        }
    }

    /// Bind and read the descriptor if it already exists.
    pub fn open(directory: impl AsRef<Path>, instance_id: &str) -> Result<Self> {
        let mut vmx = Self::new(directory, instance_id);
        if vmx.pathname.exists() {
            vmx.read()?;
        }
        Ok(vmx)
    }

    pub fn pathname(&self) -> &Path {
        &self.pathname
    }

    /// Replace the in-memory entries with the contents of the file.
    pub fn read(&mut self) -> Result<()> {
        let text = fs::read_to_string(&self.pathname)?;
        self.entries = parse(&self.pathname, &text)?;
        Ok(())
    }

    /// Serialize every entry back to the file.
    pub fn write(&self) -> Result<()> {
        fs::write(&self.pathname, self.render())?;
        tracing::debug!(path = %self.pathname.display(), entries = self.entries.len(), "wrote descriptor");
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Nested view over every key below `prefix.`
    pub fn section<'a>(&'a self, prefix: &str) -> Section<'a> {
        Section {
            entries: &self.entries,
            prefix: format!("{}.", prefix),
        }
    }
}

impl Index<&str> for Vmx {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        match self.entries.get(key) {
            Some(value) => value,
            None => panic!("no descriptor key {:?}", key),
        }
    }
}

/// Read-only view of the keys sharing a dotted prefix
#[derive(Debug, Clone)]
pub struct Section<'a> {
    entries: &'a BTreeMap<String, Value>,
    prefix: String,
}

impl<'a> Section<'a> {
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.entries.get(&format!("{}{}", self.prefix, key))
    }

    pub fn section(&self, prefix: &str) -> Section<'a> {
        Section {
            entries: self.entries,
            prefix: format!("{}{}.", self.prefix, prefix),
        }
    }

    /// Keys below this section with the prefix stripped
    pub fn keys(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.entries
            .range(self.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&self.prefix))
            .map(|(k, _)| &k[self.prefix.len()..])
    }
}

impl Index<&str> for Section<'_> {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        match self.get(key) {
            Some(value) => value,
            None => panic!("no descriptor key {:?}{:?}", self.prefix, key),
        }
    }
}

/// `{directory}/{instance_id}.vmx`
pub fn descriptor_path(directory: &Path, instance_id: &str) -> PathBuf {
    directory.join(format!("{}.{}", instance_id, EXTENSION))
}

fn parse(path: &Path, text: &str) -> Result<BTreeMap<String, Value>> {
    let mut entries = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, raw) = line.split_once('=').ok_or_else(|| Error::MalformedDescriptor {
            path: path.to_path_buf(),
            line: index + 1,
            content: line.to_string(),
        })?;
        let raw = unquote(raw.trim());
        entries.insert(key.trim().to_string(), parse_value(&raw));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pathname() {
        let vmx = Vmx::new("/does_not_exist", "foo");
        assert_eq!(vmx.pathname(), Path::new("/does_not_exist/foo.vmx"));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("TRUE"), Value::Bool(true));
        assert_eq!(parse_value("True"), Value::Bool(true));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("FALSE"), Value::Bool(false));
        assert_eq!(parse_value("False"), Value::Bool(false));
        assert_eq!(parse_value("false"), Value::Bool(false));
        assert_eq!(parse_value("foo"), Value::Str("foo".into()));
        assert_eq!(parse_value("10"), Value::Int(10));
    }

    #[test]
    fn test_parse_value_edge_literals() {
        assert_eq!(parse_value(""), Value::Str(String::new()));
        assert_eq!(parse_value("-1"), Value::Str("-1".into()));
        assert_eq!(parse_value("10G"), Value::Str("10G".into()));
        assert_eq!(parse_value("18446744073709551615"), Value::Int(u64::MAX));
        // Overflows u64, kept verbatim
        assert_eq!(
            parse_value("99999999999999999999"),
            Value::Str("99999999999999999999".into())
        );
    }

    #[test]
    fn test_read() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("foo.vmx"),
            "#foo\nfoo.bar = baz\nquux = TRUE\nzap = 10\n",
        )
        .unwrap();

        let vmx = Vmx::open(temp.path(), "foo").unwrap();
        assert_eq!(vmx.section("foo")["bar"], Value::Str("baz".into()));
        assert_eq!(vmx["quux"], Value::Bool(true));
        assert_eq!(vmx["zap"], Value::Int(10));
        assert_eq!(vmx.len(), 3);
    }

    #[test]
    fn test_read_strips_quotes_and_blank_lines() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("vm.vmx"),
            "\n  displayName = \"my vm\"  \n\nmemsize = \"512\"\n",
        )
        .unwrap();

        let vmx = Vmx::open(temp.path(), "vm").unwrap();
        assert_eq!(vmx["displayName"].as_str(), Some("my vm"));
        assert_eq!(vmx["memsize"].as_int(), Some(512));
    }

    #[test]
    fn test_missing_and_empty_files_are_empty() {
        let temp = TempDir::new().unwrap();
        assert!(Vmx::open(temp.path(), "absent").unwrap().is_empty());

        fs::write(temp.path().join("empty.vmx"), "").unwrap();
        assert!(Vmx::open(temp.path(), "empty").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("dup.vmx"), "a = 1\na = two\n").unwrap();

        let vmx = Vmx::open(temp.path(), "dup").unwrap();
        assert_eq!(vmx["a"], Value::Str("two".into()));
        assert_eq!(vmx.len(), 1);
    }

    #[test]
    fn test_malformed_line() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bad.vmx"), "ok = 1\nnot a pair\n").unwrap();

        let err = Vmx::open(temp.path(), "bad").unwrap_err();
        match err {
            Error::MalformedDescriptor { line, content, .. } => {
                assert_eq!(line, 2);
                assert_eq!(content, "not a pair");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_write_then_read_preserves_types() {
        let temp = TempDir::new().unwrap();
        let mut vmx = Vmx::new(temp.path(), "rt");
        vmx.set("ide1:0.present", true);
        vmx.set("scsi0.present", false);
        vmx.set("memsize", 512u64);
        vmx.set("displayName", "round trip");
        vmx.set("ide1:0.fileName", temp.path().join("seed.iso").as_path());
        vmx.write().unwrap();

        let reread = Vmx::open(temp.path(), "rt").unwrap();
        assert_eq!(
            reread.iter().collect::<Vec<_>>(),
            vmx.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_integer_boundaries_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut vmx = Vmx::new(temp.path(), "ints");
        vmx.set("zero", 0u64);
        vmx.set("offset", -1i64);
        vmx.set("big", i64::MAX);
        vmx.set("max", u64::MAX);
        vmx.write().unwrap();

        assert_eq!(vmx["offset"], Value::Str("-1".into()));
        assert_eq!(vmx["big"], Value::Int(i64::MAX as u64));

        let reread = Vmx::open(temp.path(), "ints").unwrap();
        assert_eq!(reread["zero"], Value::Int(0));
        assert_eq!(reread["offset"], Value::Str("-1".into()));
        assert_eq!(reread["big"], Value::Int(9_223_372_036_854_775_807));
        assert_eq!(reread["max"], Value::Int(u64::MAX));
    }

    #[test]
    fn test_multiline_string_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut vmx = Vmx::new(temp.path(), "s");
        vmx.set("annotation", "line1\nline2\r\tend");
        vmx.set("after", true);
        vmx.write().unwrap();

        let text = fs::read_to_string(vmx.pathname()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("annotation = \"line1|0Aline2|0D|09end\""));

        let reread = Vmx::open(temp.path(), "s").unwrap();
        assert_eq!(reread["annotation"].as_str(), Some("line1\nline2\r\tend"));
        assert_eq!(reread["after"], Value::Bool(true));
    }

    #[test]
    fn test_quotes_and_pipes_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut vmx = Vmx::new(temp.path(), "q");
        vmx.set("trailing", "say \"hi\"");
        vmx.set("leading", "'single");
        vmx.set("pipe", "a|22b|c");
        vmx.set("windows", r"C:\VMs\web\web.vmdk");
        vmx.write().unwrap();

        let reread = Vmx::open(temp.path(), "q").unwrap();
        assert_eq!(reread["trailing"].as_str(), Some("say \"hi\""));
        assert_eq!(reread["leading"].as_str(), Some("'single"));
        assert_eq!(reread["pipe"].as_str(), Some("a|22b|c"));
        assert_eq!(reread["windows"].as_str(), Some(r"C:\VMs\web\web.vmdk"));
    }

    #[test]
    fn test_read_decodes_escapes_and_keeps_stray_pipes() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("e.vmx"),
            "a = \"x|22y\"\nb = \"|zz|\"\nc = 'it''s'\nd = \"unbalanced\n",
        )
        .unwrap();

        let vmx = Vmx::open(temp.path(), "e").unwrap();
        assert_eq!(vmx["a"].as_str(), Some("x\"y"));
        assert_eq!(vmx["b"].as_str(), Some("|zz|"));
        assert_eq!(vmx["c"].as_str(), Some("it''s"));
        assert_eq!(vmx["d"].as_str(), Some("\"unbalanced"));
    }

    #[test]
    fn test_render_format() {
        let mut vmx = Vmx::new("/tmp", "x");
        vmx.set("b", true);
        vmx.set("a", 4u64);
        vmx.set("c", "s");
        assert_eq!(vmx.render(), "a = 4\nb = \"TRUE\"\nc = \"s\"\n");
    }

    #[test]
    fn test_mutation_visible_without_reparse() {
        let temp = TempDir::new().unwrap();
        let mut vmx = Vmx::new(temp.path(), "m");
        vmx.set("guestOS", "other");
        vmx.write().unwrap();

        vmx.set("guestOS", "ubuntu-64");
        vmx.remove("missing");
        vmx.write().unwrap();

        let text = fs::read_to_string(vmx.pathname()).unwrap();
        assert_eq!(text, "guestOS = \"ubuntu-64\"\n");
    }

    #[test]
    fn test_nested_sections() {
        let mut vmx = Vmx::new("/tmp", "n");
        vmx.set("ethernet0.present", true);
        vmx.set("ethernet0.connectionType", "nat");
        vmx.set("ethernet1.present", false);
        vmx.set("a.b.c", 1u32);

        let eth0 = vmx.section("ethernet0");
        let mut keys: Vec<_> = eth0.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["connectionType", "present"]);
        assert_eq!(vmx.section("a").section("b")["c"], Value::Int(1));
        assert!(vmx.section("ethernet2").get("present").is_none());
    }
}
