//! Fortran-namelist configuration store.
//!
//! A `Namelist` is a typed two-level mapping (section -> key -> value) built
//! by merging an ordered sequence of namelist sources. Later sources win on
//! colliding keys; non-colliding keys from earlier sources survive within
//! the same section.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A scalar or list parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NmlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<NmlValue>),
}

impl NmlValue {
    fn parse_scalar(s: &str) -> NmlValue {
        let t = s.trim();
        let lower = t.to_ascii_lowercase();
        if lower == ".true." || lower == ".t." {
            return NmlValue::Bool(true);
        }
        if lower == ".false." || lower == ".f." {
            return NmlValue::Bool(false);
        }
        if (t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2)
            || (t.starts_with('"') && t.ends_with('"') && t.len() >= 2)
        {
            return NmlValue::Str(t[1..t.len() - 1].to_string());
        }
        if let Ok(i) = t.parse::<i64>() {
            return NmlValue::Int(i);
        }
        if let Ok(f) = t.parse::<f64>() {
            return NmlValue::Float(f);
        }
        // Bare word: treat as an unquoted string, as f90 readers do.
        NmlValue::Str(t.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NmlValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for NmlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NmlValue::Bool(true) => write!(f, ".true."),
            NmlValue::Bool(false) => write!(f, ".false."),
            NmlValue::Int(i) => write!(f, "{}", i),
            NmlValue::Float(x) => {
                // Keep a decimal point so the value re-reads as a real.
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            NmlValue::Str(s) => write!(f, "'{}'", s),
            NmlValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", rendered.join(", "))
            }
        }
    }
}

impl From<bool> for NmlValue {
    fn from(v: bool) -> Self {
        NmlValue::Bool(v)
    }
}
impl From<i64> for NmlValue {
    fn from(v: i64) -> Self {
        NmlValue::Int(v)
    }
}
impl From<f64> for NmlValue {
    fn from(v: f64) -> Self {
        NmlValue::Float(v)
    }
}
impl From<&str> for NmlValue {
    fn from(v: &str) -> Self {
        NmlValue::Str(v.to_string())
    }
}

pub type Section = BTreeMap<String, NmlValue>;

/// Hierarchical runtime parameter set consumed by the simulation executable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namelist {
    sections: BTreeMap<String, Section>,
}

impl Namelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and merge `sources` in order. A later source's section overwrites
    /// colliding keys from earlier sources but leaves non-colliding keys
    /// intact. A malformed source is a fatal configuration error.
    pub fn build<P: AsRef<Path>>(sources: &[P]) -> Result<Namelist> {
        let mut merged = Namelist::new();
        for src in sources {
            let path = src.as_ref();
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading namelist source {}", path.display()))?;
            let nml = Namelist::parse(&text)
                .with_context(|| format!("malformed namelist source {}", path.display()))?;
            merged.update(&nml);
        }
        Ok(merged)
    }

    /// Parse namelist text: `&section` opens a section, `/` closes it,
    /// `key = value` lines in between. `!` starts a comment. A value line
    /// ending in `,` continues on the next line.
    pub fn parse(text: &str) -> Result<Namelist> {
        let mut nml = Namelist::new();
        let mut section: Option<String> = None;
        let mut pending: Option<(String, String)> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('&') {
                if section.is_some() {
                    bail!("line {}: nested section '&{}'", lineno + 1, name);
                }
                section = Some(name.trim().to_string());
                continue;
            }
            if line == "/" {
                let sec = section
                    .take()
                    .with_context(|| format!("line {}: '/' outside a section", lineno + 1))?;
                if let Some((key, buf)) = pending.take() {
                    nml.set(&sec, &key, parse_value(&buf));
                }
                continue;
            }
            let sec = section
                .clone()
                .with_context(|| format!("line {}: content outside a section", lineno + 1))?;

            if let Some(eq) = line.find('=') {
                if let Some((key, buf)) = pending.take() {
                    nml.set(&sec, &key, parse_value(&buf));
                }
                let key = line[..eq].trim().to_string();
                if key.is_empty() {
                    bail!("line {}: missing parameter name", lineno + 1);
                }
                let value = line[eq + 1..].trim().to_string();
                if value.ends_with(',') {
                    pending = Some((key, value));
                } else {
                    nml.set(&sec, &key, parse_value(&value));
                }
            } else if let Some((key, mut buf)) = pending.take() {
                // Continuation of a list value.
                buf.push(' ');
                buf.push_str(&line);
                if line.ends_with(',') {
                    pending = Some((key, buf));
                } else {
                    nml.set(&sec, &key, parse_value(&buf));
                }
            } else {
                bail!("line {}: expected 'key = value', got {:?}", lineno + 1, line);
            }
        }
        if let Some(sec) = section {
            bail!("unterminated section '&{}'", sec);
        }
        Ok(nml)
    }

    /// Bulk update: for each section in `patch`, create it if absent, then
    /// overwrite each given key. Keys not mentioned in `patch` are untouched.
    pub fn update(&mut self, patch: &Namelist) {
        for (sec, keys) in &patch.sections {
            let target = self.sections.entry(sec.clone()).or_default();
            for (key, value) in keys {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// Direct overwrite of one key, creating the section if absent.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<NmlValue>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Replace a whole section.
    pub fn set_section(&mut self, section: &str, keys: Section) {
        self.sections.insert(section.to_string(), keys);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&NmlValue> {
        self.sections.get(section).and_then(|s| s.get(key))
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn sections(&self) -> impl Iterator<Item = (&String, &Section)> {
        self.sections.iter()
    }

    /// Serialize to the executable's native namelist format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (sec, keys) in &self.sections {
            out.push_str(&format!("&{}\n", sec));
            for (key, value) in keys {
                out.push_str(&format!("    {} = {}\n", key, value));
            }
            out.push_str("/\n\n");
        }
        out
    }

    /// Write `input.nml` into `outdir`.
    pub fn write_to(&self, outdir: &Path) -> Result<PathBuf> {
        let path = outdir.join("input.nml");
        std::fs::write(&path, self.render())
            .with_context(|| format!("writing namelist to {}", path.display()))?;
        Ok(path)
    }
}

/// Strip a `!` comment, honoring quoted strings.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '\'') | (None, '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '!') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split a value string on top-level commas, honoring quoted strings.
fn split_items(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut buf = String::new();
    let mut quote: Option<char> = None;
    for c in value.chars() {
        match (quote, c) {
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                buf.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                buf.push(c);
            }
            (None, ',') => {
                items.push(buf.trim().to_string());
                buf.clear();
            }
            _ => buf.push(c),
        }
    }
    if !buf.trim().is_empty() {
        items.push(buf.trim().to_string());
    }
    items
}

fn parse_value(value: &str) -> NmlValue {
    let items = split_items(value);
    match items.len() {
        0 => NmlValue::Str(String::new()),
        1 => NmlValue::parse_scalar(&items[0]),
        _ => NmlValue::List(items.iter().map(|s| NmlValue::parse_scalar(s)).collect()),
    }
}
