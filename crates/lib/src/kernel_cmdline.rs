//! Kernel command line parsing and editing.
//!
//! A [`Cmdline`] is an ordered list of [`Parameter`]s. One key may carry
//! several values (`console=tty0 console=ttyS0`); they are rendered
//! together at the position the key first appeared. Keys compare with
//! dashes and underscores treated as equivalent, as the kernel does.

use std::collections::HashSet;
use std::fmt::Display;

/// Whether two keys name the same parameter.
fn keys_match(a: &str, b: &str) -> bool {
    let dedashed = |c: char| if c == '-' { '_' } else { c };
    // Not zip(): "foo" would match "foobar".
    a.chars().map(dedashed).eq(b.chars().map(dedashed))
}

fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
}

/// Split a command line on unquoted whitespace.
fn split(input: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;
    input
        .split(move |c: char| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            !in_quotes && c.is_ascii_whitespace()
        })
        .filter(|s| !s.is_empty())
}

/// Split one `key[=value]` token. A switch has an empty value.
fn split_token(token: &str) -> (&str, &str) {
    match token.split_once('=') {
        None => (token, ""),
        // *Only* the first and last double quotes are stripped
        Some((key, value)) => {
            let value = value
                .strip_prefix('"')
                .unwrap_or(value)
                .strip_suffix('"')
                .unwrap_or(value);
            (key, value)
        }
    }
}

/// A kernel parameter with every value it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    key: String,
    values: Vec<String>,
}

impl Parameter {
    fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_owned(),
            values: vec![value.to_owned()],
        }
    }

    /// The key as first written.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// All values in order; a switch has one empty value.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// The first value.
    pub fn first(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    fn tokens(&self) -> impl Iterator<Item = String> + '_ {
        self.values.iter().map(|v| {
            if v.is_empty() {
                self.key.clone()
            } else if v.contains(|c: char| c.is_ascii_whitespace()) {
                format!("{}=\"{v}\"", self.key)
            } else {
                format!("{}={v}", self.key)
            }
        })
    }
}

/// Options for [`Cmdline::append_all`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    overwrite: Vec<String>,
    delete_negated: bool,
}

impl AppendOptions {
    /// The first occurrence of `key` in the batch replaces any existing
    /// values; later occurrences append.
    pub fn overwrite_args(mut self, key: &str) -> Self {
        self.overwrite.push(key.to_owned());
        self
    }

    /// `-key` removes `key` instead of being appended.
    pub fn delete_negated_args(mut self) -> Self {
        self.delete_negated = true;
        self
    }

    fn overwrites(&self, key: &str) -> bool {
        self.overwrite.iter().any(|k| keys_match(k, key))
    }
}

/// An editable kernel command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    params: Vec<Parameter>,
}

impl Cmdline {
    /// Parse a space separated command line. Quoted values may contain
    /// whitespace.
    pub fn parse(input: &str) -> Self {
        let mut r = Self::default();
        for token in split(input) {
            let (key, value) = split_token(token);
            r.append(key, value);
        }
        r
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.params.iter().position(|p| keys_match(&p.key, key))
    }

    /// Locate the parameter named `key`.
    pub fn find(&self, key: &str) -> Option<&Parameter> {
        self.position(key).map(|i| &self.params[i])
    }

    /// The first value of `key`; `None` if absent or a switch.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.find(key)
            .and_then(Parameter::first)
            .filter(|v| !v.is_empty())
    }

    /// All parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Add `value` to `key`, creating the key at the end if needed. A value
    /// the key already has is not repeated.
    pub fn append(&mut self, key: &str, value: &str) {
        match self.position(key) {
            Some(i) => {
                let p = &mut self.params[i];
                if !p.contains(value) {
                    p.values.push(value.to_owned());
                }
            }
            None => self.params.push(Parameter::new(key, value)),
        }
    }

    /// Replace the values of every key mentioned in `args` with the values
    /// given there. Keys not yet present are added at the end.
    pub fn set_all<S: AsRef<str>>(&mut self, args: &[S]) {
        let mut batch: Vec<Parameter> = Vec::new();
        for token in args.iter().flat_map(|a| split(a.as_ref())) {
            let (key, value) = split_token(token);
            match batch.iter_mut().find(|p| keys_match(&p.key, key)) {
                Some(p) => p.values.push(value.to_owned()),
                None => batch.push(Parameter::new(key, value)),
            }
        }
        for p in batch {
            match self.position(&p.key) {
                Some(i) => self.params[i].values = p.values,
                None => self.params.push(p),
            }
        }
    }

    /// Append every argument in `args`, honoring `opts`.
    pub fn append_all<S: AsRef<str>>(&mut self, args: &[S], opts: &AppendOptions) {
        let mut overwritten = HashSet::new();
        for token in args.iter().flat_map(|a| split(a.as_ref())) {
            let (key, value) = split_token(token);
            if opts.delete_negated {
                if let Some(negated) = key.strip_prefix('-') {
                    self.delete(negated);
                    continue;
                }
            }
            if opts.overwrites(key) && overwritten.insert(normalize_key(key)) {
                match self.position(key) {
                    Some(i) => self.params[i].values = vec![value.to_owned()],
                    None => self.params.push(Parameter::new(key, value)),
                }
                continue;
            }
            self.append(key, value);
        }
    }

    /// Remove `key` and all of its values.
    pub fn delete(&mut self, key: &str) {
        self.params.retain(|p| !keys_match(&p.key, key));
    }

    /// Every `key[=value]` token in order.
    pub fn strings(&self) -> Vec<String> {
        self.params.iter().flat_map(Parameter::tokens).collect()
    }
}

impl Display for Cmdline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.strings().join(" "))
    }
}
