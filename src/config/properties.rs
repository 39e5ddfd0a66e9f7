//! Hierarchical `{label}.key` host properties read from JSON files.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::Value;
use tracing::{debug, warn};

use super::ConfigError;

const MASK: &str = "********";

#[derive(Clone, Debug, Eq, PartialEq)]
enum Property {
    Scalar(String),
    List(Vec<String>),
}

/// Flattened host properties.
///
/// Nested JSON objects become dotted keys, so `{"web": {"tunnel": {"ports":
/// "2222:22"}}}` and `{"web.tunnel.ports": "2222:22"}` are equivalent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostProperties {
    values: BTreeMap<String, Property>,
}

impl HostProperties {
    /// Creates an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] when the document is not a JSON object.
    pub fn from_json_str(origin: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        let document: Value =
            serde_json::from_str(contents).map_err(|err| ConfigError::Json {
                path: origin.to_path_buf(),
                message: err.to_string(),
            })?;
        let Value::Object(map) = document else {
            return Err(ConfigError::Json {
                path: origin.to_path_buf(),
                message: String::from("top level must be an object"),
            });
        };

        let mut properties = Self::new();
        for (key, value) in map {
            properties.flatten(key, value);
        }
        Ok(properties)
    }

    /// Reads each file in order, later files overriding earlier keys.
    /// Files that do not exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Json`] when an existing
    /// file cannot be read or parsed.
    pub fn load_layers(paths: &[Utf8PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = Self::new();
        for path in paths {
            match read_optional(path)? {
                Some(contents) => {
                    debug!(path = %path, "loading host properties");
                    merged.merge(Self::from_json_str(path, &contents)?);
                }
                None => warn!(path = %path, "host property file not found; skipping"),
            }
        }
        Ok(merged)
    }

    /// Overlays `other` onto `self`.
    pub fn merge(&mut self, other: Self) {
        self.values.extend(other.values);
    }

    /// Inserts or replaces a scalar value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), Property::Scalar(value.into()));
    }

    /// Inserts or replaces a list value.
    pub fn set_list<I, S>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values.insert(
            key.into(),
            Property::List(values.into_iter().map(Into::into).collect()),
        );
    }

    /// Returns the scoped view for one host label.
    #[must_use]
    pub const fn scope<'a>(&'a self, label: &'a str) -> PropertyScope<'a> {
        PropertyScope {
            properties: self,
            label,
        }
    }

    /// Returns the value for a password-like key masked, for logging.
    #[must_use]
    pub fn display_value(&self, key: &str) -> Option<String> {
        let raw = match self.values.get(key)? {
            Property::Scalar(value) => value.clone(),
            Property::List(values) => values.join(","),
        };
        if is_secret(key) {
            return Some(MASK.to_owned());
        }
        Some(raw)
    }

    fn flatten(&mut self, key: String, value: Value) {
        match value {
            Value::Object(map) => {
                for (child, nested) in map {
                    self.flatten(format!("{key}.{child}"), nested);
                }
            }
            Value::Array(items) => {
                let list = items.into_iter().filter_map(scalar_text).collect();
                self.values.insert(key, Property::List(list));
            }
            other => {
                if let Some(text) = scalar_text(other) {
                    self.values.insert(key, Property::Scalar(text));
                }
            }
        }
    }
}

/// Typed access to the properties of one host label.
#[derive(Clone, Copy, Debug)]
pub struct PropertyScope<'a> {
    properties: &'a HostProperties,
    label: &'a str,
}

impl<'a> PropertyScope<'a> {
    /// Host label this scope reads.
    #[must_use]
    pub const fn label(&self) -> &'a str {
        self.label
    }

    /// Fully qualified key for `name`.
    #[must_use]
    pub fn key(&self, name: &str) -> String {
        format!("{}.{name}", self.label)
    }

    /// Returns `true` when `name` is set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.properties.values.contains_key(&self.key(name))
    }

    /// Returns a trimmed, non-empty scalar value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a str> {
        match self.properties.values.get(&self.key(name))? {
            Property::Scalar(value) => Some(value.trim()).filter(|value| !value.is_empty()),
            Property::List(_) => None,
        }
    }

    /// Returns the value or `default` when unset.
    #[must_use]
    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_owned()
    }

    /// Returns the value or a [`ConfigError::MissingKey`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKey`] when unset or blank.
    pub fn require(&self, name: &str) -> Result<&'a str, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::MissingKey { key: self.key(name) })
    }

    /// Parses a boolean, accepting `true`/`false`/`yes`/`no`/`1`/`0`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything else.
    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get(name) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(self.invalid(name, raw, "expected a boolean")),
        }
    }

    /// Parses an unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the value is not a
    /// non-negative integer.
    pub fn get_u64(&self, name: &str, default: u64) -> Result<u64, ConfigError> {
        self.get(name).map_or(Ok(default), |raw| {
            raw.parse()
                .map_err(|_| self.invalid(name, raw, "expected a non-negative integer"))
        })
    }

    /// Parses a whole number of seconds.
    ///
    /// # Errors
    ///
    /// See [`PropertyScope::get_u64`].
    pub fn get_secs(&self, name: &str, default_secs: u64) -> Result<Duration, ConfigError> {
        self.get_u64(name, default_secs).map(Duration::from_secs)
    }

    /// Returns a list value. Scalar values are split on commas.
    #[must_use]
    pub fn get_list(&self, name: &str) -> Vec<String> {
        match self.properties.values.get(&self.key(name)) {
            Some(Property::List(values)) => values.clone(),
            Some(Property::Scalar(value)) => value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Returns a command vector. Scalar values are split on whitespace.
    #[must_use]
    pub fn get_words(&self, name: &str) -> Vec<String> {
        match self.properties.values.get(&self.key(name)) {
            Some(Property::List(values)) => values.clone(),
            Some(Property::Scalar(value)) => {
                value.split_whitespace().map(ToOwned::to_owned).collect()
            }
            None => Vec::new(),
        }
    }

    /// Names of the direct children of `prefix`, in key order.
    ///
    /// For keys `web.fsMapping.data.hostPath` and `web.fsMapping.logs.hostPath`
    /// the children of `fsMapping` are `data` and `logs`.
    #[must_use]
    pub fn children(&self, prefix: &str) -> BTreeSet<String> {
        let full = format!("{}.", self.key(prefix));
        self.properties
            .values
            .keys()
            .filter_map(|key| key.strip_prefix(full.as_str()))
            .filter_map(|rest| rest.split('.').next())
            .filter(|child| !child.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Builds an [`ConfigError::InvalidValue`] for `name`.
    #[must_use]
    pub fn invalid(&self, name: &str, value: &str, reason: &str) -> ConfigError {
        let key = self.key(name);
        let shown = if is_secret(&key) { MASK } else { value };
        ConfigError::InvalidValue {
            key,
            value: shown.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn is_secret(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.ends_with("password") || lower.ends_with("secretkey") || lower.ends_with("authhash")
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, ConfigError> {
    let io_error = |message: String| ConfigError::Io {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let Some(file_name) = path.file_name() else {
        return Err(io_error(String::from("path has no file name")));
    };

    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(err.to_string())),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(err.to_string())),
    }
}
