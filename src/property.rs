//! Property model: typed configuration cells shared by every module.
//!
//! A [`Property`] is the unit a UI binds to. Each carries a [`PropertyKind`]
//! that fixes how its value is coerced and validated, an observable value
//! (tokio `watch` channel, so any number of widgets can follow it), optional
//! change listeners and an enabled flag used to freeze controls while a scan
//! is running.
//!
//! A module's properties live in a [`PropertySet`], which is safe to share
//! between the controller and a running scan task. Lookups are by partial,
//! case-insensitive label match ("wait" finds "Wait Time (s)"); the first
//! match wins and is memoized.
//!
//! # Example
//!
//! ```rust
//! use fsrs_daq::property::{PropertyKind, PropertySet, PropertySpec, PropertyValue};
//!
//! let props = PropertySet::from_specs(vec![
//!     PropertySpec::new("# of Frames", PropertyKind::Spin, 2000).info(serde_json::json!([2, 20000])),
//!     PropertySpec::new("Type", PropertyKind::Choice, 0).choices(["FSRS", "TA", "T/T0"]),
//! ])?;
//!
//! props.set_value("frames", PropertyValue::Int(500))?;
//! assert_eq!(props.value("frames")?.as_i64(), Some(500));
//! assert!(props.set_value("type", PropertyValue::Index(7)).is_err());
//! # Ok::<(), fsrs_daq::error::DaqError>(())
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{AppResult, DaqError};

// =============================================================================
// Kinds, values and constraints
// =============================================================================

/// Widget kind of a property; determines coercion and validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    /// Read-only text
    Label,
    /// Free text, optionally restricted to float or int
    Input,
    /// Index into a list of choices
    Choice,
    /// Push button; the value is its caption
    Button,
    /// Boolean check box
    Checkbox,
    /// Boolean toggle button
    Toggle,
    /// Integer spinner with a range
    Spin,
    /// Progress bar, 0..=100
    Progress,
    /// File or directory path
    File,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyKind::Label => "label",
            PropertyKind::Input => "input",
            PropertyKind::Choice => "choice",
            PropertyKind::Button => "button",
            PropertyKind::Checkbox => "checkbox",
            PropertyKind::Toggle => "toggle",
            PropertyKind::Spin => "spin",
            PropertyKind::Progress => "progress",
            PropertyKind::File => "file",
        };
        f.write_str(name)
    }
}

/// Value stored in a property.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean (checkbox, toggle)
    Bool(bool),
    /// Choice index
    Index(usize),
    /// Integer (spin)
    Int(i64),
    /// Floating point (progress)
    Float(f64),
    /// Text (label, input, button, file)
    Text(String),
}

impl PropertyValue {
    /// Numeric view; text is parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::Index(i) => Some(*i as f64),
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Float(x) => Some(*x),
            PropertyValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Integer view; floats are truncated toward zero.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Bool(b) => Some(i64::from(*b)),
            PropertyValue::Index(i) => i64::try_from(*i).ok(),
            PropertyValue::Int(i) => Some(*i),
            PropertyValue::Float(x) if x.is_finite() => Some(x.trunc() as i64),
            PropertyValue::Float(_) => None,
            PropertyValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Choice index view.
    pub fn as_index(&self) -> Option<usize> {
        self.as_i64().and_then(|i| usize::try_from(i).ok())
    }

    /// Boolean view accepting `0|1|true|false`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Index(0) | PropertyValue::Int(0) => Some(false),
            PropertyValue::Index(1) | PropertyValue::Int(1) => Some(true),
            PropertyValue::Float(x) if *x == 0.0 => Some(false),
            PropertyValue::Float(x) if *x == 1.0 => Some(true),
            PropertyValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "0" | "false" => Some(false),
                "1" | "true" => Some(true),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text view of any value.
    pub fn as_text(&self) -> String {
        self.to_string()
    }

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(PropertyValue::Int)
                .or_else(|| n.as_f64().map(PropertyValue::Float)),
            serde_json::Value::String(s) => Some(PropertyValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", u8::from(*b)),
            PropertyValue::Index(i) => write!(f, "{i}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Float(x) => write!(f, "{x}"),
            PropertyValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// Numeric format accepted by an `input` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericFormat {
    /// Any text
    Any,
    /// Must parse as a float
    Float,
    /// Must parse as an integer
    Int,
}

/// What a `file` property points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Existing file to read
    Open,
    /// File to create
    Save,
    /// Directory
    Path,
}

/// Kind-specific metadata parsed from the `info` field.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyInfo {
    /// No metadata
    None,
    /// `input` restriction
    Numeric(NumericFormat),
    /// `spin` range, inclusive
    Range {
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
    /// `file` mode
    File(FileMode),
    /// Free text (checkbox caption, toggle states)
    Text(String),
}

// =============================================================================
// Property dictionary schema
// =============================================================================

/// Declarative property definition: `{label, type, value, choices?, info?, event?}`.
///
/// This is the boundary between a module and the generic property/UI layer.
/// It deserializes from TOML or JSON so module surfaces can also be described in
/// configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Display label
    pub label: String,
    /// Widget kind
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    /// Initial value
    pub value: serde_json::Value,
    /// Choice list (required for `choice`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    /// Kind-specific metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
    /// Name of the handler the module runs when the value changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl PropertySpec {
    /// Start a definition.
    pub fn new(
        label: impl Into<String>,
        kind: PropertyKind,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            label: label.into(),
            kind,
            value: value.into(),
            choices: None,
            info: None,
            event: None,
        }
    }

    /// Set the choice list.
    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    /// Set the `info` metadata.
    pub fn info(mut self, info: impl Into<serde_json::Value>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// Set the change handler name.
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    fn parse_info(&self) -> AppResult<PropertyInfo> {
        let malformed = |what: &str| {
            DaqError::PropertyDefinition(format!("'{}': {}", self.label, what))
        };
        let Some(info) = &self.info else {
            return Ok(match self.kind {
                PropertyKind::Input => PropertyInfo::Numeric(NumericFormat::Any),
                PropertyKind::Spin => PropertyInfo::Range {
                    min: i64::MIN,
                    max: i64::MAX,
                },
                _ => PropertyInfo::None,
            });
        };

        match self.kind {
            PropertyKind::Input => match info.as_str() {
                Some("float") => Ok(PropertyInfo::Numeric(NumericFormat::Float)),
                Some("int") => Ok(PropertyInfo::Numeric(NumericFormat::Int)),
                Some("") => Ok(PropertyInfo::Numeric(NumericFormat::Any)),
                _ => Err(malformed("input info must be 'float', 'int' or ''")),
            },
            PropertyKind::Spin => {
                let bounds = info
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .and_then(|a| Some((a[0].as_i64()?, a[1].as_i64()?)))
                    .ok_or_else(|| malformed("spin info must be [min, max]"))?;
                if bounds.0 > bounds.1 {
                    return Err(malformed("spin min exceeds max"));
                }
                Ok(PropertyInfo::Range {
                    min: bounds.0,
                    max: bounds.1,
                })
            }
            PropertyKind::File => match info.as_str() {
                Some("open") => Ok(PropertyInfo::File(FileMode::Open)),
                Some("save") => Ok(PropertyInfo::File(FileMode::Save)),
                Some("path") => Ok(PropertyInfo::File(FileMode::Path)),
                _ => Err(malformed("file info must be 'open', 'save' or 'path'")),
            },
            _ => Ok(info
                .as_str()
                .map(|s| PropertyInfo::Text(s.to_string()))
                .unwrap_or(PropertyInfo::None)),
        }
    }
}

// =============================================================================
// Property
// =============================================================================

type ChangeListener = Arc<dyn Fn(&PropertyValue) + Send + Sync>;

/// A single typed configuration cell.
pub struct Property {
    label: String,
    kind: PropertyKind,
    info: PropertyInfo,
    choices: Vec<String>,
    event: Option<String>,
    enabled: bool,
    revision: u64,
    value_tx: watch::Sender<PropertyValue>,
    listeners: Vec<ChangeListener>,
}

impl Property {
    /// Build a property from its definition, validating the initial value.
    pub fn from_spec(spec: PropertySpec) -> AppResult<Self> {
        if spec.kind == PropertyKind::Choice && spec.choices.is_none() {
            return Err(DaqError::PropertyDefinition(format!(
                "'{}': choice property requires a choices list",
                spec.label
            )));
        }
        let info = spec.parse_info()?;
        let raw = PropertyValue::from_json(&spec.value).ok_or_else(|| {
            DaqError::PropertyDefinition(format!("'{}': unsupported value type", spec.label))
        })?;

        let mut property = Self {
            label: spec.label,
            kind: spec.kind,
            info,
            choices: spec.choices.unwrap_or_default(),
            event: spec.event,
            enabled: true,
            revision: 0,
            value_tx: watch::channel(PropertyValue::Text(String::new())).0,
            listeners: Vec::new(),
        };
        let initial = property
            .coerce(raw)
            .map_err(|e| DaqError::PropertyDefinition(e.to_string()))?;
        property.value_tx.send_replace(initial);
        Ok(property)
    }

    /// Display label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Widget kind.
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Parsed `info` metadata.
    pub fn info(&self) -> &PropertyInfo {
        &self.info
    }

    /// Choice list (empty for non-choice kinds).
    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// Change handler name.
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    /// Whether the UI may edit this property.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of accepted value changes since creation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Current value.
    pub fn value(&self) -> PropertyValue {
        self.value_tx.borrow().clone()
    }

    /// Selected choice text, if this is a choice property with a selection.
    pub fn selected_choice(&self) -> Option<&str> {
        let index = self.value_tx.borrow().as_index()?;
        self.choices.get(index).map(String::as_str)
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<PropertyValue> {
        self.value_tx.subscribe()
    }

    /// Coerce a raw value into this property's domain or reject it.
    fn coerce(&self, value: PropertyValue) -> AppResult<PropertyValue> {
        let invalid = |reason: String| DaqError::invalid(&self.label, reason);
        match self.kind {
            PropertyKind::Checkbox | PropertyKind::Toggle => value
                .as_bool()
                .map(PropertyValue::Bool)
                .ok_or_else(|| invalid(format!("'{value}' is not boolean-like"))),
            PropertyKind::Choice => {
                let index = value
                    .as_index()
                    .ok_or_else(|| invalid(format!("'{value}' is not a choice index")))?;
                if index != 0 && index >= self.choices.len() {
                    return Err(invalid(format!(
                        "choice index {index} out of range [0, {})",
                        self.choices.len()
                    )));
                }
                Ok(PropertyValue::Index(index))
            }
            PropertyKind::Progress => {
                let percent = value
                    .as_f64()
                    .filter(|p| (0.0..=100.0).contains(p))
                    .ok_or_else(|| invalid(format!("'{value}' is not within [0, 100]")))?;
                Ok(PropertyValue::Float(percent))
            }
            PropertyKind::Spin => {
                let number = value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("'{value}' is not an integer")))?;
                if let PropertyInfo::Range { min, max } = self.info {
                    if number < min || number > max {
                        return Err(invalid(format!("{number} outside [{min}, {max}]")));
                    }
                }
                Ok(PropertyValue::Int(number))
            }
            PropertyKind::Input => {
                let text = value.as_text();
                match self.info {
                    PropertyInfo::Numeric(NumericFormat::Float) => {
                        if text.trim().parse::<f64>().is_err() {
                            return Err(invalid(format!("'{text}' is not a number")));
                        }
                    }
                    PropertyInfo::Numeric(NumericFormat::Int) => {
                        if text.trim().parse::<i64>().is_err() {
                            return Err(invalid(format!("'{text}' is not an integer")));
                        }
                    }
                    _ => {}
                }
                Ok(PropertyValue::Text(text))
            }
            PropertyKind::Label | PropertyKind::Button | PropertyKind::File => {
                Ok(PropertyValue::Text(value.as_text()))
            }
        }
    }

    /// Validate and store a value. Returns `false` when the value was already
    /// current, in which case nothing is notified.
    fn set(&mut self, value: PropertyValue) -> AppResult<(bool, Vec<ChangeListener>)> {
        let value = self.coerce(value)?;
        if *self.value_tx.borrow() == value {
            return Ok((false, Vec::new()));
        }
        self.value_tx.send_replace(value);
        self.revision += 1;
        Ok((true, self.listeners.clone()))
    }

    /// Replace the choices and reset the selection; listeners are returned
    /// only when the selection moved.
    fn set_choices(&mut self, choices: Vec<String>) -> Vec<ChangeListener> {
        self.choices = choices;
        if *self.value_tx.borrow() == PropertyValue::Index(0) {
            return Vec::new();
        }
        self.value_tx.send_replace(PropertyValue::Index(0));
        self.revision += 1;
        self.listeners.clone()
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("value", &*self.value_tx.borrow())
            .field("choices", &self.choices)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Case-insensitive partial label match.
pub fn label_matches(label: &str, query: &str) -> bool {
    label.to_lowercase().contains(&query.to_lowercase())
}

// =============================================================================
// PropertySet
// =============================================================================

/// Ordered, thread-safe collection of a module's properties.
#[derive(Default)]
pub struct PropertySet {
    properties: RwLock<Vec<Property>>,
    index: Mutex<HashMap<String, usize>>,
}

impl PropertySet {
    /// Build a set from declarative definitions.
    pub fn from_specs(specs: impl IntoIterator<Item = PropertySpec>) -> AppResult<Self> {
        let properties = specs
            .into_iter()
            .map(Property::from_spec)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            properties: RwLock::new(properties),
            index: Mutex::new(HashMap::new()),
        })
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.properties.read().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.properties.read().is_empty()
    }

    fn position(&self, query: &str) -> AppResult<usize> {
        let key = query.to_lowercase();
        if let Some(pos) = self.index.lock().get(&key) {
            return Ok(*pos);
        }
        let pos = self
            .properties
            .read()
            .iter()
            .position(|p| label_matches(&p.label, &key))
            .ok_or_else(|| DaqError::PropertyNotFound(query.to_string()))?;
        self.index.lock().insert(key, pos);
        Ok(pos)
    }

    /// Whether any property label matches `query`.
    pub fn has(&self, query: &str) -> bool {
        self.position(query).is_ok()
    }

    /// Full label of the first property matching `query`.
    pub fn label(&self, query: &str) -> AppResult<String> {
        let pos = self.position(query)?;
        Ok(self.properties.read()[pos].label.clone())
    }

    /// Current value of the property matching `query`.
    pub fn value(&self, query: &str) -> AppResult<PropertyValue> {
        let pos = self.position(query)?;
        Ok(self.properties.read()[pos].value())
    }

    /// Selected choice text of the choice property matching `query`.
    pub fn selected_choice(&self, query: &str) -> AppResult<Option<String>> {
        let pos = self.position(query)?;
        Ok(self.properties.read()[pos]
            .selected_choice()
            .map(str::to_string))
    }

    /// Handler name attached to the property matching `query`.
    pub fn event(&self, query: &str) -> AppResult<Option<String>> {
        let pos = self.position(query)?;
        Ok(self.properties.read()[pos].event.clone())
    }

    /// Validate and set a value programmatically (module or scan side).
    ///
    /// Returns whether the stored value changed. Listeners run after the set's
    /// lock is released.
    pub fn set_value(&self, query: &str, value: impl Into<PropertyValue>) -> AppResult<bool> {
        let pos = self.position(query)?;
        let (changed, listeners) = self.properties.write()[pos].set(value.into())?;
        if changed {
            let current = self.properties.read()[pos].value();
            for listener in listeners {
                listener(&current);
            }
        }
        Ok(changed)
    }

    /// Set a value on behalf of the UI; rejected while the control is frozen.
    pub fn set_from_ui(&self, query: &str, value: impl Into<PropertyValue>) -> AppResult<bool> {
        let pos = self.position(query)?;
        {
            let properties = self.properties.read();
            if !properties[pos].enabled {
                return Err(DaqError::invalid(
                    &properties[pos].label,
                    "control is disabled while a scan is running",
                ));
            }
        }
        self.set_value(query, value)
    }

    /// Replace the choice list; the selection resets to index 0.
    ///
    /// A reset that moves the selection notifies listeners like
    /// [`PropertySet::set_value`] does.
    pub fn set_choices<I, S>(&self, query: &str, choices: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pos = self.position(query)?;
        let listeners = {
            let mut properties = self.properties.write();
            if properties[pos].kind != PropertyKind::Choice {
                return Err(DaqError::invalid(&properties[pos].label, "not a choice property"));
            }
            properties[pos].set_choices(choices.into_iter().map(Into::into).collect())
        };
        let reset = PropertyValue::Index(0);
        for listener in listeners {
            listener(&reset);
        }
        Ok(())
    }

    /// Change the display label of the property matching `query`.
    pub fn set_label(&self, query: &str, label: impl Into<String>) -> AppResult<()> {
        let pos = self.position(query)?;
        self.properties.write()[pos].label = label.into();
        Ok(())
    }

    /// Enable or disable a single control.
    pub fn set_enabled(&self, query: &str, enabled: bool) -> AppResult<()> {
        let pos = self.position(query)?;
        self.properties.write()[pos].enabled = enabled;
        Ok(())
    }

    /// Freeze (disable) or unfreeze every control in the set.
    pub fn freeze(&self, frozen: bool) {
        for property in self.properties.write().iter_mut() {
            property.enabled = !frozen;
        }
    }

    /// Subscribe to the property matching `query`.
    pub fn subscribe(&self, query: &str) -> AppResult<watch::Receiver<PropertyValue>> {
        let pos = self.position(query)?;
        Ok(self.properties.read()[pos].subscribe())
    }

    /// Register a listener called after every accepted change.
    pub fn add_change_listener(
        &self,
        query: &str,
        listener: impl Fn(&PropertyValue) + Send + Sync + 'static,
    ) -> AppResult<()> {
        let pos = self.position(query)?;
        self.properties.write()[pos].listeners.push(Arc::new(listener));
        Ok(())
    }

    /// Change counter of the property matching `query`.
    pub fn revision(&self, query: &str) -> AppResult<u64> {
        let pos = self.position(query)?;
        Ok(self.properties.read()[pos].revision())
    }

    /// Copy every value under a single read lock.
    pub fn snapshot(&self) -> PropertySnapshot {
        let properties = self.properties.read();
        PropertySnapshot {
            entries: properties
                .iter()
                .map(|p| SnapshotEntry {
                    label: p.label.clone(),
                    value: p.value(),
                    choice: p.selected_choice().map(str::to_string),
                })
                .collect(),
        }
    }

    /// Read-only rows for listing and UI construction.
    pub fn describe(&self) -> Vec<PropertyView> {
        self.properties
            .read()
            .iter()
            .map(|p| PropertyView {
                label: p.label.clone(),
                kind: p.kind,
                value: p.value(),
                choices: p.choices.clone(),
                enabled: p.enabled,
            })
            .collect()
    }
}

impl fmt::Debug for PropertySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.properties.read().iter()).finish()
    }
}

/// Row returned by [`PropertySet::describe`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyView {
    /// Display label
    pub label: String,
    /// Widget kind
    pub kind: PropertyKind,
    /// Current value
    pub value: PropertyValue,
    /// Choice list
    pub choices: Vec<String>,
    /// Whether the control is editable
    pub enabled: bool,
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    label: String,
    value: PropertyValue,
    choice: Option<String>,
}

/// Point-in-time copy of a property set, taken atomically at scan start.
#[derive(Debug, Clone)]
pub struct PropertySnapshot {
    entries: Vec<SnapshotEntry>,
}

impl PropertySnapshot {
    fn entry(&self, query: &str) -> AppResult<&SnapshotEntry> {
        self.entries
            .iter()
            .find(|e| label_matches(&e.label, query))
            .ok_or_else(|| DaqError::PropertyNotFound(query.to_string()))
    }

    /// Raw value.
    pub fn value(&self, query: &str) -> AppResult<PropertyValue> {
        Ok(self.entry(query)?.value.clone())
    }

    /// Float value; text is parsed.
    pub fn float(&self, query: &str) -> AppResult<f64> {
        let entry = self.entry(query)?;
        entry
            .value
            .as_f64()
            .ok_or_else(|| DaqError::invalid(&entry.label, format!("'{}' is not a number", entry.value)))
    }

    /// Integer value.
    pub fn int(&self, query: &str) -> AppResult<i64> {
        let entry = self.entry(query)?;
        entry
            .value
            .as_i64()
            .ok_or_else(|| DaqError::invalid(&entry.label, format!("'{}' is not an integer", entry.value)))
    }

    /// Non-negative count (frames, sets, points).
    pub fn count(&self, query: &str) -> AppResult<usize> {
        let value = self.int(query)?;
        usize::try_from(value).map_err(|_| DaqError::invalid(query, format!("{value} is negative")))
    }

    /// Choice index.
    pub fn index(&self, query: &str) -> AppResult<usize> {
        let entry = self.entry(query)?;
        entry
            .value
            .as_index()
            .ok_or_else(|| DaqError::invalid(&entry.label, "not a choice index"))
    }

    /// Selected choice text.
    pub fn choice(&self, query: &str) -> AppResult<Option<String>> {
        Ok(self.entry(query)?.choice.clone())
    }

    /// Boolean value.
    pub fn flag(&self, query: &str) -> AppResult<bool> {
        let entry = self.entry(query)?;
        entry
            .value
            .as_bool()
            .ok_or_else(|| DaqError::invalid(&entry.label, "not boolean-like"))
    }

    /// Text value.
    pub fn text(&self, query: &str) -> AppResult<String> {
        Ok(self.entry(query)?.value.as_text())
    }
}
