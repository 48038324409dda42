//! Stage parameters that UI or control threads may change while the pump runs.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use framepump_common::error::{MediaError, MediaResult};

/// How a parameter's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Continuous value in `[min, max]`.
    Range,
    /// Index into a list of labels.
    Items,
}

/// A named, bounded value. Reads and writes are lock-free.
pub struct Parameter {
    name: String,
    description: String,
    min: f32,
    max: f32,
    items: Option<Vec<String>>,
    value: AtomicU32,
}

impl Parameter {
    /// A continuous parameter. `name` must be an identifier.
    pub fn range(
        name: impl Into<String>,
        description: impl Into<String>,
        min: f32,
        max: f32,
        value: f32,
    ) -> MediaResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        if min.is_nan() || max.is_nan() || min > max {
            return Err(MediaError::parameter(format!(
                "{name}: min {min} exceeds max {max}"
            )));
        }
        Ok(Self {
            name,
            description: description.into(),
            min,
            max,
            items: None,
            value: AtomicU32::new(value.clamp(min, max).to_bits()),
        })
    }

    /// A choice among labelled items; the value is the selected index.
    pub fn items(
        name: impl Into<String>,
        description: impl Into<String>,
        selected: usize,
        items: &[&str],
    ) -> MediaResult<Self> {
        let name = name.into();
        if items.is_empty() {
            return Err(MediaError::parameter(format!("{name}: no items")));
        }
        let mut param = Self::range(
            name,
            description,
            0.0,
            (items.len() - 1) as f32,
            selected as f32,
        )?;
        param.items = Some(items.iter().map(|s| s.to_string()).collect());
        Ok(param)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn kind(&self) -> ParameterKind {
        if self.items.is_some() {
            ParameterKind::Items
        } else {
            ParameterKind::Range
        }
    }

    pub fn item_labels(&self) -> Option<&[String]> {
        self.items.as_deref()
    }

    pub fn value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Relaxed))
    }

    /// Store `value` clamped to `[min, max]`; item parameters round to an index.
    pub fn set(&self, value: f32) {
        let mut value = value.clamp(self.min, self.max);
        if self.items.is_some() {
            value = value.round();
        }
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Label of the selected item.
    pub fn selected_item(&self) -> Option<&str> {
        let items = self.items.as_ref()?;
        items.get(self.value() as usize).map(String::as_str)
    }

    /// Move the value by `steps` increments sized to the parameter's range.
    pub fn step(&self, steps: i32) -> f32 {
        let range = self.max - self.min;
        let increment = if self.items.is_some() {
            1.0
        } else if range < 2.0 {
            range / 100.0
        } else {
            range / 500.0
        };
        self.set(self.value() + steps as f32 * increment);
        self.value()
    }
}

impl Clone for Parameter {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            min: self.min,
            max: self.max,
            items: self.items.clone(),
            value: AtomicU32::new(self.value.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("value", &self.value())
            .finish()
    }
}

fn validate_name(name: &str) -> MediaResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MediaError::parameter(format!(
            "Illegal (non-id) characters in name '{name}'"
        )))
    }
}

/// The ordered parameter set of one stage.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    params: Vec<Parameter>,
}

impl Parameters {
    pub fn new(params: Vec<Parameter>) -> MediaResult<Self> {
        for (i, p) in params.iter().enumerate() {
            if params[..i].iter().any(|q| q.name == p.name) {
                return Err(MediaError::parameter(format!(
                    "{}: parameter already in use",
                    p.name
                )));
            }
        }
        Ok(Self { params })
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn value(&self, name: &str) -> MediaResult<f32> {
        self.require(name).map(Parameter::value)
    }

    pub fn set(&self, name: &str, value: f32) -> MediaResult<()> {
        self.require(name)?.set(value);
        Ok(())
    }

    pub fn step(&self, name: &str, steps: i32) -> MediaResult<f32> {
        Ok(self.require(name)?.step(steps))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn require(&self, name: &str) -> MediaResult<&Parameter> {
        self.get(name)
            .ok_or_else(|| MediaError::parameter(format!("Unknown parameter '{name}'")))
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ ")?;
        for p in &self.params {
            write!(f, "{}={} ", p.name, p.value())?;
        }
        write!(f, "]")
    }
}
