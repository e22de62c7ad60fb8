//! Id generators
//!
//! Every engine keys rows by string ids; generators produce fresh ids in the
//! table's declared id type and convert between the typed and string forms.
//! Stateful generators persist their counters on the per-table metadata
//! element, which survives engine spin-down.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use xmltree::Element;

use crate::{Result, XFlatError};

const MAX_ID_ATTR: &str = "maxId";

// ============================================================================
// Id types and values
// ============================================================================

/// The id property type a table declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdType {
    Int,
    Long,
    Float,
    Double,
    String,
}

/// A generated id value.
#[derive(Debug, Clone, PartialEq)]
pub enum IdValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl IdValue {
    /// The string form engines store in the row's `id` attribute.
    pub fn to_string_id(&self) -> String {
        match self {
            IdValue::Int(v) => v.to_string(),
            IdValue::Long(v) => v.to_string(),
            IdValue::Float(v) => (*v as i64).to_string(),
            IdValue::Double(v) => (*v as i64).to_string(),
            IdValue::String(v) => v.clone(),
        }
    }
}

// ============================================================================
// Generator trait
// ============================================================================

/// Produces row ids for one table. Selected per table by the first kind that
/// supports the table's id type.
pub trait IdGenerator: Send + Sync {
    fn supports(&self, id_type: IdType) -> bool;

    fn generate(&self, id_type: IdType) -> Result<IdValue>;

    fn string_to_id(&self, id: &str, id_type: IdType) -> Result<IdValue>;

    /// Persist generator state onto the table metadata element. Stateless
    /// generators leave this as a no-op. Never invoked concurrently with
    /// `generate`.
    fn save_state(&self, _state: &mut Element) {}

    /// Restore generator state from the table metadata element.
    fn load_state(&self, _state: &Element) -> Result<()> {
        Ok(())
    }
}

/// The generator kinds the table config can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdGeneratorKind {
    Uuid,
    Integer,
}

impl IdGeneratorKind {
    pub fn create(self) -> Box<dyn IdGenerator> {
        match self {
            IdGeneratorKind::Uuid => Box::new(UuidIdGenerator),
            IdGeneratorKind::Integer => Box::new(IntegerIdGenerator::new()),
        }
    }
}

/// Pick the first generator kind supporting the id type.
pub fn generator_for(id_type: IdType) -> IdGeneratorKind {
    if UuidIdGenerator.supports(id_type) {
        IdGeneratorKind::Uuid
    } else {
        IdGeneratorKind::Integer
    }
}

// ============================================================================
// UUID generator
// ============================================================================

/// Stateless generator producing random UUIDs. String ids only.
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn supports(&self, id_type: IdType) -> bool {
        id_type == IdType::String
    }

    fn generate(&self, id_type: IdType) -> Result<IdValue> {
        match id_type {
            IdType::String => Ok(IdValue::String(uuid::Uuid::new_v4().to_string())),
            other => Err(XFlatError::Conversion(format!(
                "unsupported id type {other:?} for UUID generator"
            ))),
        }
    }

    fn string_to_id(&self, id: &str, id_type: IdType) -> Result<IdValue> {
        match id_type {
            IdType::String => Ok(IdValue::String(id.to_string())),
            other => Err(XFlatError::Conversion(format!(
                "unsupported id type {other:?} for UUID generator"
            ))),
        }
    }
}

// ============================================================================
// Integer generator
// ============================================================================

/// Sequential generator carrying an atomic counter; supports every numeric
/// id type plus strings.
#[derive(Debug, Default)]
pub struct IntegerIdGenerator {
    last_id: AtomicI64,
}

impl IntegerIdGenerator {
    pub fn new() -> Self {
        Self {
            last_id: AtomicI64::new(0),
        }
    }

    fn convert(id: i64, id_type: IdType) -> IdValue {
        match id_type {
            IdType::Int => IdValue::Int(id as i32),
            IdType::Long => IdValue::Long(id),
            IdType::Float => IdValue::Float(id as f32),
            IdType::Double => IdValue::Double(id as f64),
            IdType::String => IdValue::String(id.to_string()),
        }
    }
}

impl IdGenerator for IntegerIdGenerator {
    fn supports(&self, _id_type: IdType) -> bool {
        true
    }

    fn generate(&self, id_type: IdType) -> Result<IdValue> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self::convert(id, id_type))
    }

    fn string_to_id(&self, id: &str, id_type: IdType) -> Result<IdValue> {
        if id_type == IdType::String {
            return Ok(IdValue::String(id.to_string()));
        }
        let parsed: i64 = id
            .parse()
            .map_err(|_| XFlatError::Conversion(format!("cannot parse id {id:?} as a number")))?;
        Ok(Self::convert(parsed, id_type))
    }

    fn save_state(&self, state: &mut Element) {
        state.attributes.insert(
            MAX_ID_ATTR.to_string(),
            self.last_id.load(Ordering::SeqCst).to_string(),
        );
    }

    fn load_state(&self, state: &Element) -> Result<()> {
        if let Some(value) = state.attributes.get(MAX_ID_ATTR) {
            let max_id: i64 = value.parse().map_err(|_| {
                XFlatError::Conversion(format!("cannot parse saved {MAX_ID_ATTR} {value:?}"))
            })?;
            self.last_id.store(max_id, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_generator_string_only() {
        let generator = UuidIdGenerator;
        assert!(generator.supports(IdType::String));
        assert!(!generator.supports(IdType::Long));

        let a = generator.generate(IdType::String).unwrap();
        let b = generator.generate(IdType::String).unwrap();
        assert_ne!(a, b);
        assert!(generator.generate(IdType::Long).is_err());
    }

    #[test]
    fn test_integer_generator_sequences() {
        let generator = IntegerIdGenerator::new();
        assert_eq!(generator.generate(IdType::Long).unwrap(), IdValue::Long(1));
        assert_eq!(generator.generate(IdType::Long).unwrap(), IdValue::Long(2));
        assert_eq!(
            generator.generate(IdType::String).unwrap(),
            IdValue::String("3".to_string())
        );
    }

    #[test]
    fn test_integer_generator_state_round_trip() {
        let generator = IntegerIdGenerator::new();
        for _ in 0..42 {
            generator.generate(IdType::Long).unwrap();
        }

        let mut state = Element::new("metadata");
        generator.save_state(&mut state);
        assert_eq!(
            state.attributes.get("maxId").map(String::as_str),
            Some("42")
        );

        let restored = IntegerIdGenerator::new();
        restored.load_state(&state).unwrap();
        assert_eq!(restored.generate(IdType::Long).unwrap(), IdValue::Long(43));
    }

    #[test]
    fn test_generator_selection() {
        assert_eq!(generator_for(IdType::String), IdGeneratorKind::Uuid);
        assert_eq!(generator_for(IdType::Long), IdGeneratorKind::Integer);
    }

    #[test]
    fn test_string_id_conversion() {
        let generator = IntegerIdGenerator::new();
        assert_eq!(
            generator.string_to_id("17", IdType::Long).unwrap(),
            IdValue::Long(17)
        );
        assert!(generator.string_to_id("nope", IdType::Long).is_err());
        assert_eq!(IdValue::Double(17.0).to_string_id(), "17");
    }
}
