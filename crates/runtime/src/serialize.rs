//! Value serialization.
//!
//! Runtime values cross process boundaries (binary I/O builtins,
//! persistence) through `TypedValue`, a serde mirror of the data-bearing
//! kinds, encoded with bincode. Code-bearing kinds (classes, aliases,
//! handles, externs) do not serialize — their identity is meaningless
//! outside the owning VM.

use crate::error::HybrisError;
use crate::value::{self, MatrixData, ObjKind, ObjRef, StructData};
use crate::vm::Vm;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Binary(Vec<u8>),
    Vector(Vec<TypedValue>),
    Map(Vec<(TypedValue, TypedValue)>),
    Matrix {
        rows: usize,
        cols: usize,
        cells: Vec<TypedValue>,
    },
    Struct {
        name: String,
        attributes: Vec<(String, TypedValue)>,
    },
    Null,
    Reference(Box<TypedValue>),
}

/// Lower a runtime value to its serializable mirror.
pub fn to_typed(o: &ObjRef) -> Result<TypedValue, HybrisError> {
    let kind = o.kind().clone();
    match kind {
        ObjKind::Int(v) => Ok(TypedValue::Int(v)),
        ObjKind::Float(v) => Ok(TypedValue::Float(v)),
        ObjKind::Char(c) => Ok(TypedValue::Char(c)),
        ObjKind::Str(s) => Ok(TypedValue::Str(s)),
        ObjKind::Binary(b) => Ok(TypedValue::Binary(b)),
        ObjKind::Vector(items) => Ok(TypedValue::Vector(
            items.iter().map(to_typed).collect::<Result<_, _>>()?,
        )),
        ObjKind::Map(entries) => Ok(TypedValue::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((to_typed(k)?, to_typed(v)?)))
                .collect::<Result<_, HybrisError>>()?,
        )),
        ObjKind::Matrix(m) => Ok(TypedValue::Matrix {
            rows: m.rows,
            cols: m.cols,
            cells: m.cells.iter().map(to_typed).collect::<Result<_, _>>()?,
        }),
        ObjKind::Struct(s) => Ok(TypedValue::Struct {
            name: s.name.clone(),
            attributes: s
                .attributes
                .iter()
                .map(|(label, v)| Ok((label.clone(), to_typed(v)?)))
                .collect::<Result<_, HybrisError>>()?,
        }),
        ObjKind::Reference(None) => Ok(TypedValue::Null),
        ObjKind::Reference(Some(inner)) => Ok(TypedValue::Reference(Box::new(to_typed(&inner)?))),
        other => Err(HybrisError::type_error(format!(
            "'{}' values do not serialize",
            other.tag().name()
        ))),
    }
}

/// Rebuild a runtime value from its mirror, tracked by the collector.
pub fn from_typed(vm: &Vm, typed: &TypedValue) -> ObjRef {
    match typed {
        TypedValue::Int(v) => vm.track(ObjKind::Int(*v)),
        TypedValue::Float(v) => vm.track(ObjKind::Float(*v)),
        TypedValue::Char(c) => vm.track(ObjKind::Char(*c)),
        TypedValue::Str(s) => vm.track(ObjKind::Str(s.clone())),
        TypedValue::Binary(b) => vm.track(ObjKind::Binary(b.clone())),
        TypedValue::Vector(items) => {
            let items = items.iter().map(|i| from_typed(vm, i)).collect();
            vm.track(ObjKind::Vector(items))
        }
        TypedValue::Map(entries) => {
            let entries = entries
                .iter()
                .map(|(k, v)| (from_typed(vm, k), from_typed(vm, v)))
                .collect();
            vm.track(ObjKind::Map(entries))
        }
        TypedValue::Matrix { rows, cols, cells } => {
            let cells = cells.iter().map(|c| from_typed(vm, c)).collect();
            vm.track(ObjKind::Matrix(MatrixData {
                rows: *rows,
                cols: *cols,
                cells,
            }))
        }
        TypedValue::Struct { name, attributes } => {
            let attributes = attributes
                .iter()
                .map(|(label, v)| (label.clone(), from_typed(vm, v)))
                .collect();
            vm.track(ObjKind::Struct(StructData {
                name: name.clone(),
                attributes,
            }))
        }
        TypedValue::Null => vm.track(ObjKind::Reference(None)),
        TypedValue::Reference(inner) => {
            let inner = from_typed(vm, inner);
            vm.track(ObjKind::Reference(Some(inner)))
        }
    }
}

/// Encode a value to bytes.
pub fn serialize(o: &ObjRef) -> Result<Vec<u8>, HybrisError> {
    let typed = to_typed(o)?;
    bincode::serialize(&typed)
        .map_err(|e| HybrisError::runtime(format!("serialization failed: {}", e)))
}

/// Decode a value from bytes.
pub fn deserialize(vm: &Vm, bytes: &[u8]) -> Result<ObjRef, HybrisError> {
    let typed: TypedValue = bincode::deserialize(bytes)
        .map_err(|e| HybrisError::runtime(format!("deserialization failed: {}", e)))?;
    Ok(from_typed(vm, &typed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use crate::value::Obj;
    use crate::vm::VmArgs;
    use std::sync::Arc;

    fn vm() -> Arc<Vm> {
        Vm::new(VmArgs::default())
    }

    fn round_trip(vm: &Vm, o: &ObjRef) -> ObjRef {
        let bytes = serialize(o).unwrap();
        deserialize(vm, &bytes).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        let vm = vm();
        for original in [
            Obj::int(-42),
            Obj::float(3.25),
            Obj::char('x'),
            Obj::str("hello"),
        ] {
            let back = round_trip(&vm, &original);
            assert!(ops::equals(&original, &back), "{:?}", original.kind());
        }
    }

    #[test]
    fn test_nested_collection_round_trips() {
        let vm = vm();
        let inner = Obj::vector(vec![Obj::int(1), Obj::str("two")]);
        let map = Obj::new(ObjKind::Map(vec![(Obj::str("k"), inner)]));
        let back = round_trip(&vm, &map);
        assert!(ops::equals(&map, &back));
    }

    #[test]
    fn test_struct_round_trips() {
        let vm = vm();
        let s = Obj::new(ObjKind::Struct(StructData {
            name: "point".to_string(),
            attributes: vec![
                ("x".to_string(), Obj::int(1)),
                ("y".to_string(), Obj::int(2)),
            ],
        }));
        let back = round_trip(&vm, &s);
        assert!(ops::equals(&s, &back));
    }

    #[test]
    fn test_null_round_trips() {
        let vm = vm();
        let null = Obj::new(ObjKind::Reference(None));
        let back = round_trip(&vm, &null);
        assert!(ops::equals(&null, &back));
    }

    #[test]
    fn test_alias_does_not_serialize() {
        let alias = Obj::new(ObjKind::Alias(3));
        assert!(serialize(&alias).is_err());
    }
}
