//! Runtime values.
//!
//! Every script value is an `ObjRef` (`Arc<Obj>`): a shared object
//! carrying an atomic flag byte (constant / referenced / static) and a
//! mutex-guarded payload, the tagged sum over the fourteen Hybris types.
//!
//! Lock discipline: a payload lock is held only to read or mutate one
//! object's own fields. Nothing recurses into another object or
//! allocates through the collector while a payload guard is live —
//! children are cloned out first. This keeps payload locks disjoint
//! from the GC mutex and lets a self-referential container be traversed
//! without deadlocking on its own guard.

use crate::class::ClassData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type ObjRef = Arc<Obj>;

/// Exempt from collection; moved to the constants list at sweep time.
pub const FLAG_CONSTANT: u8 = 0b0000_0001;
/// The mark bit: set during a collection cycle, clear outside one.
pub const FLAG_REFERENCED: u8 = 0b0000_0010;
/// Class-level attribute, storage shared across instances.
pub const FLAG_STATIC: u8 = 0b0000_0100;

/// Type tags, used for dispatch tables and native argument validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Float,
    Char,
    Str,
    Binary,
    Vector,
    Map,
    Matrix,
    Struct,
    Class,
    Reference,
    Alias,
    Handle,
    Extern,
}

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Int => "integer",
            TypeTag::Float => "float",
            TypeTag::Char => "char",
            TypeTag::Str => "string",
            TypeTag::Binary => "binary",
            TypeTag::Vector => "vector",
            TypeTag::Map => "map",
            TypeTag::Matrix => "matrix",
            TypeTag::Struct => "struct",
            TypeTag::Class => "class",
            TypeTag::Reference => "reference",
            TypeTag::Alias => "alias",
            TypeTag::Handle => "handle",
            TypeTag::Extern => "extern",
        }
    }
}

/// A two-dimensional grid with a fixed shape, cells stored row-major.
#[derive(Debug, Clone)]
pub struct MatrixData {
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<ObjRef>,
}

impl MatrixData {
    pub fn at(&self, row: usize, col: usize) -> Option<&ObjRef> {
        if row < self.rows && col < self.cols {
            self.cells.get(row * self.cols + col)
        } else {
            None
        }
    }
}

/// A structure: a label-to-value mapping with a fixed attribute set
/// declared at definition time.
#[derive(Debug, Clone, Default)]
pub struct StructData {
    pub name: String,
    pub attributes: Vec<(String, ObjRef)>,
}

impl StructData {
    pub fn get(&self, name: &str) -> Option<&ObjRef> {
        self.attributes
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, name: &str, value: ObjRef) -> bool {
        for (label, slot) in &mut self.attributes {
            if label == name {
                *slot = value;
                return true;
            }
        }
        false
    }
}

/// The payload of a runtime value.
#[derive(Debug, Clone)]
pub enum ObjKind {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Binary(Vec<u8>),
    Vector(Vec<ObjRef>),
    /// Insertion-ordered mapping; keys compared structurally.
    Map(Vec<(ObjRef, ObjRef)>),
    Matrix(MatrixData),
    Struct(StructData),
    Class(ClassData),
    /// Non-owning indirection; `None` is the `null` constant.
    Reference(Option<ObjRef>),
    /// Index of a user function in the VM's code segment.
    Alias(usize),
    /// Opaque native handle (file descriptors and the like).
    Handle(u64),
    /// Address of a native function, invoked through the FFI dispatcher.
    Extern(u64),
}

impl ObjKind {
    pub fn tag(&self) -> TypeTag {
        match self {
            ObjKind::Int(_) => TypeTag::Int,
            ObjKind::Float(_) => TypeTag::Float,
            ObjKind::Char(_) => TypeTag::Char,
            ObjKind::Str(_) => TypeTag::Str,
            ObjKind::Binary(_) => TypeTag::Binary,
            ObjKind::Vector(_) => TypeTag::Vector,
            ObjKind::Map(_) => TypeTag::Map,
            ObjKind::Matrix(_) => TypeTag::Matrix,
            ObjKind::Struct(_) => TypeTag::Struct,
            ObjKind::Class(_) => TypeTag::Class,
            ObjKind::Reference(_) => TypeTag::Reference,
            ObjKind::Alias(_) => TypeTag::Alias,
            ObjKind::Handle(_) => TypeTag::Handle,
            ObjKind::Extern(_) => TypeTag::Extern,
        }
    }

    /// Tracked size in bytes: the object header plus owned payload
    /// storage. Child objects are tracked on their own.
    pub fn byte_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        let payload = match self {
            ObjKind::Str(s) => s.len(),
            ObjKind::Binary(b) => b.len(),
            ObjKind::Vector(v) => v.len() * std::mem::size_of::<ObjRef>(),
            ObjKind::Map(m) => m.len() * 2 * std::mem::size_of::<ObjRef>(),
            ObjKind::Matrix(m) => m.cells.len() * std::mem::size_of::<ObjRef>(),
            ObjKind::Struct(s) => s.attributes.len() * 2 * std::mem::size_of::<ObjRef>(),
            ObjKind::Class(c) => c.storage_size(),
            _ => 0,
        };
        base + payload
    }
}

/// A runtime object: flag byte plus payload.
#[derive(Debug)]
pub struct Obj {
    flags: AtomicU8,
    kind: Mutex<ObjKind>,
}

impl Obj {
    pub fn new(kind: ObjKind) -> ObjRef {
        Arc::new(Obj {
            flags: AtomicU8::new(0),
            kind: Mutex::new(kind),
        })
    }

    pub fn int(v: i64) -> ObjRef {
        Self::new(ObjKind::Int(v))
    }

    pub fn float(v: f64) -> ObjRef {
        Self::new(ObjKind::Float(v))
    }

    pub fn char(v: char) -> ObjRef {
        Self::new(ObjKind::Char(v))
    }

    pub fn str(v: impl Into<String>) -> ObjRef {
        Self::new(ObjKind::Str(v.into()))
    }

    pub fn vector(items: Vec<ObjRef>) -> ObjRef {
        Self::new(ObjKind::Vector(items))
    }

    /// Lock the payload. Poisoning is ignored: a panicking thread never
    /// leaves a payload half-written because mutations are single
    /// assignments behind the guard.
    pub fn kind(&self) -> MutexGuard<'_, ObjKind> {
        self.kind.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tag(&self) -> TypeTag {
        self.kind().tag()
    }

    pub fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn is_constant(&self) -> bool {
        self.has_flag(FLAG_CONSTANT)
    }

    pub fn set_constant(&self) {
        self.set_flag(FLAG_CONSTANT);
    }

    pub fn is_referenced(&self) -> bool {
        self.has_flag(FLAG_REFERENCED)
    }

    pub fn set_referenced(&self, referenced: bool) {
        if referenced {
            self.set_flag(FLAG_REFERENCED);
        } else {
            self.clear_flag(FLAG_REFERENCED);
        }
    }

    pub fn is_static(&self) -> bool {
        self.has_flag(FLAG_STATIC)
    }

    pub fn set_static(&self) {
        self.set_flag(FLAG_STATIC);
    }
}

/// Enumerate the children an object owns, one per successive index.
/// Used exclusively by the collector's mark phase; every owned value is
/// yielded exactly once across indices.
pub fn traverse(o: &ObjRef, index: usize) -> Option<ObjRef> {
    let kind = o.kind();
    match &*kind {
        ObjKind::Vector(items) => items.get(index).cloned(),
        ObjKind::Map(entries) => {
            let len = entries.len();
            if index < len {
                Some(entries[index].0.clone())
            } else {
                entries.get(index - len).map(|(_, v)| v.clone())
            }
        }
        ObjKind::Matrix(m) => m.cells.get(index).cloned(),
        ObjKind::Struct(s) => s.attributes.get(index).map(|(_, v)| v.clone()),
        ObjKind::Class(c) => c.traverse(index),
        ObjKind::Reference(inner) => {
            if index == 0 {
                inner.clone()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Integer/truthiness view of a value. Collections report their item
/// count, so a non-empty collection is truthy.
pub fn lvalue(o: &ObjRef) -> i64 {
    let kind = o.kind();
    match &*kind {
        ObjKind::Int(v) => *v,
        ObjKind::Float(v) => *v as i64,
        ObjKind::Char(c) => *c as i64,
        ObjKind::Str(s) => s.len() as i64,
        ObjKind::Binary(b) => b.len() as i64,
        ObjKind::Vector(v) => v.len() as i64,
        ObjKind::Map(m) => m.len() as i64,
        ObjKind::Matrix(m) => (m.rows * m.cols) as i64,
        ObjKind::Struct(s) => s.attributes.len() as i64,
        ObjKind::Class(c) => c.attribute_count() as i64,
        ObjKind::Reference(inner) => {
            let inner = inner.clone();
            drop(kind);
            inner.map(|i| lvalue(&i)).unwrap_or(0)
        }
        ObjKind::Alias(a) => *a as i64,
        ObjKind::Handle(h) => *h as i64,
        ObjKind::Extern(e) => *e as i64,
    }
}

pub fn is_true(o: &ObjRef) -> bool {
    lvalue(o) != 0
}

/// Floating-point view of a value.
pub fn fvalue(o: &ObjRef) -> f64 {
    let kind = o.kind();
    match &*kind {
        ObjKind::Float(v) => *v,
        _ => {
            drop(kind);
            lvalue(o) as f64
        }
    }
}

/// String rendering, the `to_string` conversion of the type registry.
pub fn svalue(o: &ObjRef) -> String {
    let kind = o.kind();
    match &*kind {
        ObjKind::Int(v) => v.to_string(),
        ObjKind::Float(v) => v.to_string(),
        ObjKind::Char(c) => c.to_string(),
        ObjKind::Str(s) => s.clone(),
        ObjKind::Binary(b) => hex_render(b),
        ObjKind::Vector(items) => {
            let items = items.clone();
            drop(kind);
            let parts: Vec<String> = items.iter().map(svalue).collect();
            format!("[{}]", parts.join(", "))
        }
        ObjKind::Map(entries) => {
            let entries = entries.clone();
            drop(kind);
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{} : {}", svalue(k), svalue(v)))
                .collect();
            format!("[{}]", parts.join(", "))
        }
        ObjKind::Matrix(m) => {
            let m = m.clone();
            drop(kind);
            let mut rows = Vec::with_capacity(m.rows);
            for r in 0..m.rows {
                let cols: Vec<String> = (0..m.cols)
                    .filter_map(|c| m.at(r, c).map(svalue))
                    .collect();
                rows.push(format!("[{}]", cols.join(", ")));
            }
            format!("[{}]", rows.join(", "))
        }
        ObjKind::Struct(s) => {
            let s = s.clone();
            drop(kind);
            let parts: Vec<String> = s
                .attributes
                .iter()
                .map(|(label, value)| format!("{} : {}", label, svalue(value)))
                .collect();
            format!("struct {{ {} }}", parts.join(", "))
        }
        ObjKind::Class(c) => format!("class {}", c.name),
        ObjKind::Reference(inner) => {
            let inner = inner.clone();
            drop(kind);
            match inner {
                Some(i) => svalue(&i),
                None => "null".to_string(),
            }
        }
        ObjKind::Alias(a) => format!("0x{:x}", a),
        ObjKind::Handle(h) => format!("0x{:x}", h),
        ObjKind::Extern(e) => format!("0x{:x}", e),
    }
}

fn hex_render(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The `to_int` conversion. Strings must lex as integers.
pub fn to_int(o: &ObjRef) -> Result<i64, crate::error::HybrisError> {
    let kind = o.kind();
    match &*kind {
        ObjKind::Int(v) => Ok(*v),
        ObjKind::Float(v) => Ok(*v as i64),
        ObjKind::Char(c) => Ok(*c as i64),
        ObjKind::Str(s) => s.trim().parse::<i64>().map_err(|_| {
            crate::error::HybrisError::type_error(format!("'{}' does not parse as an integer", s))
        }),
        ObjKind::Reference(inner) => {
            let inner = inner.clone();
            drop(kind);
            match inner {
                Some(i) => to_int(&i),
                None => Ok(0),
            }
        }
        other => Err(crate::error::HybrisError::type_error(format!(
            "cannot convert '{}' to integer",
            other.tag().name()
        ))),
    }
}

/// The `get_size` registry operation: item count for collections, byte
/// length for strings and binaries, width in bytes for scalars.
pub fn get_size(o: &ObjRef) -> usize {
    let kind = o.kind();
    match &*kind {
        ObjKind::Int(_) => std::mem::size_of::<i64>(),
        ObjKind::Float(_) => std::mem::size_of::<f64>(),
        ObjKind::Char(_) => 1,
        ObjKind::Str(s) => s.len(),
        ObjKind::Binary(b) => b.len(),
        ObjKind::Vector(v) => v.len(),
        ObjKind::Map(m) => m.len(),
        ObjKind::Matrix(m) => m.rows * m.cols,
        ObjKind::Struct(s) => s.attributes.len(),
        ObjKind::Class(c) => c.attribute_count(),
        ObjKind::Reference(inner) => {
            let inner = inner.clone();
            drop(kind);
            inner.map(|i| get_size(&i)).unwrap_or(0)
        }
        ObjKind::Alias(_) | ObjKind::Handle(_) | ObjKind::Extern(_) => {
            std::mem::size_of::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let o = Obj::int(1);
        assert!(!o.is_constant());
        o.set_constant();
        o.set_referenced(true);
        assert!(o.is_constant());
        assert!(o.is_referenced());
        o.set_referenced(false);
        assert!(o.is_constant());
        assert!(!o.is_referenced());
    }

    #[test]
    fn test_traverse_vector_yields_each_child_once() {
        let a = Obj::int(1);
        let b = Obj::int(2);
        let v = Obj::vector(vec![a.clone(), b.clone()]);
        assert!(Arc::ptr_eq(&traverse(&v, 0).unwrap(), &a));
        assert!(Arc::ptr_eq(&traverse(&v, 1).unwrap(), &b));
        assert!(traverse(&v, 2).is_none());
    }

    #[test]
    fn test_traverse_map_yields_keys_then_values() {
        let k = Obj::str("k");
        let v = Obj::int(1);
        let m = Obj::new(ObjKind::Map(vec![(k.clone(), v.clone())]));
        assert!(Arc::ptr_eq(&traverse(&m, 0).unwrap(), &k));
        assert!(Arc::ptr_eq(&traverse(&m, 1).unwrap(), &v));
        assert!(traverse(&m, 2).is_none());
    }

    #[test]
    fn test_traverse_self_referential_vector_does_not_deadlock() {
        let v = Obj::vector(vec![]);
        if let ObjKind::Vector(items) = &mut *v.kind() {
            items.push(v.clone());
        }
        let child = traverse(&v, 0).unwrap();
        assert!(Arc::ptr_eq(&child, &v));
    }

    #[test]
    fn test_svalue_scalars() {
        assert_eq!(svalue(&Obj::int(14)), "14");
        assert_eq!(svalue(&Obj::str("boom")), "boom");
        assert_eq!(svalue(&Obj::char('x')), "x");
        assert_eq!(svalue(&Obj::float(3.25)), "3.25");
    }

    #[test]
    fn test_svalue_collections() {
        let v = Obj::vector(vec![Obj::int(1), Obj::int(2)]);
        assert_eq!(svalue(&v), "[1, 2]");
        let m = Obj::new(ObjKind::Map(vec![(Obj::str("a"), Obj::int(1))]));
        assert_eq!(svalue(&m), "[a : 1]");
    }

    #[test]
    fn test_null_reference_renders_null() {
        let null = Obj::new(ObjKind::Reference(None));
        assert_eq!(svalue(&null), "null");
        assert_eq!(lvalue(&null), 0);
    }

    #[test]
    fn test_to_int_round_trips_integer_strings() {
        let s = Obj::str("42");
        assert_eq!(to_int(&s).unwrap(), 42);
        assert_eq!(svalue(&Obj::int(to_int(&s).unwrap())), "42");
        assert!(to_int(&Obj::str("nope")).is_err());
    }

    #[test]
    fn test_get_size() {
        assert_eq!(get_size(&Obj::int(5)), 8);
        assert_eq!(get_size(&Obj::str("abc")), 3);
        assert_eq!(get_size(&Obj::vector(vec![Obj::int(1)])), 1);
        assert_eq!(get_size(&Obj::char('a')), 1);
    }

    #[test]
    fn test_truthiness() {
        assert!(is_true(&Obj::int(1)));
        assert!(!is_true(&Obj::int(0)));
        assert!(is_true(&Obj::str("x")));
        assert!(!is_true(&Obj::str("")));
        assert!(is_true(&Obj::vector(vec![Obj::int(0)])));
    }
}
