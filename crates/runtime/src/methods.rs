//! Built-in methods of the primitive types.
//!
//! Method-call syntax on non-class values dispatches here: vectors know
//! `size`/`pop`/`remove`/`contains`/`join`, maps know `size`/`has`/
//! `keys`/`values`/`pop`/`remove`, strings know `length`/`find`/`split`/
//! `trim`/`replace`/`toupper`/`tolower`. Returns `None` for a method
//! the receiver's type does not have.

use crate::error::HybrisError;
use crate::ops;
use crate::value::{self, ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;

type MethodResult = Option<Result<ObjRef, HybrisError>>;

pub fn dispatch(vm: &Vm, owner: &ObjRef, method: &str, argv: &[ObjRef]) -> MethodResult {
    match owner.tag() {
        TypeTag::Vector => vector_method(vm, owner, method, argv),
        TypeTag::Map => map_method(vm, owner, method, argv),
        TypeTag::Str => string_method(vm, owner, method, argv),
        TypeTag::Binary => binary_method(vm, owner, method, argv),
        TypeTag::Struct => struct_method(vm, owner, method, argv),
        _ => None,
    }
}

fn arity(method: &str, argv: &[ObjRef], expected: usize) -> Result<(), HybrisError> {
    if argv.len() != expected {
        return Err(HybrisError::syntax(format!(
            "method '{}' requires {} parameter{} (called with {})",
            method,
            expected,
            if expected == 1 { "" } else { "s" },
            argv.len()
        )));
    }
    Ok(())
}

fn vector_method(vm: &Vm, owner: &ObjRef, method: &str, argv: &[ObjRef]) -> MethodResult {
    match method {
        "size" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Int(value::get_size(owner) as i64))
        })),
        "pop" => Some(arity(method, argv, 0).and_then(|()| ops::cl_pop(owner))),
        "remove" => Some(arity(method, argv, 1).and_then(|()| ops::cl_remove(owner, &argv[0]))),
        "contains" => {
            Some(arity(method, argv, 1).and_then(|()| ops::cl_contains(vm, owner, &argv[0])))
        }
        "join" => Some(arity(method, argv, 1).map(|()| {
            let glue = value::svalue(&argv[0]);
            let items = match &*owner.kind() {
                ObjKind::Vector(items) => items.clone(),
                _ => Vec::new(),
            };
            let parts: Vec<String> = items.iter().map(value::svalue).collect();
            vm.track(ObjKind::Str(parts.join(&glue)))
        })),
        _ => None,
    }
}

fn map_method(vm: &Vm, owner: &ObjRef, method: &str, argv: &[ObjRef]) -> MethodResult {
    let entries = match &*owner.kind() {
        ObjKind::Map(entries) => entries.clone(),
        _ => Vec::new(),
    };
    match method {
        "size" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Int(entries.len() as i64))
        })),
        "has" => Some(arity(method, argv, 1).map(|()| {
            let found = entries.iter().any(|(k, _)| ops::equals(k, &argv[0]));
            vm.track(ObjKind::Int(found as i64))
        })),
        "keys" => Some(arity(method, argv, 0).map(|()| {
            let keys = entries.iter().map(|(k, _)| k.clone()).collect();
            vm.track(ObjKind::Vector(keys))
        })),
        "values" => Some(arity(method, argv, 0).map(|()| {
            let values = entries.iter().map(|(_, v)| v.clone()).collect();
            vm.track(ObjKind::Vector(values))
        })),
        "remove" => Some(arity(method, argv, 1).and_then(|()| ops::cl_remove(owner, &argv[0]))),
        "pop" => Some(arity(method, argv, 0).and_then(|()| {
            let last_key = entries
                .last()
                .map(|(k, _)| k.clone())
                .ok_or_else(|| HybrisError::index("pop from an empty map"))?;
            ops::cl_remove(owner, &last_key)
        })),
        _ => None,
    }
}

fn string_method(vm: &Vm, owner: &ObjRef, method: &str, argv: &[ObjRef]) -> MethodResult {
    let text = value::svalue(owner);
    match method {
        "length" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Int(text.len() as i64))
        })),
        "find" => Some(arity(method, argv, 1).map(|()| {
            let needle = value::svalue(&argv[0]);
            let position = text
                .find(&needle)
                .map(|byte| text[..byte].chars().count() as i64)
                .unwrap_or(-1);
            vm.track(ObjKind::Int(position))
        })),
        "split" => Some(arity(method, argv, 1).map(|()| {
            let separator = value::svalue(&argv[0]);
            let parts: Vec<ObjRef> = text
                .split(&separator)
                .map(|part| vm.track(ObjKind::Str(part.to_string())))
                .collect();
            vm.track(ObjKind::Vector(parts))
        })),
        "trim" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Str(text.trim().to_string()))
        })),
        "replace" => Some(arity(method, argv, 2).map(|()| {
            let from = value::svalue(&argv[0]);
            let to = value::svalue(&argv[1]);
            vm.track(ObjKind::Str(text.replace(&from, &to)))
        })),
        "toupper" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Str(text.to_uppercase()))
        })),
        "tolower" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Str(text.to_lowercase()))
        })),
        _ => None,
    }
}

fn binary_method(vm: &Vm, owner: &ObjRef, method: &str, argv: &[ObjRef]) -> MethodResult {
    match method {
        "size" => Some(arity(method, argv, 0).map(|()| {
            vm.track(ObjKind::Int(value::get_size(owner) as i64))
        })),
        _ => None,
    }
}

fn struct_method(vm: &Vm, owner: &ObjRef, method: &str, argv: &[ObjRef]) -> MethodResult {
    match method {
        "attributes" => Some(arity(method, argv, 0).map(|()| {
            let labels = match &*owner.kind() {
                ObjKind::Struct(s) => s
                    .attributes
                    .iter()
                    .map(|(label, _)| vm.track(ObjKind::Str(label.clone())))
                    .collect(),
                _ => Vec::new(),
            };
            vm.track(ObjKind::Vector(labels))
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use crate::vm::VmArgs;
    use std::sync::Arc;

    fn vm() -> Arc<Vm> {
        Vm::new(VmArgs::default())
    }

    #[test]
    fn test_vector_size_and_contains() {
        let vm = vm();
        let v = Obj::vector(vec![Obj::int(1), Obj::int(2), Obj::int(3), Obj::int(4)]);
        let size = dispatch(&vm, &v, "size", &[]).unwrap().unwrap();
        assert_eq!(value::lvalue(&size), 4);
        let index = dispatch(&vm, &v, "contains", &[Obj::int(3)]).unwrap().unwrap();
        assert_eq!(value::lvalue(&index), 2);
    }

    #[test]
    fn test_vector_join() {
        let vm = vm();
        let v = Obj::vector(vec![Obj::int(1), Obj::str("two")]);
        let joined = dispatch(&vm, &v, "join", &[Obj::str("-")]).unwrap().unwrap();
        assert_eq!(value::svalue(&joined), "1-two");
    }

    #[test]
    fn test_map_keys_and_has() {
        let vm = vm();
        let m = Obj::new(ObjKind::Map(vec![
            (Obj::str("a"), Obj::int(1)),
            (Obj::str("b"), Obj::int(2)),
        ]));
        let keys = dispatch(&vm, &m, "keys", &[]).unwrap().unwrap();
        assert_eq!(value::svalue(&keys), "[a, b]");
        let has = dispatch(&vm, &m, "has", &[Obj::str("b")]).unwrap().unwrap();
        assert_eq!(value::lvalue(&has), 1);
        let has = dispatch(&vm, &m, "has", &[Obj::str("z")]).unwrap().unwrap();
        assert_eq!(value::lvalue(&has), 0);
    }

    #[test]
    fn test_string_methods() {
        let vm = vm();
        let s = Obj::str("  hello world  ");
        let trimmed = dispatch(&vm, &s, "trim", &[]).unwrap().unwrap();
        assert_eq!(value::svalue(&trimmed), "hello world");
        let found = dispatch(&vm, &trimmed, "find", &[Obj::str("world")])
            .unwrap()
            .unwrap();
        assert_eq!(value::lvalue(&found), 6);
        let missing = dispatch(&vm, &trimmed, "find", &[Obj::str("xyz")])
            .unwrap()
            .unwrap();
        assert_eq!(value::lvalue(&missing), -1);
    }

    #[test]
    fn test_unknown_method_is_none() {
        let vm = vm();
        let v = Obj::vector(vec![]);
        assert!(dispatch(&vm, &v, "nonsense", &[]).is_none());
        assert!(dispatch(&vm, &Obj::int(1), "size", &[]).is_none());
    }

    #[test]
    fn test_wrong_arity_is_error() {
        let vm = vm();
        let v = Obj::vector(vec![]);
        let err = dispatch(&vm, &v, "contains", &[]).unwrap().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
    }
}
