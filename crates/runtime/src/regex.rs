//! Regular expression support: the `~=` operator and the compiled
//! pattern cache.
//!
//! A pattern may carry trailing option flags after a final slash
//! (`"^h.*s/i"`); they are rewritten into inline flags. Compiled
//! patterns are cached by their full source text in a VM-wide table
//! guarded by the regex-cache mutex, so compiling the same text twice
//! yields the same compiled object.

use crate::error::HybrisError;
use crate::value::{self, ObjKind, ObjRef};
use crate::vm::Vm;
use ::regex::Regex;
use std::sync::Arc;

/// Split `pattern/flags` into the bare pattern and its option flags.
/// The suffix is treated as flags only when every character after the
/// last slash is a known option.
fn split_flags(pattern: &str) -> (&str, &str) {
    if let Some(pos) = pattern.rfind('/') {
        let (head, tail) = (&pattern[..pos], &pattern[pos + 1..]);
        if !head.is_empty()
            && !tail.is_empty()
            && tail.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x' | 'U'))
        {
            return (head, tail);
        }
    }
    (pattern, "")
}

/// Compile through the cache. Returns the shared compiled object.
pub fn compile(vm: &Vm, pattern: &str) -> Result<Arc<Regex>, HybrisError> {
    if let Some(compiled) = vm.pcre_cache().get(pattern) {
        return Ok(compiled.clone());
    }

    let (bare, flags) = split_flags(pattern);
    let source = if flags.is_empty() {
        bare.to_string()
    } else {
        format!("(?{}){}", flags, bare)
    };
    let compiled = Arc::new(Regex::new(&source).map_err(|e| {
        HybrisError::runtime(format!("invalid regular expression '{}': {}", pattern, e))
    })?);

    vm.pcre_cache()
        .insert(pattern.to_string(), compiled.clone());
    Ok(compiled)
}

/// The `subject ~= pattern` operation. With capture groups in the
/// pattern, yields the vector of captures across all matches; without,
/// a boolean integer.
pub fn apply(vm: &Vm, subject: &ObjRef, pattern: &ObjRef) -> Result<ObjRef, HybrisError> {
    let text = value::svalue(subject);
    let source = value::svalue(pattern);
    let re = compile(vm, &source)?;

    if re.captures_len() > 1 {
        let mut captures = Vec::new();
        for found in re.captures_iter(&text) {
            for group in found.iter().skip(1).flatten() {
                captures.push(group.as_str().to_string());
            }
        }
        let items = captures
            .into_iter()
            .map(|c| vm.track(ObjKind::Str(c)))
            .collect();
        return Ok(vm.track(ObjKind::Vector(items)));
    }

    Ok(vm.track(ObjKind::Int(re.is_match(&text) as i64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use crate::vm::VmArgs;

    fn vm() -> Arc<Vm> {
        Vm::new(VmArgs::default())
    }

    #[test]
    fn test_boolean_match_without_captures() {
        let vm = vm();
        let r = apply(&vm, &Obj::str("hello world"), &Obj::str("wo.ld")).unwrap();
        assert_eq!(value::lvalue(&r), 1);
        let r = apply(&vm, &Obj::str("hello"), &Obj::str("^x")).unwrap();
        assert_eq!(value::lvalue(&r), 0);
    }

    #[test]
    fn test_captures_across_all_matches() {
        let vm = vm();
        let r = apply(&vm, &Obj::str("a1 b2 c3"), &Obj::str("([a-z])([0-9])")).unwrap();
        assert_eq!(value::svalue(&r), "[a, 1, b, 2, c, 3]");
    }

    #[test]
    fn test_trailing_flags_after_slash() {
        let vm = vm();
        let r = apply(&vm, &Obj::str("HELLO"), &Obj::str("^hel/i")).unwrap();
        assert_eq!(value::lvalue(&r), 1);
        let r = apply(&vm, &Obj::str("HELLO"), &Obj::str("^hel")).unwrap();
        assert_eq!(value::lvalue(&r), 0);
    }

    #[test]
    fn test_slash_without_flags_stays_in_pattern() {
        let vm = vm();
        let r = apply(&vm, &Obj::str("a/b"), &Obj::str("a/b")).unwrap();
        assert_eq!(value::lvalue(&r), 1);
    }

    #[test]
    fn test_cache_returns_same_compiled_object() {
        let vm = vm();
        let first = compile(&vm, "^cache[0-9]+$").unwrap();
        let second = compile(&vm, "^cache[0-9]+$").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_invalid_pattern_is_runtime_error() {
        let vm = vm();
        let err = apply(&vm, &Obj::str("x"), &Obj::str("(unclosed")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Runtime);
    }
}
