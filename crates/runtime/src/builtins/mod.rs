//! The in-process standard modules.
//!
//! Every module registers through the same `Module`/`NamedFunction`
//! structures a dynamically loaded `.so` uses, so dispatch, caching and
//! argument validation treat them identically. Registration happens
//! once at VM initialization.

pub mod array;
pub mod conio;
pub mod encoding;
pub mod fileio;
pub mod map;
pub mod math;
pub mod mem;
pub mod pcre;
pub mod process;
pub mod reflection;
pub mod string;
pub mod threads;
pub mod time;
pub mod types;
pub mod xml;

use crate::frame::Frame;
use crate::value::{self, ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

pub fn register_all(vm: &Arc<Vm>) {
    conio::register(vm);
    types::register(vm);
    math::register(vm);
    array::register(vm);
    map::register(vm);
    string::register(vm);
    pcre::register(vm);
    time::register(vm);
    process::register(vm);
    reflection::register(vm);
    encoding::register(vm);
    xml::register(vm);
    mem::register(vm);
    fileio::register(vm);
    threads::register(vm);
}

/// Typed access to a native call frame's positional arguments.
///
/// Accessors are tolerant the way the original frame parser was:
/// missing arguments yield default values, extra arguments are simply
/// never read.
pub struct Args<'a> {
    frame: &'a Frame,
}

impl<'a> Args<'a> {
    pub fn new(frame: &'a Frame) -> Self {
        Args { frame }
    }

    pub fn argc(&self) -> usize {
        self.frame.size()
    }

    pub fn obj(&self, index: usize) -> Option<ObjRef> {
        self.frame.at(index)
    }

    pub fn int(&self, index: usize) -> i64 {
        self.obj(index).map(|o| value::lvalue(&o)).unwrap_or(0)
    }

    pub fn float(&self, index: usize) -> f64 {
        self.obj(index).map(|o| value::fvalue(&o)).unwrap_or(0.0)
    }

    pub fn bool(&self, index: usize) -> bool {
        self.obj(index).map(|o| value::is_true(&o)).unwrap_or(false)
    }

    pub fn string(&self, index: usize) -> String {
        self.obj(index).map(|o| value::svalue(&o)).unwrap_or_default()
    }

    pub fn char(&self, index: usize) -> char {
        self.obj(index)
            .and_then(|o| match &*o.kind() {
                ObjKind::Char(c) => Some(*c),
                _ => None,
            })
            .unwrap_or('\0')
    }

    /// Raw bytes of a binary or string argument.
    pub fn bytes(&self, index: usize) -> Vec<u8> {
        let Some(o) = self.obj(index) else {
            return Vec::new();
        };
        let binary = match &*o.kind() {
            ObjKind::Binary(b) => Some(b.clone()),
            _ => None,
        };
        binary.unwrap_or_else(|| value::svalue(&o).into_bytes())
    }

    pub fn is(&self, index: usize, tag: TypeTag) -> bool {
        self.obj(index).map(|o| o.tag() == tag).unwrap_or(false)
    }

    /// All arguments from `index` onward.
    pub fn rest(&self, index: usize) -> Vec<ObjRef> {
        (index..self.argc()).filter_map(|i| self.obj(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;

    #[test]
    fn test_args_defaults_for_missing_positions() {
        let frame = Frame::new("test");
        frame.push(Obj::int(5));
        let args = Args::new(&frame);
        assert_eq!(args.argc(), 1);
        assert_eq!(args.int(0), 5);
        // excess positions fall back to defaults
        assert_eq!(args.int(7), 0);
        assert_eq!(args.string(7), "");
        assert!(!args.bool(7));
    }

    #[test]
    fn test_args_typed_views() {
        let frame = Frame::new("test");
        frame.push(Obj::str("12"));
        frame.push(Obj::float(2.5));
        frame.push(Obj::char('x'));
        let args = Args::new(&frame);
        assert_eq!(args.string(0), "12");
        assert_eq!(args.float(1), 2.5);
        assert_eq!(args.char(2), 'x');
        assert!(args.is(0, TypeTag::Str));
        assert!(!args.is(1, TypeTag::Int));
    }

    #[test]
    fn test_rest_collects_tail() {
        let frame = Frame::new("test");
        frame.push(Obj::int(1));
        frame.push(Obj::int(2));
        frame.push(Obj::int(3));
        let args = Args::new(&frame);
        assert_eq!(args.rest(1).len(), 2);
    }
}
