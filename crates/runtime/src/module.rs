//! Module and builtin dispatch.
//!
//! A module is a named bundle of native functions, each declaring its
//! permitted arities and per-argument permitted types. The in-process
//! standard modules and dynamically loaded `.so` modules register
//! through the same structures, so the lookup cache and the call-site
//! validation cannot tell them apart.
//!
//! Dotted import paths resolve under the library root: `a.b.c` loads
//! `<root>/a/b/c.so`, a trailing `*` loads a directory tree recursively,
//! and a leading `*` is a syntax error.

use crate::error::HybrisError;
use crate::frame::Frame;
use crate::value::{ObjRef, TypeTag};
use crate::vm::Vm;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A native function: the VM handle is shared so builtins that spawn
/// threads can keep the VM alive from the worker.
pub type NativeFn = fn(&Arc<Vm>, &Frame) -> ObjRef;

/// Permitted call arities, ordered from minimum accepted upward. A call
/// with `argc` arguments succeeds when some descriptor is >= `argc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AritySpec {
    /// Any number of arguments.
    Any,
    List(Vec<usize>),
}

/// Permitted types for one positional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSpec {
    Any,
    OneOf(Vec<TypeTag>),
}

/// One exported native function with its declared signature.
pub struct NamedFunction {
    pub identifier: String,
    pub function: NativeFn,
    pub arities: AritySpec,
    /// Per-positional-argument type sets; unlisted positions accept
    /// anything.
    pub types: Vec<TypeSpec>,
}

impl NamedFunction {
    pub fn new(identifier: impl Into<String>, function: NativeFn) -> Self {
        NamedFunction {
            identifier: identifier.into(),
            function,
            arities: AritySpec::Any,
            types: Vec::new(),
        }
    }

    pub fn with_arities(mut self, arities: &[usize]) -> Self {
        self.arities = AritySpec::List(arities.to_vec());
        self
    }

    pub fn with_types(mut self, types: Vec<TypeSpec>) -> Self {
        self.types = types;
        self
    }

    /// Select the first arity descriptor >= the actual argument count.
    pub fn check_arity(&self, argc: usize) -> Result<(), HybrisError> {
        match &self.arities {
            AritySpec::Any => Ok(()),
            AritySpec::List(list) => {
                if list.iter().any(|&accepted| accepted >= argc) {
                    Ok(())
                } else {
                    let max = list.iter().max().copied().unwrap_or(0);
                    Err(HybrisError::syntax(format!(
                        "function '{}' called with {} arguments, at most {} accepted",
                        self.identifier, argc, max
                    )))
                }
            }
        }
    }

    /// Validate one positional argument against its declared type set.
    pub fn check_type(&self, position: usize, tag: TypeTag) -> Result<(), HybrisError> {
        match self.types.get(position) {
            None | Some(TypeSpec::Any) => Ok(()),
            Some(TypeSpec::OneOf(allowed)) => {
                if allowed.contains(&tag) {
                    Ok(())
                } else {
                    let names: Vec<&str> = allowed.iter().map(|t| t.name()).collect();
                    Err(HybrisError::type_error(format!(
                        "invalid '{}' type for argument {} of '{}', expected {}",
                        tag.name(),
                        position + 1,
                        self.identifier,
                        names.join(" or ")
                    )))
                }
            }
        }
    }
}

/// A loaded module. The library handle, when present, keeps the dynamic
/// object mapped for the VM's lifetime — modules never unload, which is
/// also why the lookup cache needs no eviction.
pub struct Module {
    pub name: String,
    pub path: String,
    pub functions: Vec<Arc<NamedFunction>>,
    #[allow(dead_code)]
    library: Option<libloading::Library>,
}

/// Register an in-process standard module.
pub fn register_builtin(vm: &Vm, name: &str, functions: Vec<NamedFunction>) {
    let module = Module {
        name: name.to_string(),
        path: "<builtin>".to_string(),
        functions: functions.into_iter().map(Arc::new).collect(),
        library: None,
    };
    vm.modules().push(Arc::new(module));
}

/// Load a module by its dotted name, or a whole namespace with a
/// trailing `*`.
pub fn load(vm: &Arc<Vm>, dotted: &str) -> Result<(), HybrisError> {
    let groups: Vec<&str> = dotted.split('.').collect();
    let mut path = PathBuf::from(vm.lib_path());
    let last = groups.len() - 1;

    for (i, group) in groups.iter().enumerate() {
        if *group == "*" {
            if i == 0 {
                return Err(HybrisError::syntax("could not use '*' as main namespace"));
            }
            return load_namespace(vm, &path);
        }
        if i == last {
            path.push(format!("{}.so", group));
            return load_dynamic(vm, &path, group);
        }
        path.push(group);
    }
    Ok(())
}

/// Recursively load every `.so` module under a directory.
pub fn load_namespace(vm: &Arc<Vm>, dir: &Path) -> Result<(), HybrisError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        HybrisError::runtime(format!(
            "could not open directory '{}' for reading: {}",
            dir.display(),
            e
        ))
    })?;
    for entry in entries {
        let entry = entry
            .map_err(|e| HybrisError::runtime(format!("could not read directory entry: {}", e)))?;
        let path = entry.path();
        if path.is_dir() {
            load_namespace(vm, &path)?;
        } else if path.extension().is_some_and(|ext| ext == "so") {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            load_dynamic(vm, &path, &name)?;
        }
    }
    Ok(())
}

/// Load one `.so` module. Exported symbols, per the module ABI:
/// `hybris_module_name`, `hybris_module_init` (optional, runs once) and
/// `hybris_module_functions`.
pub fn load_dynamic(vm: &Arc<Vm>, path: &Path, name: &str) -> Result<(), HybrisError> {
    if vm.modules().iter().any(|m| m.name == name) {
        return Ok(());
    }

    // Safety: the module is a Hybris native extension built against
    // this crate; the exported symbols carry the types declared by the
    // module ABI. A module built with a mismatched ABI is undefined
    // behavior, the same trust the host loader extends to any plugin.
    let (library, init, functions) = unsafe {
        let library = libloading::Library::new(path).map_err(|e| {
            HybrisError::runtime(format!("module '{}' could not be loaded: {}", path.display(), e))
        })?;
        let init = library
            .get::<fn(&Arc<Vm>)>(b"hybris_module_init")
            .ok()
            .map(|symbol| *symbol);
        let functions = *library
            .get::<fn() -> Vec<NamedFunction>>(b"hybris_module_functions")
            .map_err(|e| {
                HybrisError::runtime(format!(
                    "could not find module '{}' functions pointer: {}",
                    path.display(),
                    e
                ))
            })?;
        (library, init, functions)
    };

    if let Some(init) = init {
        init(vm);
    }

    let module = Module {
        name: name.to_string(),
        path: path.display().to_string(),
        functions: functions().into_iter().map(Arc::new).collect(),
        library: Some(library),
    };
    tracing::debug!(module = name, path = %module.path, functions = module.functions.len(), "module loaded");
    vm.modules().push(Arc::new(module));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use crate::vm::VmArgs;

    fn nop(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
        vm.unit()
    }

    #[test]
    fn test_arity_any_accepts_everything() {
        let f = NamedFunction::new("f", nop);
        assert!(f.check_arity(0).is_ok());
        assert!(f.check_arity(100).is_ok());
    }

    #[test]
    fn test_arity_descriptor_accepts_up_to_listed() {
        let f = NamedFunction::new("f", nop).with_arities(&[2]);
        assert!(f.check_arity(0).is_ok());
        assert!(f.check_arity(2).is_ok());
        let err = f.check_arity(3).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
    }

    #[test]
    fn test_arity_multiple_descriptors() {
        let f = NamedFunction::new("f", nop).with_arities(&[1, 3]);
        assert!(f.check_arity(3).is_ok());
        assert!(f.check_arity(4).is_err());
    }

    #[test]
    fn test_type_check_names_position() {
        let f = NamedFunction::new("strlen", nop)
            .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]);
        assert!(f.check_type(0, TypeTag::Str).is_ok());
        let err = f.check_type(0, TypeTag::Int).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Type);
        assert!(err.message.contains("argument 1"));
        // undeclared positions accept anything
        assert!(f.check_type(1, TypeTag::Vector).is_ok());
    }

    #[test]
    fn test_leading_star_is_syntax_error() {
        let vm = Vm::new(VmArgs::default());
        let err = load(&vm, "*.foo").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
    }

    #[test]
    fn test_builtin_registration_and_lookup() {
        let vm = Vm::new(VmArgs::default());
        let before = vm.native_function("test_fn_xyz");
        assert!(before.is_none());
        register_builtin(&vm, "test.mod", vec![NamedFunction::new("test_fn_xyz", nop)]);
        let found = vm.native_function("test_fn_xyz").unwrap();
        assert_eq!(found.identifier, "test_fn_xyz");
        // second resolution hits the cache and returns the same entry
        let again = vm.native_function("test_fn_xyz").unwrap();
        assert!(Arc::ptr_eq(&found, &again));
    }

    #[test]
    fn test_first_loaded_module_shadows_later() {
        let vm = Vm::new(VmArgs::default());
        fn one(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
            let _ = vm;
            Obj::int(1)
        }
        fn two(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
            let _ = vm;
            Obj::int(2)
        }
        register_builtin(&vm, "first", vec![NamedFunction::new("shadowed", one)]);
        register_builtin(&vm, "second", vec![NamedFunction::new("shadowed", two)]);
        let found = vm.native_function("shadowed").unwrap();
        let result = (found.function)(&vm, &Frame::new("t"));
        assert_eq!(crate::value::lvalue(&result), 1);
    }
}
