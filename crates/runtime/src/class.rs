//! Class metadata: attribute tables, method prototype tables and access
//! control.
//!
//! A class value extends a structure with methods and access modifiers.
//! One method name may own several prototypes, distinguished by arity;
//! lookup is keyed by `(name, argc)`. Static attributes share their
//! storage object across the prototype, every instance and every
//! subclass, so writing through one is visible to all.

use crate::error::HybrisError;
use crate::value::ObjRef;
use hybris_parser::ast::{Access, Node, NodeKind};
use std::sync::Arc;

/// One declared attribute of a class.
#[derive(Debug, Clone)]
pub struct ClassAttribute {
    pub name: String,
    pub access: Access,
    pub is_static: bool,
    /// The class the attribute was declared in; inherited copies keep
    /// their definer for private-access checks.
    pub defined_in: String,
    pub value: ObjRef,
}

/// One concrete arity of a method.
#[derive(Debug, Clone)]
pub struct MethodPrototype {
    pub argc: usize,
    pub vargs: bool,
    pub access: Access,
    pub is_static: bool,
    pub defined_in: String,
    /// The `MethodDecl` node; its single child is the body.
    pub node: Arc<Node>,
}

/// A method name and its prototypes.
#[derive(Debug, Clone)]
pub struct ClassMethod {
    pub name: String,
    pub prototypes: Vec<MethodPrototype>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassData {
    pub name: String,
    pub attributes: Vec<ClassAttribute>,
    pub methods: Vec<ClassMethod>,
}

impl ClassData {
    pub fn new(name: impl Into<String>) -> Self {
        ClassData {
            name: name.into(),
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Payload bytes attributable to the tables themselves.
    pub fn storage_size(&self) -> usize {
        self.attributes.len() * 2 * std::mem::size_of::<ObjRef>()
            + self.methods.len() * std::mem::size_of::<ClassMethod>()
    }

    pub fn get_attribute(&self, name: &str) -> Option<&ClassAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Define or redefine an attribute. A subclass redefinition keeps
    /// the subclass as definer.
    pub fn define_attribute(
        &mut self,
        name: impl Into<String>,
        access: Access,
        is_static: bool,
        defined_in: impl Into<String>,
        value: ObjRef,
    ) {
        let name = name.into();
        if let Some(existing) = self.attributes.iter_mut().find(|a| a.name == name) {
            existing.access = access;
            existing.is_static = is_static;
            existing.defined_in = defined_in.into();
            existing.value = value;
            return;
        }
        self.attributes.push(ClassAttribute {
            name,
            access,
            is_static,
            defined_in: defined_in.into(),
            value,
        });
    }

    /// Rebind a non-static attribute, or write through a static one so
    /// every sharer of the storage observes the update.
    pub fn set_attribute(&mut self, name: &str, value: ObjRef) -> bool {
        for attr in &mut self.attributes {
            if attr.name == name {
                if attr.is_static {
                    let new_kind = value.kind().clone();
                    *attr.value.kind() = new_kind;
                } else {
                    attr.value = value;
                }
                return true;
            }
        }
        false
    }

    /// Register a method prototype from its declaration node. A
    /// prototype with the same name and arity replaces the previous one,
    /// keeping arity unique within the method — this is also how a
    /// subclass overrides an inherited method.
    pub fn define_method(&mut self, node: Arc<Node>, defined_in: impl Into<String>) {
        let NodeKind::MethodDecl {
            name,
            params,
            vargs,
            access,
            is_static,
        } = &node.kind
        else {
            return;
        };
        let prototype = MethodPrototype {
            argc: params.len(),
            vargs: *vargs,
            access: *access,
            is_static: *is_static,
            defined_in: defined_in.into(),
            node: node.clone(),
        };
        let index = match self.methods.iter().position(|m| m.name == *name) {
            Some(index) => index,
            None => {
                self.methods.push(ClassMethod {
                    name: name.clone(),
                    prototypes: Vec::new(),
                });
                self.methods.len() - 1
            }
        };
        let method = &mut self.methods[index];
        if let Some(existing) = method
            .prototypes
            .iter_mut()
            .find(|p| p.argc == prototype.argc)
        {
            *existing = prototype;
        } else {
            method.prototypes.push(prototype);
        }
    }

    /// Resolve a method by name and call arity: an exact-arity prototype
    /// wins, otherwise a varargs prototype accepting at least `argc`.
    pub fn find_method(&self, name: &str, argc: usize) -> Option<&MethodPrototype> {
        let method = self.methods.iter().find(|m| m.name == name)?;
        method
            .prototypes
            .iter()
            .find(|p| !p.vargs && p.argc == argc)
            .or_else(|| {
                method
                    .prototypes
                    .iter()
                    .find(|p| p.vargs && argc >= p.argc)
            })
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name.clone()).collect()
    }

    /// GC tracing over the attribute values (methods are AST, not
    /// values).
    pub fn traverse(&self, index: usize) -> Option<ObjRef> {
        self.attributes.get(index).map(|a| a.value.clone())
    }
}

/// Enforce an access modifier for an attribute or method lookup.
///
/// Public allows any caller. Protected permits only access through
/// `self`. Private permits access through `self` only while executing a
/// method of the defining class itself.
pub fn check_access(
    access: Access,
    member: &str,
    class_name: &str,
    defined_in: &str,
    owner_is_self: bool,
    current_class: Option<&str>,
) -> Result<(), HybrisError> {
    match access {
        Access::Public => Ok(()),
        Access::Protected => {
            if owner_is_self {
                Ok(())
            } else {
                Err(HybrisError::access(format!(
                    "protected member '{}' of class '{}' can be accessed only through 'self'",
                    member, class_name
                )))
            }
        }
        Access::Private => {
            if owner_is_self && current_class == Some(defined_in) {
                Ok(())
            } else {
                Err(HybrisError::access(format!(
                    "private member '{}' can be accessed only within class '{}'",
                    member, defined_in
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use hybris_parser::ast::Param;

    fn method_node(name: &str, argc: usize, vargs: bool) -> Arc<Node> {
        let params = (0..argc)
            .map(|i| Param {
                name: format!("p{}", i),
            })
            .collect();
        Arc::new(Node::with_children(
            NodeKind::MethodDecl {
                name: name.to_string(),
                params,
                vargs,
                access: Access::Public,
                is_static: false,
            },
            1,
            vec![Arc::new(Node::new(NodeKind::Block, 1))],
        ))
    }

    #[test]
    fn test_method_lookup_by_arity() {
        let mut class = ClassData::new("C");
        class.define_method(method_node("m", 1, false), "C");
        class.define_method(method_node("m", 2, false), "C");
        assert_eq!(class.find_method("m", 1).unwrap().argc, 1);
        assert_eq!(class.find_method("m", 2).unwrap().argc, 2);
        assert!(class.find_method("m", 3).is_none());
        assert!(class.find_method("other", 1).is_none());
    }

    #[test]
    fn test_method_arity_is_unique_within_name() {
        let mut class = ClassData::new("C");
        class.define_method(method_node("m", 1, false), "C");
        class.define_method(method_node("m", 1, false), "D");
        let method = class.methods.iter().find(|m| m.name == "m").unwrap();
        assert_eq!(method.prototypes.len(), 1);
        assert_eq!(method.prototypes[0].defined_in, "D");
    }

    #[test]
    fn test_vargs_method_accepts_extra_arguments() {
        let mut class = ClassData::new("C");
        class.define_method(method_node("m", 1, true), "C");
        assert!(class.find_method("m", 1).is_some());
        assert!(class.find_method("m", 5).is_some());
        assert!(class.find_method("m", 0).is_none());
    }

    #[test]
    fn test_static_attribute_writes_through_shared_storage() {
        let mut class = ClassData::new("C");
        let storage = Obj::int(0);
        class.define_attribute("count", Access::Public, true, "C", storage.clone());
        class.set_attribute("count", Obj::int(42));
        assert_eq!(crate::value::lvalue(&storage), 42);
    }

    #[test]
    fn test_non_static_attribute_rebinds() {
        let mut class = ClassData::new("C");
        let original = Obj::int(0);
        class.define_attribute("x", Access::Public, false, "C", original.clone());
        class.set_attribute("x", Obj::int(7));
        assert_eq!(crate::value::lvalue(&original), 0);
        assert_eq!(
            crate::value::lvalue(&class.get_attribute("x").unwrap().value),
            7
        );
    }

    #[test]
    fn test_access_rules() {
        assert!(check_access(Access::Public, "a", "C", "C", false, None).is_ok());
        assert!(check_access(Access::Protected, "a", "C", "C", true, None).is_ok());
        assert!(check_access(Access::Protected, "a", "C", "C", false, None).is_err());
        assert!(check_access(Access::Private, "a", "C", "C", true, Some("C")).is_ok());
        assert!(check_access(Access::Private, "a", "C", "C", true, Some("D")).is_err());
        assert!(check_access(Access::Private, "a", "C", "C", false, Some("C")).is_err());
    }
}
