//! Abstract syntax tree for Hybris.
//!
//! Every node carries a kind discriminator, a line number and a child
//! list; kind-specific payloads (names, parameter lists, access
//! modifiers) live on the `NodeKind` variants themselves. Function and
//! method bodies are shared with the runtime via `Arc`, which is what a
//! first-class function handle (an alias value) ultimately points at.

use std::fmt;
use std::sync::Arc;

/// A literal embedded in the source text.
///
/// Literal nodes are interned by the runtime on first evaluation and
/// flagged so the collector never touches them.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
}

/// Attribute and method access modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
    Private,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Public => write!(f, "public"),
            Access::Protected => write!(f, "protected"),
            Access::Private => write!(f, "private"),
        }
    }
}

/// Binary operators, including the regex-match operator `~=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LAnd,
    LOr,
    RegexMatch,
}

/// Unary operators. `Inc`/`Dec` cover both prefix and postfix forms,
/// `Fact` is the postfix factorial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    BitNot,
    LNot,
    Inc,
    Dec,
    Fact,
}

/// One formal parameter of a function or method.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
}

/// Node kind discriminator plus kind-specific fields.
///
/// Children not named here live in `Node::children`; the comment on each
/// variant documents their layout.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Embedded literal value. No children.
    Constant(Literal),

    /// Identifier lookup. No children.
    Identifier(String),

    /// Attribute access `owner.member`. children: `[owner]`.
    Attribute { member: String },

    /// Method call `owner.method(args…)`. children: `[owner, args…]`.
    MethodCall { method: String },

    /// Function declaration. children: body statements.
    FunctionDecl {
        name: String,
        params: Vec<Param>,
        vargs: bool,
    },

    /// Method declaration inside a class. children: body statements.
    MethodDecl {
        name: String,
        params: Vec<Param>,
        vargs: bool,
        access: Access,
        is_static: bool,
    },

    /// Structure type declaration. No children.
    StructDecl {
        name: String,
        attributes: Vec<String>,
    },

    /// Class type declaration. children: `AttrDecl` and `MethodDecl`
    /// nodes, in source order.
    ClassDecl {
        name: String,
        extends: Vec<String>,
    },

    /// Class attribute declaration. children: `[initializer]` for static
    /// attributes with an initializer, empty otherwise.
    AttrDecl {
        name: String,
        access: Access,
        is_static: bool,
    },

    /// `new Type(args…)`. children: constructor arguments.
    New { type_name: String },

    /// Call by name. children: arguments.
    Call { name: String },

    /// Call through an expression yielding an alias. children:
    /// `[callee, args…]`.
    CallAlias,

    /// Statement sequence. children: statements.
    Block,

    /// `if (cond) then [else]`. children: `[cond, then]` or
    /// `[cond, then, else]`.
    If,

    /// `unless (cond) body`. children: `[cond, body]`.
    Unless,

    /// `while (cond) body`. children: `[cond, body]`.
    While,

    /// `do body while (cond);`. children: `[body, cond]`.
    DoWhile,

    /// `for (init; cond; step) body`. children: `[init, cond, step, body]`.
    For,

    /// `foreach (ident of expr) body`. children: `[iterable, body]`.
    Foreach { ident: String },

    /// `foreach (key -> value of expr) body`. children: `[iterable, body]`.
    ForeachMapping { key: String, value: String },

    /// `switch (target) { case…: …; default: … }`. children: `[target,
    /// case-expr, case-body, case-expr, case-body, …]`; the default arm,
    /// if any, is carried on the variant.
    Switch { default: Option<Arc<Node>> },

    /// `try { } catch (ident) { } [finally { }]`. children:
    /// `[try-body, catch-body]` or `[try-body, catch-body, finally-body]`.
    TryCatch { ident: String },

    /// `throw expr;`. children: `[expr]`.
    Throw,

    /// `return expr;`. children: `[expr]`.
    Return,

    /// `break;`. No children.
    Break,

    /// `next;`. No children.
    Next,

    /// `lvalue = expr`. children: `[lvalue, expr]`.
    Assign,

    /// `lvalue op= expr`. children: `[lvalue, expr]`.
    InplaceBinary(BinOp),

    /// `(a, b, c) = expr`. children: `[expr]`.
    Explode { idents: Vec<String> },

    /// Binary operator. children: `[lhs, rhs]`.
    Binary(BinOp),

    /// Unary operator. children: `[operand]`.
    Unary(UnOp),

    /// `expr[index]`. children: `[expr, index]`.
    SubscriptGet,

    /// `expr[index] = value`. children: `[expr, index, value]`.
    SubscriptSet,

    /// `expr[] = value`. children: `[expr, value]`.
    SubscriptPush,

    /// `[a, b, c]`. children: elements.
    ArrayLiteral,

    /// `[k : v, …]`. children: `[k, v, k, v, …]`.
    MapLiteral,

    /// `from .. to`. children: `[from, to]`.
    Range,

    /// `cond ? a : b`. children: `[cond, a, b]`.
    Ternary,

    /// `&expr` — build a reference value. children: `[expr]`.
    Reference,

    /// `$expr` — dynamic identifier lookup. children: `[expr]`.
    Dollar,

    /// `@` — caller varargs not bound to a formal. No children.
    Vargs,

    /// `import a.b.c;` / `import a.b.*;`. No children.
    Import { path: String },
}

/// A node in the syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// 1-indexed source line, for diagnostics and the line counter.
    pub lineno: usize,
    pub children: Vec<Arc<Node>>,
}

impl Node {
    pub fn new(kind: NodeKind, lineno: usize) -> Self {
        Node {
            kind,
            lineno,
            children: Vec::new(),
        }
    }

    pub fn with_children(kind: NodeKind, lineno: usize, children: Vec<Arc<Node>>) -> Self {
        Node {
            kind,
            lineno,
            children,
        }
    }

    pub fn child(&self, i: usize) -> Option<&Arc<Node>> {
        self.children.get(i)
    }

    /// Formal parameters of a function or method declaration, empty for
    /// any other kind.
    pub fn params(&self) -> &[Param] {
        match &self.kind {
            NodeKind::FunctionDecl { params, .. } | NodeKind::MethodDecl { params, .. } => params,
            _ => &[],
        }
    }

    /// Whether a function or method declaration accepts extra arguments.
    pub fn is_vargs(&self) -> bool {
        match &self.kind {
            NodeKind::FunctionDecl { vargs, .. } | NodeKind::MethodDecl { vargs, .. } => *vargs,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_params_for_function() {
        let node = Node::new(
            NodeKind::FunctionDecl {
                name: "f".to_string(),
                params: vec![Param {
                    name: "x".to_string(),
                }],
                vargs: false,
            },
            1,
        );
        assert_eq!(node.params().len(), 1);
        assert_eq!(node.params()[0].name, "x");
        assert!(!node.is_vargs());
    }

    #[test]
    fn test_node_params_for_non_function() {
        let node = Node::new(NodeKind::Break, 3);
        assert!(node.params().is_empty());
        assert!(!node.is_vargs());
    }
}
