//! Operator implementations of the type registry.
//!
//! Coercion rules: if either operand is a float the result is a float,
//! otherwise integer width; chars coerce to their code points; a string
//! on either side of `+` concatenates; matrix × matrix multiplies when
//! the left column count equals the right row count. Everything else
//! must type-match or the operation fails with a `TypeError`.
//!
//! Results are allocated through the VM so the collector tracks them
//! from birth. No payload guard is held across an allocation.

use crate::error::HybrisError;
use crate::value::{self, MatrixData, ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::cmp::Ordering;

/// Numeric view used by the arithmetic dispatcher.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

fn as_num(o: &ObjRef) -> Option<Num> {
    let kind = o.kind();
    match &*kind {
        ObjKind::Int(v) => Some(Num::Int(*v)),
        ObjKind::Float(v) => Some(Num::Float(*v)),
        ObjKind::Char(c) => Some(Num::Int(*c as i64)),
        // references are transparent to arithmetic
        ObjKind::Reference(Some(inner)) => {
            let inner = inner.clone();
            drop(kind);
            as_num(&inner)
        }
        _ => None,
    }
}

fn type_mismatch(op: &str, a: &ObjRef, b: &ObjRef) -> HybrisError {
    HybrisError::type_error(format!(
        "invalid operand types for '{}' : '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

fn numeric_result(vm: &Vm, a: Num, b: Num, int_op: impl Fn(i64, i64) -> i64, float_op: impl Fn(f64, f64) -> f64) -> ObjRef {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => vm.track(ObjKind::Int(int_op(x, y))),
        _ => vm.track(ObjKind::Float(float_op(a.as_f64(), b.as_f64()))),
    }
}

pub fn add(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    if a.tag() == TypeTag::Str || b.tag() == TypeTag::Str {
        let mut s = value::svalue(a);
        s.push_str(&value::svalue(b));
        return Ok(vm.track(ObjKind::Str(s)));
    }
    if a.tag() == TypeTag::Matrix && b.tag() == TypeTag::Matrix {
        return matrix_elementwise(vm, a, b, "+", |x, y| x + y);
    }
    match (as_num(a), as_num(b)) {
        (Some(x), Some(y)) => Ok(numeric_result(vm, x, y, |p, q| p.wrapping_add(q), |p, q| p + q)),
        _ => Err(type_mismatch("+", a, b)),
    }
}

pub fn sub(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    if a.tag() == TypeTag::Matrix && b.tag() == TypeTag::Matrix {
        return matrix_elementwise(vm, a, b, "-", |x, y| x - y);
    }
    match (as_num(a), as_num(b)) {
        (Some(x), Some(y)) => Ok(numeric_result(vm, x, y, |p, q| p.wrapping_sub(q), |p, q| p - q)),
        _ => Err(type_mismatch("-", a, b)),
    }
}

pub fn mul(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    if a.tag() == TypeTag::Matrix && b.tag() == TypeTag::Matrix {
        return matrix_mul(vm, a, b);
    }
    match (as_num(a), as_num(b)) {
        (Some(x), Some(y)) => Ok(numeric_result(vm, x, y, |p, q| p.wrapping_mul(q), |p, q| p * q)),
        _ => Err(type_mismatch("*", a, b)),
    }
}

pub fn div(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    match (as_num(a), as_num(b)) {
        (Some(x), Some(y)) => {
            if y.as_f64() == 0.0 {
                return Err(HybrisError::runtime("division by zero"));
            }
            Ok(numeric_result(vm, x, y, |p, q| p.wrapping_div(q), |p, q| p / q))
        }
        _ => Err(type_mismatch("/", a, b)),
    }
}

/// Integer modulo with the divisor fast paths: zero and one short out to
/// zero, a power of two reduces to a mask.
pub fn int_mod(a: i64, b: i64) -> i64 {
    if b == 0 || b == 1 {
        0
    } else if b > 0 && (b & (b - 1)) == 0 {
        a & (b - 1)
    } else {
        a % b
    }
}

pub fn modulo(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    match (as_num(a), as_num(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(vm.track(ObjKind::Int(int_mod(x, y)))),
        (Some(x), Some(y)) => Ok(vm.track(ObjKind::Float(x.as_f64() % y.as_f64()))),
        _ => Err(type_mismatch("%", a, b)),
    }
}

fn int_operands(op: &str, a: &ObjRef, b: &ObjRef) -> Result<(i64, i64), HybrisError> {
    match (as_num(a), as_num(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => Ok((x, y)),
        _ => Err(type_mismatch(op, a, b)),
    }
}

pub fn bit_and(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    let (x, y) = int_operands("&", a, b)?;
    Ok(vm.track(ObjKind::Int(x & y)))
}

pub fn bit_or(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    let (x, y) = int_operands("|", a, b)?;
    Ok(vm.track(ObjKind::Int(x | y)))
}

pub fn bit_xor(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    let (x, y) = int_operands("^", a, b)?;
    Ok(vm.track(ObjKind::Int(x ^ y)))
}

pub fn shl(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    let (x, y) = int_operands("<<", a, b)?;
    Ok(vm.track(ObjKind::Int(x.wrapping_shl(y as u32))))
}

pub fn shr(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    let (x, y) = int_operands(">>", a, b)?;
    Ok(vm.track(ObjKind::Int(x.wrapping_shr(y as u32))))
}

pub fn bit_not(vm: &Vm, a: &ObjRef) -> Result<ObjRef, HybrisError> {
    match as_num(a) {
        Some(Num::Int(x)) => Ok(vm.track(ObjKind::Int(!x))),
        _ => Err(HybrisError::type_error(format!(
            "invalid operand type for '~' : '{}'",
            a.type_name()
        ))),
    }
}

pub fn neg(vm: &Vm, a: &ObjRef) -> Result<ObjRef, HybrisError> {
    match as_num(a) {
        Some(Num::Int(x)) => Ok(vm.track(ObjKind::Int(-x))),
        Some(Num::Float(x)) => Ok(vm.track(ObjKind::Float(-x))),
        None => Err(HybrisError::type_error(format!(
            "invalid operand type for unary '-' : '{}'",
            a.type_name()
        ))),
    }
}

pub fn logical_not(vm: &Vm, a: &ObjRef) -> ObjRef {
    vm.track(ObjKind::Int((!value::is_true(a)) as i64))
}

pub fn logical_and(vm: &Vm, a: &ObjRef, b: &ObjRef) -> ObjRef {
    vm.track(ObjKind::Int((value::is_true(a) && value::is_true(b)) as i64))
}

pub fn logical_or(vm: &Vm, a: &ObjRef, b: &ObjRef) -> ObjRef {
    vm.track(ObjKind::Int((value::is_true(a) || value::is_true(b)) as i64))
}

pub fn factorial(vm: &Vm, a: &ObjRef) -> Result<ObjRef, HybrisError> {
    match as_num(a) {
        Some(Num::Int(x)) if x >= 0 => {
            let mut acc: i64 = 1;
            for i in 2..=x {
                acc = acc
                    .checked_mul(i)
                    .ok_or_else(|| HybrisError::runtime(format!("factorial of {} overflows", x)))?;
            }
            Ok(vm.track(ObjKind::Int(acc)))
        }
        Some(Num::Int(x)) => Err(HybrisError::runtime(format!(
            "factorial of negative value {}",
            x
        ))),
        _ => Err(HybrisError::type_error(format!(
            "invalid operand type for '!' : '{}'",
            a.type_name()
        ))),
    }
}

/// Increment/decrement mutate the scalar in place and return the same
/// object.
pub fn increment(a: &ObjRef, delta: i64) -> Result<(), HybrisError> {
    let mut kind = a.kind();
    match &mut *kind {
        ObjKind::Int(v) => {
            *v = v.wrapping_add(delta);
            Ok(())
        }
        ObjKind::Float(v) => {
            *v += delta as f64;
            Ok(())
        }
        ObjKind::Char(c) => {
            let next = (*c as i64).wrapping_add(delta);
            *c = char::from_u32(next as u32).unwrap_or(*c);
            Ok(())
        }
        other => Err(HybrisError::type_error(format!(
            "cannot increment '{}'",
            other.tag().name()
        ))),
    }
}

// ---------------------------------------------------------------------
// comparison
// ---------------------------------------------------------------------

/// Structural comparison. `None` means the operands are incomparable.
pub fn cmp(a: &ObjRef, b: &ObjRef) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return match (x, y) {
            (Num::Int(p), Num::Int(q)) => Some(p.cmp(&q)),
            _ => x.as_f64().partial_cmp(&y.as_f64()),
        };
    }

    let (ka, kb) = (a.kind().clone(), b.kind().clone());
    match (ka, kb) {
        (ObjKind::Str(x), ObjKind::Str(y)) => Some(x.cmp(&y)),
        (ObjKind::Binary(x), ObjKind::Binary(y)) => Some(x.cmp(&y)),
        (ObjKind::Vector(x), ObjKind::Vector(y)) => cmp_slices(&x, &y),
        (ObjKind::Map(x), ObjKind::Map(y)) => {
            match x.len().cmp(&y.len()) {
                Ordering::Equal => {}
                other => return Some(other),
            }
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                match cmp(ka, kb) {
                    Some(Ordering::Equal) => {}
                    other => return other,
                }
                match cmp(va, vb) {
                    Some(Ordering::Equal) => {}
                    other => return other,
                }
            }
            Some(Ordering::Equal)
        }
        (ObjKind::Matrix(x), ObjKind::Matrix(y)) => {
            if x.rows != y.rows || x.cols != y.cols {
                return Some(x.cells.len().cmp(&y.cells.len()));
            }
            cmp_slices(&x.cells, &y.cells)
        }
        (ObjKind::Struct(x), ObjKind::Struct(y)) => {
            match x.attributes.len().cmp(&y.attributes.len()) {
                Ordering::Equal => {}
                other => return Some(other),
            }
            for ((la, va), (lb, vb)) in x.attributes.iter().zip(y.attributes.iter()) {
                match la.cmp(lb) {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
                match cmp(va, vb) {
                    Some(Ordering::Equal) => {}
                    other => return other,
                }
            }
            Some(Ordering::Equal)
        }
        (ObjKind::Reference(x), ObjKind::Reference(y)) => match (x, y) {
            (None, None) => Some(Ordering::Equal),
            (Some(x), Some(y)) => cmp(&x, &y),
            (None, Some(_)) => Some(Ordering::Less),
            (Some(_), None) => Some(Ordering::Greater),
        },
        (ObjKind::Alias(x), ObjKind::Alias(y)) => Some(x.cmp(&y)),
        (ObjKind::Handle(x), ObjKind::Handle(y)) => Some(x.cmp(&y)),
        (ObjKind::Extern(x), ObjKind::Extern(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

fn cmp_slices(a: &[ObjRef], b: &[ObjRef]) -> Option<Ordering> {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => {}
        other => return Some(other),
    }
    for (x, y) in a.iter().zip(b.iter()) {
        match cmp(x, y) {
            Some(Ordering::Equal) => {}
            other => return other,
        }
    }
    Some(Ordering::Equal)
}

pub fn equals(a: &ObjRef, b: &ObjRef) -> bool {
    cmp(a, b) == Some(Ordering::Equal)
}

/// Ordering comparisons require comparable operands.
pub fn ordered(op: &str, a: &ObjRef, b: &ObjRef) -> Result<Ordering, HybrisError> {
    cmp(a, b).ok_or_else(|| type_mismatch(op, a, b))
}

// ---------------------------------------------------------------------
// matrices
// ---------------------------------------------------------------------

fn matrix_numbers(o: &ObjRef) -> Result<(MatrixData, Vec<f64>, bool), HybrisError> {
    let kind = o.kind();
    let ObjKind::Matrix(m) = &*kind else {
        return Err(HybrisError::type_error("expected a matrix"));
    };
    let m = m.clone();
    drop(kind);
    let mut numbers = Vec::with_capacity(m.cells.len());
    let mut all_int = true;
    for cell in &m.cells {
        match as_num(cell) {
            Some(Num::Int(v)) => numbers.push(v as f64),
            Some(Num::Float(v)) => {
                all_int = false;
                numbers.push(v);
            }
            None => {
                return Err(HybrisError::type_error(
                    "matrix arithmetic requires numeric cells",
                ));
            }
        }
    }
    Ok((m, numbers, all_int))
}

fn build_matrix(vm: &Vm, rows: usize, cols: usize, numbers: &[f64], all_int: bool) -> ObjRef {
    let cells = numbers
        .iter()
        .map(|n| {
            if all_int {
                vm.track(ObjKind::Int(*n as i64))
            } else {
                vm.track(ObjKind::Float(*n))
            }
        })
        .collect();
    vm.track(ObjKind::Matrix(MatrixData { rows, cols, cells }))
}

fn matrix_elementwise(
    vm: &Vm,
    a: &ObjRef,
    b: &ObjRef,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<ObjRef, HybrisError> {
    let (ma, xs, ia) = matrix_numbers(a)?;
    let (mb, ys, ib) = matrix_numbers(b)?;
    if ma.rows != mb.rows || ma.cols != mb.cols {
        return Err(HybrisError::type_error(format!(
            "matrix shape mismatch for '{}' : {}x{} and {}x{}",
            op, ma.rows, ma.cols, mb.rows, mb.cols
        )));
    }
    let numbers: Vec<f64> = xs.iter().zip(ys.iter()).map(|(x, y)| f(*x, *y)).collect();
    Ok(build_matrix(vm, ma.rows, ma.cols, &numbers, ia && ib))
}

fn matrix_mul(vm: &Vm, a: &ObjRef, b: &ObjRef) -> Result<ObjRef, HybrisError> {
    let (ma, xs, ia) = matrix_numbers(a)?;
    let (mb, ys, ib) = matrix_numbers(b)?;
    if ma.cols != mb.rows {
        return Err(HybrisError::type_error(format!(
            "cannot multiply a {}x{} matrix by a {}x{} matrix",
            ma.rows, ma.cols, mb.rows, mb.cols
        )));
    }
    let mut numbers = vec![0.0; ma.rows * mb.cols];
    for r in 0..ma.rows {
        for c in 0..mb.cols {
            let mut acc = 0.0;
            for k in 0..ma.cols {
                acc += xs[r * ma.cols + k] * ys[k * mb.cols + c];
            }
            numbers[r * mb.cols + c] = acc;
        }
    }
    Ok(build_matrix(vm, ma.rows, mb.cols, &numbers, ia && ib))
}

// ---------------------------------------------------------------------
// collection operations
// ---------------------------------------------------------------------

/// Subscript read. Maps are searched by structural key equality,
/// ordered collections by integer index.
pub fn cl_at(vm: &Vm, container: &ObjRef, index: &ObjRef) -> Result<ObjRef, HybrisError> {
    let kind = container.kind();
    match &*kind {
        ObjKind::Vector(items) => {
            let i = value_index(index, items.len())?;
            Ok(items[i].clone())
        }
        ObjKind::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = value_index(index, chars.len())?;
            let c = chars[i];
            drop(kind);
            Ok(vm.track(ObjKind::Char(c)))
        }
        ObjKind::Binary(bytes) => {
            let i = value_index(index, bytes.len())?;
            let byte = bytes[i];
            drop(kind);
            Ok(vm.track(ObjKind::Int(byte as i64)))
        }
        ObjKind::Matrix(m) => {
            let i = value_index(index, m.rows)?;
            let row: Vec<ObjRef> = (0..m.cols).filter_map(|c| m.at(i, c).cloned()).collect();
            drop(kind);
            Ok(vm.track(ObjKind::Vector(row)))
        }
        ObjKind::Map(entries) => {
            let entries = entries.clone();
            drop(kind);
            for (k, v) in &entries {
                if equals(k, index) {
                    return Ok(v.clone());
                }
            }
            Err(HybrisError::index(format!(
                "key '{}' not found in map",
                value::svalue(index)
            )))
        }
        other => Err(HybrisError::type_error(format!(
            "'{}' is not subscriptable",
            other.tag().name()
        ))),
    }
}

/// Subscript write. On strings only char values are accepted.
pub fn cl_set(container: &ObjRef, index: &ObjRef, item: &ObjRef) -> Result<(), HybrisError> {
    // map keys are compared outside the payload lock
    if container.tag() == TypeTag::Map {
        let entries = match &*container.kind() {
            ObjKind::Map(entries) => entries.clone(),
            _ => Vec::new(),
        };
        let mut found = None;
        for (i, (k, _)) in entries.iter().enumerate() {
            if equals(k, index) {
                found = Some(i);
                break;
            }
        }
        let mut kind = container.kind();
        if let ObjKind::Map(entries) = &mut *kind {
            match found {
                Some(i) if i < entries.len() => entries[i].1 = item.clone(),
                _ => entries.push((index.clone(), item.clone())),
            }
        }
        return Ok(());
    }

    let new_char = match &*item.kind() {
        ObjKind::Char(c) => Some(*c),
        _ => None,
    };
    let item_int = value::lvalue(item);

    let mut kind = container.kind();
    match &mut *kind {
        ObjKind::Vector(items) => {
            let i = value_index(index, items.len())?;
            items[i] = item.clone();
            Ok(())
        }
        ObjKind::Str(s) => {
            let mut chars: Vec<char> = s.chars().collect();
            let i = value_index(index, chars.len())?;
            match new_char {
                Some(c) => {
                    chars[i] = c;
                    *s = chars.into_iter().collect();
                    Ok(())
                }
                None => Err(HybrisError::type_error(
                    "only char values can be stored into a string",
                )),
            }
        }
        ObjKind::Binary(bytes) => {
            let i = value_index(index, bytes.len())?;
            bytes[i] = item_int as u8;
            Ok(())
        }
        other => Err(HybrisError::type_error(format!(
            "'{}' does not support subscript assignment",
            other.tag().name()
        ))),
    }
}

pub fn cl_push(container: &ObjRef, item: &ObjRef) -> Result<(), HybrisError> {
    let item_int = value::lvalue(item);
    let mut kind = container.kind();
    match &mut *kind {
        ObjKind::Vector(items) => {
            items.push(item.clone());
            Ok(())
        }
        ObjKind::Binary(bytes) => {
            bytes.push(item_int as u8);
            Ok(())
        }
        other => Err(HybrisError::type_error(format!(
            "cannot push into '{}'",
            other.tag().name()
        ))),
    }
}

pub fn cl_pop(container: &ObjRef) -> Result<ObjRef, HybrisError> {
    let mut kind = container.kind();
    match &mut *kind {
        ObjKind::Vector(items) => items
            .pop()
            .ok_or_else(|| HybrisError::index("pop from an empty vector")),
        other => Err(HybrisError::type_error(format!(
            "cannot pop from '{}'",
            other.tag().name()
        ))),
    }
}

/// Remove the first element equal to `target` from a vector, or the
/// entry with an equal key from a map. Returns the removed value.
pub fn cl_remove(container: &ObjRef, target: &ObjRef) -> Result<ObjRef, HybrisError> {
    let tag = container.tag();
    match tag {
        TypeTag::Vector => {
            let items = match &*container.kind() {
                ObjKind::Vector(items) => items.clone(),
                _ => Vec::new(),
            };
            let position = items.iter().position(|i| equals(i, target));
            let mut kind = container.kind();
            if let ObjKind::Vector(items) = &mut *kind {
                if let Some(i) = position {
                    if i < items.len() {
                        return Ok(items.remove(i));
                    }
                }
            }
            Err(HybrisError::index("value not found in vector"))
        }
        TypeTag::Map => {
            let entries = match &*container.kind() {
                ObjKind::Map(entries) => entries.clone(),
                _ => Vec::new(),
            };
            let position = entries.iter().position(|(k, _)| equals(k, target));
            let mut kind = container.kind();
            if let ObjKind::Map(entries) = &mut *kind {
                if let Some(i) = position {
                    if i < entries.len() {
                        return Ok(entries.remove(i).1);
                    }
                }
            }
            Err(HybrisError::index("key not found in map"))
        }
        _ => Err(HybrisError::type_error(format!(
            "cannot remove from '{}'",
            tag.name()
        ))),
    }
}

/// Position of the first element equal to `target`, or false when
/// absent.
pub fn cl_contains(vm: &Vm, container: &ObjRef, target: &ObjRef) -> Result<ObjRef, HybrisError> {
    let items = match &*container.kind() {
        ObjKind::Vector(items) => items.clone(),
        other => {
            return Err(HybrisError::type_error(format!(
                "'{}' does not support contains",
                other.tag().name()
            )));
        }
    };
    match items.iter().position(|i| equals(i, target)) {
        Some(i) => Ok(vm.track(ObjKind::Int(i as i64))),
        None => Ok(vm.track(ObjKind::Int(0))),
    }
}

/// Positional element access used by `foreach` and explode assignment:
/// for maps this is the value at insertion position `index`, for the
/// ordered collections it is the same as an integer subscript.
pub fn element_at(vm: &Vm, container: &ObjRef, index: usize) -> Result<ObjRef, HybrisError> {
    if container.tag() == TypeTag::Map {
        let entry = match &*container.kind() {
            ObjKind::Map(entries) => entries.get(index).map(|(_, v)| v.clone()),
            _ => None,
        };
        return entry.ok_or_else(|| {
            HybrisError::index(format!("position {} out of bounds for map", index))
        });
    }
    let position = vm.track(ObjKind::Int(index as i64));
    cl_at(vm, container, &position)
}

fn value_index(index: &ObjRef, len: usize) -> Result<usize, HybrisError> {
    let i = value::lvalue(index);
    if i < 0 || i as usize >= len {
        return Err(HybrisError::index(format!(
            "index {} out of bounds (size {})",
            i, len
        )));
    }
    Ok(i as usize)
}

// ---------------------------------------------------------------------
// in-place variants
// ---------------------------------------------------------------------

/// `a op= b`: mutate the left operand in place when its type supports
/// mutation, matching the plain operator's result otherwise.
pub fn inplace(vm: &Vm, op: &str, a: &ObjRef, b: &ObjRef) -> Result<(), HybrisError> {
    // string append
    if op == "+" && a.tag() == TypeTag::Str {
        let suffix = value::svalue(b);
        if let ObjKind::Str(s) = &mut *a.kind() {
            s.push_str(&suffix);
        }
        return Ok(());
    }
    // vector append: another vector extends, anything else pushes
    if op == "+" && a.tag() == TypeTag::Vector {
        if b.tag() == TypeTag::Vector {
            let extra = match &*b.kind() {
                ObjKind::Vector(items) => items.clone(),
                _ => Vec::new(),
            };
            if let ObjKind::Vector(items) = &mut *a.kind() {
                items.extend(extra);
            }
        } else {
            cl_push(a, b)?;
        }
        return Ok(());
    }
    // map merge
    if op == "+" && a.tag() == TypeTag::Map && b.tag() == TypeTag::Map {
        let extra = match &*b.kind() {
            ObjKind::Map(entries) => entries.clone(),
            _ => Vec::new(),
        };
        for (k, v) in extra {
            cl_set(a, &k, &v)?;
        }
        return Ok(());
    }
    // matrices and scalars: compute then overwrite the payload
    let result = match op {
        "+" => add(vm, a, b)?,
        "-" => sub(vm, a, b)?,
        "*" => mul(vm, a, b)?,
        "/" => div(vm, a, b)?,
        "%" => modulo(vm, a, b)?,
        "&" => bit_and(vm, a, b)?,
        "|" => bit_or(vm, a, b)?,
        "^" => bit_xor(vm, a, b)?,
        "<<" => shl(vm, a, b)?,
        ">>" => shr(vm, a, b)?,
        _ => return Err(HybrisError::runtime(format!("unknown in-place operator '{}'", op))),
    };
    let new_kind = result.kind().clone();
    *a.kind() = new_kind;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use crate::vm::{Vm, VmArgs};
    use std::sync::Arc;

    fn vm() -> Arc<Vm> {
        Vm::new(VmArgs::default())
    }

    #[test]
    fn test_add_ints_and_floats() {
        let vm = vm();
        let r = add(&vm, &Obj::int(2), &Obj::int(3)).unwrap();
        assert!(matches!(*r.kind(), ObjKind::Int(5)));
        let r = add(&vm, &Obj::int(2), &Obj::float(0.5)).unwrap();
        assert!(matches!(*r.kind(), ObjKind::Float(f) if f == 2.5));
    }

    #[test]
    fn test_string_concatenation_on_add() {
        let vm = vm();
        let r = add(&vm, &Obj::str("a"), &Obj::int(1)).unwrap();
        assert_eq!(value::svalue(&r), "a1");
        let r = add(&vm, &Obj::int(1), &Obj::str("b")).unwrap();
        assert_eq!(value::svalue(&r), "1b");
    }

    #[test]
    fn test_division_by_zero_is_runtime_error() {
        let vm = vm();
        let err = div(&vm, &Obj::int(1), &Obj::int(0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Runtime);
    }

    #[test]
    fn test_modulo_fast_paths_match_plain_modulo() {
        assert_eq!(int_mod(17, 0), 0);
        assert_eq!(int_mod(17, 1), 0);
        for divisor in [2i64, 4, 8, 16, 1024] {
            for a in [0i64, 1, 7, 17, 100, 12345] {
                assert_eq!(int_mod(a, divisor), a % divisor, "a={} b={}", a, divisor);
            }
        }
        assert_eq!(int_mod(17, 5), 2);
    }

    #[test]
    fn test_char_coerces_to_int() {
        let vm = vm();
        let r = add(&vm, &Obj::char('a'), &Obj::int(1)).unwrap();
        assert!(matches!(*r.kind(), ObjKind::Int(98)));
    }

    #[test]
    fn test_cmp_structural_vectors() {
        let a = Obj::vector(vec![Obj::int(1), Obj::int(2)]);
        let b = Obj::vector(vec![Obj::int(1), Obj::int(2)]);
        let c = Obj::vector(vec![Obj::int(1), Obj::int(3)]);
        assert_eq!(cmp(&a, &b), Some(Ordering::Equal));
        assert_eq!(cmp(&a, &c), Some(Ordering::Less));
    }

    #[test]
    fn test_cmp_incomparable() {
        let a = Obj::vector(vec![]);
        let b = Obj::int(1);
        assert_eq!(cmp(&a, &b), None);
        assert!(ordered("<", &a, &b).is_err());
    }

    #[test]
    fn test_matrix_multiplication_shapes() {
        let vm = vm();
        let a = vm.track(ObjKind::Matrix(MatrixData {
            rows: 2,
            cols: 3,
            cells: (0..6).map(|i| Obj::int(i + 1)).collect(),
        }));
        let b = vm.track(ObjKind::Matrix(MatrixData {
            rows: 3,
            cols: 2,
            cells: (0..6).map(|i| Obj::int(i + 1)).collect(),
        }));
        let r = mul(&vm, &a, &b).unwrap();
        let kind = r.kind().clone();
        let ObjKind::Matrix(m) = kind else {
            panic!("expected matrix result");
        };
        assert_eq!((m.rows, m.cols), (2, 2));
        // [[1,2,3],[4,5,6]] * [[1,2],[3,4],[5,6]] = [[22,28],[49,64]]
        assert_eq!(value::lvalue(&m.cells[0]), 22);
        assert_eq!(value::lvalue(&m.cells[3]), 64);
        // incompatible shapes fail
        assert!(mul(&vm, &a, &a).is_err());
    }

    #[test]
    fn test_subscript_bounds() {
        let vm = vm();
        let v = Obj::vector(vec![Obj::int(10)]);
        assert_eq!(value::lvalue(&cl_at(&vm, &v, &Obj::int(0)).unwrap()), 10);
        let err = cl_at(&vm, &v, &Obj::int(1)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Index);
    }

    #[test]
    fn test_string_subscript_set_requires_char() {
        let s = Obj::str("abc");
        assert!(cl_set(&s, &Obj::int(1), &Obj::char('X')).is_ok());
        assert_eq!(value::svalue(&s), "aXc");
        let err = cl_set(&s, &Obj::int(1), &Obj::int(66)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Type);
    }

    #[test]
    fn test_map_set_then_at_returns_last_set() {
        let vm = vm();
        let m = Obj::new(ObjKind::Map(Vec::new()));
        let key = Obj::str("k");
        cl_set(&m, &key, &Obj::int(1)).unwrap();
        cl_set(&m, &Obj::str("k"), &Obj::int(2)).unwrap();
        let got = cl_at(&vm, &m, &Obj::str("k")).unwrap();
        assert_eq!(value::lvalue(&got), 2);
        // structurally equal key replaced, not appended
        assert_eq!(value::get_size(&m), 1);
    }

    #[test]
    fn test_contains_returns_index() {
        let vm = vm();
        let v = Obj::vector(vec![Obj::int(1), Obj::int(2), Obj::int(3), Obj::int(4)]);
        let r = cl_contains(&vm, &v, &Obj::int(3)).unwrap();
        assert_eq!(value::lvalue(&r), 2);
    }

    #[test]
    fn test_inplace_add_mutates_string_and_vector() {
        let vm = vm();
        let s = Obj::str("ab");
        inplace(&vm, "+", &s, &Obj::str("cd")).unwrap();
        assert_eq!(value::svalue(&s), "abcd");

        let v = Obj::vector(vec![Obj::int(1)]);
        inplace(&vm, "+", &v, &Obj::int(2)).unwrap();
        assert_eq!(value::get_size(&v), 2);
    }

    #[test]
    fn test_inplace_on_scalar_overwrites_payload() {
        let vm = vm();
        let a = Obj::int(10);
        inplace(&vm, "-", &a, &Obj::int(3)).unwrap();
        assert_eq!(value::lvalue(&a), 7);
    }

    #[test]
    fn test_factorial() {
        let vm = vm();
        let r = factorial(&vm, &Obj::int(5)).unwrap();
        assert_eq!(value::lvalue(&r), 120);
        assert!(factorial(&vm, &Obj::int(-1)).is_err());
    }
}
