//! XML conversion builtins: `to_xml` and `from_xml`.
//!
//! The element name is the type tag, scalar values are text content,
//! collections nest one element per item. `from_xml(to_xml(v))` equals
//! `v` by structural comparison for the data-bearing types.

use super::Args;
use crate::error::HybrisError;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{self, MatrixData, ObjKind, ObjRef, StructData, TypeTag};
use crate::vm::Vm;
use std::fmt::Write as _;
use std::sync::Arc;

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.xml",
        vec![
            NamedFunction::new("to_xml", h_to_xml).with_arities(&[1]),
            NamedFunction::new("from_xml", h_from_xml)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]),
        ],
    );
}

fn h_to_xml(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(o) = args.obj(0) else {
        return vm.unit();
    };
    match render(&o) {
        Ok(xml) => vm.track(ObjKind::Str(xml)),
        Err(err) => vm.raise(frame, err),
    }
}

fn h_from_xml(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let text = args.string(0);
    match parse(vm, &text) {
        Ok(o) => o,
        Err(err) => vm.raise(frame, err),
    }
}

// ---------------------------------------------------------------------
// rendering
// ---------------------------------------------------------------------

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

pub fn render(o: &ObjRef) -> Result<String, HybrisError> {
    let mut out = String::new();
    render_into(o, &mut out)?;
    Ok(out)
}

fn render_into(o: &ObjRef, out: &mut String) -> Result<(), HybrisError> {
    let kind = o.kind().clone();
    match kind {
        ObjKind::Int(v) => {
            let _ = write!(out, "<integer>{}</integer>", v);
        }
        ObjKind::Float(v) => {
            let _ = write!(out, "<float>{}</float>", v);
        }
        ObjKind::Char(c) => {
            let _ = write!(out, "<char>{}</char>", escape(&c.to_string()));
        }
        ObjKind::Str(s) => {
            let _ = write!(out, "<string>{}</string>", escape(&s));
        }
        ObjKind::Binary(b) => {
            let _ = write!(out, "<binary>{}</binary>", hex::encode(b));
        }
        ObjKind::Vector(items) => {
            out.push_str("<vector>");
            for item in &items {
                render_into(item, out)?;
            }
            out.push_str("</vector>");
        }
        ObjKind::Map(entries) => {
            out.push_str("<map>");
            for (k, v) in &entries {
                out.push_str("<entry>");
                render_into(k, out)?;
                render_into(v, out)?;
                out.push_str("</entry>");
            }
            out.push_str("</map>");
        }
        ObjKind::Matrix(m) => {
            let _ = write!(out, "<matrix rows=\"{}\" cols=\"{}\">", m.rows, m.cols);
            for cell in &m.cells {
                render_into(cell, out)?;
            }
            out.push_str("</matrix>");
        }
        ObjKind::Struct(s) => {
            let _ = write!(out, "<struct name=\"{}\">", escape(&s.name));
            for (label, v) in &s.attributes {
                let _ = write!(out, "<attribute name=\"{}\">", escape(label));
                render_into(v, out)?;
                out.push_str("</attribute>");
            }
            out.push_str("</struct>");
        }
        ObjKind::Reference(None) => out.push_str("<null></null>"),
        ObjKind::Reference(Some(inner)) => render_into(&inner, out)?,
        other => {
            return Err(HybrisError::type_error(format!(
                "'{}' values have no XML form",
                other.tag().name()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// parsing
// ---------------------------------------------------------------------

struct Reader<'a> {
    chars: &'a [u8],
    pos: usize,
}

struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl<'a> Reader<'a> {
    fn new(text: &'a str) -> Self {
        Reader {
            chars: text.as_bytes(),
            pos: 0,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> HybrisError {
        HybrisError::runtime(format!("malformed XML at offset {}: {}", self.pos, message))
    }

    fn element(&mut self) -> Result<Element, HybrisError> {
        self.skip_whitespace();
        if self.chars.get(self.pos) != Some(&b'<') {
            return Err(self.error("expected '<'"));
        }
        self.pos += 1;

        let tag_start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
        {
            self.pos += 1;
        }
        let tag = String::from_utf8_lossy(&self.chars[tag_start..self.pos]).into_owned();
        if tag.is_empty() {
            return Err(self.error("empty element name"));
        }

        let mut attributes = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.get(self.pos) {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') if self.chars.get(self.pos + 1) == Some(&b'>') => {
                    self.pos += 2;
                    return Ok(Element {
                        tag,
                        attributes,
                        text: String::new(),
                        children: Vec::new(),
                    });
                }
                Some(_) => attributes.push(self.attribute()?),
                None => return Err(self.error("unterminated element")),
            }
        }

        // content: either child elements or raw text up to the closer
        let mut text = String::new();
        let mut children = Vec::new();
        loop {
            if self.chars.get(self.pos) == Some(&b'<') {
                if self.chars.get(self.pos + 1) == Some(&b'/') {
                    self.pos += 2;
                    let close_start = self.pos;
                    while self.chars.get(self.pos).is_some_and(|c| *c != b'>') {
                        self.pos += 1;
                    }
                    let closer =
                        String::from_utf8_lossy(&self.chars[close_start..self.pos]).into_owned();
                    if closer != tag {
                        return Err(self.error("mismatched closing tag"));
                    }
                    if self.chars.get(self.pos) != Some(&b'>') {
                        return Err(self.error("unterminated closing tag"));
                    }
                    self.pos += 1;
                    break;
                }
                children.push(self.element()?);
            } else {
                match self.chars.get(self.pos) {
                    Some(c) => {
                        text.push(*c as char);
                        self.pos += 1;
                    }
                    None => return Err(self.error("unterminated element content")),
                }
            }
        }

        Ok(Element {
            tag,
            attributes,
            text,
            children,
        })
    }

    fn attribute(&mut self) -> Result<(String, String), HybrisError> {
        let name_start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
        {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.chars[name_start..self.pos]).into_owned();
        if self.chars.get(self.pos) != Some(&b'=') || self.chars.get(self.pos + 1) != Some(&b'"') {
            return Err(self.error("expected attribute value"));
        }
        self.pos += 2;
        let value_start = self.pos;
        while self.chars.get(self.pos).is_some_and(|c| *c != b'"') {
            self.pos += 1;
        }
        let raw = String::from_utf8_lossy(&self.chars[value_start..self.pos]).into_owned();
        if self.chars.get(self.pos) != Some(&b'"') {
            return Err(self.error("unterminated attribute value"));
        }
        self.pos += 1;
        Ok((name, unescape(&raw)))
    }
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn parse(vm: &Vm, text: &str) -> Result<ObjRef, HybrisError> {
    let mut reader = Reader::new(text);
    let element = reader.element()?;
    build(vm, &element)
}

fn build(vm: &Vm, element: &Element) -> Result<ObjRef, HybrisError> {
    let text = unescape(&element.text);
    match element.tag.as_str() {
        "integer" => {
            let v = text
                .trim()
                .parse::<i64>()
                .map_err(|_| HybrisError::runtime("invalid integer content"))?;
            Ok(vm.track(ObjKind::Int(v)))
        }
        "float" => {
            let v = text
                .trim()
                .parse::<f64>()
                .map_err(|_| HybrisError::runtime("invalid float content"))?;
            Ok(vm.track(ObjKind::Float(v)))
        }
        "char" => {
            let c = text
                .chars()
                .next()
                .ok_or_else(|| HybrisError::runtime("empty char content"))?;
            Ok(vm.track(ObjKind::Char(c)))
        }
        "string" => Ok(vm.track(ObjKind::Str(text))),
        "binary" => {
            let bytes = hex::decode(text.trim())
                .map_err(|_| HybrisError::runtime("invalid binary content"))?;
            Ok(vm.track(ObjKind::Binary(bytes)))
        }
        "vector" => {
            let items = element
                .children
                .iter()
                .map(|child| build(vm, child))
                .collect::<Result<_, _>>()?;
            Ok(vm.track(ObjKind::Vector(items)))
        }
        "map" => {
            let mut entries = Vec::with_capacity(element.children.len());
            for entry in &element.children {
                if entry.tag != "entry" || entry.children.len() != 2 {
                    return Err(HybrisError::runtime("malformed map entry"));
                }
                entries.push((build(vm, &entry.children[0])?, build(vm, &entry.children[1])?));
            }
            Ok(vm.track(ObjKind::Map(entries)))
        }
        "matrix" => {
            let rows = element
                .attribute("rows")
                .and_then(|r| r.parse().ok())
                .ok_or_else(|| HybrisError::runtime("matrix missing rows"))?;
            let cols = element
                .attribute("cols")
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| HybrisError::runtime("matrix missing cols"))?;
            let cells: Vec<ObjRef> = element
                .children
                .iter()
                .map(|child| build(vm, child))
                .collect::<Result<_, _>>()?;
            if cells.len() != rows * cols {
                return Err(HybrisError::runtime("matrix cell count mismatch"));
            }
            Ok(vm.track(ObjKind::Matrix(MatrixData { rows, cols, cells })))
        }
        "struct" => {
            let name = element.attribute("name").unwrap_or_default().to_string();
            let mut attributes = Vec::with_capacity(element.children.len());
            for attr in &element.children {
                if attr.tag != "attribute" || attr.children.len() != 1 {
                    return Err(HybrisError::runtime("malformed struct attribute"));
                }
                let label = attr.attribute("name").unwrap_or_default().to_string();
                attributes.push((label, build(vm, &attr.children[0])?));
            }
            Ok(vm.track(ObjKind::Struct(StructData { name, attributes })))
        }
        "null" => Ok(vm.track(ObjKind::Reference(None))),
        other => Err(HybrisError::runtime(format!(
            "unknown XML element '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use crate::value::Obj;
    use crate::vm::VmArgs;

    fn vm() -> Arc<Vm> {
        Vm::new(VmArgs::default())
    }

    fn round_trip(vm: &Vm, o: &ObjRef) -> ObjRef {
        let xml = render(o).unwrap();
        parse(vm, &xml).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        let vm = vm();
        for original in [Obj::int(-3), Obj::float(1.5), Obj::char('<'), Obj::str("a<b>&c")] {
            let back = round_trip(&vm, &original);
            assert!(
                ops::equals(&original, &back),
                "{:?} -> {}",
                original.kind(),
                render(&original).unwrap()
            );
        }
    }

    #[test]
    fn test_collection_round_trips() {
        let vm = vm();
        let v = Obj::vector(vec![Obj::int(1), Obj::str("two"), Obj::float(3.0)]);
        assert!(ops::equals(&v, &round_trip(&vm, &v)));

        let m = Obj::new(ObjKind::Map(vec![
            (Obj::str("k"), Obj::int(1)),
            (Obj::int(2), Obj::vector(vec![Obj::int(3)])),
        ]));
        assert!(ops::equals(&m, &round_trip(&vm, &m)));
    }

    #[test]
    fn test_struct_round_trip() {
        let vm = vm();
        let s = Obj::new(ObjKind::Struct(StructData {
            name: "point".to_string(),
            attributes: vec![
                ("x".to_string(), Obj::int(1)),
                ("y".to_string(), Obj::int(2)),
            ],
        }));
        assert!(ops::equals(&s, &round_trip(&vm, &s)));
    }

    #[test]
    fn test_rendered_form_is_tagged_by_type() {
        let xml = render(&Obj::int(42)).unwrap();
        assert_eq!(xml, "<integer>42</integer>");
        let xml = render(&Obj::str("hi")).unwrap();
        assert_eq!(xml, "<string>hi</string>");
    }

    #[test]
    fn test_malformed_input_is_runtime_error() {
        let vm = vm();
        assert!(parse(&vm, "<integer>42</float>").is_err());
        assert!(parse(&vm, "not xml").is_err());
        assert!(parse(&vm, "<unknown>1</unknown>").is_err());
    }

    #[test]
    fn test_alias_has_no_xml_form() {
        let alias = Obj::new(ObjKind::Alias(1));
        assert!(render(&alias).is_err());
    }
}
