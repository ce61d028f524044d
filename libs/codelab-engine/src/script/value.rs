use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use super::ast::FunctionDef;
use super::env::Scope;
use super::interp::{Exec, Interpreter};

pub type NativeFn = fn(&mut Interpreter, &str, Value, Vec<Value>) -> Exec<Value>;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<ArrayCell>),
    Object(Rc<ObjectCell>),
    Function(Rc<Closure>),
    Native(Rc<NativeFunction>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Plain,
    Error,
}

/// Property bag with insertion order preserved
#[derive(Debug)]
pub struct JsObject {
    pub class: ObjectClass,
    pub props: Vec<(Rc<str>, Value)>,
    /// Function that built this object with `new`, for `instanceof`
    pub ctor: Option<Weak<Closure>>,
}

impl JsObject {
    pub fn new(class: ObjectClass) -> Self {
        Self {
            class,
            props: Vec::new(),
            ctor: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.props
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.props.iter().any(|(k, _)| &**k == key)
    }

    pub fn set(&mut self, key: Rc<str>, value: Value) {
        match self.props.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.props.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.props.len();
        self.props.retain(|(k, _)| &**k != key);
        before != self.props.len()
    }
}

/// Element storage of an array value
///
/// Learner code can nest arrays and objects arbitrarily deep (`a = [a]` in a
/// loop). The container cells and `Scope` tear their contents down through
/// `dismantle`, so releasing such a structure never recurses.
pub struct ArrayCell(RefCell<Vec<Value>>);

impl ArrayCell {
    pub fn new(items: Vec<Value>) -> Self {
        Self(RefCell::new(items))
    }
}

impl Deref for ArrayCell {
    type Target = RefCell<Vec<Value>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ArrayCell {
    fn drop(&mut self) {
        dismantle(std::mem::take(self.0.get_mut()), Vec::new());
    }
}

/// Property storage of an object value
pub struct ObjectCell(RefCell<JsObject>);

impl ObjectCell {
    pub fn new(obj: JsObject) -> Self {
        Self(RefCell::new(obj))
    }
}

impl Deref for ObjectCell {
    type Target = RefCell<JsObject>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ObjectCell {
    fn drop(&mut self) {
        let values = self.0.get_mut().props.drain(..).map(|(_, v)| v).collect();
        dismantle(values, Vec::new());
    }
}

/// Releases `values` and `scopes` with an explicit work list
///
/// Containers whose last strong reference is being dropped are emptied into
/// the work list first, so their own `Drop` finds nothing left to recurse into.
pub(super) fn dismantle(mut values: Vec<Value>, mut scopes: Vec<Rc<Scope>>) {
    loop {
        if let Some(value) = values.pop() {
            match value {
                Value::Array(cell) => {
                    if let Ok(mut cell) = Rc::try_unwrap(cell) {
                        values.append(cell.0.get_mut());
                    }
                }
                Value::Object(cell) => {
                    if let Ok(mut cell) = Rc::try_unwrap(cell) {
                        values.extend(cell.0.get_mut().props.drain(..).map(|(_, v)| v));
                    }
                }
                Value::Function(closure) => {
                    if let Ok(closure) = Rc::try_unwrap(closure) {
                        scopes.push(closure.env);
                    }
                }
                Value::Native(native) => {
                    if let Ok(native) = Rc::try_unwrap(native) {
                        values.extend(native.receiver);
                        values.extend(native.props.into_iter().map(|(_, v)| v));
                    }
                }
                _ => {}
            }
        } else if let Some(scope) = scopes.pop() {
            if let Ok(mut scope) = Rc::try_unwrap(scope) {
                scope.take_contents(&mut values, &mut scopes);
            }
        } else {
            break;
        }
    }
}

pub struct Closure {
    pub def: Rc<FunctionDef>,
    pub env: Rc<Scope>,
    /// Declared name, or the binding an anonymous function was assigned to
    pub name: Option<Rc<str>>,
}

pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
    /// Bound `this` for methods looked up on a value
    pub receiver: Option<Value>,
    /// Static members such as `Number.isInteger`
    pub props: Vec<(&'static str, Value)>,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inspect())
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(ArrayCell::new(items)))
    }

    pub fn object(props: Vec<(Rc<str>, Value)>) -> Value {
        Value::Object(Rc::new(ObjectCell::new(JsObject {
            class: ObjectClass::Plain,
            props,
            ctor: None,
        })))
    }

    pub fn native(name: &'static str, func: NativeFn) -> Value {
        Value::Native(Rc::new(NativeFunction {
            name,
            func,
            receiver: None,
            props: Vec::new(),
        }))
    }

    pub fn bound_native(name: &'static str, func: NativeFn, receiver: Value) -> Value {
        Value::Native(Rc::new(NativeFunction {
            name,
            func,
            receiver: Some(receiver),
            props: Vec::new(),
        }))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) | Value::Object(_) => "object",
            Value::Function(_) | Value::Native(_) => "function",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Array(items) => {
                let items = items.borrow();
                match items.len() {
                    0 => 0.0,
                    1 => items[0].to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// Conversion used by string concatenation, `String(x)` and template literals
    pub fn to_display(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => {
                let mut seen = Vec::new();
                join_array(items, &mut seen)
            }
            Value::Object(obj) => {
                let obj = obj.borrow();
                match obj.class {
                    ObjectClass::Error => error_summary(&obj),
                    ObjectClass::Plain => "[object Object]".to_string(),
                }
            }
            Value::Function(closure) => format!(
                "function {}() {{ [code] }}",
                closure.name.as_deref().unwrap_or("")
            ),
            Value::Native(native) => format!("function {}() {{ [native code] }}", native.name),
        }
    }

    /// Rendering used by `console.log`: strings verbatim, structures in JSON style
    pub fn inspect(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => {
                let mut out = String::new();
                render(other, &mut out, &mut Vec::new(), 0);
                out
            }
        }
    }

    fn identity(&self) -> Option<*const ()> {
        match self {
            Value::Array(rc) => Some(Rc::as_ptr(rc) as *const ()),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as *const ()),
            Value::Function(rc) => Some(Rc::as_ptr(rc) as *const ()),
            Value::Native(rc) => Some(Rc::as_ptr(rc) as *const ()),
            _ => None,
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
                self.to_number() == other.to_number()
            }
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Value::Bool(_)) => self.loose_equals(&Value::Number(other.to_number())),
            (a, b) if a.identity().is_some() && b.identity().is_none() => {
                Value::Str(Rc::from(a.to_display().as_str())).loose_equals(b)
            }
            (a, b) if a.identity().is_none() && b.identity().is_some() => {
                a.loose_equals(&Value::Str(Rc::from(b.to_display().as_str())))
            }
            _ => self.strict_equals(other),
        }
    }

    /// Host-side copy of a learner value
    ///
    /// `undefined` maps to `None`. Integral numbers become JSON integers and
    /// non-finite numbers are carried as their display strings.
    pub fn to_host(&self) -> Option<serde_json::Value> {
        let mut seen = Vec::new();
        self.to_host_inner(&mut seen)
    }

    fn to_host_inner(&self, seen: &mut Vec<*const ()>) -> Option<serde_json::Value> {
        use serde_json::Value as J;
        let value = match self {
            Value::Undefined => return None,
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Number(n) => number_to_json(*n).unwrap_or_else(|| J::String(number_to_string(*n))),
            Value::Str(s) => J::String(s.to_string()),
            Value::Function(_) | Value::Native(_) => J::String(self.inspect()),
            Value::Array(items) => {
                let id = Rc::as_ptr(items) as *const ();
                if seen.contains(&id) {
                    return Some(J::String("[Circular]".into()));
                }
                if seen.len() >= MAX_NESTING {
                    return Some(J::String("[Array]".into()));
                }
                seen.push(id);
                let out = items
                    .borrow()
                    .iter()
                    .map(|v| v.to_host_inner(seen).unwrap_or(J::Null))
                    .collect();
                seen.pop();
                J::Array(out)
            }
            Value::Object(obj) => {
                let id = Rc::as_ptr(obj) as *const ();
                if seen.contains(&id) {
                    return Some(J::String("[Circular]".into()));
                }
                if seen.len() >= MAX_NESTING {
                    return Some(J::String("[Object]".into()));
                }
                seen.push(id);
                let mut map = serde_json::Map::new();
                for (k, v) in obj.borrow().props.iter() {
                    if let Some(v) = v.to_host_inner(seen) {
                        map.insert(k.to_string(), v);
                    }
                }
                seen.pop();
                J::Object(map)
            }
        };
        Some(value)
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            J::String(s) => Value::str(s),
            J::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            J::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (Rc::from(k.as_str()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// JSON number for finite values; integral values stay integers
pub fn number_to_json(n: f64) -> Option<serde_json::Value> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        // -0 serializes as 0
        return Some(serde_json::Value::from(n as i64));
    }
    serde_json::Number::from_f64(n).map(serde_json::Value::Number)
}

pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let formatted = format!("{:e}", n);
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => formatted,
        };
    }
    format!("{}", n)
}

pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    let (sign, body) = match t.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    let radix = match body.get(..2) {
        Some("0x") | Some("0X") => 16,
        Some("0b") | Some("0B") => 2,
        Some("0o") | Some("0O") => 8,
        _ => 10,
    };
    if radix != 10 {
        if sign < 0.0 {
            return f64::NAN;
        }
        return u64::from_str_radix(&body[2..], radix)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN);
    }
    let valid = body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !valid {
        return f64::NAN;
    }
    body.parse::<f64>().map(|v| sign * v).unwrap_or(f64::NAN)
}

pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
}

pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

fn error_summary(obj: &JsObject) -> String {
    let name = obj.get("name").map(|v| v.to_display()).unwrap_or_else(|| "Error".into());
    let message = obj.get("message").map(|v| v.to_display()).unwrap_or_default();
    if message.is_empty() {
        name
    } else {
        format!("{}: {}", name, message)
    }
}

fn join_array(items: &Rc<ArrayCell>, seen: &mut Vec<*const ()>) -> String {
    let id = Rc::as_ptr(items) as *const ();
    if seen.contains(&id) || seen.len() >= MAX_NESTING {
        return String::new();
    }
    seen.push(id);
    let parts: Vec<String> = items
        .borrow()
        .iter()
        .map(|v| match v {
            Value::Undefined | Value::Null => String::new(),
            Value::Array(inner) => join_array(inner, seen),
            other => other.to_display(),
        })
        .collect();
    seen.pop();
    parts.join(",")
}

const MAX_RENDER_DEPTH: usize = 16;
/// Recursion ceiling for host conversion and array joining
const MAX_NESTING: usize = 256;

fn render(value: &Value, out: &mut String, seen: &mut Vec<*const ()>, depth: usize) {
    match value {
        Value::Str(s) => out.push_str(&serde_json::Value::String(s.to_string()).to_string()),
        Value::Function(closure) => match &closure.name {
            Some(name) => out.push_str(&format!("[Function: {}]", name)),
            None => out.push_str("[Function (anonymous)]"),
        },
        Value::Native(native) => out.push_str(&format!("[Function: {}]", native.name)),
        Value::Array(items) => {
            let id = Rc::as_ptr(items) as *const ();
            if seen.contains(&id) {
                out.push_str("[Circular]");
                return;
            }
            if depth >= MAX_RENDER_DEPTH {
                out.push_str("[Array]");
                return;
            }
            seen.push(id);
            out.push('[');
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(item, out, seen, depth + 1);
            }
            out.push(']');
            seen.pop();
        }
        Value::Object(obj) => {
            let id = Rc::as_ptr(obj) as *const ();
            if seen.contains(&id) {
                out.push_str("[Circular]");
                return;
            }
            let obj_ref = obj.borrow();
            if obj_ref.class == ObjectClass::Error {
                out.push_str(&error_summary(&obj_ref));
                return;
            }
            if depth >= MAX_RENDER_DEPTH {
                out.push_str("[Object]");
                return;
            }
            seen.push(id);
            out.push('{');
            for (i, (key, item)) in obj_ref.props.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.to_string()).to_string());
                out.push(':');
                render(item, out, seen, depth + 1);
            }
            out.push('}');
            seen.pop();
        }
        other => out.push_str(&other.to_display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(15.0), "15");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1.5e-7), "1.5e-7");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number("  42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert!(string_to_number("12px").is_nan());
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::str("").truthy());
        assert!(Value::str("0").truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn test_equality_rules() {
        let arr = Value::array(vec![Value::Number(1.0)]);
        assert!(arr.strict_equals(&arr.clone()));
        assert!(!arr.strict_equals(&Value::array(vec![Value::Number(1.0)])));
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(Value::str("5").loose_equals(&Value::Number(5.0)));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
    }

    #[test]
    fn test_inspect_is_json_style_for_structures() {
        let v = Value::object(vec![
            (Rc::from("name"), Value::str("Ada")),
            (Rc::from("tags"), Value::array(vec![Value::Number(1.0), Value::Undefined])),
        ]);
        assert_eq!(v.inspect(), r#"{"name":"Ada","tags":[1,undefined]}"#);
        assert_eq!(Value::str("plain").inspect(), "plain");
    }

    #[test]
    fn test_display_of_arrays_joins_with_commas() {
        let v = Value::array(vec![Value::Number(1.0), Value::Null, Value::str("x")]);
        assert_eq!(v.to_display(), "1,,x");
    }

    #[test]
    fn test_host_conversion() {
        assert_eq!(Value::Number(15.0).to_host(), Some(json!(15)));
        assert_eq!(Value::Number(1.5).to_host(), Some(json!(1.5)));
        assert_eq!(Value::Number(f64::NAN).to_host(), Some(json!("NaN")));
        assert_eq!(Value::Undefined.to_host(), None);
        let obj = Value::object(vec![
            (Rc::from("b"), Value::Number(1.0)),
            (Rc::from("a"), Value::Undefined),
        ]);
        assert_eq!(obj.to_host(), Some(json!({ "b": 1 })));
    }

    #[test]
    fn test_deep_nesting_is_released_iteratively() {
        let mut arr = Value::array(vec![]);
        let mut obj = Value::object(vec![]);
        for _ in 0..1_000_000 {
            arr = Value::array(vec![arr]);
            obj = Value::object(vec![(Rc::from("next"), obj)]);
        }
        assert!(arr.inspect().contains("[Array]"));
        assert!(obj.inspect().contains("[Object]"));
        drop(arr);
        drop(obj);
    }

    #[test]
    fn test_shared_children_survive_teardown() {
        let shared = Value::array(vec![Value::Number(7.0)]);
        let outer = Value::array(vec![shared.clone(), shared.clone()]);
        drop(outer);
        assert_eq!(shared.inspect(), "[7]");
    }

    #[test]
    fn test_int32_wrapping() {
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(-1.0), -1);
        assert_eq!(to_uint32(-1.0), u32::MAX);
        assert_eq!(to_int32(f64::NAN), 0);
    }
}
