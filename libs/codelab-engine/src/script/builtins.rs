//! Global objects and the method tables looked up on primitive values

use std::cmp::Ordering;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::console::ConsoleLevel;
use super::env::Scope;
use super::interp::{describe_value, js_pow, Exec, Interpreter, PropName, MAX_ARRAY_LEN};
use super::value::*;

type Method = (&'static str, NativeFn);

const STRING_METHODS: &[&str] = &[
    "charAt", "charCodeAt", "at", "indexOf", "lastIndexOf", "includes", "startsWith", "endsWith",
    "slice", "substring", "toUpperCase", "toLowerCase", "trim", "trimStart", "trimEnd", "split",
    "replace", "replaceAll", "repeat", "padStart", "padEnd", "concat", "localeCompare",
    "toString", "valueOf",
];

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "slice", "splice", "concat", "join", "reverse", "indexOf",
    "lastIndexOf", "includes", "map", "filter", "forEach", "find", "findIndex", "findLast",
    "findLastIndex", "some", "every", "flatMap", "reduce", "reduceRight", "sort", "flat", "fill",
    "at", "toString",
];

const OBJECT_METHODS: &[&str] = &["hasOwnProperty", "toString"];

const NUMBER_METHODS: &[&str] = &["toFixed", "toString", "valueOf"];

const FUNCTION_METHODS: &[&str] = &["call", "apply", "bind"];

const MAX_SLEEP_MS: f64 = 86_400_000.0;
const SLEEP_SLICE: Duration = Duration::from_millis(5);
const MAX_JSON_DEPTH: usize = 512;

fn lookup(table: &'static [&'static str], name: &str, func: NativeFn) -> Option<Method> {
    table.iter().find(|m| **m == name).map(|m| (*m, func))
}

pub(crate) fn string_method(name: &str) -> Option<Method> {
    lookup(STRING_METHODS, name, string_dispatch)
}

pub(crate) fn array_method(name: &str) -> Option<Method> {
    lookup(ARRAY_METHODS, name, array_dispatch)
}

pub(crate) fn object_method(name: &str) -> Option<Method> {
    lookup(OBJECT_METHODS, name, object_dispatch)
}

pub(crate) fn number_method(name: &str) -> Option<Method> {
    lookup(NUMBER_METHODS, name, number_dispatch)
}

pub(crate) fn function_method(name: &str) -> Option<Method> {
    lookup(FUNCTION_METHODS, name, function_dispatch)
}

pub(crate) fn object_to_string(
    _interp: &mut Interpreter,
    _name: &str,
    this: Value,
    _args: Vec<Value>,
) -> Exec<Value> {
    Ok(Value::str(&this.to_display()))
}

/// Declares the global bindings every program starts with
pub(crate) fn install(root: &Rc<Scope>) {
    let constants = [
        ("undefined", Value::Undefined),
        ("NaN", Value::Number(f64::NAN)),
        ("Infinity", Value::Number(f64::INFINITY)),
        ("this", Value::Undefined),
    ];
    for (name, value) in constants {
        root.declare(Rc::from(name), value, false);
    }

    let globals = [
        ("console", namespace(&["log", "info", "warn", "error"], console_write)),
        ("Math", math_namespace()),
        ("JSON", namespace(&["stringify", "parse"], json_dispatch)),
        ("Object", object_constructor()),
        ("Array", array_constructor()),
        ("Number", number_constructor()),
        (
            "String",
            native_with("String", string_ctor, vec![("fromCharCode", Value::native("fromCharCode", from_char_code))]),
        ),
        ("Boolean", Value::native("Boolean", boolean_ctor)),
        ("parseInt", Value::native("parseInt", number_static)),
        ("parseFloat", Value::native("parseFloat", number_static)),
        ("isNaN", Value::native("isNaN", global_numeric)),
        ("isFinite", Value::native("isFinite", global_numeric)),
        ("Error", Value::native("Error", error_ctor)),
        ("TypeError", Value::native("TypeError", error_ctor)),
        ("RangeError", Value::native("RangeError", error_ctor)),
        ("ReferenceError", Value::native("ReferenceError", error_ctor)),
        ("SyntaxError", Value::native("SyntaxError", error_ctor)),
        ("sleep", Value::native("sleep", sleep)),
    ];
    for (name, value) in globals {
        root.declare(Rc::from(name), value, true);
    }
}

fn native_with(name: &'static str, func: NativeFn, props: Vec<(&'static str, Value)>) -> Value {
    Value::Native(Rc::new(NativeFunction {
        name,
        func,
        receiver: None,
        props,
    }))
}

fn namespace(members: &[&'static str], func: NativeFn) -> Value {
    Value::object(
        members
            .iter()
            .map(|name| (Rc::from(*name), Value::native(*name, func)))
            .collect(),
    )
}

// ── argument helpers ────────────────────────────────────────────────────────

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

fn to_integer(value: &Value) -> f64 {
    let n = value.to_number();
    if n.is_nan() {
        0.0
    } else {
        n.trunc()
    }
}

/// Resolves a possibly negative index against `len`, as `slice` does
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = to_integer(value);
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        n.min(len as f64) as usize
    }
}

fn callback(interp: &Interpreter, args: &[Value]) -> Exec<Value> {
    let func = arg(args, 0);
    if !func.is_callable() {
        return interp.throw("TypeError", format!("{} is not a function", describe_value(&func)));
    }
    Ok(func)
}

fn item_at(items: &Rc<ArrayCell>, i: usize) -> Option<Value> {
    items.borrow().get(i).cloned()
}

fn char_values(s: &str) -> Vec<Value> {
    s.chars().map(|c| Value::str(c.encode_utf8(&mut [0; 4]))).collect()
}

fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => a.strict_equals(b),
    }
}

// ── console, sleep ──────────────────────────────────────────────────────────

fn console_write(interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let level = match name {
        "info" => ConsoleLevel::Info,
        "warn" => ConsoleLevel::Warn,
        "error" => ConsoleLevel::Error,
        _ => ConsoleLevel::Log,
    };
    let line = args.iter().map(Value::inspect).collect::<Vec<_>>().join(" ");
    interp.console().write(level, line);
    Ok(Value::Undefined)
}

fn sleep(interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    if !interp.limits().allow_sleep {
        return interp.throw("Error", "sleep() is not available in restricted sandbox mode");
    }
    let ms = arg(&args, 0).to_number();
    let ms = if ms.is_nan() { 0.0 } else { ms.clamp(0.0, MAX_SLEEP_MS) };
    let until = Instant::now() + Duration::from_millis(ms as u64);
    loop {
        interp.check_budget()?;
        let now = Instant::now();
        if now >= until {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(until - now));
    }
    Ok(Value::Undefined)
}

fn error_ctor(interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let message = match arg(&args, 0) {
        Value::Undefined => String::new(),
        other => other.to_display(),
    };
    Ok(interp.make_error(name, &message))
}

// ── Math ────────────────────────────────────────────────────────────────────

fn math_namespace() -> Value {
    const FUNCTIONS: &[&str] = &[
        "abs", "floor", "ceil", "round", "trunc", "sign", "sqrt", "cbrt", "pow", "min", "max",
        "random", "log", "log2", "log10", "exp", "sin", "cos", "tan", "atan", "atan2", "hypot",
    ];
    let mut props: Vec<(Rc<str>, Value)> = FUNCTIONS
        .iter()
        .map(|name| (Rc::from(*name), Value::native(*name, math)))
        .collect();
    props.push((Rc::from("PI"), Value::Number(std::f64::consts::PI)));
    props.push((Rc::from("E"), Value::Number(std::f64::consts::E)));
    Value::object(props)
}

fn math(interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let x = arg(&args, 0).to_number();
    let y = || arg(&args, 1).to_number();
    let result = match name {
        "abs" => x.abs(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => {
            let floor = x.floor();
            if x - floor >= 0.5 {
                floor + 1.0
            } else {
                floor
            }
        }
        "trunc" => x.trunc(),
        "sign" => {
            if x.is_nan() || x == 0.0 {
                x
            } else {
                x.signum()
            }
        }
        "sqrt" => x.sqrt(),
        "cbrt" => x.cbrt(),
        "pow" => js_pow(x, y()),
        "min" | "max" => {
            let mut acc = if name == "min" { f64::INFINITY } else { f64::NEG_INFINITY };
            for value in &args {
                let n = value.to_number();
                if n.is_nan() {
                    return Ok(Value::Number(f64::NAN));
                }
                acc = if name == "min" { acc.min(n) } else { acc.max(n) };
            }
            acc
        }
        "random" => interp.next_random(),
        "log" => x.ln(),
        "log2" => x.log2(),
        "log10" => x.log10(),
        "exp" => x.exp(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "atan" => x.atan(),
        "atan2" => x.atan2(y()),
        "hypot" => args.iter().map(|v| v.to_number().powi(2)).sum::<f64>().sqrt(),
        _ => f64::NAN,
    };
    Ok(Value::Number(result))
}

// ── JSON ────────────────────────────────────────────────────────────────────

fn json_dispatch(interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    match name {
        "parse" => {
            let text = arg(&args, 0).to_display();
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(json) => Ok(Value::from_json(&json)),
                Err(e) => interp.throw("SyntaxError", format!("Invalid JSON: {}", e)),
            }
        }
        _ => {
            let mut seen = Vec::new();
            let Some(json) = to_json(interp, &arg(&args, 0), &mut seen)? else {
                return Ok(Value::Undefined);
            };
            let indent = match arg(&args, 2) {
                Value::Number(n) => " ".repeat(n.clamp(0.0, 10.0) as usize),
                Value::Str(s) => s.chars().take(10).collect(),
                _ => String::new(),
            };
            let text = if indent.is_empty() {
                serde_json::to_string(&json)
            } else {
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
                let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
                json.serialize(&mut ser)
                    .map(|_| String::from_utf8_lossy(&buf).into_owned())
            };
            match text {
                Ok(text) => interp.string_value(text),
                Err(e) => interp.throw("TypeError", e.to_string()),
            }
        }
    }
}

/// `None` for values JSON omits (undefined and functions)
fn to_json(interp: &Interpreter, value: &Value, seen: &mut Vec<*const ()>) -> Exec<Option<serde_json::Value>> {
    use serde_json::Value as J;
    let json = match value {
        Value::Undefined | Value::Function(_) | Value::Native(_) => return Ok(None),
        Value::Null => J::Null,
        Value::Bool(b) => J::Bool(*b),
        Value::Number(n) => number_to_json(*n).unwrap_or(J::Null),
        Value::Str(s) => J::String(s.to_string()),
        Value::Array(items) => {
            let id = Rc::as_ptr(items) as *const ();
            enter(interp, seen, id)?;
            let snapshot = items.borrow().clone();
            let mut out = Vec::with_capacity(snapshot.len());
            for item in &snapshot {
                out.push(to_json(interp, item, seen)?.unwrap_or(J::Null));
            }
            seen.pop();
            J::Array(out)
        }
        Value::Object(obj) => {
            if obj.borrow().class == ObjectClass::Error {
                return Ok(Some(J::Object(serde_json::Map::new())));
            }
            let id = Rc::as_ptr(obj) as *const ();
            enter(interp, seen, id)?;
            let props = obj.borrow().props.clone();
            let mut map = serde_json::Map::new();
            for (key, item) in &props {
                if let Some(item) = to_json(interp, item, seen)? {
                    map.insert(key.to_string(), item);
                }
            }
            seen.pop();
            J::Object(map)
        }
    };
    Ok(Some(json))
}

fn enter(interp: &Interpreter, seen: &mut Vec<*const ()>, id: *const ()) -> Exec<()> {
    if seen.contains(&id) {
        return interp.throw("TypeError", "Converting circular structure to JSON");
    }
    if seen.len() >= MAX_JSON_DEPTH {
        return interp.throw("RangeError", "Maximum call stack size exceeded");
    }
    seen.push(id);
    Ok(())
}

// ── Object ──────────────────────────────────────────────────────────────────

fn object_constructor() -> Value {
    let statics = ["keys", "values", "entries", "assign", "fromEntries"]
        .into_iter()
        .map(|name| (name, Value::native(name, object_static)))
        .collect();
    native_with("Object", object_ctor, statics)
}

fn object_ctor(_interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    Ok(match arg(&args, 0) {
        v @ (Value::Object(_) | Value::Array(_) | Value::Function(_) | Value::Native(_)) => v,
        _ => Value::object(Vec::new()),
    })
}

fn own_entries(value: &Value) -> Vec<(Rc<str>, Value)> {
    match value {
        Value::Object(obj) => obj.borrow().props.clone(),
        Value::Array(items) => items
            .borrow()
            .iter()
            .enumerate()
            .map(|(i, v)| (Rc::from(i.to_string().as_str()), v.clone()))
            .collect(),
        Value::Str(s) => char_values(s)
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Rc::from(i.to_string().as_str()), v))
            .collect(),
        _ => Vec::new(),
    }
}

fn object_static(interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let subject = arg(&args, 0);
    if subject.is_nullish() && name != "fromEntries" {
        return interp.throw("TypeError", "Cannot convert undefined or null to object");
    }
    let result = match name {
        "keys" => Value::array(
            own_entries(&subject)
                .into_iter()
                .map(|(k, _)| Value::Str(k))
                .collect(),
        ),
        "values" => Value::array(own_entries(&subject).into_iter().map(|(_, v)| v).collect()),
        "entries" => Value::array(
            own_entries(&subject)
                .into_iter()
                .map(|(k, v)| Value::array(vec![Value::Str(k), v]))
                .collect(),
        ),
        "assign" => {
            if let Value::Object(target) = &subject {
                for source in args.iter().skip(1) {
                    for (key, value) in own_entries(source) {
                        target.borrow_mut().set(key, value);
                    }
                }
            }
            subject
        }
        _ => {
            let entries = match &subject {
                Value::Array(items) => items.borrow().clone(),
                other => {
                    return interp.throw("TypeError", format!("{} is not iterable", describe_value(other)))
                }
            };
            let mut obj = JsObject::new(ObjectClass::Plain);
            for entry in entries {
                let Value::Array(pair) = &entry else {
                    return interp.throw(
                        "TypeError",
                        format!("Iterator value {} is not an entry object", describe_value(&entry)),
                    );
                };
                let (key, value) = {
                    let pair = pair.borrow();
                    (
                        pair.first().cloned().unwrap_or(Value::Undefined),
                        pair.get(1).cloned().unwrap_or(Value::Undefined),
                    )
                };
                obj.set(PropName::from_value(&key).as_key(), value);
            }
            Value::Object(Rc::new(ObjectCell::new(obj)))
        }
    };
    Ok(result)
}

fn object_dispatch(_interp: &mut Interpreter, name: &str, this: Value, args: Vec<Value>) -> Exec<Value> {
    match name {
        "hasOwnProperty" => {
            let key = PropName::from_value(&arg(&args, 0)).as_key();
            let found = match &this {
                Value::Object(obj) => obj.borrow().has(&key),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        _ => Ok(Value::str(&this.to_display())),
    }
}

// ── Array ───────────────────────────────────────────────────────────────────

fn array_constructor() -> Value {
    let statics = ["isArray", "from", "of"]
        .into_iter()
        .map(|name| (name, Value::native(name, array_static)))
        .collect();
    native_with("Array", array_ctor, statics)
}

fn array_ctor(interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    match args.as_slice() {
        [Value::Number(n)] => {
            if *n < 0.0 || n.fract() != 0.0 || *n as usize > MAX_ARRAY_LEN {
                return interp.throw("RangeError", "Invalid array length");
            }
            Ok(Value::array(vec![Value::Undefined; *n as usize]))
        }
        _ => Ok(Value::array(args)),
    }
}

fn array_static(interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    match name {
        "isArray" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
        "of" => Ok(Value::array(args)),
        _ => {
            let items = match arg(&args, 0) {
                Value::Array(items) => items.borrow().clone(),
                Value::Str(s) => char_values(&s),
                Value::Object(obj) => {
                    let len = obj
                        .borrow()
                        .get("length")
                        .map(|v| to_integer(&v).max(0.0))
                        .unwrap_or(0.0);
                    if len > MAX_ARRAY_LEN as f64 {
                        return interp.throw("RangeError", "Invalid array length");
                    }
                    let obj = obj.borrow();
                    let items: Vec<Value> = (0..len as usize)
                        .map(|i| obj.get(&i.to_string()).unwrap_or(Value::Undefined))
                        .collect();
                    items
                }
                _ => Vec::new(),
            };
            let map_fn = arg(&args, 1);
            if !map_fn.is_callable() {
                return Ok(Value::array(items));
            }
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                out.push(interp.call(&map_fn, Value::Undefined, vec![item, Value::Number(i as f64)])?);
            }
            Ok(Value::array(out))
        }
    }
}

fn array_dispatch(interp: &mut Interpreter, name: &str, this: Value, args: Vec<Value>) -> Exec<Value> {
    let arr = match &this {
        Value::Array(items) => items.clone(),
        other => {
            return interp.throw(
                "TypeError",
                format!("Array.prototype.{} called on {}", name, describe_value(other)),
            )
        }
    };
    let len = arr.borrow().len();

    let result = match name {
        "push" => {
            let new_len = len + args.len();
            interp.check_array_len(new_len)?;
            arr.borrow_mut().extend(args);
            Value::Number(new_len as f64)
        }
        "pop" => {
            let popped = arr.borrow_mut().pop();
            popped.unwrap_or(Value::Undefined)
        }
        "shift" => {
            if len == 0 {
                Value::Undefined
            } else {
                let first = arr.borrow_mut().remove(0);
                first
            }
        }
        "unshift" => {
            let new_len = len + args.len();
            interp.check_array_len(new_len)?;
            arr.borrow_mut().splice(0..0, args);
            Value::Number(new_len as f64)
        }
        "slice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            let items = arr.borrow();
            Value::array(if start < end { items[start..end].to_vec() } else { Vec::new() })
        }
        "splice" => {
            if args.is_empty() {
                return Ok(Value::array(Vec::new()));
            }
            let start = relative_index(&args[0], len, 0);
            let delete = match args.get(1) {
                None => len - start,
                Some(count) => (to_integer(count).max(0.0) as usize).min(len - start),
            };
            let inserts: Vec<Value> = args.iter().skip(2).cloned().collect();
            interp.check_array_len(len - delete + inserts.len())?;
            let removed: Vec<Value> = arr.borrow_mut().splice(start..start + delete, inserts).collect();
            Value::array(removed)
        }
        "concat" => {
            let mut out = arr.borrow().clone();
            for value in &args {
                match value {
                    Value::Array(items) => out.extend(items.borrow().iter().cloned()),
                    other => out.push(other.clone()),
                }
                interp.check_array_len(out.len())?;
            }
            Value::array(out)
        }
        "join" | "toString" => {
            let separator = match arg(&args, 0) {
                Value::Undefined => ",".to_string(),
                other if name == "join" => other.to_display(),
                _ => ",".to_string(),
            };
            let parts: Vec<String> = arr
                .borrow()
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_display(),
                })
                .collect();
            interp.string_value(parts.join(&separator))?
        }
        "reverse" => {
            arr.borrow_mut().reverse();
            this.clone()
        }
        "indexOf" | "lastIndexOf" | "includes" => {
            let needle = arg(&args, 0);
            let items = arr.borrow();
            let found = match name {
                "indexOf" => {
                    let from = relative_index(&arg(&args, 1), len, 0);
                    (from..len).find(|&i| items[i].strict_equals(&needle))
                }
                "lastIndexOf" => {
                    let from = match arg(&args, 1) {
                        Value::Undefined => len,
                        v => relative_index(&v, len, len).saturating_add(1).min(len),
                    };
                    (0..from).rev().find(|&i| items[i].strict_equals(&needle))
                }
                _ => {
                    let from = relative_index(&arg(&args, 1), len, 0);
                    return Ok(Value::Bool(items[from..].iter().any(|v| same_value_zero(v, &needle))));
                }
            };
            Value::Number(found.map(|i| i as f64).unwrap_or(-1.0))
        }
        "map" | "filter" | "forEach" | "some" | "every" | "flatMap" => {
            let func = callback(interp, &args)?;
            let this_arg = arg(&args, 1);
            let mut out = Vec::new();
            for i in 0..len {
                let Some(item) = item_at(&arr, i) else { break };
                let result = interp.call(
                    &func,
                    this_arg.clone(),
                    vec![item.clone(), Value::Number(i as f64), this.clone()],
                )?;
                match name {
                    "map" => out.push(result),
                    "filter" if result.truthy() => out.push(item),
                    "some" if result.truthy() => return Ok(Value::Bool(true)),
                    "every" if !result.truthy() => return Ok(Value::Bool(false)),
                    "flatMap" => match result {
                        Value::Array(inner) => out.extend(inner.borrow().iter().cloned()),
                        other => out.push(other),
                    },
                    _ => {}
                }
                interp.check_array_len(out.len())?;
            }
            match name {
                "some" => Value::Bool(false),
                "every" => Value::Bool(true),
                "forEach" => Value::Undefined,
                _ => Value::array(out),
            }
        }
        "find" | "findIndex" | "findLast" | "findLastIndex" => {
            let func = callback(interp, &args)?;
            let reverse = name.starts_with("findLast");
            let indices: Box<dyn Iterator<Item = usize>> = if reverse {
                Box::new((0..len).rev())
            } else {
                Box::new(0..len)
            };
            let wants_index = name.ends_with("Index");
            for i in indices {
                let item = item_at(&arr, i).unwrap_or(Value::Undefined);
                let hit = interp
                    .call(&func, Value::Undefined, vec![item.clone(), Value::Number(i as f64), this.clone()])?
                    .truthy();
                if hit {
                    return Ok(if wants_index { Value::Number(i as f64) } else { item });
                }
            }
            if wants_index {
                Value::Number(-1.0)
            } else {
                Value::Undefined
            }
        }
        "reduce" | "reduceRight" => {
            let func = callback(interp, &args)?;
            let mut order: Box<dyn Iterator<Item = usize>> = if name == "reduce" {
                Box::new(0..len)
            } else {
                Box::new((0..len).rev())
            };
            let mut acc = if args.len() >= 2 {
                args[1].clone()
            } else {
                match order.next().and_then(|i| item_at(&arr, i)) {
                    Some(first) => first,
                    None => return interp.throw("TypeError", "Reduce of empty array with no initial value"),
                }
            };
            for i in order {
                let Some(item) = item_at(&arr, i) else { continue };
                acc = interp.call(
                    &func,
                    Value::Undefined,
                    vec![acc, item, Value::Number(i as f64), this.clone()],
                )?;
            }
            acc
        }
        "sort" => {
            let comparator = match arg(&args, 0) {
                Value::Undefined => None,
                f if f.is_callable() => Some(f),
                _ => {
                    return interp.throw(
                        "TypeError",
                        "The comparison function must be either a function or undefined",
                    )
                }
            };
            let items = arr.borrow().clone();
            let (defined, undefined): (Vec<Value>, Vec<Value>) =
                items.into_iter().partition(|v| !matches!(v, Value::Undefined));
            let mut sorted = merge_sort(interp, defined, comparator.as_ref())?;
            sorted.extend(undefined);
            *arr.borrow_mut() = sorted;
            this.clone()
        }
        "flat" => {
            let depth = match arg(&args, 0) {
                Value::Undefined => 1.0,
                v => to_integer(&v).min(MAX_JSON_DEPTH as f64),
            };
            let items = arr.borrow().clone();
            let mut out = Vec::new();
            flatten_into(interp, &items, depth, &mut out)?;
            Value::array(out)
        }
        "fill" => {
            let value = arg(&args, 0);
            let start = relative_index(&arg(&args, 1), len, 0);
            let end = relative_index(&arg(&args, 2), len, len);
            for slot in arr.borrow_mut().iter_mut().take(end).skip(start) {
                *slot = value.clone();
            }
            this.clone()
        }
        "at" => {
            let n = to_integer(&arg(&args, 0));
            let index = if n < 0.0 { len as f64 + n } else { n };
            if index < 0.0 {
                Value::Undefined
            } else {
                item_at(&arr, index as usize).unwrap_or(Value::Undefined)
            }
        }
        _ => Value::Undefined,
    };
    Ok(result)
}

fn sort_compare(interp: &mut Interpreter, a: &Value, b: &Value, comparator: Option<&Value>) -> Exec<Ordering> {
    match comparator {
        Some(func) => {
            let n = interp.call(func, Value::Undefined, vec![a.clone(), b.clone()])?.to_number();
            Ok(if n > 0.0 {
                Ordering::Greater
            } else if n < 0.0 {
                Ordering::Less
            } else {
                Ordering::Equal
            })
        }
        None => Ok(a.to_display().cmp(&b.to_display())),
    }
}

/// Stable merge sort whose comparator may throw
fn merge_sort(interp: &mut Interpreter, mut items: Vec<Value>, comparator: Option<&Value>) -> Exec<Vec<Value>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, items, comparator)?;
    let right = merge_sort(interp, right, comparator)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if sort_compare(interp, &left[i], &right[j], comparator)? == Ordering::Greater {
            out.push(right[j].clone());
            j += 1;
        } else {
            out.push(left[i].clone());
            i += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    Ok(out)
}

fn flatten_into(interp: &Interpreter, items: &[Value], depth: f64, out: &mut Vec<Value>) -> Exec<()> {
    for item in items {
        match item {
            Value::Array(inner) if depth >= 1.0 => {
                let inner = inner.borrow().clone();
                flatten_into(interp, &inner, depth - 1.0, out)?;
            }
            other => out.push(other.clone()),
        }
        interp.check_array_len(out.len())?;
    }
    Ok(())
}

// ── String ──────────────────────────────────────────────────────────────────

fn string_ctor(_interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    Ok(match args.first() {
        None => Value::str(""),
        Some(Value::Str(s)) => Value::Str(s.clone()),
        Some(other) => Value::str(&other.to_display()),
    })
}

fn from_char_code(interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let text: String = args
        .iter()
        .map(|v| char::from_u32(to_uint32(v.to_number()) & 0xffff).unwrap_or('\u{fffd}'))
        .collect();
    interp.string_value(text)
}

fn boolean_ctor(_interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    Ok(Value::Bool(arg(&args, 0).truthy()))
}

fn find_from(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(hay.len()));
    }
    if needle.len() > hay.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()] == *needle)
}

fn rfind_from(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > hay.len() {
        return None;
    }
    let start = from.min(hay.len() - needle.len());
    (0..=start).rev().find(|&i| hay[i..i + needle.len()] == *needle)
}

/// Expands `$&` and `$$` in a replacement string
fn expand_replacement(template: &str, matched: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('$', Some('&')) => {
                chars.next();
                out.push_str(matched);
            }
            ('$', Some('$')) => {
                chars.next();
                out.push('$');
            }
            _ => out.push(c),
        }
    }
    out
}

fn string_dispatch(interp: &mut Interpreter, name: &str, this: Value, args: Vec<Value>) -> Exec<Value> {
    let s: Rc<str> = match &this {
        Value::Str(s) => s.clone(),
        other => Rc::from(other.to_display().as_str()),
    };
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let text_arg = |i: usize| -> Vec<char> { arg(&args, i).to_display().chars().collect() };
    let from_chars = |range: &[char]| -> Value { Value::str(&range.iter().collect::<String>()) };

    let result = match name {
        "charAt" => {
            let i = to_integer(&arg(&args, 0));
            if i >= 0.0 && (i as usize) < len {
                from_chars(&chars[i as usize..i as usize + 1])
            } else {
                Value::str("")
            }
        }
        "charCodeAt" => {
            let i = to_integer(&arg(&args, 0));
            if i >= 0.0 && (i as usize) < len {
                Value::Number(chars[i as usize] as u32 as f64)
            } else {
                Value::Number(f64::NAN)
            }
        }
        "at" => {
            let n = to_integer(&arg(&args, 0));
            let index = if n < 0.0 { len as f64 + n } else { n };
            if index >= 0.0 && (index as usize) < len {
                from_chars(&chars[index as usize..index as usize + 1])
            } else {
                Value::Undefined
            }
        }
        "indexOf" => {
            let from = to_integer(&arg(&args, 1)).clamp(0.0, len as f64) as usize;
            Value::Number(find_from(&chars, &text_arg(0), from).map(|i| i as f64).unwrap_or(-1.0))
        }
        "lastIndexOf" => {
            let from = match arg(&args, 1).to_number() {
                n if n.is_nan() => len,
                n => n.max(0.0).min(len as f64) as usize,
            };
            Value::Number(rfind_from(&chars, &text_arg(0), from).map(|i| i as f64).unwrap_or(-1.0))
        }
        "includes" => {
            let from = to_integer(&arg(&args, 1)).clamp(0.0, len as f64) as usize;
            Value::Bool(find_from(&chars, &text_arg(0), from).is_some())
        }
        "startsWith" => {
            let pos = to_integer(&arg(&args, 1)).clamp(0.0, len as f64) as usize;
            Value::Bool(chars[pos..].starts_with(&text_arg(0)))
        }
        "endsWith" => {
            let end = match arg(&args, 1) {
                Value::Undefined => len,
                v => to_integer(&v).clamp(0.0, len as f64) as usize,
            };
            Value::Bool(chars[..end].ends_with(&text_arg(0)))
        }
        "slice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            if start < end {
                from_chars(&chars[start..end])
            } else {
                Value::str("")
            }
        }
        "substring" => {
            let clamp = |v: &Value, default: usize| match v {
                Value::Undefined => default,
                v => to_integer(v).clamp(0.0, len as f64) as usize,
            };
            let a = clamp(&arg(&args, 0), 0);
            let b = clamp(&arg(&args, 1), len);
            from_chars(&chars[a.min(b)..a.max(b)])
        }
        "toUpperCase" => Value::str(&s.to_uppercase()),
        "toLowerCase" => Value::str(&s.to_lowercase()),
        "trim" => Value::str(s.trim()),
        "trimStart" => Value::str(s.trim_start()),
        "trimEnd" => Value::str(s.trim_end()),
        "split" => {
            let limit = match arg(&args, 1) {
                Value::Undefined => usize::MAX,
                v => to_uint32(v.to_number()) as usize,
            };
            let parts: Vec<Value> = match arg(&args, 0) {
                Value::Undefined => vec![Value::Str(s.clone())],
                separator => {
                    let separator = separator.to_display();
                    if separator.is_empty() {
                        char_values(&s)
                    } else {
                        s.split(separator.as_str()).map(Value::str).collect()
                    }
                }
            };
            Value::array(parts.into_iter().take(limit).collect())
        }
        "replace" | "replaceAll" => {
            let pattern = arg(&args, 0).to_display();
            let replacement = arg(&args, 1);
            let positions: Vec<usize> = match (pattern.is_empty(), name) {
                (true, "replace") => vec![0],
                (true, _) => s.char_indices().map(|(i, _)| i).chain(std::iter::once(s.len())).collect(),
                (false, "replace") => s.match_indices(pattern.as_str()).map(|(i, _)| i).take(1).collect(),
                (false, _) => s.match_indices(pattern.as_str()).map(|(i, _)| i).collect(),
            };
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for pos in positions {
                out.push_str(&s[last..pos]);
                let piece = if replacement.is_callable() {
                    let offset = s[..pos].chars().count();
                    interp
                        .call(
                            &replacement,
                            Value::Undefined,
                            vec![Value::str(&pattern), Value::Number(offset as f64), Value::Str(s.clone())],
                        )?
                        .to_display()
                } else {
                    expand_replacement(&replacement.to_display(), &pattern)
                };
                out.push_str(&piece);
                if out.len() > interp.limits().max_string_len {
                    return interp.throw("RangeError", "Invalid string length");
                }
                last = pos + pattern.len();
            }
            out.push_str(&s[last..]);
            interp.string_value(out)?
        }
        "repeat" => {
            let count = to_integer(&arg(&args, 0));
            if count < 0.0 || count.is_infinite() {
                return interp.throw("RangeError", format!("Invalid count value: {}", number_to_string(count)));
            }
            if s.len() as f64 * count > interp.limits().max_string_len as f64 {
                return interp.throw("RangeError", "Invalid string length");
            }
            Value::str(&s.repeat(count as usize))
        }
        "padStart" | "padEnd" => {
            let target = to_integer(&arg(&args, 0));
            let fill = match arg(&args, 1) {
                Value::Undefined => " ".to_string(),
                v => v.to_display(),
            };
            if target <= len as f64 || fill.is_empty() {
                return Ok(Value::Str(s.clone()));
            }
            if target > interp.limits().max_string_len as f64 {
                return interp.throw("RangeError", "Invalid string length");
            }
            let pad: String = fill.chars().cycle().take(target as usize - len).collect();
            let out = if name == "padStart" {
                pad + &*s
            } else {
                format!("{}{}", s, pad)
            };
            interp.string_value(out)?
        }
        "concat" => {
            let mut out = s.to_string();
            for value in &args {
                out.push_str(&value.to_display());
            }
            interp.string_value(out)?
        }
        "localeCompare" => {
            let other = arg(&args, 0).to_display();
            Value::Number(match (*s).cmp(other.as_str()) {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            })
        }
        _ => Value::Str(s.clone()),
    };
    Ok(result)
}

// ── Number ──────────────────────────────────────────────────────────────────

fn number_constructor() -> Value {
    let mut statics: Vec<(&'static str, Value)> =
        ["isInteger", "isFinite", "isNaN", "isSafeInteger", "parseInt", "parseFloat"]
            .into_iter()
            .map(|name| (name, Value::native(name, number_static)))
            .collect();
    statics.extend([
        ("MAX_SAFE_INTEGER", Value::Number(9_007_199_254_740_991.0)),
        ("MIN_SAFE_INTEGER", Value::Number(-9_007_199_254_740_991.0)),
        ("EPSILON", Value::Number(f64::EPSILON)),
        ("MAX_VALUE", Value::Number(f64::MAX)),
        ("MIN_VALUE", Value::Number(5e-324)),
        ("POSITIVE_INFINITY", Value::Number(f64::INFINITY)),
        ("NEGATIVE_INFINITY", Value::Number(f64::NEG_INFINITY)),
        ("NaN", Value::Number(f64::NAN)),
    ]);
    native_with("Number", number_ctor, statics)
}

fn number_ctor(_interp: &mut Interpreter, _name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    Ok(Value::Number(args.first().map(Value::to_number).unwrap_or(0.0)))
}

fn number_static(_interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let subject = arg(&args, 0);
    let result = match (name, &subject) {
        ("parseInt", v) => Value::Number(parse_int(&v.to_display(), &arg(&args, 1))),
        ("parseFloat", v) => Value::Number(parse_float(&v.to_display())),
        ("isInteger", Value::Number(n)) => Value::Bool(n.is_finite() && n.fract() == 0.0),
        ("isSafeInteger", Value::Number(n)) => {
            Value::Bool(n.is_finite() && n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0)
        }
        ("isFinite", Value::Number(n)) => Value::Bool(n.is_finite()),
        ("isNaN", Value::Number(n)) => Value::Bool(n.is_nan()),
        _ => Value::Bool(false),
    };
    Ok(result)
}

/// Global `isNaN`/`isFinite`, which coerce their argument
fn global_numeric(_interp: &mut Interpreter, name: &str, _this: Value, args: Vec<Value>) -> Exec<Value> {
    let n = arg(&args, 0).to_number();
    Ok(Value::Bool(if name == "isNaN" { n.is_nan() } else { n.is_finite() }))
}

fn parse_int(text: &str, radix: &Value) -> f64 {
    let s = text.trim_start();
    let (sign, mut s) = match s.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut radix = match radix {
        Value::Undefined => 0,
        v => to_int32(v.to_number()),
    };
    if radix != 0 && !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    if (radix == 0 || radix == 16) && (s.starts_with("0x") || s.starts_with("0X")) {
        s = &s[2..];
        radix = 16;
    }
    if radix == 0 {
        radix = 10;
    }
    let mut value = 0.0;
    let mut any = false;
    for c in s.chars() {
        match c.to_digit(radix as u32) {
            Some(d) => {
                value = value * radix as f64 + d as f64;
                any = true;
            }
            None => break,
        }
    }
    if any {
        sign * value
    } else {
        f64::NAN
    }
}

fn parse_float(text: &str) -> f64 {
    let s = text.trim_start();
    let unsigned = s.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(s);
    if unsigned.starts_with("Infinity") {
        return if s.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    let bytes = s.as_bytes();
    let digits = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };
    let mut end = if unsigned.len() < s.len() { 1 } else { 0 };
    let int_end = digits(end);
    let mut saw_digit = int_end > end;
    end = int_end;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_end = digits(end + 1);
        saw_digit |= frac_end > end + 1;
        end = frac_end;
    }
    if !saw_digit {
        return f64::NAN;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        let exp_end = digits(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    s[..end].parse::<f64>().unwrap_or(f64::NAN)
}

fn number_dispatch(interp: &mut Interpreter, name: &str, this: Value, args: Vec<Value>) -> Exec<Value> {
    let n = this.to_number();
    match name {
        "toFixed" => {
            let digits = to_integer(&arg(&args, 0));
            if !(0.0..=100.0).contains(&digits) {
                return interp.throw("RangeError", "toFixed() digits argument must be between 0 and 100");
            }
            Ok(Value::str(&to_fixed(n, digits as usize)))
        }
        "toString" => {
            let radix = match arg(&args, 0) {
                Value::Undefined => 10.0,
                v => to_integer(&v),
            };
            if !(2.0..=36.0).contains(&radix) {
                return interp.throw("RangeError", "toString() radix must be between 2 and 36");
            }
            Ok(Value::str(&to_radix_string(n, radix as u32)))
        }
        _ => Ok(Value::Number(n)),
    }
}

/// Fixed-point formatting with ties rounded away from zero on the exact binary value
fn to_fixed(n: f64, digits: usize) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if !n.is_finite() || n.abs() >= 1e21 {
        return number_to_string(n);
    }
    let exact = format!("{:.*}", digits + 30, n.abs());
    let (int_part, frac_part) = exact.split_once('.').unwrap_or((exact.as_str(), ""));
    let mut kept: Vec<u8> = int_part.bytes().chain(frac_part.bytes().take(digits)).collect();
    if frac_part.as_bytes().get(digits).is_some_and(|d| *d >= b'5') {
        let mut i = kept.len();
        loop {
            if i == 0 {
                kept.insert(0, b'1');
                break;
            }
            i -= 1;
            if kept[i] == b'9' {
                kept[i] = b'0';
            } else {
                kept[i] += 1;
                break;
            }
        }
    }
    let int_len = kept.len() - digits;
    let mut out = String::new();
    if n < 0.0 {
        out.push('-');
    }
    out.push_str(&String::from_utf8_lossy(&kept[..int_len]));
    if digits > 0 {
        out.push('.');
        out.push_str(&String::from_utf8_lossy(&kept[int_len..]));
    }
    out
}

fn to_radix_string(n: f64, radix: u32) -> String {
    if radix == 10 || !n.is_finite() {
        return number_to_string(n);
    }
    let base = radix as f64;
    let mut int = n.abs().trunc();
    let mut frac = n.abs().fract();
    let mut digits = Vec::new();
    if int == 0.0 {
        digits.push('0');
    }
    while int >= 1.0 {
        let d = (int % base) as u32;
        digits.push(char::from_digit(d, radix).unwrap_or('0'));
        int = (int / base).trunc();
    }
    if n < 0.0 {
        digits.push('-');
    }
    digits.reverse();
    let mut out: String = digits.into_iter().collect();
    if frac > 0.0 {
        out.push('.');
        for _ in 0..52 {
            frac *= base;
            let d = frac.trunc() as u32;
            out.push(char::from_digit(d, radix).unwrap_or('0'));
            frac -= d as f64;
            if frac == 0.0 {
                break;
            }
        }
    }
    out
}

// ── Function ────────────────────────────────────────────────────────────────

fn function_dispatch(interp: &mut Interpreter, name: &str, this: Value, args: Vec<Value>) -> Exec<Value> {
    let mut args = args.into_iter();
    let bound_this = args.next().unwrap_or(Value::Undefined);
    match name {
        "call" => interp.call(&this, bound_this, args.collect()),
        "apply" => {
            let list = match args.next() {
                Some(Value::Array(items)) => items.borrow().clone(),
                None | Some(Value::Undefined) | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return interp.throw(
                        "TypeError",
                        format!("CreateListFromArrayLike called on {}", describe_value(&other)),
                    )
                }
            };
            interp.call(&this, bound_this, list)
        }
        _ => {
            let packed = Value::array(vec![this, bound_this, Value::array(args.collect())]);
            Ok(Value::bound_native("bound", call_bound, packed))
        }
    }
}

/// Invokes a function produced by `bind`; the receiver packs `[target, this, args]`
fn call_bound(interp: &mut Interpreter, _name: &str, packed: Value, args: Vec<Value>) -> Exec<Value> {
    let Value::Array(parts) = &packed else {
        return Ok(Value::Undefined);
    };
    let (target, this, mut full_args) = {
        let parts = parts.borrow();
        let bound_args = match parts.get(2) {
            Some(Value::Array(items)) => items.borrow().clone(),
            _ => Vec::new(),
        };
        (
            parts.first().cloned().unwrap_or(Value::Undefined),
            parts.get(1).cloned().unwrap_or(Value::Undefined),
            bound_args,
        )
    };
    full_args.extend(args);
    interp.call(&target, this, full_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{run, Console, Limits, RunOptions, ScriptFailure};
    use std::time::Duration;

    fn logs(src: &str) -> Vec<String> {
        let console = Console::new(true, 100);
        let options = RunOptions::new(Limits::standard(), Duration::from_secs(5));
        match run(src, options, console.clone()) {
            Ok(_) => console.snapshot(),
            Err(failure) => panic!("program failed: {:?}", failure),
        }
    }

    fn thrown(src: &str) -> String {
        let options = RunOptions::new(Limits::standard(), Duration::from_secs(5));
        match run(src, options, Console::new(true, 100)) {
            Err(ScriptFailure::Thrown { message, .. }) => message,
            other => panic!("expected a throw, got {:?}", other),
        }
    }

    #[test]
    fn test_console_levels_and_formatting() {
        let out = logs(r#"
            console.log("a", 1, [1, "b"], { k: null })
            console.warn("careful")
            console.error(new RangeError("bad"))
        "#);
        assert_eq!(out, vec![r#"a 1 [1,"b"] {"k":null}"#, "WARN: careful", "ERROR: RangeError: bad"]);
    }

    #[test]
    fn test_array_higher_order_methods() {
        let out = logs(r#"
            const xs = [3, 1, 2]
            console.log(xs.map(x => x * 2).join("-"))
            console.log(xs.filter(x => x > 1).length)
            console.log(xs.reduce((a, b) => a + b, 0))
            console.log(xs.find(x => x < 3), xs.findIndex(x => x === 9))
            console.log(xs.some(x => x > 2), xs.every(x => x > 2))
            console.log([[1, 2], [3, [4]]].flat().length, [1, 2].flatMap(x => [x, x]).join(""))
        "#);
        assert_eq!(out, vec!["6-2-4", "2", "6", "1 -1", "true false", "4 1122"]);
    }

    #[test]
    fn test_sort_is_stable_and_numeric_with_comparator() {
        let out = logs(r#"
            console.log([10, 9, 1, 100].sort().join())
            console.log([10, 9, 1, 100].sort((a, b) => a - b).join())
            const people = [{ n: "b", a: 1 }, { n: "a", a: 0 }, { n: "c", a: 1 }]
            console.log(people.sort((x, y) => x.a - y.a).map(p => p.n).join(""))
            console.log([3, undefined, 1].sort().join())
        "#);
        assert_eq!(out, vec!["1,10,100,9", "1,9,10,100", "abc", "1,3,"]);
    }

    #[test]
    fn test_reduce_on_empty_array_throws() {
        assert_eq!(thrown("[].reduce((a, b) => a + b)"), "Reduce of empty array with no initial value");
    }

    #[test]
    fn test_string_methods_are_char_indexed() {
        let out = logs(r#"
            const s = "héllo wörld"
            console.log(s.length, s.charAt(1), s.indexOf("w"), s.slice(-5))
            console.log(s.split(" ").length, "a,b,,c".split(",", 2).join("|"))
            console.log("abc".padStart(5, "-"), "7".padEnd(3, "0"), "ab".repeat(3))
            console.log("aXbXc".replaceAll("X", "_"), "aXbXc".replace("X", m => m.toLowerCase()))
            console.log("  trim  ".trim() + "|", "Hello".toUpperCase(), "abc".at(-1))
        "#);
        assert_eq!(
            out,
            vec!["11 é 6 wörld", "2 a|b", "--abc 700 ababab", "a_b_c axbXc", "trim| HELLO c"]
        );
    }

    #[test]
    fn test_number_formatting_methods() {
        let out = logs(r#"
            console.log((2.5).toFixed(0), (1.005).toFixed(2), (0.1 + 0.2).toFixed(2), (-1.5).toFixed(1))
            console.log((255).toString(16), (5).toString(2), (3.14159).toFixed())
            console.log(parseInt("42px"), parseInt("ff", 16), parseFloat("3.5e2kg"), Number("12"))
            console.log(Number.isInteger(5), Number.isInteger("5"), isNaN("abc"))
        "#);
        assert_eq!(
            out,
            vec!["3 1.00 0.30 -1.5", "ff 101 3", "42 255 350 12", "true false true"]
        );
    }

    #[test]
    fn test_json_round_trip_and_indent() {
        let out = logs(r#"
            const data = { b: 1, a: [1, "x", null], skip: undefined, f() {} }
            console.log(JSON.stringify(data))
            console.log(JSON.stringify([1, 2], null, 2))
            console.log(JSON.parse('{"z": 1, "y": [true]}').y[0])
        "#);
        assert_eq!(out, vec![r#"{"b":1,"a":[1,"x",null]}"#, "[\n  1,\n  2\n]", "true"]);
    }

    #[test]
    fn test_json_cycles_throw() {
        assert_eq!(
            thrown("const o = {}; o.self = o; JSON.stringify(o)"),
            "Converting circular structure to JSON"
        );
        assert!(thrown("JSON.parse('{bad')").starts_with("Invalid JSON"));
    }

    #[test]
    fn test_object_statics() {
        let out = logs(r#"
            const o = { x: 1, y: 2 }
            console.log(Object.keys(o).join(), Object.values(o).join(), Object.entries(o).length)
            const merged = Object.assign({}, o, { z: 3 })
            console.log(JSON.stringify(merged), JSON.stringify(Object.fromEntries([["k", 1]])))
            console.log(o.hasOwnProperty("x"), "y" in o, Array.isArray([]))
        "#);
        assert_eq!(out, vec!["x,y 1,2 2", r#"{"x":1,"y":2,"z":3} {"k":1}"#, "true true true"]);
    }

    #[test]
    fn test_array_from_and_constructor() {
        let out = logs(r#"
            console.log(Array.from({ length: 3 }, (_, i) => i * i).join())
            console.log(Array.from("abc").join("-"), new Array(3).length, Array.of(7, 8).join())
        "#);
        assert_eq!(out, vec!["0,1,4", "a-b-c 3 7,8"]);
    }

    #[test]
    fn test_math_helpers() {
        let out = logs(r#"
            console.log(Math.max(1, 5, 3), Math.min(), Math.round(2.5), Math.round(-2.5), Math.abs(-4))
            const r = Math.random()
            console.log(r >= 0 && r < 1)
        "#);
        assert_eq!(out, vec!["5 Infinity 3 -2 4", "true"]);
    }

    #[test]
    fn test_call_apply_bind() {
        let out = logs(r#"
            function greet(greeting, mark) { return greeting + ", " + this.name + mark }
            const ada = { name: "Ada" }
            console.log(greet.call(ada, "Hi", "!"), greet.apply(ada, ["Yo", "?"]))
            const bound = greet.bind(ada, "Hey")
            console.log(bound("."))
        "#);
        assert_eq!(out, vec!["Hi, Ada! Yo, Ada?", "Hey, Ada."]);
    }

    #[test]
    fn test_sleep_is_refused_in_restricted_mode() {
        let options = RunOptions::new(Limits::restricted(), Duration::from_secs(5));
        match run("sleep(10)", options, Console::new(true, 10)) {
            Err(ScriptFailure::Thrown { message, .. }) => {
                assert_eq!(message, "sleep() is not available in restricted sandbox mode")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_repeat_rejects_oversized_strings() {
        assert_eq!(thrown("'x'.repeat(1e9)"), "Invalid string length");
        assert_eq!(thrown("'x'.repeat(-1)"), "Invalid count value: -1");
    }

    #[test]
    fn test_to_fixed_rounding() {
        assert_eq!(to_fixed(2.5, 0), "3");
        assert_eq!(to_fixed(0.125, 2), "0.13");
        assert_eq!(to_fixed(9.995, 2), "9.99");
        assert_eq!(to_fixed(99.5, 0), "100");
        assert_eq!(to_fixed(-0.0, 1), "0.0");
    }
}
