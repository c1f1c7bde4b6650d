use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The runtime datum. Containers are reference-like: cloning a `Value`
/// clones the handle, so every binding of the same list sees its mutations.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Dictionary>>),
    Function(Rc<Function>),
    Object(Rc<RefCell<Object>>),
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(dict: Dictionary) -> Self {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn object(object: Object) -> Self {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    /// Only `none` and `false` are falsey.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::None | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
        }
    }

    /// Identity for containers, the value itself for scalars.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        equal(self, other, &mut Vec::new())
    }
}

/// Address of a container's allocation, used to detect cycles.
fn address<T: ?Sized>(rc: &Rc<T>) -> usize {
    Rc::as_ptr(rc) as *const () as usize
}

/// Structural equality. A pair of containers already being compared
/// further up counts as equal, so cyclic values terminate.
fn equal(a: &Value, b: &Value, active: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y)
                || nested((address(x), address(y)), active, |active| {
                    let (x, y) = (x.borrow(), y.borrow());
                    all_equal(x.iter(), y.iter(), x.len() == y.len(), active)
                })
        }
        (Value::Dict(x), Value::Dict(y)) => {
            Rc::ptr_eq(x, y)
                || nested((address(x), address(y)), active, |active| {
                    let (x, y) = (x.borrow(), y.borrow());
                    entries_equal(&x.entries, &y.entries, active)
                })
        }
        (Value::Object(x), Value::Object(y)) => {
            Rc::ptr_eq(x, y)
                || nested((address(x), address(y)), active, |active| {
                    let (x, y) = (x.borrow(), y.borrow());
                    x.class == y.class && entries_equal(&x.slots, &y.slots, active)
                })
        }
        (Value::Function(x), Value::Function(y)) => {
            Rc::ptr_eq(x, y)
                || (x.name == y.name
                    && x.arity == y.arity
                    && x.entry == y.entry
                    && x.registers == y.registers
                    && x.capture_count == y.capture_count
                    && nested((address(x), address(y)), active, |active| {
                        let same_len = x.captures.len() == y.captures.len();
                        all_equal(x.captures.iter(), y.captures.iter(), same_len, active)
                    }))
        }
        _ => false,
    }
}

fn nested(
    pair: (usize, usize),
    active: &mut Vec<(usize, usize)>,
    compare: impl FnOnce(&mut Vec<(usize, usize)>) -> bool,
) -> bool {
    if active.contains(&pair) {
        return true;
    }
    active.push(pair);
    let result = compare(active);
    active.pop();
    result
}

fn all_equal<'a>(
    xs: impl Iterator<Item = &'a Value>,
    ys: impl Iterator<Item = &'a Value>,
    same_len: bool,
    active: &mut Vec<(usize, usize)>,
) -> bool {
    same_len && xs.zip(ys).all(|(x, y)| equal(x, y, active))
}

fn entries_equal(
    xs: &[(Rc<str>, Value)],
    ys: &[(Rc<str>, Value)],
    active: &mut Vec<(usize, usize)>,
) -> bool {
    xs.len() == ys.len()
        && xs.iter().zip(ys).all(|((kx, vx), (ky, vy))| kx == ky && equal(vx, vy, active))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(self, f, &mut Vec::new())
    }
}

/// Writes `value`; a container already open further up prints as `...`.
fn render(value: &Value, f: &mut fmt::Formatter<'_>, open: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::None => write!(f, "none"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => {
            if n.is_finite() && *n == (*n as i64) as f64 {
                write!(f, "{}", *n as i64)
            } else {
                write!(f, "{}", n)
            }
        }
        Value::String(s) => write!(f, "{}", s),
        Value::List(items) => {
            if open.contains(&address(items)) {
                return write!(f, "[...]");
            }
            open.push(address(items));
            write!(f, "[")?;
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                render(item, f, open)?;
            }
            open.pop();
            write!(f, "]")
        }
        Value::Dict(dict) => {
            if open.contains(&address(dict)) {
                return write!(f, "{{...}}");
            }
            open.push(address(dict));
            write!(f, "{{")?;
            render_entries(dict.borrow().iter(), f, open)?;
            open.pop();
            write!(f, "}}")
        }
        Value::Function(func) => match &func.name {
            Some(name) => write!(f, "<function {}/{}>", name, func.arity),
            None => write!(f, "<function/{}>", func.arity),
        },
        Value::Object(obj) => {
            let borrowed = obj.borrow();
            if open.contains(&address(obj)) {
                return write!(f, "{} {{...}}", borrowed.class);
            }
            open.push(address(obj));
            write!(f, "{} {{", borrowed.class)?;
            render_entries(borrowed.slots.iter().map(|(k, v)| (k, v)), f, open)?;
            open.pop();
            write!(f, "}}")
        }
    }
}

fn render_entries<'a>(
    entries: impl Iterator<Item = (&'a Rc<str>, &'a Value)>,
    f: &mut fmt::Formatter<'_>,
    open: &mut Vec<usize>,
) -> fmt::Result {
    for (i, (k, v)) in entries.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}: ", k)?;
        render(v, f, open)?;
    }
    Ok(())
}

/// Insertion-ordered string-keyed map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    entries: Vec<(Rc<str>, Value)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| &**k == key).map(|(_, v)| v)
    }

    /// Updates in place when the key exists, so insertion order is kept.
    pub fn insert(&mut self, key: impl Into<Rc<str>>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| &**k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn entry_at(&self, pos: usize) -> Option<(&Rc<str>, &Value)> {
        self.entries.get(pos).map(|(k, v)| (k, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl<K: Into<Rc<str>>> FromIterator<(K, Value)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// An instance: a class name plus its named slots.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub class: Rc<str>,
    pub slots: Vec<(Rc<str>, Value)>,
}

impl Object {
    pub fn new(class: impl Into<Rc<str>>) -> Self {
        Object { class: class.into(), slots: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots.iter().find(|(n, _)| &**n == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: impl Into<Rc<str>>, value: Value) {
        let name = name.into();
        match self.slots.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.slots.push((name, value)),
        }
    }
}

/// A compiled function: where its code starts and how big its frame is.
///
/// The constant pool holds the prototype with no captured values;
/// `CLOSURE` produces copies carrying `captures`.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: Option<Rc<str>>,
    pub arity: u32,
    pub entry: usize,
    pub registers: u32,
    pub capture_count: u32,
    pub captures: Vec<Value>,
}

impl Function {
    pub fn with_captures(&self, captures: Vec<Value>) -> Function {
        Function { captures, ..self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_none_and_false_are_falsey() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::list(vec![]).is_truthy());
        assert!(Value::dict(Dictionary::new()).is_truthy());
    }

    #[test]
    fn integral_numbers_display_without_fraction() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(-2.0).to_string(), "-2");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Number(f64::INFINITY).to_string(), "inf");
    }

    #[test]
    fn containers_display() {
        let list = Value::list(vec![Value::Number(1.0), Value::string("a"), Value::None]);
        assert_eq!(list.to_string(), "[1, a, none]");
        let dict: Dictionary = vec![("x", Value::Number(1.0)), ("y", Value::Bool(true))]
            .into_iter()
            .collect();
        assert_eq!(Value::dict(dict).to_string(), "{x: 1, y: true}");
        let mut obj = Object::new("Point");
        obj.set("x", Value::Number(4.0));
        assert_eq!(Value::object(obj).to_string(), "Point {x: 4}");
    }

    #[test]
    fn cloned_list_handles_alias() {
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = a.clone();
        if let Value::List(items) = &b {
            items.borrow_mut().push(Value::Number(2.0));
        }
        assert!(a.same(&b));
        assert_eq!(a, Value::list(vec![Value::Number(1.0), Value::Number(2.0)]));
    }

    #[test]
    fn equal_lists_are_not_the_same_list() {
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = Value::list(vec![Value::Number(1.0)]);
        assert_eq!(a, b);
        assert!(!a.same(&b));
    }

    #[test]
    fn dictionary_keeps_insertion_order_on_update() {
        let mut d = Dictionary::new();
        d.insert("b", Value::Number(1.0));
        d.insert("a", Value::Number(2.0));
        d.insert("b", Value::Number(3.0));
        let keys: Vec<&str> = d.iter().map(|(k, _)| &**k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(d.get("b"), Some(&Value::Number(3.0)));
        assert_eq!(d.remove("b"), Some(Value::Number(3.0)));
        assert_eq!(d.len(), 1);
        assert!(d.remove("missing").is_none());
    }

    fn self_containing_list() -> Value {
        let list = Value::list(vec![Value::Number(1.0)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        list
    }

    #[test]
    fn self_containing_list_compares_and_displays() {
        let a = self_containing_list();
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "[1, [...]]");
        // Two distinct cycles of the same shape.
        let b = self_containing_list();
        assert_eq!(a, b);
        assert_ne!(a, Value::list(vec![Value::Number(1.0)]));
    }

    #[test]
    fn self_containing_dict_and_object_display() {
        let dict = Value::dict(Dictionary::new());
        if let Value::Dict(d) = &dict {
            d.borrow_mut().insert("me", dict.clone());
        }
        assert_eq!(dict.to_string(), "{me: {...}}");
        assert_eq!(dict, dict.clone());

        let obj = Value::object(Object::new("Node"));
        if let Value::Object(o) = &obj {
            o.borrow_mut().set("next", obj.clone());
        }
        assert_eq!(obj.to_string(), "Node {next: Node {...}}");
    }
}
