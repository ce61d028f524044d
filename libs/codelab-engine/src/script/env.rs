use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::value::{dismantle, Value};

struct Binding {
    value: Value,
    mutable: bool,
}

pub enum AssignResult {
    Assigned,
    Immutable,
    Unbound,
}

/// Lexical scope; function scopes are where `var` declarations land
pub struct Scope {
    vars: RefCell<HashMap<Rc<str>, Binding>>,
    parent: Option<Rc<Scope>>,
    is_function: bool,
}

impl Scope {
    pub fn new(parent: Option<Rc<Scope>>, is_function: bool) -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent,
            is_function,
        })
    }

    /// Creates or replaces a binding in this scope
    pub fn declare(&self, name: Rc<str>, value: Value, mutable: bool) {
        self.vars.borrow_mut().insert(name, Binding { value, mutable });
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(binding) = self.vars.borrow().get(name) {
            return Some(binding.value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn assign(&self, name: &str, value: Value) -> AssignResult {
        {
            let mut vars = self.vars.borrow_mut();
            if let Some(binding) = vars.get_mut(name) {
                if !binding.mutable {
                    return AssignResult::Immutable;
                }
                binding.value = value;
                return AssignResult::Assigned;
            }
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => AssignResult::Unbound,
        }
    }

    pub fn function_scope(self: &Rc<Self>) -> Rc<Scope> {
        let mut scope = self.clone();
        while !scope.is_function {
            match &scope.parent {
                Some(parent) => scope = parent.clone(),
                None => break,
            }
        }
        scope
    }

    pub fn parent(&self) -> Option<Rc<Scope>> {
        self.parent.clone()
    }

    /// Copies the named bindings into a fresh sibling scope (per-iteration `for (let ...)`)
    pub fn fork(&self, names: &[Rc<str>]) -> Rc<Scope> {
        let fresh = Scope::new(self.parent.clone(), false);
        {
            let vars = self.vars.borrow();
            let mut target = fresh.vars.borrow_mut();
            for name in names {
                if let Some(binding) = vars.get(name) {
                    target.insert(
                        name.clone(),
                        Binding {
                            value: binding.value.clone(),
                            mutable: binding.mutable,
                        },
                    );
                }
            }
        }
        fresh
    }

    /// Moves the bindings and the parent link out for `dismantle`
    pub(super) fn take_contents(&mut self, values: &mut Vec<Value>, scopes: &mut Vec<Rc<Scope>>) {
        values.extend(self.vars.get_mut().drain().map(|(_, b)| b.value));
        scopes.extend(self.parent.take());
    }

    /// Drops every binding, breaking closure reference cycles
    pub fn clear(&self) {
        let drained: Vec<Binding> = self.vars.borrow_mut().drain().map(|(_, b)| b).collect();
        drop(drained);
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let mut values = Vec::new();
        let mut scopes = Vec::new();
        self.take_contents(&mut values, &mut scopes);
        dismantle(values, scopes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parents() {
        let global = Scope::new(None, true);
        global.declare(Rc::from("x"), Value::Number(1.0), true);
        let inner = Scope::new(Some(global.clone()), false);

        assert!(matches!(inner.lookup("x"), Some(Value::Number(n)) if n == 1.0));
        assert!(inner.lookup("y").is_none());
    }

    #[test]
    fn test_assign_respects_const() {
        let global = Scope::new(None, true);
        global.declare(Rc::from("k"), Value::Number(1.0), false);
        let inner = Scope::new(Some(global), false);

        assert!(matches!(inner.assign("k", Value::Null), AssignResult::Immutable));
        assert!(matches!(inner.assign("nope", Value::Null), AssignResult::Unbound));
    }

    #[test]
    fn test_function_scope_skips_blocks() {
        let func = Scope::new(None, true);
        let block = Scope::new(Some(func.clone()), false);
        let nested = Scope::new(Some(block), false);
        assert!(Rc::ptr_eq(&nested.function_scope(), &func));
    }

    #[test]
    fn test_fork_copies_only_named_bindings() {
        let outer = Scope::new(None, true);
        let loop_scope = Scope::new(Some(outer), false);
        loop_scope.declare(Rc::from("i"), Value::Number(3.0), true);
        loop_scope.declare(Rc::from("tmp"), Value::Null, true);

        let forked = loop_scope.fork(&[Rc::from("i")]);
        assert!(forked.has_own("i"));
        assert!(!forked.has_own("tmp"));
    }
}
