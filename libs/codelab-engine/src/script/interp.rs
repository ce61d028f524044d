use std::cmp::Ordering;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use super::ast::*;
use super::builtins;
use super::console::Console;
use super::env::{AssignResult, Scope};
use super::value::*;

/// Upper bound on array length, checked wherever arrays grow in bulk
pub const MAX_ARRAY_LEN: usize = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Deadline,
    Cancelled,
    StepLimit,
}

/// Non-local exit from evaluation
///
/// `Throw` is visible to learner `try/catch`; `Halt` is not.
pub enum Interrupt {
    Throw(Value),
    Halt(HaltReason),
}

pub type Exec<T> = Result<T, Interrupt>;

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: u64,
    pub max_call_depth: usize,
    pub max_output_lines: usize,
    /// Ceiling on any single string, in bytes
    pub max_string_len: usize,
    /// Whether the blocking `sleep(ms)` built-in is available
    pub allow_sleep: bool,
}

impl Limits {
    pub fn standard() -> Self {
        Self {
            max_steps: 50_000_000,
            max_call_depth: 400,
            max_output_lines: 1_000,
            max_string_len: 1 << 20,
            allow_sleep: true,
        }
    }

    pub fn restricted() -> Self {
        Self {
            max_steps: 5_000_000,
            max_call_depth: 150,
            max_output_lines: 200,
            max_string_len: 64 * 1024,
            allow_sleep: false,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::standard()
    }
}

pub struct Budget {
    deadline: Instant,
    cancel: Arc<AtomicBool>,
    steps: u64,
    limits: Limits,
}

impl Budget {
    pub fn new(deadline: Instant, cancel: Arc<AtomicBool>, limits: Limits) -> Self {
        Self {
            deadline,
            cancel,
            steps: 0,
            limits,
        }
    }

    fn check(&self) -> Result<(), HaltReason> {
        if self.cancel.load(AtomicOrdering::Relaxed) {
            return Err(HaltReason::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(HaltReason::Deadline);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare(DeclKind),
    Assign,
}

/// Resolved assignment target
enum Reference {
    Name(Rc<str>),
    Member(Value, PropName),
}

/// Property key after conversion; canonical array indices stay numeric
#[derive(Debug, Clone)]
pub enum PropName {
    Index(usize),
    Key(Rc<str>),
}

impl PropName {
    pub fn from_key(key: Rc<str>) -> PropName {
        let canonical = !key.is_empty()
            && key.len() <= 10
            && key.bytes().all(|b| b.is_ascii_digit())
            && (key.len() == 1 || !key.starts_with('0'));
        match key.parse::<usize>() {
            Ok(idx) if canonical => PropName::Index(idx),
            _ => PropName::Key(key),
        }
    }

    pub fn from_value(value: &Value) -> PropName {
        match value {
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < 4_294_967_295.0 => {
                PropName::Index(*n as usize)
            }
            Value::Str(s) => PropName::from_key(s.clone()),
            other => PropName::from_key(Rc::from(other.to_display().as_str())),
        }
    }

    pub fn as_key(&self) -> Rc<str> {
        match self {
            PropName::Index(i) => Rc::from(i.to_string().as_str()),
            PropName::Key(k) => k.clone(),
        }
    }
}

/// Tree-walking evaluator for one learner program
///
/// Every statement, loop iteration and call ticks the budget; deadline and
/// cancellation are polled every 256 ticks so busy loops are preempted.
pub struct Interpreter {
    root: Rc<Scope>,
    global: Rc<Scope>,
    env: Rc<Scope>,
    budget: Budget,
    console: Console,
    call_depth: usize,
    pos: Pos,
    scopes: Vec<Weak<Scope>>,
    prune_at: usize,
    rng_state: u64,
    completion: Value,
    this_key: Rc<str>,
    arguments_key: Rc<str>,
}

impl Interpreter {
    pub fn new(budget: Budget, console: Console) -> Self {
        let root = Scope::new(None, true);
        builtins::install(&root);
        let global = Scope::new(Some(root.clone()), true);
        Self {
            root,
            global: global.clone(),
            env: global,
            budget,
            console,
            call_depth: 0,
            pos: Pos { line: 1, col: 1 },
            scopes: Vec::new(),
            prune_at: 1024,
            rng_state: 0x2545_f491_4f6c_dd1d,
            completion: Value::Undefined,
            this_key: Rc::from("this"),
            arguments_key: Rc::from("arguments"),
        }
    }

    /// Runs the program; the result is the top-level `return` value, else
    /// the completion value of the last top-level expression statement
    pub fn run(&mut self, program: &Program) -> Exec<Value> {
        self.budget.check().map_err(Interrupt::Halt)?;
        self.hoist_vars(&program.body);
        match self.exec_stmts(&program.body)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(std::mem::replace(&mut self.completion, Value::Undefined)),
        }
    }

    // ── services for built-ins ──────────────────────────────────────────────

    pub(crate) fn console(&self) -> &Console {
        &self.console
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.budget.limits
    }

    pub(crate) fn check_budget(&self) -> Exec<()> {
        self.budget.check().map_err(Interrupt::Halt)
    }

    /// xorshift64*, seeded identically for every run
    pub(crate) fn next_random(&mut self) -> f64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        let out = x.wrapping_mul(0x2545_f491_4f6c_dd1d);
        (out >> 11) as f64 / (1u64 << 53) as f64
    }

    pub(crate) fn make_error(&self, name: &str, message: &str) -> Value {
        let header = if message.is_empty() {
            name.to_string()
        } else {
            format!("{}: {}", name, message)
        };
        let stack = format!("{}\n    at line {}, column {}", header, self.pos.line, self.pos.col);
        Value::Object(Rc::new(ObjectCell::new(JsObject {
            class: ObjectClass::Error,
            props: vec![
                (Rc::from("name"), Value::str(name)),
                (Rc::from("message"), Value::str(message)),
                (Rc::from("stack"), Value::str(&stack)),
            ],
            ctor: None,
        })))
    }

    pub(crate) fn throw<T>(&self, name: &str, message: impl Into<String>) -> Exec<T> {
        Err(Interrupt::Throw(self.make_error(name, &message.into())))
    }

    pub(crate) fn string_value(&self, s: String) -> Exec<Value> {
        if s.len() > self.budget.limits.max_string_len {
            return self.throw("RangeError", "Invalid string length");
        }
        Ok(Value::Str(Rc::from(s.as_str())))
    }

    pub(crate) fn check_array_len(&self, len: usize) -> Exec<()> {
        if len > MAX_ARRAY_LEN {
            return self.throw("RangeError", "Invalid array length");
        }
        Ok(())
    }

    pub(crate) fn call(&mut self, func: &Value, this: Value, args: Vec<Value>) -> Exec<Value> {
        match func {
            Value::Function(closure) => self.call_closure(closure, this, args),
            Value::Native(native) => {
                self.tick()?;
                let native = native.clone();
                let this = native.receiver.clone().unwrap_or(this);
                (native.func)(self, native.name, this, args)
            }
            other => self.throw("TypeError", format!("{} is not a function", describe_value(other))),
        }
    }

    // ── bookkeeping ─────────────────────────────────────────────────────────

    fn tick(&mut self) -> Exec<()> {
        self.budget.steps += 1;
        if self.budget.steps > self.budget.limits.max_steps {
            return Err(Interrupt::Halt(HaltReason::StepLimit));
        }
        if self.budget.steps & 0xff == 0 {
            self.budget.check().map_err(Interrupt::Halt)?;
        }
        Ok(())
    }

    fn track(&mut self, scope: &Rc<Scope>) {
        self.scopes.push(Rc::downgrade(scope));
        if self.scopes.len() >= self.prune_at {
            self.scopes.retain(|weak| weak.strong_count() > 0);
            self.prune_at = (self.scopes.len() * 2).max(1024);
        }
    }

    fn child_scope(&mut self, is_function: bool) -> Rc<Scope> {
        let scope = Scope::new(Some(self.env.clone()), is_function);
        self.track(&scope);
        scope
    }

    fn with_scope<T>(&mut self, scope: Rc<Scope>, f: impl FnOnce(&mut Self) -> Exec<T>) -> Exec<T> {
        let saved = std::mem::replace(&mut self.env, scope);
        let result = f(self);
        self.env = saved;
        result
    }

    /// Clears every scope created during the run so closure cycles are freed
    fn teardown(&mut self) {
        for weak in self.scopes.drain(..) {
            if let Some(scope) = weak.upgrade() {
                scope.clear();
            }
        }
        self.global.clear();
        self.root.clear();
    }

    // ── declarations ────────────────────────────────────────────────────────

    fn hoist_functions(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let StmtKind::Function(def) = &stmt.kind {
                if let Some(name) = &def.name {
                    let closure = Value::Function(Rc::new(Closure {
                        def: def.clone(),
                        env: self.env.clone(),
                        name: Some(name.clone()),
                    }));
                    self.env.declare(name.clone(), closure, true);
                }
            }
        }
    }

    fn hoist_vars(&mut self, stmts: &[Stmt]) {
        let mut names = Vec::new();
        for stmt in stmts {
            collect_var_names(stmt, &mut names);
        }
        let scope = self.env.function_scope();
        for name in names {
            if !scope.has_own(&name) {
                scope.declare(name, Value::Undefined, true);
            }
        }
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: Value, mode: BindMode) -> Exec<()> {
        match pattern {
            Pattern::Ident(name) => self.bind_name(name, value, mode),
            Pattern::Array(elems) => {
                let items: Vec<Value> = match &value {
                    Value::Array(items) => items.borrow().clone(),
                    Value::Str(s) => s.chars().map(|c| Value::str(&c.to_string())).collect(),
                    other => {
                        return self.throw("TypeError", format!("{} is not iterable", describe_value(other)))
                    }
                };
                for (i, elem) in elems.iter().enumerate() {
                    if let Some(elem) = elem {
                        let item = items.get(i).cloned().unwrap_or(Value::Undefined);
                        let item = self.apply_default(item, &elem.default, &elem.target)?;
                        self.bind_pattern(&elem.target, item, mode)?;
                    }
                }
                Ok(())
            }
            Pattern::Object(props) => {
                if value.is_nullish() {
                    let shown = value.to_display();
                    return self.throw(
                        "TypeError",
                        format!("Cannot destructure '{}' as it is {}.", shown, shown),
                    );
                }
                for (key, elem) in props {
                    let item = self.get_member(&value, &PropName::from_key(key.clone()))?;
                    let item = self.apply_default(item, &elem.default, &elem.target)?;
                    self.bind_pattern(&elem.target, item, mode)?;
                }
                Ok(())
            }
        }
    }

    fn apply_default(&mut self, value: Value, default: &Option<Expr>, target: &Pattern) -> Exec<Value> {
        match (value, default) {
            (Value::Undefined, Some(expr)) => match target {
                Pattern::Ident(name) => self.eval_named(expr, name),
                _ => self.eval(expr),
            },
            (value, _) => Ok(value),
        }
    }

    fn bind_name(&mut self, name: &Rc<str>, value: Value, mode: BindMode) -> Exec<()> {
        match mode {
            BindMode::Declare(DeclKind::Var) => {
                let scope = self.env.function_scope();
                if scope.has_own(name) {
                    scope.assign(name, value);
                } else {
                    scope.declare(name.clone(), value, true);
                }
            }
            BindMode::Declare(DeclKind::Let) => self.env.declare(name.clone(), value, true),
            BindMode::Declare(DeclKind::Const) => self.env.declare(name.clone(), value, false),
            BindMode::Assign => self.assign_name(name, value)?,
        }
        Ok(())
    }

    fn assign_name(&mut self, name: &Rc<str>, value: Value) -> Exec<()> {
        match self.env.assign(name, value.clone()) {
            AssignResult::Assigned => Ok(()),
            AssignResult::Immutable => self.throw("TypeError", "Assignment to constant variable."),
            AssignResult::Unbound => {
                // sloppy-mode implicit global
                self.global.declare(name.clone(), value, true);
                Ok(())
            }
        }
    }

    fn lookup(&self, name: &Rc<str>) -> Exec<Value> {
        match self.env.lookup(name) {
            Some(value) => Ok(value),
            None => self.throw("ReferenceError", format!("{} is not defined", name)),
        }
    }

    // ── statements ──────────────────────────────────────────────────────────

    fn exec_stmts(&mut self, stmts: &[Stmt]) -> Exec<Flow> {
        self.hoist_functions(stmts);
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Exec<Flow> {
        let scope = self.child_scope(false);
        self.with_scope(scope, |this| this.exec_stmts(stmts))
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Exec<Flow> {
        self.tick()?;
        self.pos = stmt.pos;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                let value = self.eval(expr)?;
                if self.call_depth == 0 {
                    self.completion = value;
                }
                Ok(Flow::Normal)
            }
            StmtKind::Decl(kind, decls) => {
                for decl in decls {
                    let value = match (&decl.init, &decl.target) {
                        (Some(init), Pattern::Ident(name)) => self.eval_named(init, name)?,
                        (Some(init), _) => self.eval(init)?,
                        // `var x;` must not reset a hoisted or earlier value
                        (None, _) if *kind == DeclKind::Var => continue,
                        (None, _) => Value::Undefined,
                    };
                    self.bind_pattern(&decl.target, value, BindMode::Declare(*kind))?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::Function(_) | StmtKind::Empty => Ok(Flow::Normal),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::If(test, cons, alt) => {
                if self.eval(test)?.truthy() {
                    self.exec_stmt(cons)
                } else if let Some(alt) = alt {
                    self.exec_stmt(alt)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::While(test, body) => {
                loop {
                    self.tick()?;
                    if !self.eval(test)?.truthy() {
                        break;
                    }
                    match self.exec_stmt(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::DoWhile(body, test) => {
                loop {
                    self.tick()?;
                    match self.exec_stmt(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(test)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body),
            StmtKind::ForEach {
                kind,
                decl,
                target,
                iterable,
                body,
            } => self.exec_for_each(*kind, *decl, target, iterable, body),
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Throw(expr) => {
                let value = self.eval(expr)?;
                Err(Interrupt::Throw(value))
            }
            StmtKind::Try {
                block,
                param,
                handler,
                finalizer,
            } => self.exec_try(block, param.as_ref(), handler.as_deref(), finalizer.as_deref()),
            StmtKind::Switch(discriminant, cases) => self.exec_switch(discriminant, cases),
            StmtKind::Block(stmts) => self.exec_block(stmts),
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
    ) -> Exec<Flow> {
        let mut per_iteration = Vec::new();
        if let Some(Stmt {
            kind: StmtKind::Decl(DeclKind::Let, decls),
            ..
        }) = init
        {
            for decl in decls {
                pattern_names(&decl.target, &mut per_iteration);
            }
        }

        let loop_scope = self.child_scope(false);
        self.with_scope(loop_scope, |this| {
            if let Some(init) = init {
                this.exec_stmt(init)?;
            }
            if !per_iteration.is_empty() {
                this.env = this.fork_env(&per_iteration);
            }
            loop {
                this.tick()?;
                if let Some(test) = test {
                    if !this.eval(test)?.truthy() {
                        break;
                    }
                }
                match this.exec_stmt(body)? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
                // closures created in the body keep their own copy of `let` bindings
                if !per_iteration.is_empty() {
                    this.env = this.fork_env(&per_iteration);
                }
                if let Some(update) = update {
                    this.eval(update)?;
                }
            }
            Ok(Flow::Normal)
        })
    }

    fn fork_env(&mut self, names: &[Rc<str>]) -> Rc<Scope> {
        let forked = self.env.fork(names);
        self.track(&forked);
        forked
    }

    fn exec_for_each(
        &mut self,
        kind: ForEachKind,
        decl: Option<DeclKind>,
        target: &Pattern,
        iterable: &Expr,
        body: &Stmt,
    ) -> Exec<Flow> {
        enum Source {
            Live(Rc<ArrayCell>),
            Snapshot(Vec<Value>),
        }

        let subject = self.eval(iterable)?;
        let source = match (kind, &subject) {
            (ForEachKind::Of, Value::Array(items)) => Source::Live(items.clone()),
            (ForEachKind::Of, Value::Str(s)) => {
                Source::Snapshot(s.chars().map(|c| Value::str(&c.to_string())).collect())
            }
            (ForEachKind::Of, other) => {
                return self.throw("TypeError", format!("{} is not iterable", describe_value(other)))
            }
            (ForEachKind::In, Value::Object(obj)) => Source::Snapshot(
                obj.borrow()
                    .props
                    .iter()
                    .map(|(k, _)| Value::Str(k.clone()))
                    .collect(),
            ),
            (ForEachKind::In, Value::Array(items)) => {
                let len = items.borrow().len();
                Source::Snapshot((0..len).map(|i| Value::str(&i.to_string())).collect())
            }
            (ForEachKind::In, Value::Str(s)) => {
                Source::Snapshot((0..s.chars().count()).map(|i| Value::str(&i.to_string())).collect())
            }
            (ForEachKind::In, _) => Source::Snapshot(Vec::new()),
        };

        let mode = match decl {
            Some(kind) => BindMode::Declare(kind),
            None => BindMode::Assign,
        };
        let mut index = 0;
        loop {
            self.tick()?;
            let item = match &source {
                Source::Live(items) => items.borrow().get(index).cloned(),
                Source::Snapshot(items) => items.get(index).cloned(),
            };
            let Some(item) = item else { break };
            index += 1;

            let scope = self.child_scope(false);
            let flow = self.with_scope(scope, |this| {
                this.bind_pattern(target, item, mode)?;
                this.exec_stmt(body)
            })?;
            match flow {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        block: &[Stmt],
        param: Option<&Pattern>,
        handler: Option<&[Stmt]>,
        finalizer: Option<&[Stmt]>,
    ) -> Exec<Flow> {
        let result = match (self.exec_block(block), handler) {
            (Err(Interrupt::Throw(thrown)), Some(handler)) => {
                let scope = self.child_scope(false);
                self.with_scope(scope, |this| {
                    if let Some(param) = param {
                        this.bind_pattern(param, thrown, BindMode::Declare(DeclKind::Let))?;
                    }
                    this.exec_stmts(handler)
                })
            }
            (other, _) => other,
        };
        if matches!(result, Err(Interrupt::Halt(_))) {
            return result;
        }
        match finalizer {
            Some(finalizer) => match self.exec_block(finalizer)? {
                Flow::Normal => result,
                flow => Ok(flow),
            },
            None => result,
        }
    }

    fn exec_switch(&mut self, discriminant: &Expr, cases: &[SwitchCase]) -> Exec<Flow> {
        let value = self.eval(discriminant)?;
        let mut start = None;
        for (i, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                if self.eval(test)?.strict_equals(&value) {
                    start = Some(i);
                    break;
                }
            }
        }
        let Some(start) = start.or_else(|| cases.iter().position(|c| c.test.is_none())) else {
            return Ok(Flow::Normal);
        };

        let scope = self.child_scope(false);
        self.with_scope(scope, |this| {
            for case in cases {
                this.hoist_functions(&case.body);
            }
            for case in &cases[start..] {
                for stmt in &case.body {
                    match this.exec_stmt(stmt)? {
                        Flow::Normal => {}
                        Flow::Break => return Ok(Flow::Normal),
                        flow => return Ok(flow),
                    }
                }
            }
            Ok(Flow::Normal)
        })
    }

    // ── functions ───────────────────────────────────────────────────────────

    fn make_closure(&mut self, def: &Rc<FunctionDef>, inferred: Option<&Rc<str>>) -> Value {
        match &def.name {
            // a named function expression can refer to itself
            Some(name) => {
                let scope = self.child_scope(false);
                let closure = Value::Function(Rc::new(Closure {
                    def: def.clone(),
                    env: scope.clone(),
                    name: Some(name.clone()),
                }));
                scope.declare(name.clone(), closure.clone(), false);
                closure
            }
            None => Value::Function(Rc::new(Closure {
                def: def.clone(),
                env: self.env.clone(),
                name: inferred.cloned(),
            })),
        }
    }

    /// Evaluates `expr`, naming it after `name` if it is an anonymous function
    fn eval_named(&mut self, expr: &Expr, name: &Rc<str>) -> Exec<Value> {
        match expr {
            Expr::Function(def) if def.name.is_none() => Ok(self.make_closure(def, Some(name))),
            other => self.eval(other),
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, this: Value, args: Vec<Value>) -> Exec<Value> {
        self.tick()?;
        if self.call_depth >= self.budget.limits.max_call_depth {
            return self.throw("RangeError", "Maximum call stack size exceeded");
        }
        let scope = Scope::new(Some(closure.env.clone()), true);
        self.track(&scope);
        let saved_env = std::mem::replace(&mut self.env, scope);
        let saved_pos = self.pos;
        self.call_depth += 1;
        let result = self.run_closure_body(closure, this, args);
        self.call_depth -= 1;
        self.env = saved_env;
        self.pos = saved_pos;
        result
    }

    fn run_closure_body(&mut self, closure: &Rc<Closure>, this: Value, args: Vec<Value>) -> Exec<Value> {
        let def = closure.def.clone();
        if !def.is_arrow {
            self.env.declare(self.this_key.clone(), this, false);
            self.env
                .declare(self.arguments_key.clone(), Value::array(args.clone()), true);
        }
        let mut args = args.into_iter();
        for param in &def.params {
            let value = if param.rest {
                Value::array(args.by_ref().collect())
            } else {
                args.next().unwrap_or(Value::Undefined)
            };
            let value = self.apply_default(value, &param.default, &param.target)?;
            self.bind_pattern(&param.target, value, BindMode::Declare(DeclKind::Let))?;
        }
        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr),
            FunctionBody::Block(stmts) => {
                self.hoist_vars(stmts);
                match self.exec_stmts(stmts)? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }

    // ── expressions ─────────────────────────────────────────────────────────

    fn eval(&mut self, expr: &Expr) -> Exec<Value> {
        match expr {
            Expr::Num(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Template(pieces) => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        TemplatePiece::Text(text) => out.push_str(text),
                        TemplatePiece::Expr(expr) => out.push_str(&self.eval(expr)?.to_display()),
                    }
                }
                self.string_value(out)
            }
            Expr::Ident(name) => self.lookup(name),
            Expr::Array(items) => {
                let items = self.eval_items(items)?;
                Ok(Value::array(items))
            }
            Expr::Object(props) => self.eval_object(props),
            Expr::Function(def) => Ok(self.make_closure(def, None)),
            Expr::Unary(op, operand) => self.eval_unary(*op, operand),
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let reference = self.resolve(target)?;
                let old = self.read_ref(&reference)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_ref(reference, Value::Number(new))?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                self.binary(*op, &lhs, &rhs)
            }
            Expr::Logical(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                if short_circuits(*op, &lhs) {
                    Ok(lhs)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value),
            Expr::AssignPattern { target, value } => {
                let value = self.eval(value)?;
                self.bind_pattern(target, value.clone(), BindMode::Assign)?;
                Ok(value)
            }
            Expr::Conditional(test, cons, alt) => {
                if self.eval(test)?.truthy() {
                    self.eval(cons)
                } else {
                    self.eval(alt)
                }
            }
            Expr::Call { .. } | Expr::Member { .. } => {
                Ok(self.eval_chain(expr)?.unwrap_or(Value::Undefined))
            }
            Expr::New { callee, args } => self.eval_new(callee, args),
            Expr::Sequence(exprs) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr)?;
                }
                Ok(last)
            }
        }
    }

    /// Member/call chain evaluation; `None` means an optional link short-circuited
    fn eval_chain(&mut self, expr: &Expr) -> Exec<Option<Value>> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(object) = self.eval_chain(object)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                let name = self.prop_name(property)?;
                self.get_member(&object, &name).map(Some)
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => {
                let (func, this) = match &**callee {
                    Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } => {
                        let Some(object) = self.eval_chain(object)? else {
                            return Ok(None);
                        };
                        if *member_optional && object.is_nullish() {
                            return Ok(None);
                        }
                        let name = self.prop_name(property)?;
                        let func = self.get_member(&object, &name)?;
                        (func, object)
                    }
                    other => match self.eval_chain(other)? {
                        Some(func) => (func, Value::Undefined),
                        None => return Ok(None),
                    },
                };
                if *optional && func.is_nullish() {
                    return Ok(None);
                }
                let args = self.eval_items(args)?;
                if !func.is_callable() {
                    return self.throw("TypeError", format!("{} is not a function", describe_expr(callee)));
                }
                self.call(&func, this, args).map(Some)
            }
            other => self.eval(other).map(Some),
        }
    }

    fn prop_name(&mut self, property: &MemberProp) -> Exec<PropName> {
        match property {
            MemberProp::Named(name) => Ok(PropName::Key(name.clone())),
            MemberProp::Computed(expr) => {
                let key = self.eval(expr)?;
                Ok(PropName::from_value(&key))
            }
        }
    }

    fn eval_items(&mut self, items: &[ArrayItem]) -> Exec<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                ArrayItem::Item(expr) => out.push(self.eval(expr)?),
                ArrayItem::Spread(expr) => {
                    let value = self.eval(expr)?;
                    match &value {
                        Value::Array(items) => {
                            let items = items.borrow();
                            self.check_array_len(out.len() + items.len())?;
                            out.extend(items.iter().cloned());
                        }
                        Value::Str(s) => out.extend(s.chars().map(|c| Value::str(&c.to_string()))),
                        other => {
                            return self.throw(
                                "TypeError",
                                format!("{} is not iterable", describe_value(other)),
                            )
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn eval_object(&mut self, props: &[PropDef]) -> Exec<Value> {
        let mut obj = JsObject::new(ObjectClass::Plain);
        for prop in props {
            match prop {
                PropDef::KeyValue(key, value) => {
                    let key = match key {
                        PropKey::Static(key) => key.clone(),
                        PropKey::Computed(expr) => {
                            let key = self.eval(expr)?;
                            PropName::from_value(&key).as_key()
                        }
                    };
                    let value = self.eval_named(value, &key)?;
                    obj.set(key, value);
                }
                PropDef::Shorthand(name) => {
                    let value = self.lookup(name)?;
                    obj.set(name.clone(), value);
                }
                PropDef::Spread(expr) => match self.eval(expr)? {
                    Value::Object(src) => {
                        for (k, v) in src.borrow().props.iter() {
                            obj.set(k.clone(), v.clone());
                        }
                    }
                    Value::Array(src) => {
                        for (i, v) in src.borrow().iter().enumerate() {
                            obj.set(Rc::from(i.to_string().as_str()), v.clone());
                        }
                    }
                    Value::Str(s) => {
                        for (i, c) in s.chars().enumerate() {
                            obj.set(Rc::from(i.to_string().as_str()), Value::str(&c.to_string()));
                        }
                    }
                    _ => {}
                },
            }
        }
        Ok(Value::Object(Rc::new(ObjectCell::new(obj))))
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr) -> Exec<Value> {
        match op {
            UnaryOp::Typeof => {
                if let Expr::Ident(name) = operand {
                    if self.env.lookup(name).is_none() {
                        return Ok(Value::str("undefined"));
                    }
                }
                let value = self.eval(operand)?;
                Ok(Value::str(value.type_of()))
            }
            UnaryOp::Delete => {
                if let Expr::Member {
                    object, property, ..
                } = operand
                {
                    let object = self.eval(object)?;
                    let name = self.prop_name(property)?;
                    match (&object, &name) {
                        (Value::Object(obj), name) => {
                            obj.borrow_mut().remove(&name.as_key());
                        }
                        (Value::Array(items), PropName::Index(i)) => {
                            if let Some(slot) = items.borrow_mut().get_mut(*i) {
                                *slot = Value::Undefined;
                            }
                        }
                        _ => {}
                    }
                } else {
                    self.eval(operand)?;
                }
                Ok(Value::Bool(true))
            }
            UnaryOp::Void => {
                self.eval(operand)?;
                Ok(Value::Undefined)
            }
            UnaryOp::Neg => Ok(Value::Number(-self.eval(operand)?.to_number())),
            UnaryOp::Plus => Ok(Value::Number(self.eval(operand)?.to_number())),
            UnaryOp::Not => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            UnaryOp::BitNot => Ok(Value::Number(!to_int32(self.eval(operand)?.to_number()) as f64)),
        }
    }

    fn resolve(&mut self, target: &Expr) -> Exec<Reference> {
        match target {
            Expr::Ident(name) => Ok(Reference::Name(name.clone())),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval(object)?;
                let name = self.prop_name(property)?;
                Ok(Reference::Member(object, name))
            }
            _ => self.throw("SyntaxError", "Invalid left-hand side in assignment"),
        }
    }

    fn read_ref(&mut self, reference: &Reference) -> Exec<Value> {
        match reference {
            Reference::Name(name) => self.lookup(name),
            Reference::Member(object, name) => self.get_member(object, name),
        }
    }

    fn write_ref(&mut self, reference: Reference, value: Value) -> Exec<()> {
        match reference {
            Reference::Name(name) => self.assign_name(&name, value),
            Reference::Member(object, name) => self.set_member(&object, name, value),
        }
    }

    fn eval_assign(&mut self, op: AssignOp, target: &Expr, value: &Expr) -> Exec<Value> {
        let reference = self.resolve(target)?;
        let result = match op {
            AssignOp::Assign => match &reference {
                Reference::Name(name) => self.eval_named(value, name)?,
                Reference::Member(..) => self.eval(value)?,
            },
            AssignOp::Compound(bin) => {
                let current = self.read_ref(&reference)?;
                let rhs = self.eval(value)?;
                self.binary(bin, &current, &rhs)?
            }
            AssignOp::Logical(logical) => {
                let current = self.read_ref(&reference)?;
                if short_circuits(logical, &current) {
                    return Ok(current);
                }
                self.eval(value)?
            }
        };
        self.write_ref(reference, result.clone())?;
        Ok(result)
    }

    fn eval_new(&mut self, callee: &Expr, args: &[ArrayItem]) -> Exec<Value> {
        let ctor = self.eval(callee)?;
        let args = self.eval_items(args)?;
        match &ctor {
            Value::Native(native) => {
                self.tick()?;
                let native = native.clone();
                (native.func)(self, native.name, Value::Undefined, args)
            }
            Value::Function(closure) if !closure.def.is_arrow => {
                let instance = Value::Object(Rc::new(ObjectCell::new(JsObject {
                    class: ObjectClass::Plain,
                    props: Vec::new(),
                    ctor: Some(Rc::downgrade(closure)),
                })));
                let result = self.call_closure(closure, instance.clone(), args)?;
                match result {
                    Value::Object(_) | Value::Array(_) => Ok(result),
                    _ => Ok(instance),
                }
            }
            _ => self.throw("TypeError", format!("{} is not a constructor", describe_expr(callee))),
        }
    }

    // ── property access ─────────────────────────────────────────────────────

    pub(crate) fn get_member(&mut self, object: &Value, name: &PropName) -> Exec<Value> {
        let key = || name.as_key();
        let value = match object {
            Value::Undefined | Value::Null => {
                return self.throw(
                    "TypeError",
                    format!(
                        "Cannot read properties of {} (reading '{}')",
                        object.to_display(),
                        key()
                    ),
                )
            }
            Value::Str(s) => match name {
                PropName::Index(i) => s
                    .chars()
                    .nth(*i)
                    .map(|c| Value::str(&c.to_string()))
                    .unwrap_or(Value::Undefined),
                PropName::Key(k) if &**k == "length" => Value::Number(s.chars().count() as f64),
                PropName::Key(k) => builtins::string_method(k)
                    .map(|(name, func)| Value::bound_native(name, func, object.clone()))
                    .unwrap_or(Value::Undefined),
            },
            Value::Array(items) => match name {
                PropName::Index(i) => items.borrow().get(*i).cloned().unwrap_or(Value::Undefined),
                PropName::Key(k) if &**k == "length" => Value::Number(items.borrow().len() as f64),
                PropName::Key(k) => builtins::array_method(k)
                    .map(|(name, func)| Value::bound_native(name, func, object.clone()))
                    .unwrap_or(Value::Undefined),
            },
            Value::Object(obj) => {
                let key = key();
                let own = obj.borrow().get(&key);
                match own {
                    Some(value) => value,
                    None => builtins::object_method(&key)
                        .map(|(name, func)| Value::bound_native(name, func, object.clone()))
                        .unwrap_or(Value::Undefined),
                }
            }
            Value::Number(_) => builtins::number_method(&key())
                .map(|(name, func)| Value::bound_native(name, func, object.clone()))
                .unwrap_or(Value::Undefined),
            Value::Bool(_) => match &*key() {
                "toString" => Value::bound_native("toString", builtins::object_to_string, object.clone()),
                _ => Value::Undefined,
            },
            Value::Function(closure) => match &*key() {
                "name" => Value::str(closure.name.as_deref().unwrap_or("")),
                "length" => Value::Number(
                    closure
                        .def
                        .params
                        .iter()
                        .take_while(|p| !p.rest && p.default.is_none())
                        .count() as f64,
                ),
                other => builtins::function_method(other)
                    .map(|(name, func)| Value::bound_native(name, func, object.clone()))
                    .unwrap_or(Value::Undefined),
            },
            Value::Native(native) => {
                let key = key();
                match native.props.iter().find(|(k, _)| **k == *key) {
                    Some((_, value)) => value.clone(),
                    None if &*key == "name" => Value::str(native.name),
                    None => builtins::function_method(&key)
                        .map(|(name, func)| Value::bound_native(name, func, object.clone()))
                        .unwrap_or(Value::Undefined),
                }
            }
        };
        Ok(value)
    }

    fn set_member(&mut self, object: &Value, name: PropName, value: Value) -> Exec<()> {
        match object {
            Value::Undefined | Value::Null => self.throw(
                "TypeError",
                format!(
                    "Cannot set properties of {} (setting '{}')",
                    object.to_display(),
                    name.as_key()
                ),
            ),
            Value::Array(items) => match name {
                PropName::Index(i) => {
                    let len = items.borrow().len();
                    if i >= len {
                        self.check_array_len(i + 1)?;
                        items.borrow_mut().resize(i + 1, Value::Undefined);
                    }
                    items.borrow_mut()[i] = value;
                    Ok(())
                }
                PropName::Key(k) if &*k == "length" => {
                    let n = value.to_number();
                    if n < 0.0 || n.fract() != 0.0 || !n.is_finite() {
                        return self.throw("RangeError", "Invalid array length");
                    }
                    self.check_array_len(n as usize)?;
                    items.borrow_mut().resize(n as usize, Value::Undefined);
                    Ok(())
                }
                PropName::Key(_) => Ok(()),
            },
            Value::Object(obj) => {
                obj.borrow_mut().set(name.as_key(), value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ── operators ───────────────────────────────────────────────────────────

    fn binary(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Exec<Value> {
        let num = |v: f64| Ok(Value::Number(v));
        match op {
            BinaryOp::Add => match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => num(a + b),
                _ => {
                    let (a, b) = (to_primitive(lhs), to_primitive(rhs));
                    if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
                        let mut out = a.to_display();
                        out.push_str(&b.to_display());
                        self.string_value(out)
                    } else {
                        num(a.to_number() + b.to_number())
                    }
                }
            },
            BinaryOp::Sub => num(lhs.to_number() - rhs.to_number()),
            BinaryOp::Mul => num(lhs.to_number() * rhs.to_number()),
            BinaryOp::Div => num(lhs.to_number() / rhs.to_number()),
            BinaryOp::Rem => num(lhs.to_number() % rhs.to_number()),
            BinaryOp::Pow => num(js_pow(lhs.to_number(), rhs.to_number())),
            BinaryOp::Eq => Ok(Value::Bool(lhs.loose_equals(rhs))),
            BinaryOp::NotEq => Ok(Value::Bool(!lhs.loose_equals(rhs))),
            BinaryOp::StrictEq => Ok(Value::Bool(lhs.strict_equals(rhs))),
            BinaryOp::StrictNotEq => Ok(Value::Bool(!lhs.strict_equals(rhs))),
            BinaryOp::Lt => Ok(Value::Bool(compare(lhs, rhs) == Some(Ordering::Less))),
            BinaryOp::Gt => Ok(Value::Bool(compare(lhs, rhs) == Some(Ordering::Greater))),
            BinaryOp::LtEq => Ok(Value::Bool(matches!(
                compare(lhs, rhs),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            BinaryOp::GtEq => Ok(Value::Bool(matches!(
                compare(lhs, rhs),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            BinaryOp::BitAnd => num((to_int32(lhs.to_number()) & to_int32(rhs.to_number())) as f64),
            BinaryOp::BitOr => num((to_int32(lhs.to_number()) | to_int32(rhs.to_number())) as f64),
            BinaryOp::BitXor => num((to_int32(lhs.to_number()) ^ to_int32(rhs.to_number())) as f64),
            BinaryOp::Shl => num(to_int32(lhs.to_number()).wrapping_shl(to_uint32(rhs.to_number()) & 31) as f64),
            BinaryOp::Shr => num((to_int32(lhs.to_number()) >> (to_uint32(rhs.to_number()) & 31)) as f64),
            BinaryOp::UShr => num((to_uint32(lhs.to_number()) >> (to_uint32(rhs.to_number()) & 31)) as f64),
            BinaryOp::In => {
                let name = PropName::from_value(lhs);
                let found = match rhs {
                    Value::Object(obj) => obj.borrow().has(&name.as_key()),
                    Value::Array(items) => match &name {
                        PropName::Index(i) => *i < items.borrow().len(),
                        PropName::Key(k) => &**k == "length",
                    },
                    other => {
                        return self.throw(
                            "TypeError",
                            format!(
                                "Cannot use 'in' operator to search for '{}' in {}",
                                name.as_key(),
                                describe_value(other)
                            ),
                        )
                    }
                };
                Ok(Value::Bool(found))
            }
            BinaryOp::InstanceOf => self.instance_of(lhs, rhs),
        }
    }

    fn instance_of(&self, value: &Value, ctor: &Value) -> Exec<Value> {
        let result = match ctor {
            Value::Native(native) => match native.name {
                "Error" => matches!(value, Value::Object(o) if o.borrow().class == ObjectClass::Error),
                "TypeError" | "RangeError" | "ReferenceError" | "SyntaxError" => match value {
                    Value::Object(o) => {
                        let o = o.borrow();
                        o.class == ObjectClass::Error
                            && matches!(o.get("name"), Some(Value::Str(n)) if &*n == native.name)
                    }
                    _ => false,
                },
                "Array" => matches!(value, Value::Array(_)),
                "Object" => matches!(
                    value,
                    Value::Object(_) | Value::Array(_) | Value::Function(_) | Value::Native(_)
                ),
                _ => false,
            },
            Value::Function(closure) => match value {
                Value::Object(o) => o
                    .borrow()
                    .ctor
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .is_some_and(|c| Rc::ptr_eq(&c, closure)),
                _ => false,
            },
            other => {
                return self.throw(
                    "TypeError",
                    format!("Right-hand side of 'instanceof' is not callable ({})", describe_value(other)),
                )
            }
        };
        Ok(Value::Bool(result))
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn short_circuits(op: LogicalOp, lhs: &Value) -> bool {
    match op {
        LogicalOp::And => !lhs.truthy(),
        LogicalOp::Or => lhs.truthy(),
        LogicalOp::Nullish => !lhs.is_nullish(),
    }
}

fn to_primitive(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Native(_) => {
            Value::Str(Rc::from(value.to_display().as_str()))
        }
        other => other.clone(),
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (to_primitive(lhs), to_primitive(rhs)) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(&b)),
        (a, b) => a.to_number().partial_cmp(&b.to_number()),
    }
}

pub(crate) fn js_pow(base: f64, exp: f64) -> f64 {
    if exp.is_nan() || (base.abs() == 1.0 && exp.is_infinite()) {
        return f64::NAN;
    }
    base.powf(exp)
}

pub(crate) fn describe_value(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("\"{}\"", s),
        Value::Array(_) | Value::Object(_) => {
            let shown = value.inspect();
            if shown.chars().count() > 40 {
                format!("{}...", shown.chars().take(40).collect::<String>())
            } else {
                shown
            }
        }
        other => other.inspect(),
    }
}

fn describe_expr(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.to_string(),
        Expr::Member {
            object, property, ..
        } => match property {
            MemberProp::Named(name) => format!("{}.{}", describe_expr(object), name),
            MemberProp::Computed(_) => format!("{}[...]", describe_expr(object)),
        },
        Expr::Call { callee, .. } => format!("{}(...)", describe_expr(callee)),
        _ => "expression".to_string(),
    }
}

fn pattern_names(pattern: &Pattern, out: &mut Vec<Rc<str>>) {
    match pattern {
        Pattern::Ident(name) => out.push(name.clone()),
        Pattern::Array(elems) => {
            for elem in elems.iter().flatten() {
                pattern_names(&elem.target, out);
            }
        }
        Pattern::Object(props) => {
            for (_, elem) in props {
                pattern_names(&elem.target, out);
            }
        }
    }
}

fn collect_var_names(stmt: &Stmt, out: &mut Vec<Rc<str>>) {
    let nested = |stmts: &[Stmt], out: &mut Vec<Rc<str>>| {
        for stmt in stmts {
            collect_var_names(stmt, out);
        }
    };
    match &stmt.kind {
        StmtKind::Decl(DeclKind::Var, decls) => {
            for decl in decls {
                pattern_names(&decl.target, out);
            }
        }
        StmtKind::If(_, cons, alt) => {
            collect_var_names(cons, out);
            if let Some(alt) = alt {
                collect_var_names(alt, out);
            }
        }
        StmtKind::While(_, body) | StmtKind::DoWhile(body, _) => collect_var_names(body, out),
        StmtKind::For { init, body, .. } => {
            if let Some(init) = init {
                collect_var_names(init, out);
            }
            collect_var_names(body, out);
        }
        StmtKind::ForEach {
            decl, target, body, ..
        } => {
            if *decl == Some(DeclKind::Var) {
                pattern_names(target, out);
            }
            collect_var_names(body, out);
        }
        StmtKind::Try {
            block,
            handler,
            finalizer,
            ..
        } => {
            nested(block, out);
            if let Some(handler) = handler {
                nested(handler, out);
            }
            if let Some(finalizer) = finalizer {
                nested(finalizer, out);
            }
        }
        StmtKind::Switch(_, cases) => {
            for case in cases {
                nested(&case.body, out);
            }
        }
        StmtKind::Block(stmts) => nested(stmts, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse_program;
    use std::time::Duration;

    /// Runs on a large stack like the engine does; values are rendered in-thread
    fn run_with(src: &str, limits: Limits, budget_ms: u64) -> (Result<String, String>, Vec<String>) {
        let src = src.to_string();
        std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(move || {
                let program = parse_program(&src).unwrap_or_else(|e| panic!("parse failed: {}", e));
                let console = Console::new(true, limits.max_output_lines);
                let budget = Budget::new(
                    Instant::now() + Duration::from_millis(budget_ms),
                    Arc::new(AtomicBool::new(false)),
                    limits,
                );
                let mut interp = Interpreter::new(budget, console.clone());
                let result = match interp.run(&program) {
                    Ok(value) => Ok(value.inspect()),
                    Err(Interrupt::Throw(value)) => Err(value.to_display()),
                    Err(Interrupt::Halt(reason)) => Err(format!("halt: {:?}", reason)),
                };
                (result, console.snapshot())
            })
            .unwrap()
            .join()
            .unwrap()
    }

    fn run(src: &str) -> (Result<String, String>, Vec<String>) {
        run_with(src, Limits::standard(), 5_000)
    }

    fn output(src: &str) -> Vec<String> {
        let (result, lines) = run(src);
        if let Err(e) = result {
            panic!("program failed: {}", e);
        }
        lines
    }

    fn value(src: &str) -> String {
        match run(src).0 {
            Ok(v) => v,
            Err(e) => panic!("program failed: {}", e),
        }
    }

    #[test]
    fn test_hello_world() {
        assert_eq!(output(r#"console.log("Hello World")"#), vec!["Hello World"]);
    }

    #[test]
    fn test_completion_value_is_last_expression() {
        assert_eq!(value("let x = 5\nx * 3"), "15");
        assert_eq!(value("const a = 2; a + 3; let b = 1;"), "5");
        assert_eq!(value("console.log('x')"), "undefined");
    }

    #[test]
    fn test_top_level_return() {
        assert_eq!(value("return 7\nconsole.log('never')"), "7");
    }

    #[test]
    fn test_functions_and_recursion() {
        let src = "function fact(n) { return n <= 1 ? 1 : n * fact(n - 1) }\nfact(10)";
        assert_eq!(value(src), "3628800");
    }

    #[test]
    fn test_closures_capture_per_iteration_bindings() {
        let src = r#"
            const fns = []
            for (let i = 0; i < 3; i++) { fns.push(() => i) }
            fns.map(f => f()).join(",")
        "#;
        assert_eq!(value(src), "0,1,2");
    }

    #[test]
    fn test_var_hoisting_and_function_hoisting() {
        assert_eq!(value("typeof later + ':' + helper()\nvar later = 1\nfunction helper() { return 'ok' }"), "undefined:ok");
    }

    #[test]
    fn test_try_catch_finally() {
        let src = r#"
            let log = []
            try { null.x } catch (e) { log.push(e.name) } finally { log.push('done') }
            log.join(' ')
        "#;
        assert_eq!(value(src), "TypeError done");
    }

    #[test]
    fn test_thrown_error_carries_position() {
        let (result, _) = run("let a = 1\n  throw new Error('boom')");
        assert_eq!(result.unwrap_err(), "Error: boom");

        let program = parse_program("let a = 1\n  missing()").unwrap();
        let budget = Budget::new(
            Instant::now() + Duration::from_secs(5),
            Arc::new(AtomicBool::new(false)),
            Limits::standard(),
        );
        let mut interp = Interpreter::new(budget, Console::new(true, 10));
        match interp.run(&program) {
            Err(Interrupt::Throw(Value::Object(obj))) => {
                let stack = obj.borrow().get("stack").unwrap().to_display();
                assert_eq!(stack, "ReferenceError: missing is not defined\n    at line 2, column 3");
            }
            _ => panic!("expected a thrown error"),
        }
    }

    #[test]
    fn test_const_reassignment_throws() {
        let (result, _) = run("const k = 1\nk = 2");
        assert_eq!(result.unwrap_err(), "TypeError: Assignment to constant variable.");
    }

    #[test]
    fn test_duplicate_let_is_tolerated_at_runtime() {
        assert_eq!(value("let x = 1; let x = 2; x"), "2");
    }

    #[test]
    fn test_destructuring_and_spread() {
        let src = r#"
            const { a, b: [first, second = 9] } = { a: 1, b: [2] }
            const merged = { ...{ p: 1 }, q: 2 }
            let x = 1, y = 2;
            [x, y] = [y, x];
            [a, first, second, merged.p + merged.q, x, y, Math.max(...[4, 8, 3])].join(",")
        "#;
        assert_eq!(value(src), "1,2,9,3,2,1,8");
    }

    #[test]
    fn test_switch_fallthrough() {
        let src = r#"
            function grade(n) {
                switch (n) {
                    case 1:
                    case 2: return 'low'
                    case 3: return 'mid'
                    default: return 'high'
                }
            }
            [grade(2), grade(3), grade(7)].join(" ")
        "#;
        assert_eq!(value(src), "low mid high");
    }

    #[test]
    fn test_constructor_functions_and_instanceof() {
        let src = r#"
            function Point(x, y) { this.x = x; this.y = y }
            const p = new Point(1, 2)
            const e = new TypeError('bad');
            [p instanceof Point, e instanceof Error, e instanceof RangeError, [] instanceof Array].join()
        "#;
        assert_eq!(value(src), "true,true,false,true");
    }

    #[test]
    fn test_optional_chaining_short_circuits() {
        assert_eq!(value("const o = null\no?.a.b.c"), "undefined");
        assert_eq!(value("const o = { f() { return 3 } }\no.g?.() ?? o.f()"), "3");
    }

    #[test]
    fn test_string_concat_and_coercion() {
        assert_eq!(value("'a' + 1 + 2"), "a12");
        assert_eq!(value("1 + 2 + 'a'"), "3a");
        assert_eq!(value("[1, 2] + ''"), "1,2");
        assert_eq!(value("'5' * '2'"), "10");
    }

    #[test]
    fn test_deeply_nested_structures_are_released() {
        let src = r#"
            let a = [];
            for (let i = 0; i < 300000; i++) a = [a];
            let f = () => 0;
            for (let i = 0; i < 100000; i++) { const g = f; f = () => g(); }
            a.length
        "#;
        assert_eq!(value(src), "1");
    }

    #[test]
    fn test_infinite_loop_hits_deadline() {
        let (result, _) = run_with("while (true) {}", Limits::standard(), 50);
        assert_eq!(result.unwrap_err(), "halt: Deadline");
    }

    #[test]
    fn test_step_ceiling_halts() {
        let limits = Limits {
            max_steps: 1_000,
            ..Limits::standard()
        };
        let (result, _) = run_with("for (;;) {}", limits, 5_000);
        assert_eq!(result.unwrap_err(), "halt: StepLimit");
    }

    #[test]
    fn test_halt_is_not_catchable() {
        let limits = Limits {
            max_steps: 1_000,
            ..Limits::standard()
        };
        let (result, _) = run_with("try { for (;;) {} } catch (e) { 'caught' }", limits, 5_000);
        assert_eq!(result.unwrap_err(), "halt: StepLimit");
    }

    #[test]
    fn test_runaway_recursion_is_a_catchable_range_error() {
        let src = r#"
            function down(n) { return down(n + 1) }
            try { down(0) } catch (e) { e.message }
        "#;
        assert_eq!(value(src), "Maximum call stack size exceeded");
    }

    #[test]
    fn test_cancel_flag_stops_execution() {
        let program = parse_program("let i = 0; while (true) { i++ }").unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let budget = Budget::new(Instant::now() + Duration::from_secs(5), cancel, Limits::standard());
        let mut interp = Interpreter::new(budget, Console::new(true, 10));
        assert!(matches!(
            interp.run(&program),
            Err(Interrupt::Halt(HaltReason::Cancelled))
        ));
    }

    #[test]
    fn test_implicit_global_assignment() {
        assert_eq!(value("function f() { leaked = 4 }\nf()\nleaked"), "4");
    }

    #[test]
    fn test_prop_name_canonical_indices() {
        assert!(matches!(PropName::from_key(Rc::from("12")), PropName::Index(12)));
        assert!(matches!(PropName::from_key(Rc::from("012")), PropName::Key(_)));
        assert!(matches!(PropName::from_value(&Value::Number(1.5)), PropName::Key(_)));
    }
}
