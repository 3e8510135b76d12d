//! Real-time code generator
//!
//! Compiles a `TypedRule` into a `RealTimeValidator`: a tree of closures,
//! one per typed node, each built from a whitelisted primitive. The
//! primitive used for every node is recorded in the validator's call graph.

use crate::error::{CompileError, Result};
use trialcheck_core::ast::{AllowKind, Builtin, LogicalOp, TypedExpr, TypedKind, TypedRule};
use trialcheck_core::ir::primitive::{self, Primitive};
use trialcheck_core::ir::{read_field, CompiledFn, Eval, Halt, RealTimeValidator};
use trialcheck_core::Value;

fn as_bool(value: Value) -> Eval<bool> {
    value
        .as_bool()
        .ok_or_else(|| Halt::fault(format!("expected logical, found {}", value.type_name())))
}

fn as_number(value: Value) -> Eval<f64> {
    value
        .as_number()
        .ok_or_else(|| Halt::fault(format!("expected numeric, found {}", value.type_name())))
}

/// Real-time code generator
pub struct RealTimeCodegen {
    allow: Option<AllowKind>,
    call_graph: Vec<Primitive>,
}

impl RealTimeCodegen {
    /// Compile a typed rule into a validator
    pub fn compile(typed: &TypedRule) -> Result<RealTimeValidator> {
        let mut codegen = Self {
            allow: typed.allow.clone(),
            call_graph: Vec::new(),
        };
        let root = codegen.gen(&typed.body)?;

        Ok(RealTimeValidator::new(
            typed.rule.id.clone(),
            typed.content_hash.clone(),
            typed.target.clone(),
            typed.rule.severity,
            typed.description.clone(),
            typed.allow.clone(),
            root,
            codegen.call_graph,
        ))
    }

    fn gen(&mut self, expr: &TypedExpr) -> Result<CompiledFn> {
        match &expr.kind {
            TypedKind::Literal(value) => {
                self.call_graph.push(Primitive::Const);
                let value = value.clone();
                Ok(Box::new(move |_, _| Ok(value.clone())))
            }

            TypedKind::Field(field) => {
                self.call_graph.push(Primitive::LoadField);
                let field = field.clone();
                let allow = self.allow.clone();
                Ok(Box::new(move |record, _| {
                    read_field(record, &field, allow.as_ref())
                }))
            }

            TypedKind::Today => {
                self.call_graph.push(Primitive::Today);
                Ok(Box::new(|_, ctx| Ok(Value::Date(ctx.today))))
            }

            TypedKind::Required(field) => {
                self.call_graph.push(Primitive::Required);
                let field = field.clone();
                let allow = self.allow.clone();
                Ok(Box::new(move |record, _| {
                    let present = !matches!(
                        read_field(record, &field, allow.as_ref()),
                        Err(Halt::Missing { .. })
                    );
                    Ok(Value::Bool(present))
                }))
            }

            TypedKind::Compare { left, op, right } => {
                self.call_graph.push(Primitive::Compare);
                let op = *op;
                let l = self.gen(left)?;
                let r = self.gen(right)?;
                Ok(Box::new(move |record, ctx| {
                    let a = l(record, ctx)?;
                    let b = r(record, ctx)?;
                    primitive::compare(&a, op, &b)
                        .map(Value::Bool)
                        .map_err(Halt::Fault)
                }))
            }

            TypedKind::Arithmetic { left, op, right } => {
                self.call_graph.push(Primitive::Arith);
                let op = *op;
                let l = self.gen(left)?;
                let r = self.gen(right)?;
                Ok(Box::new(move |record, ctx| {
                    let a = as_number(l(record, ctx)?)?;
                    let b = as_number(r(record, ctx)?)?;
                    primitive::arith(a, op, b)
                        .map(Value::Number)
                        .map_err(Halt::Fault)
                }))
            }

            TypedKind::Between { value, low, high } => {
                self.call_graph.push(Primitive::Between);
                let v = self.gen(value)?;
                let lo = self.gen(low)?;
                let hi = self.gen(high)?;
                Ok(Box::new(move |record, ctx| {
                    let x = v(record, ctx)?;
                    let a = lo(record, ctx)?;
                    let b = hi(record, ctx)?;
                    primitive::between(&x, &a, &b)
                        .map(Value::Bool)
                        .map_err(Halt::Fault)
                }))
            }

            TypedKind::InList {
                value,
                items,
                negated,
            } => {
                self.call_graph.push(Primitive::InList);
                let v = self.gen(value)?;
                let items = items.clone();
                let negated = *negated;
                Ok(Box::new(move |record, ctx| {
                    let x = v(record, ctx)?;
                    Ok(Value::Bool(primitive::in_list(&x, &items) != negated))
                }))
            }

            TypedKind::Logical { op, left, right } => {
                let l = self.gen(left)?;
                let r = self.gen(right)?;
                match op {
                    LogicalOp::And => {
                        self.call_graph.push(Primitive::And);
                        Ok(Box::new(move |record, ctx| match l(record, ctx) {
                            Ok(left) => {
                                if !as_bool(left)? {
                                    return Ok(Value::Bool(false));
                                }
                                Ok(Value::Bool(as_bool(r(record, ctx)?)?))
                            }
                            // Unknown on the left is still decided by a false right side
                            Err(missing @ Halt::Missing { .. }) => {
                                if as_bool(r(record, ctx)?)? {
                                    Err(missing)
                                } else {
                                    Ok(Value::Bool(false))
                                }
                            }
                            Err(fault) => Err(fault),
                        }))
                    }
                    LogicalOp::Or => {
                        self.call_graph.push(Primitive::Or);
                        Ok(Box::new(move |record, ctx| match l(record, ctx) {
                            Ok(left) => {
                                if as_bool(left)? {
                                    return Ok(Value::Bool(true));
                                }
                                Ok(Value::Bool(as_bool(r(record, ctx)?)?))
                            }
                            Err(missing @ Halt::Missing { .. }) => {
                                if as_bool(r(record, ctx)?)? {
                                    Ok(Value::Bool(true))
                                } else {
                                    Err(missing)
                                }
                            }
                            Err(fault) => Err(fault),
                        }))
                    }
                }
            }

            TypedKind::Not(inner) => {
                self.call_graph.push(Primitive::Not);
                let f = self.gen(inner)?;
                Ok(Box::new(move |record, ctx| {
                    Ok(Value::Bool(!as_bool(f(record, ctx)?)?))
                }))
            }

            TypedKind::Negate(inner) => {
                self.call_graph.push(Primitive::Arith);
                let f = self.gen(inner)?;
                Ok(Box::new(move |record, ctx| {
                    Ok(Value::Number(-as_number(f(record, ctx)?)?))
                }))
            }

            TypedKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                self.call_graph.push(Primitive::Select);
                let c = self.gen(condition)?;
                let t = self.gen(then_branch)?;
                let e = match else_branch {
                    Some(e) => Some(self.gen(e)?),
                    None => None,
                };
                Ok(Box::new(move |record, ctx| {
                    if as_bool(c(record, ctx)?)? {
                        t(record, ctx)
                    } else {
                        match &e {
                            Some(e) => e(record, ctx),
                            None => Ok(Value::Bool(true)),
                        }
                    }
                }))
            }

            TypedKind::DateShift { base, days } => {
                self.call_graph.push(Primitive::DateShift);
                let b = self.gen(base)?;
                let days = *days;
                Ok(Box::new(move |record, ctx| {
                    let value = b(record, ctx)?;
                    let date = value.as_date().ok_or_else(|| {
                        Halt::fault(format!("expected date, found {}", value.type_name()))
                    })?;
                    primitive::date_shift(date, days)
                        .map(Value::Date)
                        .map_err(Halt::Fault)
                }))
            }

            TypedKind::Within {
                value,
                reference,
                tolerance,
            } => {
                self.call_graph.push(Primitive::Within);
                let v = self.gen(value)?;
                let r = self.gen(reference)?;
                let tolerance = *tolerance;
                Ok(Box::new(move |record, ctx| {
                    let a = v(record, ctx)?;
                    let b = r(record, ctx)?;
                    primitive::within(&a, &b, tolerance)
                        .map(Value::Bool)
                        .map_err(Halt::Fault)
                }))
            }

            TypedKind::Builtin { func, args } => self.gen_builtin(*func, args),

            TypedKind::VisitRef { visit, field } => Err(CompileError::Internal(format!(
                "visit(\"{}\").{} reached real-time codegen",
                visit, field.name
            ))),

            TypedKind::Aggregate { func, field } => Err(CompileError::Internal(format!(
                "{}({}) reached real-time codegen",
                func.name(),
                field.name
            ))),
        }
    }

    fn gen_builtin(&mut self, func: Builtin, args: &[TypedExpr]) -> Result<CompiledFn> {
        if args.len() != func.arity() {
            return Err(CompileError::Internal(format!(
                "{}() compiled with {} arguments",
                func.name(),
                args.len()
            )));
        }

        match func {
            Builtin::Length => {
                self.call_graph.push(Primitive::Length);
                let a = self.gen(&args[0])?;
                Ok(Box::new(move |record, ctx| {
                    let value = a(record, ctx)?;
                    let text = value.as_str().ok_or_else(|| {
                        Halt::fault(format!("length() of {}", value.type_name()))
                    })?;
                    Ok(Value::Number(primitive::length(text)))
                }))
            }
            Builtin::IsBlank => {
                self.call_graph.push(Primitive::IsBlank);
                let a = self.gen(&args[0])?;
                Ok(Box::new(move |record, ctx| match a(record, ctx) {
                    Ok(value) => Ok(Value::Bool(value.is_blank())),
                    Err(Halt::Missing { .. }) => Ok(Value::Bool(true)),
                    Err(fault) => Err(fault),
                }))
            }
            Builtin::DateDiff => {
                self.call_graph.push(Primitive::DateDiff);
                let a = self.gen(&args[0])?;
                let b = self.gen(&args[1])?;
                Ok(Box::new(move |record, ctx| {
                    let x = a(record, ctx)?;
                    let y = b(record, ctx)?;
                    match (x.as_date(), y.as_date()) {
                        (Some(x), Some(y)) => Ok(Value::Number(primitive::date_diff(x, y) as f64)),
                        _ => Err(Halt::fault(format!(
                            "date_diff() of {} and {}",
                            x.type_name(),
                            y.type_name()
                        ))),
                    }
                }))
            }
            Builtin::Abs => {
                self.call_graph.push(Primitive::Abs);
                let a = self.gen(&args[0])?;
                Ok(Box::new(move |record, ctx| {
                    Ok(Value::Number(as_number(a(record, ctx)?)?.abs()))
                }))
            }
        }
    }
}
