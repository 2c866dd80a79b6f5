//! Predicate compiler for the store's placeholder-based filter syntax.
//!
//! # Invariants
//! - Every leaf operand gets its own placeholder; the numeric suffix comes
//!   from a counter threaded through the call, never from shared state.
//! - Field references become `#` name aliases, literals become `:` value
//!   aliases, so the store can tell `a = "x"` from `a = b`.
//! - `And`/`Or` fold left: `[a, b, c]` renders as `((a OP b) OP c)`.

use super::{ComparisonOp, Operand, Predicate};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Native filter expression plus its placeholder tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledExpression {
    /// Expression text, e.g. `((#field_currency_1 = :val_2) AND ...)`.
    pub expression: String,
    /// Name placeholder -> attribute name.
    pub names: BTreeMap<String, String>,
    /// Value placeholder -> literal.
    pub values: BTreeMap<String, Value>,
    /// Counter value after the last leaf; seed the next compilation with it.
    pub last_counter: u32,
}

impl CompiledExpression {
    fn absorb(&mut self, other: CompiledExpression) {
        self.names.extend(other.names);
        self.values.extend(other.values);
        self.last_counter = other.last_counter;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// `And([])` / `Or([])` have no defined meaning.
    EmptyJunction(&'static str),
    EmptyFieldName,
    /// The seed leaves no room for this predicate's placeholders.
    CounterOverflow(u32),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyJunction(op) => write!(f, "{op} predicate must have at least one child"),
            Self::EmptyFieldName => write!(f, "field reference must name an attribute"),
            Self::CounterOverflow(seed) => {
                write!(f, "placeholder counter overflows after seed {seed}")
            }
        }
    }
}

impl Error for CompileError {}

/// Compiles `predicate`, numbering placeholders after `counter`.
pub fn compile(predicate: &Predicate, counter: u32) -> Result<CompiledExpression, CompileError> {
    match predicate {
        Predicate::Not(inner) => {
            let mut compiled = compile(inner, counter)?;
            compiled.expression = format!("(NOT {})", compiled.expression);
            Ok(compiled)
        }
        Predicate::And(children) => compile_junction("AND", children, counter),
        Predicate::Or(children) => compile_junction("OR", children, counter),
        Predicate::Comparison { lhs, op, rhs } => compile_comparison(lhs, *op, rhs, counter),
    }
}

fn compile_junction(
    op: &'static str,
    children: &[Predicate],
    counter: u32,
) -> Result<CompiledExpression, CompileError> {
    let (first, rest) = children
        .split_first()
        .ok_or(CompileError::EmptyJunction(op))?;

    let mut acc = compile(first, counter)?;
    for child in rest {
        let next = compile(child, acc.last_counter)?;
        acc.expression = format!("({} {op} {})", acc.expression, next.expression);
        acc.absorb(next);
    }
    Ok(acc)
}

fn compile_comparison(
    lhs: &Operand,
    op: ComparisonOp,
    rhs: &Operand,
    counter: u32,
) -> Result<CompiledExpression, CompileError> {
    let last_counter = counter
        .checked_add(2)
        .ok_or(CompileError::CounterOverflow(counter))?;
    let mut compiled = CompiledExpression {
        last_counter,
        ..CompiledExpression::default()
    };
    let left = bind_operand(lhs, counter + 1, &mut compiled)?;
    let right = bind_operand(rhs, last_counter, &mut compiled)?;

    compiled.expression = match op {
        ComparisonOp::Lt => format!("({left} < {right})"),
        ComparisonOp::Le => format!("({left} <= {right})"),
        ComparisonOp::Eq => format!("({left} = {right})"),
        ComparisonOp::Gt => format!("({left} > {right})"),
        ComparisonOp::Ge => format!("({left} >= {right})"),
        ComparisonOp::Ne => format!("({left} <> {right})"),
        ComparisonOp::Contains => format!("contains({left}, {right})"),
        ComparisonOp::NotContains => format!("(NOT contains({left}, {right}))"),
    };
    Ok(compiled)
}

fn bind_operand(
    operand: &Operand,
    counter: u32,
    compiled: &mut CompiledExpression,
) -> Result<String, CompileError> {
    match operand {
        Operand::Field(field) => {
            if field.name.is_empty() {
                return Err(CompileError::EmptyFieldName);
            }
            let placeholder = format!("#field_{}_{counter}", alias_safe(&field.name));
            compiled
                .names
                .insert(placeholder.clone(), field.name.clone());
            Ok(placeholder)
        }
        Operand::Literal(scalar) => {
            let placeholder = format!(":val_{counter}");
            compiled.values.insert(placeholder.clone(), scalar.to_value());
            Ok(placeholder)
        }
    }
}

// Placeholders only admit [A-Za-z0-9_]; the real name lives in the map.
fn alias_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{compile, CompileError};
    use crate::predicate::{ComparisonOp, Operand, Predicate};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn strip_counters(expression: &str) -> String {
        let mut out = String::new();
        let mut chars = expression.chars().peekable();
        while let Some(c) = chars.next() {
            out.push(c);
            if c == '_' {
                while chars.peek().is_some_and(|next| next.is_ascii_digit()) {
                    chars.next();
                }
            }
        }
        out
    }

    #[test]
    fn currency_and_timestamp_use_two_names_and_two_values() {
        let predicate = Predicate::and([
            Predicate::eq("currency", "usd"),
            Predicate::ge("timestamp", "2024-01-01"),
        ]);

        let compiled = compile(&predicate, 0).unwrap();
        assert_eq!(
            compiled.expression,
            "((#field_currency_1 = :val_2) AND (#field_timestamp_3 >= :val_4))"
        );
        assert_eq!(compiled.names.len(), 2);
        assert_eq!(compiled.values.len(), 2);
        assert_eq!(compiled.names["#field_currency_1"], "currency");
        assert_eq!(compiled.names["#field_timestamp_3"], "timestamp");
        assert_eq!(compiled.values[":val_2"], json!("usd"));
        assert_eq!(compiled.values[":val_4"], json!("2024-01-01"));
        assert_eq!(compiled.last_counter, 4);
    }

    #[test]
    fn repeated_fields_and_literals_never_collide() {
        let predicate = Predicate::or([
            Predicate::eq("coin_id", "bitcoin"),
            Predicate::eq("coin_id", "bitcoin"),
            Predicate::not(Predicate::and([
                Predicate::eq("coin_id", "bitcoin"),
                Predicate::compare(
                    Operand::field("coin_id"),
                    ComparisonOp::Ne,
                    Operand::field("coin_id"),
                ),
            ])),
        ]);

        let compiled = compile(&predicate, 7).unwrap();
        let placeholders: BTreeSet<&String> =
            compiled.names.keys().chain(compiled.values.keys()).collect();
        assert_eq!(placeholders.len(), predicate.leaf_count());
        assert_eq!(compiled.last_counter, 7 + predicate.leaf_count() as u32);
    }

    #[test]
    fn junction_is_a_left_fold() {
        let a = Predicate::eq("a", 1);
        let b = Predicate::lt("b", 2);
        let c = Predicate::contains("c", "x");

        let flat = compile(&Predicate::and([a.clone(), b.clone(), c.clone()]), 0).unwrap();
        let nested = compile(
            &Predicate::and([Predicate::and([a, b]), c]),
            0,
        )
        .unwrap();

        assert_eq!(flat.expression, nested.expression);
        assert_eq!(
            strip_counters(&flat.expression),
            "(((#field_a_ = :val_) AND (#field_b_ < :val_)) AND contains(#field_c_, :val_))"
        );
    }

    #[test]
    fn single_child_junction_is_transparent() {
        let inner = Predicate::gt("price", 100);
        let alone = compile(&inner, 3).unwrap();
        let wrapped = compile(&Predicate::or([inner]), 3).unwrap();

        assert_eq!(alone, wrapped);
    }

    #[test]
    fn not_wraps_and_forwards_placeholders() {
        let inner = Predicate::not_contains("tags", "stable");
        let compiled = compile(&Predicate::not(inner.clone()), 0).unwrap();
        let plain = compile(&inner, 0).unwrap();

        assert_eq!(compiled.expression, format!("(NOT {})", plain.expression));
        assert_eq!(compiled.names, plain.names);
        assert_eq!(compiled.values, plain.values);
        assert_eq!(compiled.last_counter, plain.last_counter);
        assert_eq!(
            plain.expression,
            "(NOT contains(#field_tags_1, :val_2))"
        );
    }

    #[test]
    fn field_to_field_comparison_uses_name_aliases_only() {
        let predicate =
            Predicate::compare(Operand::field("low"), ComparisonOp::Le, Operand::field("high"));
        let compiled = compile(&predicate, 0).unwrap();

        assert_eq!(compiled.expression, "(#field_low_1 <= #field_high_2)");
        assert!(compiled.values.is_empty());
    }

    #[test]
    fn not_equal_uses_native_spelling() {
        let compiled = compile(&Predicate::ne("granularity", "daily"), 0).unwrap();
        assert_eq!(compiled.expression, "(#field_granularity_1 <> :val_2)");
    }

    #[test]
    fn reserved_characters_in_names_are_aliased() {
        let compiled = compile(&Predicate::eq("timestamp#currency", "x"), 0).unwrap();

        assert_eq!(compiled.expression, "(#field_timestamp_currency_1 = :val_2)");
        assert_eq!(
            compiled.names["#field_timestamp_currency_1"],
            "timestamp#currency"
        );
    }

    #[test]
    fn empty_junction_is_rejected() {
        let err = compile(&Predicate::and([]), 0).unwrap_err();
        assert_eq!(err, CompileError::EmptyJunction("AND"));

        let nested = Predicate::not(Predicate::or([]));
        assert_eq!(
            compile(&nested, 0).unwrap_err(),
            CompileError::EmptyJunction("OR")
        );
    }

    #[test]
    fn seed_near_counter_limit_is_rejected() {
        let leaf = Predicate::eq("a", 1);
        assert_eq!(
            compile(&leaf, u32::MAX - 1).unwrap_err(),
            CompileError::CounterOverflow(u32::MAX - 1)
        );

        let last = compile(&leaf, u32::MAX - 2).unwrap();
        assert_eq!(last.last_counter, u32::MAX);

        let pair = Predicate::and([leaf.clone(), leaf]);
        assert_eq!(
            compile(&pair, u32::MAX - 2).unwrap_err(),
            CompileError::CounterOverflow(u32::MAX)
        );
    }

    #[test]
    fn empty_field_name_is_rejected() {
        let err = compile(&Predicate::eq("", 1), 0).unwrap_err();
        assert_eq!(err, CompileError::EmptyFieldName);
    }
}
