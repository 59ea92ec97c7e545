use crate::helpers::quote_ident;
use crate::mapping::{MappingError, TableSpec};
use crate::value::SqlValue;

/// Comparison operators available on predicate leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
}

impl CmpOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "<>",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
            CmpOp::Like => "LIKE",
        }
    }
}

/// Boolean predicate over an entity's properties. Properties are declared
/// names; the compiler resolves them to database columns through the
/// `TableSpec`, so renames never leak into caller code.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Matches every row. Only valid at the root: passing it to a delete
    /// is the caller explicitly choosing an unfiltered statement.
    All,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Cmp { property: String, op: CmpOp, value: SqlValue },
    IsNull { property: String, negated: bool },
    In { property: String, values: Vec<SqlValue> },
}

impl Expr {
    pub fn cmp(property: impl Into<String>, op: CmpOp, value: impl Into<SqlValue>) -> Expr {
        Expr::Cmp { property: property.into(), op, value: value.into() }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<SqlValue>) -> Expr {
        Expr::cmp(property, CmpOp::Eq, value)
    }

    pub fn not_eq(property: impl Into<String>, value: impl Into<SqlValue>) -> Expr {
        Expr::cmp(property, CmpOp::NotEq, value)
    }

    pub fn lt(property: impl Into<String>, value: impl Into<SqlValue>) -> Expr {
        Expr::cmp(property, CmpOp::Lt, value)
    }

    pub fn lt_eq(property: impl Into<String>, value: impl Into<SqlValue>) -> Expr {
        Expr::cmp(property, CmpOp::LtEq, value)
    }

    pub fn gt(property: impl Into<String>, value: impl Into<SqlValue>) -> Expr {
        Expr::cmp(property, CmpOp::Gt, value)
    }

    pub fn gt_eq(property: impl Into<String>, value: impl Into<SqlValue>) -> Expr {
        Expr::cmp(property, CmpOp::GtEq, value)
    }

    pub fn like(property: impl Into<String>, pattern: impl Into<String>) -> Expr {
        Expr::cmp(property, CmpOp::Like, SqlValue::Text(pattern.into()))
    }

    pub fn is_null(property: impl Into<String>) -> Expr {
        Expr::IsNull { property: property.into(), negated: false }
    }

    pub fn is_not_null(property: impl Into<String>) -> Expr {
        Expr::IsNull { property: property.into(), negated: true }
    }

    pub fn in_list<V: Into<SqlValue>>(
        property: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Expr {
        Expr::In {
            property: property.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Build an AND of expressions.
    pub fn all_of(exprs: Vec<Expr>) -> Expr {
        Expr::And(exprs)
    }

    /// Build an OR of expressions.
    pub fn any_of(exprs: Vec<Expr>) -> Expr {
        Expr::Or(exprs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Expr {
        Expr::Not(Box::new(expr))
    }
}

/// Arithmetic operators available inside a column modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn as_sql(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

/// Right-hand side of a single-column update. Compiled structurally into
/// the SET expression, so nested arithmetic and conditionals come out with
/// balanced parentheses by construction.
#[derive(Debug, Clone)]
pub enum ValueExpr {
    Column(String),
    Value(SqlValue),
    Binary { op: ArithOp, lhs: Box<ValueExpr>, rhs: Box<ValueExpr> },
    Case { when: Box<Expr>, then: Box<ValueExpr>, otherwise: Box<ValueExpr> },
}

impl ValueExpr {
    pub fn column(property: impl Into<String>) -> ValueExpr {
        ValueExpr::Column(property.into())
    }

    pub fn value(value: impl Into<SqlValue>) -> ValueExpr {
        ValueExpr::Value(value.into())
    }

    pub fn binary(op: ArithOp, lhs: ValueExpr, rhs: ValueExpr) -> ValueExpr {
        ValueExpr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn add(lhs: ValueExpr, rhs: ValueExpr) -> ValueExpr {
        ValueExpr::binary(ArithOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: ValueExpr, rhs: ValueExpr) -> ValueExpr {
        ValueExpr::binary(ArithOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: ValueExpr, rhs: ValueExpr) -> ValueExpr {
        ValueExpr::binary(ArithOp::Mul, lhs, rhs)
    }

    pub fn div(lhs: ValueExpr, rhs: ValueExpr) -> ValueExpr {
        ValueExpr::binary(ArithOp::Div, lhs, rhs)
    }

    pub fn case(when: Expr, then: ValueExpr, otherwise: ValueExpr) -> ValueExpr {
        ValueExpr::Case { when: Box::new(when), then: Box::new(then), otherwise: Box::new(otherwise) }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExpressionError {
    #[error("Property {property} does not exist on entity {entity}")]
    UnknownProperty { entity: &'static str, property: String },

    #[error("An empty AND/OR group has no SQL equivalent")]
    EmptyConjunction,

    #[error("IN over an empty value list has no SQL equivalent")]
    EmptyInList,

    #[error("The match-all expression is only valid at the root of a filter")]
    NestedAll,
}

/// Compiled filter: `where_sql` carries the leading `WHERE ` when a filter
/// exists and is empty for the explicit match-all case. Parameters are
/// positional, matched 1:1 with the `$n` markers.
#[derive(Debug, Clone)]
pub struct QueryInformation {
    pub schema: String,
    pub table: String,
    pub where_sql: String,
    pub parameters: Vec<(String, SqlValue)>,
}

/// Compiled single-column modifier: the assignment target column and its
/// right-hand SQL, emitted directly instead of being carved back out of a
/// WHERE-shaped fragment.
#[derive(Debug, Clone)]
pub struct CompiledModifier {
    pub column: String,
    pub set_sql: String,
    pub parameters: Vec<(String, SqlValue)>,
}

struct Compiler<'a> {
    spec: &'a TableSpec,
    parameters: Vec<(String, SqlValue)>,
    next_param: usize,
}

impl<'a> Compiler<'a> {
    fn new(spec: &'a TableSpec, param_offset: usize) -> Self {
        Compiler { spec, parameters: Vec::new(), next_param: param_offset + 1 }
    }

    fn column(&self, property: &str) -> Result<String, ExpressionError> {
        match self.spec.column_for_property(property) {
            Ok(mapping) => Ok(quote_ident(&mapping.name_in_database)),
            Err(MappingError::UnknownProperty { entity, property }) => {
                Err(ExpressionError::UnknownProperty { entity, property })
            }
            Err(_) => unreachable!("column_for_property only raises UnknownProperty"),
        }
    }

    fn push_param(&mut self, value: SqlValue) -> String {
        let marker = format!("${}", self.next_param);
        self.parameters.push((format!("p{}", self.next_param), value));
        self.next_param += 1;
        marker
    }

    fn predicate_fragment(&mut self, expr: &Expr) -> Result<String, ExpressionError> {
        match expr {
            Expr::All => Err(ExpressionError::NestedAll),
            Expr::And(exprs) | Expr::Or(exprs) => {
                if exprs.is_empty() {
                    return Err(ExpressionError::EmptyConjunction);
                }
                let joiner = if matches!(expr, Expr::And(_)) { " AND " } else { " OR " };
                let mut fragments = Vec::with_capacity(exprs.len());
                for inner in exprs {
                    fragments.push(self.predicate_fragment(inner)?);
                }
                Ok(format!("({})", fragments.join(joiner)))
            }
            Expr::Not(inner) => Ok(format!("NOT ({})", self.predicate_fragment(inner)?)),
            Expr::Cmp { property, op, value } => {
                let column = self.column(property)?;
                let marker = self.push_param(value.clone());
                Ok(format!("{} {} {}", column, op.as_sql(), marker))
            }
            Expr::IsNull { property, negated } => {
                let column = self.column(property)?;
                Ok(if *negated {
                    format!("{column} IS NOT NULL")
                } else {
                    format!("{column} IS NULL")
                })
            }
            Expr::In { property, values } => {
                if values.is_empty() {
                    return Err(ExpressionError::EmptyInList);
                }
                let column = self.column(property)?;
                let markers: Vec<String> =
                    values.iter().map(|value| self.push_param(value.clone())).collect();
                Ok(format!("{} IN ({})", column, markers.join(", ")))
            }
        }
    }

    fn modifier_fragment(&mut self, expr: &ValueExpr) -> Result<String, ExpressionError> {
        match expr {
            ValueExpr::Column(property) => self.column(property),
            ValueExpr::Value(value) => Ok(self.push_param(value.clone())),
            ValueExpr::Binary { op, lhs, rhs } => {
                let lhs = self.modifier_fragment(lhs)?;
                let rhs = self.modifier_fragment(rhs)?;
                Ok(format!("({} {} {})", lhs, op.as_sql(), rhs))
            }
            ValueExpr::Case { when, then, otherwise } => {
                let when = self.predicate_fragment(when)?;
                let then = self.modifier_fragment(then)?;
                let otherwise = self.modifier_fragment(otherwise)?;
                Ok(format!("CASE WHEN {when} THEN {then} ELSE {otherwise} END"))
            }
        }
    }
}

/// Compile a filter predicate against a resolved table.
pub fn compile_predicate(
    spec: &TableSpec,
    expr: &Expr,
) -> Result<QueryInformation, ExpressionError> {
    let mut compiler = Compiler::new(spec, 0);
    let where_sql = match expr {
        Expr::All => String::new(),
        _ => format!("WHERE {}", compiler.predicate_fragment(expr)?),
    };
    Ok(QueryInformation {
        schema: spec.schema.clone(),
        table: spec.table_name.clone(),
        where_sql,
        parameters: compiler.parameters,
    })
}

/// Compile a column modifier. `param_offset` is the number of parameters
/// already claimed by the predicate sharing the statement.
pub fn compile_modifier(
    spec: &TableSpec,
    target_property: &str,
    expr: &ValueExpr,
    param_offset: usize,
) -> Result<CompiledModifier, ExpressionError> {
    let mut compiler = Compiler::new(spec, param_offset);
    let column = compiler.column(target_property)?;
    let set_sql = compiler.modifier_fragment(expr)?;
    Ok(CompiledModifier { column, set_sql, parameters: compiler.parameters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::test_entities::{BlogPost, RenamedAndReorderedBlogPost};
    use crate::mapping::TableSpec;

    fn spec() -> TableSpec {
        TableSpec::resolve::<BlogPost>().unwrap()
    }

    #[test]
    fn test_simple_equality() {
        let info = compile_predicate(&spec(), &Expr::eq("title", "T1")).unwrap();
        assert_eq!(info.where_sql, "WHERE \"title\" = $1");
        assert_eq!(info.parameters.len(), 1);
        assert_eq!(info.parameters[0].0, "p1");
        assert_eq!(info.parameters[0].1, SqlValue::Text("T1".into()));
        assert_eq!(info.schema, "public");
        assert_eq!(info.table, "blog_posts");
    }

    #[test]
    fn test_conjunction_numbers_parameters_in_order() {
        let expr = Expr::all_of(vec![Expr::gt("reads", 10), Expr::lt("reads", 100)]);
        let info = compile_predicate(&spec(), &expr).unwrap();
        assert_eq!(info.where_sql, "WHERE (\"reads\" > $1 AND \"reads\" < $2)");
        assert_eq!(info.parameters[0].1, SqlValue::Int(10));
        assert_eq!(info.parameters[1].1, SqlValue::Int(100));
    }

    #[test]
    fn test_or_not_null_and_in() {
        let expr = Expr::any_of(vec![
            Expr::is_null("title"),
            Expr::in_list("reads", vec![1, 2, 3]),
        ]);
        let info = compile_predicate(&spec(), &expr).unwrap();
        assert_eq!(info.where_sql, "WHERE (\"title\" IS NULL OR \"reads\" IN ($1, $2, $3))");
        assert_eq!(info.parameters.len(), 3);
    }

    #[test]
    fn test_not_wraps_operand() {
        let info = compile_predicate(&spec(), &Expr::not(Expr::eq("reads", 0))).unwrap();
        assert_eq!(info.where_sql, "WHERE NOT (\"reads\" = $1)");
    }

    #[test]
    fn test_renamed_column_never_leaks_property_name() {
        let spec = TableSpec::resolve::<RenamedAndReorderedBlogPost>().unwrap();
        let info = compile_predicate(&spec, &Expr::eq("reads", 5)).unwrap();
        assert_eq!(info.where_sql, "WHERE \"reads2\" = $1");
        let modifier =
            compile_modifier(&spec, "id", &ValueExpr::column("id"), 0).unwrap();
        assert_eq!(modifier.column, "\"blog_id\"");
        assert_eq!(modifier.set_sql, "\"blog_id\"");
    }

    #[test]
    fn test_match_all_compiles_to_empty_filter() {
        let info = compile_predicate(&spec(), &Expr::All).unwrap();
        assert_eq!(info.where_sql, "");
        assert!(info.parameters.is_empty());
    }

    #[test]
    fn test_match_all_rejected_below_root() {
        let expr = Expr::all_of(vec![Expr::All, Expr::eq("reads", 1)]);
        assert!(matches!(
            compile_predicate(&spec(), &expr),
            Err(ExpressionError::NestedAll)
        ));
    }

    #[test]
    fn test_empty_groups_rejected() {
        assert!(matches!(
            compile_predicate(&spec(), &Expr::And(vec![])),
            Err(ExpressionError::EmptyConjunction)
        ));
        assert!(matches!(
            compile_predicate(&spec(), &Expr::in_list("reads", Vec::<i32>::new())),
            Err(ExpressionError::EmptyInList)
        ));
    }

    #[test]
    fn test_unknown_property() {
        assert!(matches!(
            compile_predicate(&spec(), &Expr::eq("missing", 1)),
            Err(ExpressionError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn test_arithmetic_modifier_continues_parameter_numbering() {
        let modifier = compile_modifier(
            &spec(),
            "reads",
            &ValueExpr::add(ValueExpr::column("reads"), ValueExpr::value(1)),
            2,
        )
        .unwrap();
        assert_eq!(modifier.column, "\"reads\"");
        assert_eq!(modifier.set_sql, "(\"reads\" + $3)");
        assert_eq!(modifier.parameters.len(), 1);
        assert_eq!(modifier.parameters[0].0, "p3");
        assert_eq!(modifier.parameters[0].1, SqlValue::Int(1));
    }

    #[test]
    fn test_nested_arithmetic_balances_parentheses() {
        let modifier = compile_modifier(
            &spec(),
            "reads",
            &ValueExpr::mul(
                ValueExpr::add(ValueExpr::column("reads"), ValueExpr::value(1)),
                ValueExpr::value(2),
            ),
            0,
        )
        .unwrap();
        assert_eq!(modifier.set_sql, "((\"reads\" + $1) * $2)");
    }

    #[test]
    fn test_conditional_modifier() {
        let modifier = compile_modifier(
            &spec(),
            "reads",
            &ValueExpr::case(
                Expr::is_null("title"),
                ValueExpr::value(0),
                ValueExpr::add(ValueExpr::column("reads"), ValueExpr::value(1)),
            ),
            1,
        )
        .unwrap();
        assert_eq!(
            modifier.set_sql,
            "CASE WHEN \"title\" IS NULL THEN $2 ELSE (\"reads\" + $3) END"
        );
        assert_eq!(modifier.parameters.len(), 2);
    }

    #[test]
    fn test_values_are_never_inlined() {
        let expr = Expr::eq("title", "x' OR '1'='1");
        let info = compile_predicate(&spec(), &expr).unwrap();
        assert!(!info.where_sql.contains("x'"));
        assert_eq!(info.where_sql, "WHERE \"title\" = $1");
    }
}
