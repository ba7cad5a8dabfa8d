//! SQL rendering for dynamic registry tables
//!
//! Identifiers are always quoted; values are always bound as parameters with
//! an explicit cast to the column's declared type, so a value read as text
//! (a gis id from a URL, a spreadsheet cell) binds correctly to a uuid or
//! integer column.

use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use super::query::{ColumnRef, CompareOp, Join, NativeQuerySpec, OrderBy, Predicate};
use super::value::{CellValue, DataType};

/// Alias of the base table in rendered queries.
pub const BASE_ALIAS: &str = "t";

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Incrementally built statement with typed bind values.
#[derive(Debug, Default)]
pub struct SqlBuilder {
    sql: String,
    args: Vec<CellValue>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_ident(&mut self, name: &str) -> &mut Self {
        self.sql.push_str(&quote_ident(name));
        self
    }

    /// Append a `$n::type` placeholder for `value`.
    pub fn push_bind(&mut self, value: CellValue, data_type: DataType) -> &mut Self {
        self.args.push(value);
        self.sql
            .push_str(&format!("${}::{}", self.args.len(), data_type.sql_cast()));
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[CellValue] {
        &self.args
    }

    pub fn build(&self) -> Query<'_, Postgres, PgArguments> {
        bind_all(sqlx::query(&self.sql), &self.args)
    }
}

/// Bind each value with its natural Rust type; the placeholder's cast does
/// the rest.
pub fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &'q [CellValue],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            CellValue::Null => query.bind(Option::<String>::None),
            CellValue::Bool(b) => query.bind(*b),
            CellValue::Int(i) => query.bind(*i),
            CellValue::Float(f) => query.bind(*f),
            CellValue::Decimal(d) => query.bind(*d),
            CellValue::Text(s) => query.bind(s.as_str()),
            CellValue::Date(d) => query.bind(*d),
            CellValue::Timestamp(t) => query.bind(*t),
            CellValue::TimestampTz(t) => query.bind(*t),
            CellValue::Uuid(u) => query.bind(*u),
            CellValue::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// How a listing query presents the base table.
pub struct SelectTarget<'a> {
    pub schema: &'a str,
    pub table: &'a str,
    pub columns: Vec<&'a str>,
}

pub fn render_column(builder: &mut SqlBuilder, column: &ColumnRef) {
    match column {
        ColumnRef::Base(name) => {
            builder.push(BASE_ALIAS).push(".").push_ident(name);
        }
        ColumnRef::Joined { alias, column } => {
            builder.push_ident(alias).push(".").push_ident(column);
        }
    }
}

fn render_joins(builder: &mut SqlBuilder, joins: &[Join]) {
    for join in joins {
        builder
            .push(" LEFT JOIN ")
            .push(&qualified(&join.schema, &join.table))
            .push(" AS ")
            .push_ident(&join.alias)
            .push(" ON ")
            .push_ident(&join.alias)
            .push(".")
            .push_ident(&join.key_column)
            .push(" = ")
            .push(BASE_ALIAS)
            .push(".")
            .push_ident(&join.foreign_key_column);
    }
}

pub fn render_predicate(builder: &mut SqlBuilder, predicate: &Predicate) {
    match predicate {
        Predicate::And(parts) | Predicate::Or(parts) if parts.is_empty() => {
            builder.push(if matches!(predicate, Predicate::And(_)) {
                "TRUE"
            } else {
                "FALSE"
            });
        }
        Predicate::And(parts) | Predicate::Or(parts) => {
            let glue = if matches!(predicate, Predicate::And(_)) {
                " AND "
            } else {
                " OR "
            };
            builder.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    builder.push(glue);
                }
                render_predicate(builder, part);
            }
            builder.push(")");
        }
        Predicate::Compare {
            column,
            op,
            value,
            data_type,
            date_only,
        } => {
            if *date_only {
                builder.push("date(");
                render_column(builder, column);
                builder.push(")");
            } else {
                render_column(builder, column);
            }
            builder.push(" ").push(op.as_sql()).push(" ");
            builder.push_bind(value.clone(), *data_type);
        }
        Predicate::TextMatch { column, pattern } => {
            render_column(builder, column);
            builder.push("::text ILIKE ");
            builder.push_bind(CellValue::Text(pattern.clone()), DataType::Text);
        }
        Predicate::IsNotNull(column) => {
            render_column(builder, column);
            builder.push(" IS NOT NULL");
        }
        Predicate::In {
            column,
            values,
            data_type,
            negated,
        } => {
            if values.is_empty() {
                builder.push(if *negated { "TRUE" } else { "FALSE" });
                return;
            }
            render_column(builder, column);
            builder.push(if *negated { " NOT IN (" } else { " IN (" });
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_bind(v.clone(), *data_type);
            }
            builder.push(")");
        }
    }
}

fn render_order(builder: &mut SqlBuilder, order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    builder.push(" ORDER BY ");
    for (i, o) in order.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        render_column(builder, &o.column);
        builder.push(if o.descending { " DESC" } else { " ASC" });
    }
}

/// `SELECT` of base columns plus each join's display column (as text,
/// aliased by the join alias).
pub fn render_list(target: &SelectTarget<'_>, spec: &NativeQuerySpec) -> SqlBuilder {
    let mut builder = SqlBuilder::new();
    builder.push("SELECT ");
    let mut first = true;
    for column in &target.columns {
        if !first {
            builder.push(", ");
        }
        first = false;
        builder.push(BASE_ALIAS).push(".").push_ident(column);
    }
    for join in &spec.joins {
        if let Some(display) = &join.display_column {
            if !first {
                builder.push(", ");
            }
            first = false;
            builder
                .push_ident(&join.alias)
                .push(".")
                .push_ident(display)
                .push("::text AS ")
                .push_ident(&join.alias);
        }
    }
    if first {
        builder.push("*");
    }
    builder
        .push(" FROM ")
        .push(&qualified(target.schema, target.table))
        .push(" AS ")
        .push(BASE_ALIAS);
    render_joins(&mut builder, &spec.joins);
    if let Some(predicate) = &spec.predicate {
        builder.push(" WHERE ");
        render_predicate(&mut builder, predicate);
    }
    render_order(&mut builder, &spec.order);
    if let Some(limit) = spec.limit {
        builder.push(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = spec.offset {
        builder.push(&format!(" OFFSET {offset}"));
    }
    builder
}

pub fn render_count(target: &SelectTarget<'_>, spec: &NativeQuerySpec) -> SqlBuilder {
    let mut builder = SqlBuilder::new();
    builder
        .push("SELECT COUNT(*) AS count FROM ")
        .push(&qualified(target.schema, target.table))
        .push(" AS ")
        .push(BASE_ALIAS);
    render_joins(&mut builder, &spec.joins);
    if let Some(predicate) = &spec.predicate {
        builder.push(" WHERE ");
        render_predicate(&mut builder, predicate);
    }
    builder
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}
