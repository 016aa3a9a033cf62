// ============================================================================
// SQL front end of the in-memory driver
// ============================================================================

use crate::core::{ColumnMeta, DataType, ProxyError, Result, Value};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub(crate) enum Plan {
    CreateTable {
        name: String,
        columns: Vec<ColumnMeta>,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Select(SelectPlan),
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Option<Expr>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
    },
}

impl Plan {
    pub fn is_query(&self) -> bool {
        matches!(self, Plan::Select(_))
    }

    pub fn is_write(&self) -> bool {
        !self.is_query()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SelectPlan {
    pub table: Option<String>,
    pub projection: Vec<Projection>,
    pub filter: Option<Expr>,
    pub order_by: Vec<(Expr, bool)>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

#[derive(Debug, Clone)]
pub(crate) enum Projection {
    Wildcard,
    Expr { expr: Expr, label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Column(String),
    Literal(Value),
    Param(usize),
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
}

/// Parsed statement plus the number of positional parameters it expects.
#[derive(Debug, Clone)]
pub(crate) struct ParsedSql {
    pub plan: Plan,
    pub param_count: usize,
}

pub(crate) fn parse(sql: &str) -> Result<ParsedSql> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| ProxyError::database_with_state(e.to_string(), "42601"))?;

    let mut statements = statements.into_iter();
    let statement = statements
        .next()
        .ok_or_else(|| ProxyError::database_with_state("No statement found", "42601"))?;
    if statements.next().is_some() {
        return Err(ProxyError::database_with_state(
            "Only one statement per call is supported",
            "0A000",
        ));
    }

    let mut converter = Converter::default();
    let plan = converter.statement(statement)?;
    Ok(ParsedSql {
        plan,
        param_count: converter.params,
    })
}

#[derive(Default)]
struct Converter {
    params: usize,
}

impl Converter {
    fn statement(&mut self, stmt: sql_ast::Statement) -> Result<Plan> {
        match stmt {
            sql_ast::Statement::CreateTable(create) => {
                let name = table_name(&create.name)?;
                let columns = create
                    .columns
                    .into_iter()
                    .map(|col| {
                        let data_type = convert_data_type(&col.data_type)?;
                        let nullable = !col
                            .options
                            .iter()
                            .any(|opt| matches!(opt.option, sql_ast::ColumnOption::NotNull));
                        let mut meta = ColumnMeta::new(col.name.value.to_lowercase(), data_type);
                        if !nullable {
                            meta = meta.not_null();
                        }
                        Ok(meta)
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(Plan::CreateTable {
                    name,
                    columns,
                    if_not_exists: create.if_not_exists,
                })
            }
            sql_ast::Statement::Drop {
                object_type,
                names,
                if_exists,
                ..
            } => {
                if !matches!(object_type, sql_ast::ObjectType::Table) || names.len() != 1 {
                    return Err(unsupported("Only single table DROP supported"));
                }
                Ok(Plan::DropTable {
                    name: table_name(&names[0])?,
                    if_exists,
                })
            }
            sql_ast::Statement::Insert(insert) => {
                let table = insert.table.to_string().trim_matches('"').to_lowercase();
                let columns = if insert.columns.is_empty() {
                    None
                } else {
                    Some(
                        insert
                            .columns
                            .into_iter()
                            .map(|id| id.value.to_lowercase())
                            .collect(),
                    )
                };

                let Some(source) = insert.source else {
                    return Err(unsupported("INSERT requires a VALUES clause"));
                };
                let sql_ast::SetExpr::Values(values) = *source.body else {
                    return Err(unsupported("Only VALUES clause supported"));
                };

                let rows = values
                    .rows
                    .into_iter()
                    .map(|row| row.into_iter().map(|e| self.expr(e)).collect())
                    .collect::<Result<Vec<_>>>()?;

                Ok(Plan::Insert {
                    table,
                    columns,
                    rows,
                })
            }
            sql_ast::Statement::Query(query) => Ok(Plan::Select(self.query(*query)?)),
            sql_ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                let table = match table.relation {
                    sql_ast::TableFactor::Table { name, .. } => table_name(&name)?,
                    _ => return Err(unsupported("Complex table references not supported in UPDATE")),
                };

                let assignments = assignments
                    .into_iter()
                    .map(|assign| {
                        let column = match assign.target {
                            sql_ast::AssignmentTarget::ColumnName(name) if name.0.len() == 1 => {
                                name.0[0].to_string().to_lowercase()
                            }
                            _ => return Err(unsupported("Only simple column names supported in UPDATE")),
                        };
                        Ok((column, self.expr(assign.value)?))
                    })
                    .collect::<Result<Vec<_>>>()?;

                let filter = selection.map(|e| self.expr(e)).transpose()?;
                Ok(Plan::Update {
                    table,
                    assignments,
                    filter,
                })
            }
            sql_ast::Statement::Delete(delete) => {
                let tables = match delete.from {
                    sql_ast::FromTable::WithFromKeyword(tables) => tables,
                    sql_ast::FromTable::WithoutKeyword(tables) => tables,
                };
                let table = match tables.first().map(|t| &t.relation) {
                    Some(sql_ast::TableFactor::Table { name, .. }) => table_name(name)?,
                    _ => return Err(unsupported("DELETE requires a single table")),
                };
                let filter = delete.selection.map(|e| self.expr(e)).transpose()?;
                Ok(Plan::Delete { table, filter })
            }
            other => Err(unsupported(&format!("Statement not supported: {}", other))),
        }
    }

    fn query(&mut self, query: sql_ast::Query) -> Result<SelectPlan> {
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(unsupported("Only SELECT queries supported"));
        };

        if let sql_ast::GroupByExpr::Expressions(exprs, _) = &select.group_by {
            if !exprs.is_empty() {
                return Err(unsupported("GROUP BY is not supported"));
            }
        } else {
            return Err(unsupported("GROUP BY ALL is not supported"));
        }

        let table = match select.from.len() {
            0 => None,
            1 => {
                let from = &select.from[0];
                if !from.joins.is_empty() {
                    return Err(unsupported("JOIN is not supported"));
                }
                match &from.relation {
                    sql_ast::TableFactor::Table { name, .. } => Some(table_name(name)?),
                    _ => return Err(unsupported("Only plain table references supported")),
                }
            }
            _ => return Err(unsupported("Only one table per query supported")),
        };

        let projection = select
            .projection
            .into_iter()
            .map(|item| match item {
                sql_ast::SelectItem::Wildcard(_) => Ok(Projection::Wildcard),
                sql_ast::SelectItem::UnnamedExpr(expr) => {
                    let label = match &expr {
                        sql_ast::Expr::Identifier(ident) => ident.value.to_lowercase(),
                        other => other.to_string(),
                    };
                    Ok(Projection::Expr {
                        expr: self.expr(expr)?,
                        label,
                    })
                }
                sql_ast::SelectItem::ExprWithAlias { expr, alias } => Ok(Projection::Expr {
                    expr: self.expr(expr)?,
                    label: alias.value.to_lowercase(),
                }),
                _ => Err(unsupported("Unsupported select item")),
            })
            .collect::<Result<Vec<_>>>()?;

        let filter = select.selection.map(|e| self.expr(e)).transpose()?;

        let order_by = match query.order_by {
            None => Vec::new(),
            Some(order_by) => match order_by.kind {
                sql_ast::OrderByKind::Expressions(exprs) => exprs
                    .into_iter()
                    .map(|o| {
                        let descending = o.options.asc.map(|asc| !asc).unwrap_or(false);
                        Ok((self.expr(o.expr)?, descending))
                    })
                    .collect::<Result<Vec<_>>>()?,
                sql_ast::OrderByKind::All(_) => {
                    return Err(unsupported("ORDER BY ALL not supported"));
                }
            },
        };

        let (limit, offset) = match query.limit_clause {
            None => (None, None),
            Some(sql_ast::LimitClause::LimitOffset { limit, offset, .. }) => (
                limit.map(|e| self.expr(e)).transpose()?,
                offset.map(|o| self.expr(o.value)).transpose()?,
            ),
            Some(sql_ast::LimitClause::OffsetCommaLimit { offset, limit }) => {
                (Some(self.expr(limit)?), Some(self.expr(offset)?))
            }
        };

        Ok(SelectPlan {
            table,
            projection,
            filter,
            order_by,
            limit,
            offset,
        })
    }

    fn expr(&mut self, expr: sql_ast::Expr) -> Result<Expr> {
        match expr {
            sql_ast::Expr::Identifier(ident) => Ok(Expr::Column(ident.value.to_lowercase())),
            sql_ast::Expr::CompoundIdentifier(idents) => idents
                .last()
                .map(|i| Expr::Column(i.value.to_lowercase()))
                .ok_or_else(|| unsupported("Empty identifier")),
            sql_ast::Expr::Value(value) => self.value(&value.value),
            sql_ast::Expr::Nested(inner) => self.expr(*inner),
            sql_ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: false,
            }),
            sql_ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: true,
            }),
            sql_ast::Expr::UnaryOp { op, expr } => {
                let inner = Box::new(self.expr(*expr)?);
                match op {
                    sql_ast::UnaryOperator::Not => Ok(Expr::Not(inner)),
                    sql_ast::UnaryOperator::Minus => Ok(Expr::Negate(inner)),
                    sql_ast::UnaryOperator::Plus => Ok(*inner),
                    other => Err(unsupported(&format!("Unsupported unary operator: {}", other))),
                }
            }
            sql_ast::Expr::BinaryOp { left, op, right } => {
                let left = Box::new(self.expr(*left)?);
                let op = convert_binary_op(&op)?;
                let right = Box::new(self.expr(*right)?);
                Ok(Expr::Binary { left, op, right })
            }
            other => Err(unsupported(&format!("Unsupported expression: {}", other))),
        }
    }

    fn value(&mut self, value: &sql_ast::Value) -> Result<Expr> {
        let literal = match value {
            sql_ast::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Value::Integer(i)
                } else if let Ok(f) = n.parse::<f64>() {
                    Value::Float(f)
                } else {
                    return Err(ProxyError::database_with_state(
                        format!("Invalid number: {}", n),
                        "22P02",
                    ));
                }
            }
            sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
                Value::Text(s.clone())
            }
            sql_ast::Value::Boolean(b) => Value::Boolean(*b),
            sql_ast::Value::Null => Value::Null,
            sql_ast::Value::Placeholder(p) => return self.placeholder(p),
            other => return Err(unsupported(&format!("Unsupported value: {}", other))),
        };
        Ok(Expr::Literal(literal))
    }

    fn placeholder(&mut self, placeholder: &str) -> Result<Expr> {
        let digits = placeholder.trim_start_matches(['?', '$']);
        if digits.is_empty() {
            self.params += 1;
            return Ok(Expr::Param(self.params - 1));
        }

        let position: usize = digits.parse().map_err(|_| {
            ProxyError::database_with_state(format!("Invalid placeholder: {}", placeholder), "42P02")
        })?;
        if position == 0 {
            return Err(ProxyError::database_with_state(
                "Parameter positions start at 1",
                "42P02",
            ));
        }
        self.params = self.params.max(position);
        Ok(Expr::Param(position - 1))
    }
}

fn unsupported(message: &str) -> ProxyError {
    ProxyError::database_with_state(message, "0A000")
}

fn table_name(name: &sql_ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|ident| ident.to_string().trim_matches('"').to_lowercase())
        .ok_or_else(|| ProxyError::database_with_state("Invalid table name", "42602"))
}

fn convert_data_type(dt: &sql_ast::DataType) -> Result<DataType> {
    match dt {
        sql_ast::DataType::Int(_)
        | sql_ast::DataType::Integer(_)
        | sql_ast::DataType::BigInt(_)
        | sql_ast::DataType::SmallInt(_) => Ok(DataType::Integer),

        sql_ast::DataType::Float(_)
        | sql_ast::DataType::Double(_)
        | sql_ast::DataType::Real => Ok(DataType::Float),

        sql_ast::DataType::Text
        | sql_ast::DataType::Varchar(_)
        | sql_ast::DataType::Char(_)
        | sql_ast::DataType::String(_) => Ok(DataType::Text),

        sql_ast::DataType::Boolean | sql_ast::DataType::Bool => Ok(DataType::Boolean),

        sql_ast::DataType::Bytea | sql_ast::DataType::Blob(_) | sql_ast::DataType::Varbinary(_) => {
            Ok(DataType::Bytes)
        }

        sql_ast::DataType::Timestamp(..) => Ok(DataType::Timestamp),

        other => Err(unsupported(&format!("Unsupported data type: {}", other))),
    }
}

fn convert_binary_op(op: &sql_ast::BinaryOperator) -> Result<BinOp> {
    use sql_ast::BinaryOperator as SqlOp;

    match op {
        SqlOp::Plus => Ok(BinOp::Add),
        SqlOp::Minus => Ok(BinOp::Subtract),
        SqlOp::Multiply => Ok(BinOp::Multiply),
        SqlOp::Divide => Ok(BinOp::Divide),
        SqlOp::Modulo => Ok(BinOp::Modulo),
        SqlOp::StringConcat => Ok(BinOp::Concat),

        SqlOp::Eq => Ok(BinOp::Eq),
        SqlOp::NotEq => Ok(BinOp::NotEq),
        SqlOp::Lt => Ok(BinOp::Lt),
        SqlOp::LtEq => Ok(BinOp::LtEq),
        SqlOp::Gt => Ok(BinOp::Gt),
        SqlOp::GtEq => Ok(BinOp::GtEq),

        SqlOp::And => Ok(BinOp::And),
        SqlOp::Or => Ok(BinOp::Or),

        other => Err(unsupported(&format!("Unsupported binary operator: {}", other))),
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Row context for expression evaluation; `None` for queries without FROM.
pub(crate) type RowRef<'a> = Option<(&'a [ColumnMeta], &'a [Value])>;

pub(crate) fn eval(expr: &Expr, row: RowRef<'_>, params: &[Value]) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(index) => params.get(*index).cloned().ok_or_else(|| {
            ProxyError::database_with_state(
                format!("No value specified for parameter {}", index + 1),
                "07001",
            )
        }),
        Expr::Column(name) => {
            let Some((columns, values)) = row else {
                return Err(ProxyError::database_with_state(
                    format!("Column '{}' referenced without a table", name),
                    "42703",
                ));
            };
            columns
                .iter()
                .position(|c| c.name == *name)
                .and_then(|idx| values.get(idx).cloned())
                .ok_or_else(|| {
                    ProxyError::database_with_state(format!("Column '{}' not found", name), "42703")
                })
        }
        Expr::Not(inner) => match eval(inner, row, params)? {
            Value::Null => Ok(Value::Null),
            v => Ok(Value::Boolean(!v.as_bool())),
        },
        Expr::Negate(inner) => match eval(inner, row, params)? {
            Value::Integer(i) => Ok(Value::Integer(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Null => Ok(Value::Null),
            other => Err(type_error("negate", &other, &other)),
        },
        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, row, params)?.is_null();
            Ok(Value::Boolean(is_null != *negated))
        }
        Expr::Binary { left, op, right } => {
            let left = eval(left, row, params)?;
            match op {
                BinOp::And => {
                    if !left.is_null() && !left.as_bool() {
                        return Ok(Value::Boolean(false));
                    }
                    let right = eval(right, row, params)?;
                    if !right.is_null() && !right.as_bool() {
                        return Ok(Value::Boolean(false));
                    }
                    if left.is_null() || right.is_null() {
                        return Ok(Value::Null);
                    }
                    Ok(Value::Boolean(true))
                }
                BinOp::Or => {
                    if left.as_bool() {
                        return Ok(Value::Boolean(true));
                    }
                    let right = eval(right, row, params)?;
                    if right.as_bool() {
                        return Ok(Value::Boolean(true));
                    }
                    if left.is_null() || right.is_null() {
                        return Ok(Value::Null);
                    }
                    Ok(Value::Boolean(false))
                }
                _ => {
                    let right = eval(right, row, params)?;
                    binary(*op, left, right)
                }
            }
        }
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    let compare = |expected: &[Ordering]| -> Result<Value> {
        let ordering = left.compare(&right)?;
        Ok(Value::Boolean(expected.contains(&ordering)))
    };

    match op {
        BinOp::Eq => compare(&[Ordering::Equal]),
        BinOp::NotEq => compare(&[Ordering::Less, Ordering::Greater]),
        BinOp::Lt => compare(&[Ordering::Less]),
        BinOp::LtEq => compare(&[Ordering::Less, Ordering::Equal]),
        BinOp::Gt => compare(&[Ordering::Greater]),
        BinOp::GtEq => compare(&[Ordering::Greater, Ordering::Equal]),
        BinOp::Concat => Ok(Value::Text(format!("{}{}", left, right))),
        BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide | BinOp::Modulo => {
            arithmetic(op, &left, &right)
        }
        BinOp::And | BinOp::Or => unreachable!("logical operators are short-circuited"),
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    if let (Value::Integer(a), Value::Integer(b)) = (left, right) {
        let result = match op {
            BinOp::Add => a.checked_add(*b),
            BinOp::Subtract => a.checked_sub(*b),
            BinOp::Multiply => a.checked_mul(*b),
            BinOp::Divide | BinOp::Modulo if *b == 0 => {
                return Err(ProxyError::database_with_state("Division by zero", "22012"));
            }
            BinOp::Divide => a.checked_div(*b),
            BinOp::Modulo => a.checked_rem(*b),
            _ => None,
        };
        return result
            .map(Value::Integer)
            .ok_or_else(|| ProxyError::database_with_state("Integer overflow", "22003"));
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(type_error("apply arithmetic to", left, right));
    };
    if !left.is_numeric() || !right.is_numeric() {
        return Err(type_error("apply arithmetic to", left, right));
    }

    let result = match op {
        BinOp::Add => a + b,
        BinOp::Subtract => a - b,
        BinOp::Multiply => a * b,
        BinOp::Divide if b == 0.0 => {
            return Err(ProxyError::database_with_state("Division by zero", "22012"));
        }
        BinOp::Divide => a / b,
        BinOp::Modulo => a % b,
        _ => return Err(type_error("apply arithmetic to", left, right)),
    };
    Ok(Value::Float(result))
}

fn type_error(action: &str, left: &Value, right: &Value) -> ProxyError {
    ProxyError::database_with_state(
        format!("Cannot {} {} and {}", action, left.type_name(), right.type_name()),
        "42883",
    )
}

/// Evaluates a constant expression (LIMIT/OFFSET) to a row count.
pub(crate) fn eval_count(expr: &Expr, params: &[Value]) -> Result<usize> {
    match eval(expr, None, params)? {
        Value::Integer(n) if n >= 0 => Ok(n as usize),
        other => Err(ProxyError::database_with_state(
            format!("Expected a non-negative integer, got {}", other),
            "2201W",
        )),
    }
}

/// Static type of an expression when it can be known without data.
pub(crate) fn infer_type(expr: &Expr, columns: &[ColumnMeta], params: &[Value]) -> DataType {
    match expr {
        Expr::Column(name) => columns
            .iter()
            .find(|c| c.name == *name)
            .map(|c| c.data_type)
            .unwrap_or(DataType::Text),
        Expr::Literal(v) => v.data_type().unwrap_or(DataType::Text),
        Expr::Param(i) => params
            .get(*i)
            .and_then(|v| v.data_type())
            .unwrap_or(DataType::Text),
        Expr::Not(_) | Expr::IsNull { .. } => DataType::Boolean,
        Expr::Negate(inner) => infer_type(inner, columns, params),
        Expr::Binary { left, op, right } => match op {
            BinOp::Eq
            | BinOp::NotEq
            | BinOp::Lt
            | BinOp::LtEq
            | BinOp::Gt
            | BinOp::GtEq
            | BinOp::And
            | BinOp::Or => DataType::Boolean,
            BinOp::Concat => DataType::Text,
            _ => {
                let l = infer_type(left, columns, params);
                let r = infer_type(right, columns, params);
                if l == DataType::Integer && r == DataType::Integer {
                    DataType::Integer
                } else {
                    DataType::Float
                }
            }
        },
    }
}
