use super::sql::{self, Expr, ParsedSql, Plan, Projection, SelectPlan};
use super::{MemoryDatabase, MemoryTable, Shared};
use crate::core::{ColumnMeta, ProxyError, Result, Row, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Outcome of running one plan against a database.
pub(crate) enum Executed {
    Rows {
        columns: Vec<ColumnMeta>,
        rows: Vec<Row>,
    },
    Count {
        count: u64,
        inserted: Vec<Row>,
        key_column: Option<ColumnMeta>,
    },
}

/// Binds positional parameters (1-based in `bound`) into a dense vector.
pub(crate) fn bind_params(parsed: &ParsedSql, bound: &BTreeMap<usize, Value>) -> Result<Vec<Value>> {
    (1..=parsed.param_count)
        .map(|position| {
            bound.get(&position).cloned().ok_or_else(|| {
                ProxyError::database_with_state(
                    format!("No value specified for parameter {}", position),
                    "07001",
                )
            })
        })
        .collect()
}

pub(crate) fn execute(shared: &Shared, parsed: &ParsedSql, params: &[Value], max_rows: u64) -> Result<Executed> {
    shared.ensure_open()?;

    if let Plan::Select(select) = &parsed.plan {
        let db = shared.db.read();
        let (columns, mut rows) = run_select(&db, select, params)?;
        if max_rows > 0 {
            rows.truncate(max_rows as usize);
        }
        return Ok(Executed::Rows { columns, rows });
    }

    let mut txn = shared.txn.lock();
    if txn.read_only {
        return Err(ProxyError::database_with_state(
            "Cannot execute a write in a read-only connection",
            "25006",
        ));
    }

    let mut db = shared.db.write();
    if !txn.auto_commit && txn.snapshot.is_none() {
        txn.snapshot = Some(db.clone());
    }

    run_write(&mut db, &parsed.plan, params)
}

fn run_write(db: &mut MemoryDatabase, plan: &Plan, params: &[Value]) -> Result<Executed> {
    match plan {
        Plan::CreateTable {
            name,
            columns,
            if_not_exists,
        } => {
            if db.tables.contains_key(name) {
                if *if_not_exists {
                    return Ok(count(0));
                }
                return Err(ProxyError::database_with_state(
                    format!("Table '{}' already exists", name),
                    "42P07",
                ));
            }
            db.tables.insert(
                name.clone(),
                MemoryTable {
                    name: name.clone(),
                    columns: columns.clone(),
                    rows: Vec::new(),
                },
            );
            Ok(count(0))
        }
        Plan::DropTable { name, if_exists } => {
            if db.tables.remove(name).is_none() && !*if_exists {
                return Err(missing_table(name));
            }
            Ok(count(0))
        }
        Plan::Insert {
            table,
            columns,
            rows,
        } => {
            let table = db.tables.get_mut(table).ok_or_else(|| missing_table(table))?;

            let targets: Vec<usize> = match columns {
                None => (0..table.columns.len()).collect(),
                Some(names) => names
                    .iter()
                    .map(|name| {
                        table
                            .columns
                            .iter()
                            .position(|c| c.name == *name)
                            .ok_or_else(|| missing_column(name))
                    })
                    .collect::<Result<_>>()?,
            };

            let mut inserted = Vec::with_capacity(rows.len());
            for exprs in rows {
                if exprs.len() != targets.len() {
                    return Err(ProxyError::database_with_state(
                        format!(
                            "INSERT has {} expressions but {} target columns",
                            exprs.len(),
                            targets.len()
                        ),
                        "42601",
                    ));
                }

                let mut row = vec![Value::Null; table.columns.len()];
                for (expr, &idx) in exprs.iter().zip(&targets) {
                    row[idx] = sql::eval(expr, None, params)?;
                }
                for (column, value) in table.columns.iter().zip(row.iter_mut()) {
                    *value = column.data_type.coerce(std::mem::replace(value, Value::Null))?;
                    column.validate(value)?;
                }
                inserted.push(row);
            }

            table.rows.extend(inserted.iter().cloned());
            Ok(Executed::Count {
                count: inserted.len() as u64,
                key_column: table.columns.first().cloned(),
                inserted,
            })
        }
        Plan::Update {
            table,
            assignments,
            filter,
        } => {
            let table = db.tables.get_mut(table).ok_or_else(|| missing_table(table))?;

            let targets: Vec<(usize, &Expr)> = assignments
                .iter()
                .map(|(name, expr)| {
                    table
                        .columns
                        .iter()
                        .position(|c| c.name == *name)
                        .map(|idx| (idx, expr))
                        .ok_or_else(|| missing_column(name))
                })
                .collect::<Result<_>>()?;

            let mut changes = Vec::new();
            for (pos, row) in table.rows.iter().enumerate() {
                if !matches(filter.as_ref(), &table.columns, row, params)? {
                    continue;
                }
                let mut next = row.clone();
                for (idx, expr) in &targets {
                    let value = sql::eval(expr, Some((table.columns.as_slice(), row.as_slice())), params)?;
                    let value = table.columns[*idx].data_type.coerce(value)?;
                    table.columns[*idx].validate(&value)?;
                    next[*idx] = value;
                }
                changes.push((pos, next));
            }

            let updated = changes.len() as u64;
            for (pos, next) in changes {
                table.rows[pos] = next;
            }
            Ok(count(updated))
        }
        Plan::Delete { table, filter } => {
            let table = db.tables.get_mut(table).ok_or_else(|| missing_table(table))?;

            let mut doomed = Vec::with_capacity(table.rows.len());
            for row in &table.rows {
                doomed.push(matches(filter.as_ref(), &table.columns, row, params)?);
            }

            let deleted = doomed.iter().filter(|d| **d).count() as u64;
            let mut flags = doomed.into_iter();
            table.rows.retain(|_| !flags.next().unwrap_or(false));
            Ok(count(deleted))
        }
        Plan::Select(_) => Err(ProxyError::database("SELECT is not a write")),
    }
}

fn run_select(db: &MemoryDatabase, plan: &SelectPlan, params: &[Value]) -> Result<(Vec<ColumnMeta>, Vec<Row>)> {
    let (source_columns, source_rows): (&[ColumnMeta], Vec<&Row>) = match &plan.table {
        Some(name) => {
            let table = db.tables.get(name).ok_or_else(|| missing_table(name))?;
            let mut rows = Vec::new();
            for row in &table.rows {
                if matches(plan.filter.as_ref(), &table.columns, row, params)? {
                    rows.push(row);
                }
            }
            (table.columns.as_slice(), rows)
        }
        None => (&[] as &[ColumnMeta], Vec::new()),
    };

    let columns = project_columns(plan, source_columns, params)?;

    if plan.table.is_none() {
        let keep = match &plan.filter {
            Some(filter) => sql::eval(filter, None, params)?.as_bool(),
            None => true,
        };
        let mut rows = Vec::new();
        if keep {
            rows.push(project_row(plan, None, params)?);
        }
        return Ok((columns, rows));
    }

    let mut rows = source_rows;
    if !plan.order_by.is_empty() {
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let keys = plan
                .order_by
                .iter()
                .map(|(expr, _)| sql::eval(expr, Some((source_columns, row.as_slice())), params))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((keys, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for ((left, right), (_, descending)) in a.iter().zip(b).zip(&plan.order_by) {
                let ordering = left.compare(right).unwrap_or(Ordering::Equal);
                let ordering = if *descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    let offset = plan
        .offset
        .as_ref()
        .map(|e| sql::eval_count(e, params))
        .transpose()?
        .unwrap_or(0);
    let limit = plan
        .limit
        .as_ref()
        .map(|e| sql::eval_count(e, params))
        .transpose()?;

    let rows = rows
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|row| project_row(plan, Some((source_columns, row.as_slice())), params))
        .collect::<Result<Vec<_>>>()?;

    Ok((columns, rows))
}

fn project_columns(plan: &SelectPlan, source: &[ColumnMeta], params: &[Value]) -> Result<Vec<ColumnMeta>> {
    let mut columns = Vec::new();
    for item in &plan.projection {
        match item {
            Projection::Wildcard => {
                if plan.table.is_none() {
                    return Err(ProxyError::database_with_state(
                        "SELECT * requires a FROM clause",
                        "42601",
                    ));
                }
                columns.extend(source.iter().cloned());
            }
            Projection::Expr { expr, label } => {
                let data_type = sql::infer_type(expr, source, params);
                let meta = match expr {
                    Expr::Column(name) => {
                        let base = source
                            .iter()
                            .find(|c| c.name == *name)
                            .ok_or_else(|| missing_column(name))?;
                        base.clone().with_label(label.clone())
                    }
                    _ => ColumnMeta::new(label.clone(), data_type),
                };
                columns.push(meta);
            }
        }
    }
    Ok(columns)
}

fn project_row(plan: &SelectPlan, row: sql::RowRef<'_>, params: &[Value]) -> Result<Row> {
    let mut out = Vec::new();
    for item in &plan.projection {
        match item {
            Projection::Wildcard => {
                if let Some((_, values)) = row {
                    out.extend(values.iter().cloned());
                }
            }
            Projection::Expr { expr, .. } => out.push(sql::eval(expr, row, params)?),
        }
    }
    Ok(out)
}

fn matches(filter: Option<&Expr>, columns: &[ColumnMeta], row: &[Value], params: &[Value]) -> Result<bool> {
    match filter {
        None => Ok(true),
        Some(expr) => Ok(sql::eval(expr, Some((columns, row)), params)?.as_bool()),
    }
}

fn count(count: u64) -> Executed {
    Executed::Count {
        count,
        inserted: Vec::new(),
        key_column: None,
    }
}

fn missing_table(name: &str) -> ProxyError {
    ProxyError::database_with_state(format!("Table '{}' does not exist", name), "42P01")
}

fn missing_column(name: &str) -> ProxyError {
    ProxyError::database_with_state(format!("Column '{}' does not exist", name), "42703")
}
