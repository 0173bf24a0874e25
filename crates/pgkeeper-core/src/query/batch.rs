//! Multi-row INSERT, upsert and bulk UPDATE.

use tracing::debug;

use super::filter::{Conditions, Filter};
use crate::db::{Database, Executor, Value};
use crate::error::{DbResultExt, Error, Result};
use crate::ident::{self, Ident};

/// PostgreSQL's limit on bind parameters per statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Rows per statement for a table of `columns` columns.
pub(crate) fn rows_per_statement(columns: usize, batch_size: usize) -> usize {
    let by_params = (MAX_BIND_PARAMS / columns.max(1)).max(1);
    batch_size.clamp(1, by_params)
}

fn check_rows(columns: &[Ident], rows: &[Vec<Value>]) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::InvalidArgument("no columns given".to_string()));
    }
    if let Some((i, row)) = rows
        .iter()
        .enumerate()
        .find(|(_, r)| r.len() != columns.len())
    {
        return Err(Error::InvalidArgument(format!(
            "row {i} has {} values, expected {}",
            row.len(),
            columns.len()
        )));
    }
    Ok(())
}

fn values_clause(chunk: &[Vec<Value>], width: usize) -> (String, Vec<Value>) {
    let mut params = Vec::with_capacity(chunk.len() * width);
    let mut groups = Vec::with_capacity(chunk.len());
    for row in chunk {
        let start = params.len();
        let placeholders = (1..=width)
            .map(|i| format!("${}", start + i))
            .collect::<Vec<_>>()
            .join(", ");
        groups.push(format!("({placeholders})"));
        params.extend(row.iter().cloned());
    }
    (groups.join(", "), params)
}

/// What to do with rows that hit a unique constraint.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum OnConflict<'a> {
    Fail,
    /// Overwrite every non-key column with the incoming value.
    Update(&'a [Ident]),
}

pub(crate) fn insert_sql(
    table: &Ident,
    columns: &[Ident],
    chunk: &[Vec<Value>],
    on_conflict: &OnConflict<'_>,
) -> (String, Vec<Value>) {
    let (values, params) = values_clause(chunk, columns.len());
    let mut sql = format!(
        "INSERT INTO {table} ({}) VALUES {values}",
        ident::join(columns)
    );
    if let OnConflict::Update(keys) = on_conflict {
        let updates = columns
            .iter()
            .filter(|c| !keys.contains(c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", ident::join(keys)));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                ident::join(keys),
                updates.join(", ")
            ));
        }
    }
    (sql, params)
}

/// Inserts `rows` in chunks of at most `batch_size` rows, all in one
/// transaction. Returns the number of rows written.
pub fn batch_insert<D: Database + ?Sized>(
    db: &mut D,
    table: &Ident,
    columns: &[Ident],
    rows: &[Vec<Value>],
    batch_size: usize,
) -> Result<u64> {
    write_chunks(db, table, columns, rows, batch_size, OnConflict::Fail)
}

/// Like [`batch_insert`], updating existing rows that conflict on
/// `conflict_columns`.
pub fn upsert<D: Database + ?Sized>(
    db: &mut D,
    table: &Ident,
    columns: &[Ident],
    conflict_columns: &[Ident],
    rows: &[Vec<Value>],
    batch_size: usize,
) -> Result<u64> {
    if conflict_columns.is_empty() {
        return Err(Error::InvalidArgument("upsert needs conflict columns".to_string()));
    }
    if let Some(c) = conflict_columns.iter().find(|c| !columns.contains(c)) {
        return Err(Error::InvalidArgument(format!(
            "conflict column {c} is not among the inserted columns"
        )));
    }
    write_chunks(
        db,
        table,
        columns,
        rows,
        batch_size,
        OnConflict::Update(conflict_columns),
    )
}

fn write_chunks<D: Database + ?Sized>(
    db: &mut D,
    table: &Ident,
    columns: &[Ident],
    rows: &[Vec<Value>],
    batch_size: usize,
    on_conflict: OnConflict<'_>,
) -> Result<u64> {
    check_rows(columns, rows)?;
    if rows.is_empty() {
        return Ok(0);
    }
    let per_statement = rows_per_statement(columns.len(), batch_size);
    let operation = format!("insert into {table}");

    let mut tx = db.transaction().during(&operation)?;
    let mut written = 0;
    for chunk in rows.chunks(per_statement) {
        let (sql, params) = insert_sql(table, columns, chunk, &on_conflict);
        written += tx.execute(&sql, &params).during(&operation)?;
    }
    tx.commit().during(&operation)?;

    debug!(table = %table, rows = rows.len(), written, "batch written");
    Ok(written)
}

/// `UPDATE table SET ... WHERE filters`. Refuses to run without filters.
pub fn bulk_update<E: Executor + ?Sized>(
    db: &mut E,
    table: &Ident,
    set: &[(Ident, Value)],
    filters: &[Filter],
) -> Result<u64> {
    if set.is_empty() {
        return Err(Error::InvalidArgument("nothing to update".to_string()));
    }
    if filters.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "refusing to update every row of {table}"
        )));
    }
    let (sql, params) = update_sql(table, set, filters);
    db.execute(&sql, &params)
        .during(format!("update {table}"))
}

pub(crate) fn update_sql(
    table: &Ident,
    set: &[(Ident, Value)],
    filters: &[Filter],
) -> (String, Vec<Value>) {
    let mut c = Conditions::new();
    let assignments = set
        .iter()
        .map(|(col, v)| format!("{col} = {}", c.bind(v.clone())))
        .collect::<Vec<_>>()
        .join(", ");
    c.push_filters(filters);
    (
        format!("UPDATE {table} SET {assignments}{}", c.where_sql()),
        c.params,
    )
}

/// Sets `column` to a different value per row id in one statement per chunk:
/// `UPDATE t SET c = CASE id WHEN $1 THEN $2::text::type ... END WHERE id IN (...)`.
///
/// PostgreSQL cannot infer parameter types inside `CASE` branches, so values
/// are sent as text and cast to the column type read from the catalog.
pub fn bulk_update_by_id<D: Database + ?Sized>(
    db: &mut D,
    table: &Ident,
    id_column: &Ident,
    column: &Ident,
    updates: &[(Value, Value)],
    batch_size: usize,
) -> Result<u64> {
    if updates.is_empty() {
        return Ok(0);
    }
    let operation = format!("update {table}.{column} by id");
    let column_type: String = db
        .query_opt(
            "SELECT format_type(atttypid, atttypmod) AS column_type \
             FROM pg_attribute \
             WHERE attrelid = to_regclass($1::text) AND attname = $2 AND NOT attisdropped",
            &[Value::from(table.as_str()), Value::from(column.as_str())],
        )
        .during(&operation)?
        .ok_or_else(|| Error::InvalidArgument(format!("column {column} not found on {table}")))?
        .try_get("column_type")
        .during(&operation)?;

    // Each update binds two parameters.
    let per_statement = batch_size.clamp(1, MAX_BIND_PARAMS / 2);
    let mut tx = db.transaction().during(&operation)?;
    let mut updated = 0;
    for chunk in updates.chunks(per_statement) {
        let (sql, params) = case_update_sql(table, id_column, column, &column_type, chunk);
        updated += tx.execute(&sql, &params).during(&operation)?;
    }
    tx.commit().during(&operation)?;
    Ok(updated)
}

pub(crate) fn case_update_sql(
    table: &Ident,
    id_column: &Ident,
    column: &Ident,
    column_type: &str,
    chunk: &[(Value, Value)],
) -> (String, Vec<Value>) {
    let mut c = Conditions::new();
    let mut branches = Vec::with_capacity(chunk.len());
    let mut ids = Vec::with_capacity(chunk.len());
    for (id, value) in chunk {
        let pid = c.bind(id.clone());
        let pv = c.bind(value.clone());
        branches.push(format!("WHEN {pid} THEN {pv}::text::{column_type}"));
        ids.push(pid);
    }
    (
        format!(
            "UPDATE {table} SET {column} = CASE {id_column} {} END WHERE {id_column} IN ({})",
            branches.join(" "),
            ids.join(", ")
        ),
        c.params,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use crate::db::mock::{MockDatabase, StatementKind};

    fn ident(s: &str) -> Ident {
        Ident::new(s).unwrap()
    }

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::from(id), Value::from(name)]
    }

    #[test]
    fn chunk_size_respects_parameter_limit() {
        assert_eq!(rows_per_statement(2, 1000), 1000);
        assert_eq!(rows_per_statement(10, 100_000), 6553);
        assert_eq!(rows_per_statement(3, 0), 1);
        assert_eq!(rows_per_statement(70_000, 10), 1);
    }

    #[test]
    fn insert_numbers_placeholders_row_major() {
        let (sql, params) = insert_sql(
            &ident("users"),
            &[ident("id"), ident("name")],
            &[row(1, "ada"), row(2, "bob")],
            &OnConflict::Fail,
        );
        assert_eq!(sql, "INSERT INTO users (id, name) VALUES ($1, $2), ($3, $4)");
        assert_eq!(params.len(), 4);
        assert_eq!(params[2], Value::from(2));
    }

    #[test]
    fn upsert_updates_non_key_columns() {
        let keys = [ident("id")];
        let (sql, _) = insert_sql(
            &ident("users"),
            &[ident("id"), ident("name"), ident("email")],
            &[vec![Value::from(1), Value::from("a"), Value::from("a@x")]],
            &OnConflict::Update(&keys),
        );
        assert!(sql.ends_with(
            "ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, email = EXCLUDED.email"
        ));

        let (sql, _) = insert_sql(
            &ident("tags"),
            &[ident("id")],
            &[vec![Value::from(1)]],
            &OnConflict::Update(&keys),
        );
        assert!(sql.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn batch_insert_chunks_inside_one_transaction() {
        let mut db = MockDatabase::new();
        db.on_execute_once("INSERT INTO users", 2)
            .on_execute_once("INSERT INTO users", 2)
            .on_execute_once("INSERT INTO users", 1);
        let rows: Vec<_> = (1..=5).map(|i| row(i, "x")).collect();

        let written = batch_insert(&mut db, &ident("users"), &[ident("id"), ident("name")], &rows, 2)
            .unwrap();
        assert_eq!(written, 5);

        let kinds: Vec<_> = db.statements().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StatementKind::Begin,
                StatementKind::Execute,
                StatementKind::Execute,
                StatementKind::Execute,
                StatementKind::Commit
            ]
        );
        assert_eq!(db.statements()[1].sql, "INSERT INTO users (id, name) VALUES ($1, $2), ($3, $4)");
        assert_eq!(db.statements()[1].params.len(), 4);
        assert_eq!(db.statements()[3].params.len(), 2);
    }

    #[test]
    fn failed_chunk_rolls_back_everything() {
        let mut db = MockDatabase::new();
        db.on_execute_once("INSERT INTO users", 2).on_error(
            "INSERT INTO users",
            crate::error::DbError::with_code("23505", "duplicate key value violates unique constraint"),
        );
        let rows: Vec<_> = (1..=4).map(|i| row(i, "x")).collect();

        let err = batch_insert(&mut db, &ident("users"), &[ident("id"), ident("name")], &rows, 2)
            .unwrap_err();
        assert!(err.to_string().starts_with("insert into users: duplicate key"));
        assert_eq!(db.statements().last().map(|s| s.kind), Some(StatementKind::Rollback));
    }

    #[test]
    fn ragged_rows_are_rejected_before_any_sql() {
        let mut db = MockDatabase::new();
        let err = batch_insert(
            &mut db,
            &ident("users"),
            &[ident("id"), ident("name")],
            &[row(1, "a"), vec![Value::from(2)]],
            100,
        )
        .unwrap_err();
        assert!(err.to_string().contains("row 1 has 1 values, expected 2"));
        assert!(db.statements().is_empty());

        assert_eq!(
            batch_insert(&mut db, &ident("users"), &[ident("id")], &[], 100).unwrap(),
            0
        );
        assert!(db.statements().is_empty());
    }

    #[test]
    fn upsert_validates_conflict_columns() {
        let mut db = MockDatabase::new();
        let cols = [ident("id"), ident("name")];
        assert!(upsert(&mut db, &ident("users"), &cols, &[], &[row(1, "a")], 10).is_err());
        assert!(
            upsert(&mut db, &ident("users"), &cols, &[ident("email")], &[row(1, "a")], 10).is_err()
        );
    }

    #[test]
    fn bulk_update_requires_filters() {
        let mut db = MockDatabase::new();
        db.on_execute("UPDATE orders", 12);
        let set = [(ident("status"), Value::from("archived"))];

        let n = bulk_update(
            &mut db,
            &ident("orders"),
            &set,
            &[Filter::lt(ident("created_at"), "2024-01-01")],
        )
        .unwrap();
        assert_eq!(n, 12);
        assert_eq!(
            db.statements()[0].sql,
            "UPDATE orders SET status = $1 WHERE created_at < $2"
        );

        assert!(bulk_update(&mut db, &ident("orders"), &set, &[]).is_err());
        assert_eq!(db.statements().len(), 1);
    }

    #[test]
    fn update_by_id_casts_to_the_column_type() {
        let mut db = MockDatabase::new();
        db.on_query(
            "FROM pg_attribute",
            vec![Row::from_pairs([("column_type", Value::from("numeric(10,2)"))])],
        );
        db.on_execute("UPDATE products", 2);

        let n = bulk_update_by_id(
            &mut db,
            &ident("products"),
            &ident("id"),
            &ident("price"),
            &[
                (Value::from(1), Value::from(9.99)),
                (Value::from(2), Value::from(19.5)),
            ],
            500,
        )
        .unwrap();
        assert_eq!(n, 2);

        let update = db
            .statements()
            .iter()
            .find(|s| s.sql.starts_with("UPDATE"))
            .unwrap();
        assert_eq!(
            update.sql,
            "UPDATE products SET price = CASE id WHEN $1 THEN $2::text::numeric(10,2) \
             WHEN $3 THEN $4::text::numeric(10,2) END WHERE id IN ($1, $3)"
        );
        assert!(update.in_transaction);
    }

    #[test]
    fn update_by_id_reports_unknown_column() {
        let mut db = MockDatabase::new();
        let err = bulk_update_by_id(
            &mut db,
            &ident("products"),
            &ident("id"),
            &ident("colour"),
            &[(Value::from(1), Value::from("red"))],
            10,
        )
        .unwrap_err();
        assert!(err.to_string().contains("column colour not found on products"));
    }
}
