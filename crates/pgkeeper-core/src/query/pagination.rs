//! Offset and keyset pagination.

use serde::Serialize;
use tracing::debug;

use super::Diagnostics;
use super::filter::{Conditions, Filter};
use crate::db::{Executor, FromRow, Row, Value};
use crate::error::{Error, Result};
use crate::ident::{self, Ident, SortDirection};

/// One page of results.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    /// 1-based.
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> PaginatedResult<T> {
    fn new(items: Vec<T>, total: i64, page: i64, page_size: i64) -> Self {
        let total_pages = if total <= 0 {
            0
        } else {
            total / page_size + i64::from(total % page_size != 0)
        };
        Self {
            items,
            total,
            page,
            page_size,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// `SELECT ... LIMIT/OFFSET` paging with a separate `COUNT(*)`.
///
/// Cost grows with the page number; use [`KeysetPagination`] for deep paging.
#[derive(Clone, Debug)]
pub struct PaginatedQuery {
    table: Ident,
    columns: Vec<Ident>,
    filters: Vec<Filter>,
    order_by: Vec<(Ident, SortDirection)>,
    diagnostics: Diagnostics,
}

impl PaginatedQuery {
    pub fn new(table: Ident) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub(super) fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Selected columns. Default: `*`.
    pub fn select(mut self, columns: Vec<Ident>) -> Self {
        self.columns = columns;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: Ident, direction: SortDirection) -> Self {
        self.order_by.push((column, direction));
        self
    }

    fn conditions(&self) -> Conditions {
        let mut c = Conditions::new();
        c.push_filters(&self.filters);
        c
    }

    pub(crate) fn count_sql(&self) -> (String, Vec<Value>) {
        let c = self.conditions();
        (
            format!(
                "SELECT COUNT(*)::bigint AS total FROM {}{}",
                self.table,
                c.where_sql()
            ),
            c.params,
        )
    }

    pub(crate) fn page_sql(&self, offset: i64, page_size: i64) -> (String, Vec<Value>) {
        let mut c = self.conditions();
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            select_list(&self.columns),
            self.table,
            c.where_sql()
        );
        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(|(col, dir)| format!("{col} {}", dir.as_sql()))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        let limit = c.bind(Value::Int(page_size));
        let offset = c.bind(Value::Int(offset));
        sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        (sql, c.params)
    }

    /// Fetches page `page` (1-based) of `page_size` rows.
    pub fn execute<E: Executor + ?Sized>(
        &self,
        db: &mut E,
        page: i64,
        page_size: i64,
    ) -> Result<PaginatedResult<Row>> {
        self.execute_as(db, page, page_size)
    }

    /// Like [`execute`](Self::execute), converting each row.
    pub fn execute_as<E, T>(&self, db: &mut E, page: i64, page_size: i64) -> Result<PaginatedResult<T>>
    where
        E: Executor + ?Sized,
        T: FromRow,
    {
        if page < 1 || page_size < 1 {
            return Err(Error::InvalidArgument(format!(
                "page and page size must be positive, got page {page}, size {page_size}"
            )));
        }
        let offset = (page - 1).checked_mul(page_size).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "page {page} of size {page_size} is beyond the last addressable row"
            ))
        })?;

        let (count_sql, count_params) = self.count_sql();
        let total: i64 = match self
            .diagnostics
            .query(db, "paginate count", &count_sql, &count_params)?
            .first()
        {
            Some(row) => row.try_get(0)?,
            None => 0,
        };

        let (page_sql, page_params) = self.page_sql(offset, page_size);
        let rows = self
            .diagnostics
            .query(db, "paginate page", &page_sql, &page_params)?;
        let items = rows.iter().map(T::from_row).collect::<Result<Vec<_>, _>>()?;
        debug!(table = %self.table, page, total, "page fetched");
        Ok(PaginatedResult::new(items, total, page, page_size))
    }
}

/// Cursor paging on `(sort_column, id)`.
///
/// Each page continues strictly after the last row of the previous one, so
/// rows sharing a sort value are neither skipped nor repeated. The id column
/// must be unique and both columns non-null.
#[derive(Clone, Debug)]
pub struct KeysetPagination {
    table: Ident,
    sort_column: Ident,
    id_column: Ident,
    direction: SortDirection,
    columns: Vec<Ident>,
    filters: Vec<Filter>,
    cursor: Option<(Value, Value)>,
    diagnostics: Diagnostics,
}

impl KeysetPagination {
    pub fn new(table: Ident, sort_column: Ident, direction: SortDirection) -> Self {
        Self {
            table,
            sort_column,
            id_column: Ident::from_static("id"),
            direction,
            columns: Vec::new(),
            filters: Vec::new(),
            cursor: None,
            diagnostics: Diagnostics::default(),
        }
    }

    pub(super) fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Tie-breaker column. Default: `id`.
    pub fn id_column(mut self, column: Ident) -> Self {
        self.id_column = column;
        self
    }

    /// Selected columns. Default: `*`. Must include the sort and id columns
    /// for [`advance`](Self::advance) to work.
    pub fn select(mut self, columns: Vec<Ident>) -> Self {
        self.columns = columns;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Continues after the row with these sort and id values.
    pub fn after(&mut self, value: impl Into<Value>, id: impl Into<Value>) -> &mut Self {
        self.cursor = Some((value.into(), id.into()));
        self
    }

    /// Starts again from the first row.
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    pub fn cursor(&self) -> Option<&(Value, Value)> {
        self.cursor.as_ref()
    }

    /// Moves the cursor to `last`, normally the final row of a page.
    pub fn advance(&mut self, last: &Row) -> Result<()> {
        let value: Value = last.try_get(self.sort_column.as_str())?;
        let id: Value = last.try_get(self.id_column.as_str())?;
        // A NULL in the row comparison matches nothing and would end paging early.
        if value.is_null() || id.is_null() {
            return Err(Error::InvalidArgument(format!(
                "keyset columns {} and {} must not be NULL",
                self.sort_column, self.id_column
            )));
        }
        self.cursor = Some((value, id));
        Ok(())
    }

    pub(crate) fn fetch_sql(&self, limit: i64) -> (String, Vec<Value>) {
        let mut c = Conditions::new();
        c.push_filters(&self.filters);
        if let Some((value, id)) = &self.cursor {
            let op = match self.direction {
                SortDirection::Asc => ">",
                SortDirection::Desc => "<",
            };
            let pv = c.bind(value.clone());
            let pi = c.bind(id.clone());
            c.push_clause(format!(
                "({}, {}) {op} ({pv}, {pi})",
                self.sort_column, self.id_column
            ));
        }
        let dir = self.direction.as_sql();
        let where_sql = c.where_sql();
        let limit = c.bind(Value::Int(limit));
        (
            format!(
                "SELECT {} FROM {}{} ORDER BY {} {dir}, {} {dir} LIMIT {limit}",
                select_list(&self.columns),
                self.table,
                where_sql,
                self.sort_column,
                self.id_column
            ),
            c.params,
        )
    }

    /// Fetches up to `limit` rows after the cursor without moving it.
    pub fn fetch<E: Executor + ?Sized>(&self, db: &mut E, limit: i64) -> Result<Vec<Row>> {
        if limit < 1 {
            return Err(Error::InvalidArgument(format!(
                "limit must be positive, got {limit}"
            )));
        }
        let (sql, params) = self.fetch_sql(limit);
        self.diagnostics.query(db, "keyset fetch", &sql, &params)
    }

    /// Fetches the next page and advances the cursor past it.
    pub fn next_page<E: Executor + ?Sized>(&mut self, db: &mut E, limit: i64) -> Result<Vec<Row>> {
        let rows = self.fetch(db, limit)?;
        if let Some(last) = rows.last() {
            self.advance(last)?;
        }
        Ok(rows)
    }
}

fn select_list(columns: &[Ident]) -> String {
    if columns.is_empty() {
        "*".to_string()
    } else {
        ident::join(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDatabase;

    fn ident(s: &str) -> Ident {
        Ident::new(s).unwrap()
    }

    #[test]
    fn count_and_page_share_filters() {
        let q = PaginatedQuery::new(ident("orders"))
            .select(vec![ident("id"), ident("total")])
            .filter(Filter::eq(ident("status"), "paid"))
            .order_by(ident("created_at"), SortDirection::Desc);

        let (count, params) = q.count_sql();
        assert_eq!(
            count,
            "SELECT COUNT(*)::bigint AS total FROM orders WHERE status = $1"
        );
        assert_eq!(params, vec![Value::from("paid")]);

        let (page, params) = q.page_sql(40, 20);
        assert_eq!(
            page,
            "SELECT id, total FROM orders WHERE status = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        assert_eq!(
            params,
            vec![Value::from("paid"), Value::from(20), Value::from(40)]
        );
    }

    #[test]
    fn execute_computes_page_flags() {
        let mut db = MockDatabase::new();
        db.on_query(
            "COUNT(*)",
            vec![Row::from_pairs([("total", Value::from(45))])],
        );
        db.on_query(
            "LIMIT",
            vec![Row::from_pairs([("id", Value::from(21))])],
        );

        let result = PaginatedQuery::new(ident("orders"))
            .execute(&mut db, 2, 20)
            .unwrap();
        assert_eq!(result.total, 45);
        assert_eq!(result.total_pages, 3);
        assert!(result.has_next);
        assert!(result.has_prev);
        assert_eq!(result.items.len(), 1);
        assert_eq!(db.statements()[0].sql, "SELECT COUNT(*)::bigint AS total FROM orders");
    }

    #[test]
    fn empty_table_has_no_pages() {
        let mut db = MockDatabase::new();
        db.on_query("COUNT(*)", vec![Row::from_pairs([("total", Value::from(0))])]);
        let result = PaginatedQuery::new(ident("orders"))
            .execute(&mut db, 1, 10)
            .unwrap();
        assert_eq!(result.total_pages, 0);
        assert!(!result.has_next);
        assert!(!result.has_prev);
    }

    #[test]
    fn rejects_non_positive_page() {
        let mut db = MockDatabase::new();
        let q = PaginatedQuery::new(ident("orders"));
        assert!(q.execute(&mut db, 0, 10).is_err());
        assert!(q.execute(&mut db, 1, 0).is_err());
        assert!(db.statements().is_empty());
    }

    #[test]
    fn rejects_offset_overflow_without_querying() {
        let mut db = MockDatabase::new();
        let q = PaginatedQuery::new(ident("events"));
        let err = q.execute(&mut db, i64::MAX / 2, 10).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(db.statements().is_empty());
    }

    #[test]
    fn total_pages_does_not_overflow_for_huge_page_size() {
        let mut db = MockDatabase::new();
        db.on_query("COUNT(*)", vec![Row::from_pairs([("total", Value::from(5))])]);
        let result = PaginatedQuery::new(ident("events"))
            .execute(&mut db, 1, i64::MAX)
            .unwrap();
        assert_eq!(result.total_pages, 1);
        assert!(!result.has_next);
    }

    #[test]
    fn keyset_first_page_has_no_cursor_clause() {
        let q = KeysetPagination::new(ident("events"), ident("created_at"), SortDirection::Desc)
            .filter(Filter::eq(ident("kind"), "click"));
        let (sql, params) = q.fetch_sql(50);
        assert_eq!(
            sql,
            "SELECT * FROM events WHERE kind = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        assert_eq!(params, vec![Value::from("click"), Value::from(50)]);
    }

    #[test]
    fn keyset_compares_the_whole_tuple() {
        let mut q = KeysetPagination::new(ident("events"), ident("score"), SortDirection::Desc);
        q.after(10, 7);
        let (sql, params) = q.fetch_sql(5);
        assert_eq!(
            sql,
            "SELECT * FROM events WHERE (score, id) < ($1, $2) ORDER BY score DESC, id DESC LIMIT $3"
        );
        assert_eq!(params, vec![Value::from(10), Value::from(7), Value::from(5)]);

        let mut asc = KeysetPagination::new(ident("events"), ident("score"), SortDirection::Asc)
            .id_column(ident("event_id"));
        asc.after(10, 7);
        let (sql, _) = asc.fetch_sql(5);
        assert!(sql.contains("WHERE (score, event_id) > ($1, $2)"));
        assert!(sql.ends_with("ORDER BY score ASC, event_id ASC LIMIT $3"));
    }

    #[test]
    fn advance_reads_cursor_from_row() {
        let mut q = KeysetPagination::new(ident("events"), ident("score"), SortDirection::Asc);
        let row = Row::from_pairs([
            ("id", Value::from(42)),
            ("score", Value::from(3.5)),
        ]);
        q.advance(&row).unwrap();
        assert_eq!(q.cursor(), Some(&(Value::from(3.5), Value::from(42))));

        let missing = Row::from_pairs([("id", Value::from(1))]);
        assert!(q.advance(&missing).is_err());

        let null_sort = Row::from_pairs([("id", Value::from(43)), ("score", Value::Null)]);
        assert!(q.advance(&null_sort).is_err());
        assert_eq!(q.cursor(), Some(&(Value::from(3.5), Value::from(42))));
    }
}
