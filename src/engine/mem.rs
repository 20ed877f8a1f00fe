//! Bundled page engine
//!
//! A deterministic in-memory implementation of the [`SqlEngine`] seam. The
//! committed image is a [`PageStore`]; mutating statements never touch it
//! directly. Instead they run against a copy-on-write overlay and the dirty
//! pages are captured as WAL frames, which the apply path later writes into
//! the committed image. Leader and followers therefore mutate their images
//! through the exact same code path, with the exact same bytes.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{Error, Result};
use super::pages::{
    self, Catalog, Overlay, PageStore, TableInfo, CATALOG_PAGE, PAGE_SIZE,
};
use super::sql::{self, Expr, Filter, SelectColumns, Statement};
use super::{ExecResult, ImageCapture, Prepared, Row, RowCursor, SqlEngine, Value, WalFrames};

/// Deterministic in-memory engine over a page store
#[derive(Debug)]
pub struct MemEngine {
    store: PageStore,
}

impl MemEngine {
    pub fn new() -> Self {
        Self { store: PageStore::new() }
    }

    pub fn page_count(&self) -> usize {
        self.store.page_count()
    }

    fn catalog(overlay: &Overlay<'_>) -> Result<Catalog> {
        let page = overlay
            .get(CATALOG_PAGE)
            .ok_or_else(|| Error::Fatal("catalog page missing".to_string()))?;
        pages::decode_catalog(&page)
    }

    fn committed_catalog(&self) -> Result<Catalog> {
        let page = self
            .store
            .get(CATALOG_PAGE)
            .ok_or_else(|| Error::Fatal("catalog page missing".to_string()))?;
        pages::decode_catalog(page)
    }
}

// =============================================================================
// Statement Evaluation
// =============================================================================

/// Bind an expression against the caller-supplied parameters
fn resolve(expr: &Expr, params: &[Value]) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(i) => params
            .get(*i as usize)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("parameter {} not bound", i + 1))),
    }
}

/// Resolve a `WHERE col = expr` filter to (column index, wanted value)
fn resolve_filter(
    table: &TableInfo,
    filter: &Filter,
    params: &[Value],
) -> Result<Option<(usize, Value)>> {
    match filter {
        None => Ok(None),
        Some((col, expr)) => {
            let idx = table
                .column_index(col)
                .ok_or_else(|| Error::Schema(format!("no such column '{col}'")))?;
            Ok(Some((idx, resolve(expr, params)?)))
        }
    }
}

fn row_matches(row: &[Value], filter: &Option<(usize, Value)>) -> bool {
    match filter {
        None => true,
        Some((idx, wanted)) => row.get(*idx) == Some(wanted),
    }
}

/// Read every row of a table through the overlay
fn all_rows(overlay: &Overlay<'_>, table: &TableInfo) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for page_no in &table.pages {
        let page = overlay
            .get(*page_no)
            .ok_or_else(|| Error::Fatal(format!("data page {page_no} missing")))?;
        rows.extend(pages::decode_data_page(&page)?);
    }
    Ok(rows)
}

/// Rewrite a table's data pages from scratch: free the old pages, pack the
/// rows into freshly allocated ones, and update the catalog entry.
fn repack_table(
    overlay: &mut Overlay<'_>,
    catalog: &mut Catalog,
    table_name: &str,
    rows: &[Row],
) -> Result<()> {
    let old_pages = catalog
        .find(table_name)
        .map(|t| t.pages.clone())
        .unwrap_or_default();
    for page_no in &old_pages {
        overlay.free(*page_no);
    }

    let mut new_pages = Vec::new();
    let mut current: Vec<Row> = Vec::new();
    let mut used = 2usize;
    for row in rows {
        let encoded_len = pages::encode_row(row)?.len();
        if !pages::row_fits(used, encoded_len) {
            let page_no = overlay.alloc();
            overlay.put(page_no, pages::encode_data_page(&current)?);
            new_pages.push(page_no);
            current = Vec::new();
            used = 2;
        }
        current.push(row.clone());
        used += encoded_len;
    }
    if !current.is_empty() {
        let page_no = overlay.alloc();
        overlay.put(page_no, pages::encode_data_page(&current)?);
        new_pages.push(page_no);
    }

    let table = catalog
        .find_mut(table_name)
        .ok_or_else(|| Error::Schema(format!("no such table '{table_name}'")))?;
    table.pages = new_pages;
    Ok(())
}

fn write_catalog(overlay: &mut Overlay<'_>, catalog: &Catalog) -> Result<()> {
    overlay.put(CATALOG_PAGE, pages::encode_catalog(catalog)?);
    Ok(())
}

impl MemEngine {
    fn exec_on_overlay(
        &self,
        overlay: &mut Overlay<'_>,
        stmt: &Statement,
        params: &[Value],
    ) -> Result<ExecResult> {
        match stmt {
            // Transaction bracketing statements replicate nothing; the frame
            // set already is the atomic unit.
            Statement::Begin | Statement::Commit | Statement::Rollback => {
                Ok(ExecResult::default())
            }

            Statement::CreateTable { name, columns } => {
                let mut catalog = Self::catalog(overlay)?;
                if catalog.find(name).is_some() {
                    return Err(Error::Schema(format!("table '{name}' already exists")));
                }
                catalog.tables.push(TableInfo {
                    name: name.clone(),
                    row_counter: 0,
                    columns: columns.clone(),
                    pages: Vec::new(),
                });
                write_catalog(overlay, &catalog)?;
                Ok(ExecResult::default())
            }

            Statement::DropTable { name } => {
                let mut catalog = Self::catalog(overlay)?;
                let table = catalog
                    .find(name)
                    .ok_or_else(|| Error::Schema(format!("no such table '{name}'")))?;
                for page_no in table.pages.clone() {
                    overlay.free(page_no);
                }
                catalog.tables.retain(|t| t.name != *name);
                write_catalog(overlay, &catalog)?;
                Ok(ExecResult::default())
            }

            Statement::Insert { table, columns, values } => {
                let mut catalog = Self::catalog(overlay)?;
                let info = catalog
                    .find(table)
                    .ok_or_else(|| Error::Schema(format!("no such table '{table}'")))?;

                let bound: Vec<Value> =
                    values.iter().map(|e| resolve(e, params)).collect::<Result<_>>()?;

                // Build the row in table column order
                let row: Row = match columns {
                    None => {
                        if bound.len() != info.columns.len() {
                            return Err(Error::Schema(format!(
                                "table '{table}' has {} columns, {} values supplied",
                                info.columns.len(),
                                bound.len()
                            )));
                        }
                        bound
                    }
                    Some(named) => {
                        if bound.len() != named.len() {
                            return Err(Error::Schema(format!(
                                "{} columns named, {} values supplied",
                                named.len(),
                                bound.len()
                            )));
                        }
                        let mut row = vec![Value::Null; info.columns.len()];
                        for (col, value) in named.iter().zip(bound) {
                            let idx = info.column_index(col).ok_or_else(|| {
                                Error::Schema(format!("no such column '{col}'"))
                            })?;
                            row[idx] = value;
                        }
                        row
                    }
                };

                let encoded_len = pages::encode_row(&row)?.len();

                // Append to the last data page when it has room
                let info = catalog.find_mut(table).expect("table just looked up");
                let mut appended = false;
                if let Some(&last) = info.pages.last() {
                    let page = overlay
                        .get(last)
                        .ok_or_else(|| Error::Fatal(format!("data page {last} missing")))?;
                    if pages::row_fits(page.len(), encoded_len) {
                        let mut rows = pages::decode_data_page(&page)?;
                        rows.push(row.clone());
                        overlay.put(last, pages::encode_data_page(&rows)?);
                        appended = true;
                    }
                }
                if !appended {
                    let page_no = overlay.alloc();
                    overlay.put(page_no, pages::encode_data_page(std::slice::from_ref(&row))?);
                    info.pages.push(page_no);
                }

                info.row_counter += 1;
                let last_insert_id = info.row_counter;
                write_catalog(overlay, &catalog)?;
                Ok(ExecResult { last_insert_id, rows_affected: 1 })
            }

            Statement::Update { table, assignments, filter } => {
                let mut catalog = Self::catalog(overlay)?;
                let info = catalog
                    .find(table)
                    .ok_or_else(|| Error::Schema(format!("no such table '{table}'")))?;

                let filter = resolve_filter(info, filter, params)?;
                let changes: Vec<(usize, Value)> = assignments
                    .iter()
                    .map(|(col, expr)| {
                        let idx = info
                            .column_index(col)
                            .ok_or_else(|| Error::Schema(format!("no such column '{col}'")))?;
                        Ok((idx, resolve(expr, params)?))
                    })
                    .collect::<Result<_>>()?;

                let mut rows = all_rows(overlay, info)?;
                let mut affected = 0u64;
                for row in rows.iter_mut() {
                    if row_matches(row, &filter) {
                        for (idx, value) in &changes {
                            row[*idx] = value.clone();
                        }
                        affected += 1;
                    }
                }
                if affected > 0 {
                    repack_table(overlay, &mut catalog, table, &rows)?;
                    write_catalog(overlay, &catalog)?;
                }
                Ok(ExecResult { last_insert_id: 0, rows_affected: affected })
            }

            Statement::Delete { table, filter } => {
                let mut catalog = Self::catalog(overlay)?;
                let info = catalog
                    .find(table)
                    .ok_or_else(|| Error::Schema(format!("no such table '{table}'")))?;

                let filter = resolve_filter(info, filter, params)?;
                let rows = all_rows(overlay, info)?;
                let before = rows.len();
                let kept: Vec<Row> =
                    rows.into_iter().filter(|r| !row_matches(r, &filter)).collect();
                let affected = (before - kept.len()) as u64;
                if affected > 0 {
                    repack_table(overlay, &mut catalog, table, &kept)?;
                    write_catalog(overlay, &catalog)?;
                }
                Ok(ExecResult { last_insert_id: 0, rows_affected: affected })
            }

            Statement::Select { .. } => {
                Err(Error::Schema("SELECT must go through the query path".to_string()))
            }
        }
    }
}

// =============================================================================
// SqlEngine Implementation
// =============================================================================

impl SqlEngine for MemEngine {
    fn prepare(&self, sql_text: &str) -> Result<Prepared> {
        let statement = sql::parse(sql_text)?;
        let mutates = statement.mutates();
        let param_count = statement.param_count();
        Ok(Prepared { statement, mutates, param_count })
    }

    fn exec_capture(&mut self, stmt: &Statement, params: &[Value]) -> Result<(ExecResult, WalFrames)> {
        let mut overlay = Overlay::new(&self.store);
        let result = self.exec_on_overlay(&mut overlay, stmt, params)?;
        Ok((result, overlay.into_frames()))
    }

    fn query(&self, stmt: &Statement, params: &[Value]) -> Result<Box<dyn RowCursor>> {
        let (table_name, columns, filter) = match stmt {
            Statement::Select { table, columns, filter } => (table, columns, filter),
            _ => return Err(Error::Schema("statement is not a query".to_string())),
        };

        let catalog = self.committed_catalog()?;
        let info = catalog
            .find(table_name)
            .ok_or_else(|| Error::Schema(format!("no such table '{table_name}'")))?;

        let projection: Vec<usize> = match columns {
            SelectColumns::All => (0..info.columns.len()).collect(),
            SelectColumns::Named(names) => names
                .iter()
                .map(|n| {
                    info.column_index(n)
                        .ok_or_else(|| Error::Schema(format!("no such column '{n}'")))
                })
                .collect::<Result<_>>()?,
        };
        let column_names = projection
            .iter()
            .map(|&i| info.columns[i].name.clone())
            .collect();
        let filter = resolve_filter(info, filter, params)?;

        // Clone the page handles now so the cursor observes a consistent
        // image even if frames apply while the client drains rows.
        let page_handles: Vec<Bytes> = info
            .pages
            .iter()
            .map(|p| {
                self.store
                    .get(*p)
                    .cloned()
                    .ok_or_else(|| Error::Fatal(format!("data page {p} missing")))
            })
            .collect::<Result<_>>()?;

        Ok(Box::new(MemCursor {
            columns: column_names,
            pages: page_handles.into(),
            buffered: VecDeque::new(),
            projection,
            filter,
        }))
    }

    fn apply_frames(&mut self, frames: &WalFrames) -> Result<()> {
        for frame in &frames.frames {
            if frame.data.is_empty() {
                self.store.free(frame.page_no);
            } else {
                if frame.data.len() > PAGE_SIZE {
                    return Err(Error::Fatal(format!(
                        "frame for page {} is {} bytes",
                        frame.page_no,
                        frame.data.len()
                    )));
                }
                self.store.put(frame.page_no, Bytes::from(frame.data.clone()));
            }
        }
        Ok(())
    }

    fn snapshot_image(&self) -> Result<ImageCapture> {
        Ok(ImageCapture::new(self.store.clone_pages()))
    }

    fn restore_image(&mut self, image: &[u8]) -> Result<()> {
        self.store.replace(ImageCapture::deserialize(image)?);
        Ok(())
    }
}

// =============================================================================
// Cursor
// =============================================================================

struct MemCursor {
    columns: Vec<String>,
    pages: VecDeque<Bytes>,
    buffered: VecDeque<Row>,
    projection: Vec<usize>,
    filter: Option<(usize, Value)>,
}

impl RowCursor for MemCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(row));
            }
            let Some(page) = self.pages.pop_front() else {
                return Ok(None);
            };
            for row in pages::decode_data_page(&page)? {
                if row_matches(&row, &self.filter) {
                    let projected =
                        self.projection.iter().map(|&i| row[i].clone()).collect();
                    self.buffered.push_back(projected);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(engine: &mut MemEngine, sql: &str, params: &[Value]) -> (ExecResult, WalFrames) {
        let prepared = engine.prepare(sql).unwrap();
        let (result, frames) = engine.exec_capture(&prepared.statement, params).unwrap();
        engine.apply_frames(&frames).unwrap();
        (result, frames)
    }

    fn query_all(engine: &MemEngine, sql: &str, params: &[Value]) -> Vec<Row> {
        let prepared = engine.prepare(sql).unwrap();
        let mut cursor = engine.query(&prepared.statement, params).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn create_insert_select() {
        let mut engine = MemEngine::new();
        exec(&mut engine, "CREATE TABLE t (n INT, label TEXT)", &[]);
        let (result, _) =
            exec(&mut engine, "INSERT INTO t (n, label) VALUES (1, 'one')", &[]);
        assert_eq!(result.last_insert_id, 1);
        assert_eq!(result.rows_affected, 1);

        let rows = query_all(&engine, "SELECT n, label FROM t", &[]);
        assert_eq!(rows, vec![vec![Value::Integer(1), Value::Text("one".to_string())]]);
    }

    #[test]
    fn speculative_exec_leaves_image_untouched() {
        let mut engine = MemEngine::new();
        exec(&mut engine, "CREATE TABLE t (n INT)", &[]);

        let prepared = engine.prepare("INSERT INTO t (n) VALUES (7)").unwrap();
        let (_, frames) = engine.exec_capture(&prepared.statement, &[]).unwrap();
        assert!(!frames.is_empty());

        // Frames not applied yet: no rows visible
        assert!(query_all(&engine, "SELECT n FROM t", &[]).is_empty());

        engine.apply_frames(&frames).unwrap();
        assert_eq!(query_all(&engine, "SELECT n FROM t", &[]).len(), 1);
    }

    #[test]
    fn params_bind_in_order() {
        let mut engine = MemEngine::new();
        exec(&mut engine, "CREATE TABLE t (a INT, b TEXT)", &[]);
        exec(
            &mut engine,
            "INSERT INTO t (a, b) VALUES (?, ?)",
            &[Value::Integer(5), Value::Text("five".to_string())],
        );
        let rows = query_all(&engine, "SELECT b FROM t WHERE a = ?", &[Value::Integer(5)]);
        assert_eq!(rows, vec![vec![Value::Text("five".to_string())]]);
    }

    #[test]
    fn update_and_delete_report_affected_rows() {
        let mut engine = MemEngine::new();
        exec(&mut engine, "CREATE TABLE t (n INT)", &[]);
        for i in 0..10 {
            exec(&mut engine, &format!("INSERT INTO t (n) VALUES ({i})"), &[]);
        }
        let (result, _) = exec(&mut engine, "UPDATE t SET n = 100 WHERE n = 3", &[]);
        assert_eq!(result.rows_affected, 1);

        let (result, _) = exec(&mut engine, "DELETE FROM t WHERE n = 100", &[]);
        assert_eq!(result.rows_affected, 1);
        assert_eq!(query_all(&engine, "SELECT n FROM t", &[]).len(), 9);
    }

    #[test]
    fn begin_commit_capture_no_frames() {
        let mut engine = MemEngine::new();
        let (_, frames) = exec(&mut engine, "BEGIN", &[]);
        assert!(frames.is_empty());
        let (_, frames) = exec(&mut engine, "COMMIT", &[]);
        assert!(frames.is_empty());
    }

    #[test]
    fn inserts_spill_across_pages() {
        let mut engine = MemEngine::new();
        exec(&mut engine, "CREATE TABLE t (s TEXT)", &[]);
        let big = "x".repeat(1000);
        for _ in 0..20 {
            exec(
                &mut engine,
                "INSERT INTO t (s) VALUES (?)",
                &[Value::Text(big.clone())],
            );
        }
        assert!(engine.page_count() > 2);
        assert_eq!(query_all(&engine, "SELECT s FROM t", &[]).len(), 20);
    }

    #[test]
    fn identical_frames_yield_identical_images() {
        let mut leader = MemEngine::new();
        let mut follower = MemEngine::new();

        let statements = [
            "CREATE TABLE t (n INT, s TEXT)",
            "INSERT INTO t (n, s) VALUES (1, 'a')",
            "INSERT INTO t (n, s) VALUES (2, 'b')",
            "UPDATE t SET s = 'z' WHERE n = 1",
            "DELETE FROM t WHERE n = 2",
        ];
        for sql in statements {
            let prepared = leader.prepare(sql).unwrap();
            let (_, frames) = leader.exec_capture(&prepared.statement, &[]).unwrap();
            leader.apply_frames(&frames).unwrap();
            follower.apply_frames(&frames).unwrap();
        }

        assert_eq!(
            leader.snapshot_image().unwrap().serialize().unwrap(),
            follower.snapshot_image().unwrap().serialize().unwrap()
        );
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut engine = MemEngine::new();
        exec(&mut engine, "CREATE TABLE t (n INT)", &[]);
        exec(&mut engine, "INSERT INTO t (n) VALUES (42)", &[]);

        let image = engine.snapshot_image().unwrap().serialize().unwrap();
        let mut restored = MemEngine::new();
        restored.restore_image(&image).unwrap();
        assert_eq!(
            query_all(&restored, "SELECT n FROM t", &[]),
            vec![vec![Value::Integer(42)]]
        );
    }

    #[test]
    fn corrupt_snapshot_rejected() {
        let engine = MemEngine::new();
        let mut image = engine.snapshot_image().unwrap().serialize().unwrap().to_vec();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        let mut other = MemEngine::new();
        assert!(other.restore_image(&image).is_err());
    }
}
