//! Page store for the bundled engine
//!
//! All engine state lives in fixed-size pages so that replication can ship
//! page images: a WAL frame is "page N now contains these bytes", and two
//! nodes that apply the same frames hold bit-identical stores.
//!
//! ## Page Layout
//!
//! ```text
//! Page 0 (catalog):
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ count (2) │ per table:                                   │
//! │           │   name_len (2) + name                        │
//! │           │   row_counter (8)                            │
//! │           │   col_count (2) + [name_len + name + tag(1)] │
//! │           │   page_count (2) + [page_no (4)]             │
//! └───────────┴──────────────────────────────────────────────┘
//!
//! Data page:
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ rows (2)  │ per row: row_len (2) + tagged values         │
//! └───────────┴──────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use super::sql::{ColumnDef, ColumnType};
use super::Value;

/// Fixed page size
pub const PAGE_SIZE: usize = 4096;

/// The catalog always lives in page 0
pub const CATALOG_PAGE: u32 = 0;

// =============================================================================
// Page Store
// =============================================================================

/// The committed page image. Pages are immutable `Bytes` handles, so
/// snapshot capture is a map clone, not a byte copy.
#[derive(Debug, Clone)]
pub struct PageStore {
    pages: BTreeMap<u32, Bytes>,
}

impl PageStore {
    /// Empty store with an empty catalog page
    pub fn new() -> Self {
        let mut pages = BTreeMap::new();
        pages.insert(CATALOG_PAGE, encode_catalog(&Catalog::default()).expect("empty catalog fits"));
        Self { pages }
    }

    pub fn get(&self, page_no: u32) -> Option<&Bytes> {
        self.pages.get(&page_no)
    }

    pub fn put(&mut self, page_no: u32, data: Bytes) {
        self.pages.insert(page_no, data);
    }

    pub fn free(&mut self, page_no: u32) {
        self.pages.remove(&page_no);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Bytes)> {
        self.pages.iter()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Highest allocated page id
    pub fn max_page(&self) -> u32 {
        self.pages.keys().next_back().copied().unwrap_or(CATALOG_PAGE)
    }

    /// Replace the whole image (snapshot restore)
    pub fn replace(&mut self, pages: BTreeMap<u32, Bytes>) {
        self.pages = pages;
    }

    pub fn clone_pages(&self) -> BTreeMap<u32, Bytes> {
        self.pages.clone()
    }
}

// =============================================================================
// Copy-on-Write Overlay
// =============================================================================

/// Uncommitted view used for speculative execution: reads fall through to
/// the base store, writes land in the overlay. Captured frames are exactly
/// the overlay contents; the base store is never touched.
pub struct Overlay<'a> {
    base: &'a PageStore,
    /// `Some(bytes)` = written page, `None` = freed page
    written: BTreeMap<u32, Option<Bytes>>,
}

impl<'a> Overlay<'a> {
    pub fn new(base: &'a PageStore) -> Self {
        Self { base, written: BTreeMap::new() }
    }

    pub fn get(&self, page_no: u32) -> Option<Bytes> {
        match self.written.get(&page_no) {
            Some(Some(data)) => Some(data.clone()),
            Some(None) => None,
            None => self.base.get(page_no).cloned(),
        }
    }

    pub fn put(&mut self, page_no: u32, data: Bytes) {
        self.written.insert(page_no, Some(data));
    }

    pub fn free(&mut self, page_no: u32) {
        self.written.insert(page_no, None);
    }

    /// Next unallocated page id, considering both base and overlay
    pub fn alloc(&self) -> u32 {
        let overlay_max = self
            .written
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| *k)
            .next_back()
            .unwrap_or(CATALOG_PAGE);
        self.base.max_page().max(overlay_max) + 1
    }

    /// Drain the captured mutations as WAL frames, in page order
    pub fn into_frames(self) -> super::WalFrames {
        let frames = self
            .written
            .into_iter()
            .map(|(page_no, data)| super::WalFrame {
                page_no,
                data: data.map(|b| b.to_vec()).unwrap_or_default(),
            })
            .collect();
        super::WalFrames { frames }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// One table's catalog entry
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// Monotonic row id counter; replicated because it lives in page 0
    pub row_counter: u64,
    pub columns: Vec<ColumnDef>,
    /// Data pages in insertion order
    pub pages: Vec<u32>,
}

impl TableInfo {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// The table directory decoded from page 0
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tables: Vec<TableInfo>,
}

impl Catalog {
    pub fn find(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut TableInfo> {
        self.tables.iter_mut().find(|t| t.name == name)
    }
}

/// Encode the catalog into page 0. Fails with a schema error when the
/// directory no longer fits in one page.
pub fn encode_catalog(catalog: &Catalog) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(PAGE_SIZE);
    buf.put_u16(catalog.tables.len() as u16);
    for table in &catalog.tables {
        put_str(&mut buf, &table.name)?;
        buf.put_u64(table.row_counter);
        buf.put_u16(table.columns.len() as u16);
        for col in &table.columns {
            put_str(&mut buf, &col.name)?;
            buf.put_u8(col.ty.tag());
        }
        buf.put_u16(table.pages.len() as u16);
        for page_no in &table.pages {
            buf.put_u32(*page_no);
        }
    }
    if buf.len() > PAGE_SIZE {
        return Err(Error::Schema("catalog page full".to_string()));
    }
    Ok(buf.freeze())
}

/// Decode page 0 into the table directory
pub fn decode_catalog(mut page: &[u8]) -> Result<Catalog> {
    let count = get_u16(&mut page)?;
    let mut tables = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = get_str(&mut page)?;
        let row_counter = get_u64(&mut page)?;
        let col_count = get_u16(&mut page)?;
        let mut columns = Vec::with_capacity(col_count as usize);
        for _ in 0..col_count {
            let col_name = get_str(&mut page)?;
            let tag = get_u8(&mut page)?;
            let ty = ColumnType::from_tag(tag)
                .ok_or_else(|| Error::Fatal(format!("catalog column type tag 0x{tag:02x}")))?;
            columns.push(ColumnDef { name: col_name, ty });
        }
        let page_count = get_u16(&mut page)?;
        let mut pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            pages.push(get_u32(&mut page)?);
        }
        tables.push(TableInfo { name, row_counter, columns, pages });
    }
    Ok(Catalog { tables })
}

// =============================================================================
// Rows
// =============================================================================

/// Encode one row as `row_len (2) + tagged values`
pub fn encode_row(row: &[Value]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for value in row {
        payload.push(value.tag());
        match value {
            Value::Null => {}
            Value::Integer(i) => payload.extend_from_slice(&i.to_be_bytes()),
            Value::Real(f) => payload.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Text(s) => {
                payload.extend_from_slice(&(s.len() as u32).to_be_bytes());
                payload.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                payload.extend_from_slice(&(b.len() as u32).to_be_bytes());
                payload.extend_from_slice(b);
            }
        }
    }
    if payload.len() + 2 > PAGE_SIZE - 2 {
        return Err(Error::Schema(format!(
            "row of {} bytes exceeds page capacity",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_row(mut payload: &[u8]) -> Result<Vec<Value>> {
    let mut row = Vec::new();
    while !payload.is_empty() {
        let tag = get_u8(&mut payload)?;
        let value = match tag {
            0x00 => Value::Null,
            0x01 => Value::Integer(get_u64(&mut payload)? as i64),
            0x02 => Value::Real(f64::from_bits(get_u64(&mut payload)?)),
            0x03 => {
                let bytes = get_len_prefixed(&mut payload)?;
                Value::Text(
                    String::from_utf8(bytes)
                        .map_err(|_| Error::Fatal("non-UTF8 text value in page".to_string()))?,
                )
            }
            0x04 => Value::Blob(get_len_prefixed(&mut payload)?),
            other => return Err(Error::Fatal(format!("value tag 0x{other:02x} in page"))),
        };
        row.push(value);
    }
    Ok(row)
}

/// Encode a full data page. The caller is responsible for not overflowing;
/// an oversized result is a bug upstream, reported as a schema error.
pub fn encode_data_page(rows: &[Vec<Value>]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(PAGE_SIZE);
    buf.put_u16(rows.len() as u16);
    for row in rows {
        buf.extend_from_slice(&encode_row(row)?);
    }
    if buf.len() > PAGE_SIZE {
        return Err(Error::Schema("data page overflow".to_string()));
    }
    Ok(buf.freeze())
}

/// Decode all rows of a data page
pub fn decode_data_page(mut page: &[u8]) -> Result<Vec<Vec<Value>>> {
    let count = get_u16(&mut page)?;
    let mut rows = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let row_len = get_u16(&mut page)? as usize;
        if page.len() < row_len {
            return Err(Error::Fatal("truncated row in data page".to_string()));
        }
        let (row_bytes, rest) = page.split_at(row_len);
        rows.push(decode_row(row_bytes)?);
        page = rest;
    }
    Ok(rows)
}

/// Whether a page currently holding `used` bytes can take another encoded row
pub fn row_fits(used: usize, encoded_row_len: usize) -> bool {
    used + encoded_row_len <= PAGE_SIZE
}

// =============================================================================
// Byte Helpers
// =============================================================================

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::Schema(format!("identifier too long: {} bytes", s.len())));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::Fatal("truncated page".to_string()));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Fatal("truncated page".to_string()));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Fatal("truncated page".to_string()));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Fatal("truncated page".to_string()));
    }
    Ok(buf.get_u64())
}

fn get_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Fatal("truncated page".to_string()));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Fatal("truncated page".to_string()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::Fatal("non-UTF8 identifier in page".to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_round_trip() {
        let catalog = Catalog {
            tables: vec![TableInfo {
                name: "t".to_string(),
                row_counter: 42,
                columns: vec![
                    ColumnDef { name: "n".to_string(), ty: ColumnType::Integer },
                    ColumnDef { name: "label".to_string(), ty: ColumnType::Text },
                ],
                pages: vec![1, 2, 7],
            }],
        };
        let encoded = encode_catalog(&catalog).unwrap();
        let decoded = decode_catalog(&encoded).unwrap();
        let t = decoded.find("t").unwrap();
        assert_eq!(t.row_counter, 42);
        assert_eq!(t.pages, vec![1, 2, 7]);
        assert_eq!(t.column_index("label"), Some(1));
    }

    #[test]
    fn data_page_round_trip() {
        let rows = vec![
            vec![Value::Integer(1), Value::Text("one".to_string())],
            vec![Value::Integer(-2), Value::Null],
            vec![Value::Real(1.5), Value::Blob(vec![0xDE, 0xAD])],
        ];
        let page = encode_data_page(&rows).unwrap();
        assert_eq!(decode_data_page(&page).unwrap(), rows);
    }

    #[test]
    fn overlay_reads_through_and_captures_writes() {
        let mut store = PageStore::new();
        store.put(1, Bytes::from_static(b"base"));

        let mut overlay = Overlay::new(&store);
        assert_eq!(overlay.get(1).unwrap().as_ref(), b"base");
        overlay.put(2, Bytes::from_static(b"new"));
        overlay.free(1);
        assert!(overlay.get(1).is_none());
        assert_eq!(overlay.alloc(), 3);

        let frames = overlay.into_frames();
        assert_eq!(frames.frames.len(), 2);
        assert_eq!(frames.frames[0].page_no, 1);
        assert!(frames.frames[0].data.is_empty());
        assert_eq!(frames.frames[1].data, b"new");

        // Base store untouched by the speculative run
        assert_eq!(store.get(1).unwrap().as_ref(), b"base");
    }

    #[test]
    fn oversized_row_rejected() {
        let row = vec![Value::Blob(vec![0u8; PAGE_SIZE])];
        assert!(encode_row(&row).is_err());
    }
}
