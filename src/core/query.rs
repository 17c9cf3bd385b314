// Name lookup with year/sex filtering, stable year ordering, and 1-indexed pagination.
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::index::NameIndex;
use crate::core::normalize::normalize;
use crate::core::record::{Record, Sex, stored_name};
use crate::core::store::RecordStore;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchQuery {
    pub name: String,
    pub year_from: Option<u16>,
    pub year_to: Option<u16>,
    pub sex: Option<Sex>,
    pub page: u32,
    pub page_size: u32,
}

impl SearchQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            year_from: None,
            year_to: None,
            sex: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_years(mut self, year_from: Option<u16>, year_to: Option<u16>) -> Self {
        self.year_from = year_from;
        self.year_to = year_to;
        self
    }

    pub fn with_sex(mut self, sex: Option<Sex>) -> Self {
        self.sex = sex;
        self
    }

    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    fn matches(&self, record: &Record) -> bool {
        if self.year_from.is_some_and(|from| record.year < from) {
            return false;
        }
        if self.year_to.is_some_and(|to| record.year > to) {
            return false;
        }
        self.sex.is_none_or(|sex| record.sex == sex)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchPage {
    pub records: Vec<Record>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

pub fn search(
    store: &RecordStore,
    index: &NameIndex,
    query: &SearchQuery,
) -> Result<SearchPage, Error> {
    if query.page == 0 || query.page_size == 0 {
        return Err(Error::new(ErrorKind::Validation)
            .with_message("page and page_size must be at least 1"));
    }
    let key = lookup_key(index, &query.name)?;

    let mut matches = Vec::new();
    for record in fetch_all(store, index, &key) {
        let record = record?;
        if query.matches(&record) {
            matches.push(record);
        }
    }
    // Stable: equal years keep index (write) order.
    matches.sort_by_key(|record| record.year);
    let total = matches.len();

    let start = (query.page as usize - 1).saturating_mul(query.page_size as usize);
    let records = if start >= total {
        Vec::new()
    } else {
        let end = start.saturating_add(query.page_size as usize).min(total);
        matches.drain(start..end).collect()
    };
    tracing::debug!(key = %key, total, returned = records.len(), page = query.page, "search");

    Ok(SearchPage {
        records,
        total,
        page: query.page,
        page_size: query.page_size,
    })
}

/// Validates a query name and returns its index key. Blank names are rejected
/// rather than treated as a lookup for the empty key.
///
/// Records are indexed under their stored (truncated) name, so a name longer
/// than the name field falls back to the key of its stored prefix.
pub(crate) fn lookup_key(index: &NameIndex, name: &str) -> Result<String, Error> {
    if name.trim().is_empty() {
        return Err(Error::new(ErrorKind::Validation)
            .with_message("municipality name is required")
            .with_hint("Pass a municipality name, e.g. \"Porto Alegre\"."));
    }
    let key = normalize(name);
    if index.lookup(&key).is_empty() {
        let stored = normalize(stored_name(name.trim()));
        if stored != key && !index.lookup(&stored).is_empty() {
            return Ok(stored);
        }
    }
    Ok(key)
}

/// Reads every record indexed under `key`, in index order. Read failures are
/// returned to the caller, never skipped.
pub(crate) fn fetch_all<'a>(
    store: &'a RecordStore,
    index: &'a NameIndex,
    key: &str,
) -> impl Iterator<Item = Result<Record, Error>> + 'a {
    index
        .lookup(key)
        .iter()
        .map(move |offset| store.read_at(*offset))
}
