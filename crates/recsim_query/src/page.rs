//! Explicit pagination for row-level detail queries.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};

/// Rows per page when the caller does not choose.
pub const DEFAULT_PAGE_SIZE: usize = 5;
/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: usize = 500;

/// Zero-based page request as supplied by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: DEFAULT_PAGE_SIZE as i64,
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        Self { page, page_size }
    }

    pub fn first(page_size: i64) -> Self {
        Self::new(0, page_size)
    }

    pub fn validate(self) -> QueryResult<ValidPage> {
        if self.page < 0 {
            return Err(QueryError::invalid(format!(
                "page number {} must not be negative",
                self.page
            )));
        }
        if self.page_size <= 0 || self.page_size as usize > MAX_PAGE_SIZE {
            return Err(QueryError::invalid(format!(
                "page size {} outside [1, {MAX_PAGE_SIZE}]",
                self.page_size
            )));
        }
        Ok(ValidPage {
            page: self.page as usize,
            page_size: self.page_size as usize,
        })
    }
}

/// Bounds-checked page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidPage {
    pub page: usize,
    pub page_size: usize,
}

impl ValidPage {
    /// Number of rows to skip before this page.
    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.page_size)
    }
}

/// One page of an ordered result plus the totals a pager needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    /// Always at least one, so an empty result still renders "page 1 of 1".
    pub total_pages: usize,
    pub rows: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(page: ValidPage, total_rows: usize, rows: Vec<T>) -> Self {
        Self {
            page: page.page,
            page_size: page.page_size,
            total_rows,
            total_pages: total_pages(total_rows, page.page_size),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn total_pages(total_rows: usize, page_size: usize) -> usize {
    total_rows.div_ceil(page_size.max(1)).max(1)
}
