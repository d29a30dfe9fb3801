//! Paginated find envelope.

use crate::context::Record;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindResult {
    pub docs: Vec<Record>,
    pub total_docs: u64,
    pub limit: u32,
    pub total_pages: u64,
    pub page: u64,
    /// 1-based index of the first doc on this page.
    pub paging_counter: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    pub prev_page: Option<u64>,
    pub next_page: Option<u64>,
}

impl FindResult {
    pub fn new(docs: Vec<Record>, total_docs: u64, limit: u32, offset: u32) -> Self {
        let per_page = u64::from(limit.max(1));
        let total_pages = total_docs.div_ceil(per_page).max(1);
        let page = u64::from(offset) / per_page + 1;
        let has_prev_page = page > 1;
        let has_next_page = page < total_pages;
        FindResult {
            docs,
            total_docs,
            limit,
            total_pages,
            page,
            paging_counter: u64::from(offset) + 1,
            has_next_page,
            has_prev_page,
            prev_page: has_prev_page.then(|| page - 1),
            next_page: has_next_page.then(|| page + 1),
        }
    }
}
