//! Page-number pagination over executors and raw SQL.

use core::fmt;

use quarry_core::{Model, QuarryError, Result, Row};
use serde::Serialize;

use crate::executor::{QueryExecutor, Shape};
use crate::raw::RawQuery;
use crate::router::ConnectionRouter;

/// Position metadata for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub number: i64,
    pub page_size: u64,
    /// The page came back full
    pub has_next: bool,
    pub has_previous: bool,
    /// Zero-based index of the first result, `None` for an empty page
    pub start_index: Option<u64>,
    /// One past the last result, `None` for an empty page
    pub end_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResponse {
    pub results: Vec<Row>,
    #[serde(rename = "results_paginator")]
    pub page: PageInfo,
}

/// Cursor shared by both paginators.
#[derive(Debug, Clone)]
struct PageState {
    number: i64,
    page_size: u64,
    has_next: bool,
    has_previous: bool,
}

impl PageState {
    fn new(page_size: u64) -> Self {
        Self {
            number: 0,
            page_size,
            has_next: true,
            has_previous: false,
        }
    }

    /// Moves to page `n` and returns its `(limit, offset)`.
    fn seek(&mut self, n: i64) -> Result<(u64, u64)> {
        self.number = n;
        if n < 1 {
            return Err(QuarryError::InvalidPage(n));
        }
        Ok((self.page_size, self.offset()))
    }

    fn offset(&self) -> u64 {
        (self.number.max(1) as u64 - 1) * self.page_size
    }

    fn respond(&mut self, results: Vec<Row>) -> PageResponse {
        let count = results.len() as u64;
        self.has_next = count == self.page_size;
        self.has_previous = self.number > 1;
        let (start_index, end_index) = if count > 0 {
            let start = self.offset();
            (Some(start), Some(start + count))
        } else {
            (None, None)
        };
        PageResponse {
            results,
            page: PageInfo {
                number: self.number,
                page_size: self.page_size,
                has_next: self.has_next,
                has_previous: self.has_previous,
                start_index,
                end_index,
            },
        }
    }
}

// ==================== Paginator ====================

/// Pages through the rows of a query.
///
/// Executors resolve once, so the paginator takes a factory and builds a
/// fresh one for every page. A factory without an action pages `all()`.
pub struct Paginator<F> {
    factory: F,
    state: PageState,
}

impl<F> fmt::Debug for Paginator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paginator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'r, M, Sh, F> Paginator<F>
where
    M: Model,
    Sh: Shape<M>,
    F: FnMut() -> Result<QueryExecutor<'r, M, Sh>>,
{
    pub fn new(page_size: u64, factory: F) -> Self {
        Self {
            factory,
            state: PageState::new(page_size),
        }
    }

    /// The current page number, 0 before the first fetch.
    #[inline]
    pub fn number(&self) -> i64 {
        self.state.number
    }

    /// Fetches page `n`, counting from 1.
    ///
    /// # Errors
    ///
    /// [`QuarryError::InvalidPage`] for `n < 1`, before any I/O.
    pub async fn page(&mut self, n: i64) -> Result<PageResponse> {
        let (limit, offset) = self.state.seek(n)?;
        let rows = (self.factory)()?
            .or_all()
            .limit(limit)
            .offset(offset)
            .as_rows()
            .await?
            .into_many();
        Ok(self.state.respond(rows))
    }

    /// The following page, or an empty response once a short page was seen.
    pub async fn next_page(&mut self) -> Result<PageResponse> {
        self.state.number += 1;
        if self.state.has_next {
            self.page(self.state.number).await
        } else {
            Ok(self.state.respond(Vec::new()))
        }
    }

    /// The preceding page, or an empty response before page 1.
    pub async fn previous_page(&mut self) -> Result<PageResponse> {
        self.state.number -= 1;
        if self.state.has_previous {
            self.page(self.state.number).await
        } else {
            Ok(self.state.respond(Vec::new()))
        }
    }
}

// ==================== RawPaginator ====================

type Serializer = Box<dyn Fn(Vec<Row>) -> Vec<Row> + Send + Sync>;

/// Pages through raw SQL. The text carries `{limit}` and `{offset}` slots,
/// e.g. `SELECT * FROM items ORDER BY id LIMIT {limit} OFFSET {offset}`.
pub struct RawPaginator<'r> {
    router: &'r ConnectionRouter,
    text: String,
    params: Row,
    serializer: Option<Serializer>,
    state: PageState,
}

impl fmt::Debug for RawPaginator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPaginator")
            .field("text", &self.text)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'r> RawPaginator<'r> {
    pub fn new(
        router: &'r ConnectionRouter,
        page_size: u64,
        text: impl Into<String>,
        params: Row,
    ) -> Self {
        Self {
            router,
            text: text.into(),
            params,
            serializer: None,
            state: PageState::new(page_size),
        }
    }

    /// Post-processes each page's rows before they are returned.
    pub fn serializer(mut self, serializer: impl Fn(Vec<Row>) -> Vec<Row> + Send + Sync + 'static) -> Self {
        self.serializer = Some(Box::new(serializer));
        self
    }

    #[inline]
    pub fn number(&self) -> i64 {
        self.state.number
    }

    pub async fn page(&mut self, n: i64) -> Result<PageResponse> {
        let (limit, offset) = self.state.seek(n)?;
        let text = self
            .text
            .replace("{limit}", &limit.to_string())
            .replace("{offset}", &offset.to_string());
        let mut rows = RawQuery::new(self.router, text).fetch(&self.params).await?;
        if let Some(serializer) = &self.serializer {
            rows = serializer(rows);
        }
        Ok(self.state.respond(rows))
    }

    pub async fn next_page(&mut self) -> Result<PageResponse> {
        self.state.number += 1;
        if self.state.has_next {
            self.page(self.state.number).await
        } else {
            Ok(self.state.respond(Vec::new()))
        }
    }

    pub async fn previous_page(&mut self) -> Result<PageResponse> {
        self.state.number -= 1;
        if self.state.has_previous {
            self.page(self.state.number).await
        } else {
            Ok(self.state.respond(Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_page_has_next() {
        let mut state = PageState::new(2);
        state.seek(1).unwrap();
        let response = state.respond(vec![Row::new(), Row::new()]);
        assert_eq!(
            response.page,
            PageInfo {
                number: 1,
                page_size: 2,
                has_next: true,
                has_previous: false,
                start_index: Some(0),
                end_index: Some(2),
            }
        );
    }

    #[test]
    fn short_page_is_last() {
        let mut state = PageState::new(2);
        assert_eq!(state.seek(3).unwrap(), (2, 4));
        let page = state.respond(vec![Row::new()]).page;
        assert!(!page.has_next);
        assert!(page.has_previous);
        assert_eq!((page.start_index, page.end_index), (Some(4), Some(5)));
    }

    #[test]
    fn empty_page_has_no_indexes() {
        let mut state = PageState::new(5);
        state.seek(1).unwrap();
        let page = state.respond(Vec::new()).page;
        assert_eq!((page.start_index, page.end_index), (None, None));
    }

    #[test]
    fn rejects_page_zero() {
        let mut state = PageState::new(5);
        assert!(matches!(state.seek(0), Err(QuarryError::InvalidPage(0))));
    }

    #[test]
    fn response_serializes_under_results_paginator() {
        let mut state = PageState::new(1);
        state.seek(1).unwrap();
        let json = serde_json::to_value(state.respond(vec![Row::new().with("id", 1)])).unwrap();
        assert_eq!(json["results"][0]["id"], 1);
        assert_eq!(json["results_paginator"]["number"], 1);
        assert_eq!(json["results_paginator"]["end_index"], 1);
    }
}
