use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.page == 0 {
            return Err(AppError::validation("page", "page must be a positive integer"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(AppError::validation(
                "pageSize",
                format!("pageSize must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        Ok(())
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: i64) -> Self {
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total,
        }
    }

    pub fn has_more(&self) -> bool {
        i64::from(self.page) * i64::from(self.page_size) < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_zero_based() {
        let req = PageRequest::new(3, 25);
        assert_eq!(req.offset(), 50);
        assert_eq!(req.limit(), 25);
    }

    #[test]
    fn rejects_oversized_pages() {
        assert!(PageRequest::new(1, 101).validate().is_err());
        assert!(PageRequest::new(0, 10).validate().is_err());
        assert!(PageRequest::new(1, 100).validate().is_ok());
    }

    #[test]
    fn has_more_tracks_total() {
        let page: Page<u8> = Page::new(vec![1, 2], PageRequest::new(1, 2), 3);
        assert!(page.has_more());
        let page: Page<u8> = Page::new(vec![3], PageRequest::new(2, 2), 3);
        assert!(!page.has_more());
    }
}
