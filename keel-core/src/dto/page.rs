//! Pagination

use serde::{Deserialize, Serialize};

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

/// One page of a filtered listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

/// Normalized (page, per_page) with 1-based pages and a capped page size
pub fn normalize(page: Option<u32>, per_page: Option<u32>) -> (u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    (page, per_page)
}

impl<T> Page<T> {
    /// Offset of the first item for a normalized page
    pub fn offset(page: u32, per_page: u32) -> u64 {
        u64::from(page.saturating_sub(1)) * u64::from(per_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_defaults() {
        assert_eq!(normalize(None, None), (1, DEFAULT_PER_PAGE));
        assert_eq!(normalize(Some(0), Some(0)), (1, 1));
        assert_eq!(normalize(Some(3), Some(500)), (3, MAX_PER_PAGE));
    }

    #[test]
    fn test_offset() {
        assert_eq!(Page::<()>::offset(1, 20), 0);
        assert_eq!(Page::<()>::offset(3, 20), 40);
    }
}
