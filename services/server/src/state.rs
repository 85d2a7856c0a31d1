//! Application state shared across request handlers.

use std::sync::Arc;

use crate::service::ContentService;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    content: ContentService,
}

impl AppState {
    pub fn new(content: ContentService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { content }),
        }
    }

    pub fn content(&self) -> &ContentService {
        &self.inner.content
    }
}
