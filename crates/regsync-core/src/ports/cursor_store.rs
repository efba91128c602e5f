//! CursorStore port - レジストリごとの cursor 永続化
//!
//! cursor は「ここまでの変更はすべて Task に変換済み」という位置を表します。

use async_trait::async_trait;

use crate::domain::{Cursor, StoreError};

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, registry_id: &str) -> Result<Option<Cursor>, StoreError>;

    /// Compare-and-swap: store `next` only if the stored value still equals
    /// `expected`. A `next` that does not move forward is not written.
    ///
    /// Returns `false` when another writer moved the cursor first.
    async fn advance(
        &self,
        registry_id: &str,
        expected: Option<&Cursor>,
        next: &Cursor,
    ) -> Result<bool, StoreError>;
}

/// Whether `advance(expected, next)` should write anything.
pub fn moves_forward(expected: Option<&Cursor>, next: &Cursor) -> bool {
    expected.is_none_or(|e| next > e)
}
