//! Byte-id dispatch tables for codec plugins.
//!
//! A [`Selector`] resolves a plugin from the single-byte id carried in a
//! frame header. The table has a fixed 127 slots, is built once on first use
//! and is read without locking afterwards.

use std::sync::{Arc, OnceLock};

use super::compression::{Compression, Deflate, Zlib};
use super::serialization::{Json, MsgPack, Serialization};

/// Number of addressable ids (0..=126).
pub const SELECTOR_SLOTS: usize = 127;

/// Lazily-built id → plugin table.
pub struct Selector<T: ?Sized> {
    table: OnceLock<Vec<Option<Arc<T>>>>,
    loader: Box<dyn Fn() -> Vec<Arc<T>> + Send + Sync>,
    id_of: fn(&T) -> u8,
}

impl<T: ?Sized + Send + Sync> Selector<T> {
    /// Create a selector whose table is filled from `loader` on first lookup.
    pub fn new<L>(loader: L, id_of: fn(&T) -> u8) -> Self
    where
        L: Fn() -> Vec<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            table: OnceLock::new(),
            loader: Box::new(loader),
            id_of,
        }
    }

    /// Look up the plugin registered under `id`.
    #[inline]
    pub fn select(&self, id: u8) -> Option<Arc<T>> {
        self.table()
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .cloned()
    }

    /// Ids that resolve to a plugin, ascending.
    pub fn ids(&self) -> Vec<u8> {
        self.table()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id as u8)
            .collect()
    }

    fn table(&self) -> &[Option<Arc<T>>] {
        self.table.get_or_init(|| {
            let mut table: Vec<Option<Arc<T>>> = vec![None; SELECTOR_SLOTS];
            for plugin in (self.loader)() {
                let id = (self.id_of)(&plugin) as usize;
                match table.get_mut(id) {
                    Some(slot) if slot.is_none() => *slot = Some(plugin),
                    Some(_) => tracing::warn!("Duplicate codec plugin id {}, keeping the first", id),
                    None => tracing::warn!("Codec plugin id {} out of range, ignored", id),
                }
            }
            table
        })
    }
}

impl<T: ?Sized> std::fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("initialized", &self.table.get().is_some())
            .finish()
    }
}

/// Selector over the built-in serializations plus `extra`.
pub fn serialization_selector(
    extra: Vec<Arc<dyn Serialization>>,
) -> Selector<dyn Serialization> {
    Selector::new(
        move || {
            let mut plugins: Vec<Arc<dyn Serialization>> = vec![Arc::new(MsgPack), Arc::new(Json)];
            plugins.extend(extra.iter().cloned());
            plugins
        },
        |s| s.type_id(),
    )
}

/// Selector over the built-in compressions plus `extra`.
pub fn compression_selector(extra: Vec<Arc<dyn Compression>>) -> Selector<dyn Compression> {
    Selector::new(
        move || {
            let mut plugins: Vec<Arc<dyn Compression>> = vec![Arc::new(Deflate), Arc::new(Zlib)];
            plugins.extend(extra.iter().cloned());
            plugins
        },
        |c| c.type_id(),
    )
}

/// Process-wide serialization table.
pub fn default_serializations() -> Arc<Selector<dyn Serialization>> {
    static TABLE: OnceLock<Arc<Selector<dyn Serialization>>> = OnceLock::new();
    TABLE
        .get_or_init(|| Arc::new(serialization_selector(Vec::new())))
        .clone()
}

/// Process-wide compression table.
pub fn default_compressions() -> Arc<Selector<dyn Compression>> {
    static TABLE: OnceLock<Arc<Selector<dyn Compression>>> = OnceLock::new();
    TABLE
        .get_or_init(|| Arc::new(compression_selector(Vec::new())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DEFLATE_ID, JSON_ID, MSGPACK_ID, ZLIB_ID};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builtin_ids_resolve() {
        let s = default_serializations();
        assert_eq!(s.select(MSGPACK_ID).unwrap().name(), "msgpack");
        assert_eq!(s.select(JSON_ID).unwrap().name(), "json");
        assert!(s.select(0).is_none());
        assert!(s.select(200).is_none());

        let c = default_compressions();
        assert_eq!(c.ids(), vec![DEFLATE_ID, ZLIB_ID]);
    }

    #[test]
    fn test_table_built_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let selector: Selector<dyn Compression> = Selector::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![Arc::new(Deflate) as Arc<dyn Compression>]
            },
            |c| c.type_id(),
        );
        for _ in 0..10 {
            assert!(selector.select(DEFLATE_ID).is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_and_out_of_range_ids() {
        struct Custom(u8);
        impl Compression for Custom {
            fn type_id(&self) -> u8 {
                self.0
            }
            fn name(&self) -> &'static str {
                "custom"
            }
            fn compress(&self, data: &[u8]) -> Vec<u8> {
                data.to_vec()
            }
            fn decompress(&self, data: &[u8], _limit: usize) -> crate::error::Result<Vec<u8>> {
                Ok(data.to_vec())
            }
        }

        let selector = compression_selector(vec![
            Arc::new(Custom(DEFLATE_ID)),
            Arc::new(Custom(127)),
            Arc::new(Custom(9)),
        ]);
        assert_eq!(selector.select(DEFLATE_ID).unwrap().name(), "deflate");
        assert_eq!(selector.select(9).unwrap().name(), "custom");
        assert!(selector.select(127).is_none());
    }
}
