//! Filesystem-backed [`AssetStore`](studio_core::AssetStore), an
//! HMAC-bearer [`ContentAccess`](studio_core::ContentAccess)
//! implementation, and the retention sweep that expires assets past
//! their `retain_until` (spec §4.8, supplemented — see SPEC_FULL.md §2).

mod fs_store;
mod hmac_token;
mod retention;

pub use fs_store::FsAssetStore;
pub use hmac_token::HmacContentAccess;
pub use retention::RetentionSweeper;
