//! Built-in plugins. Registered into `ServerShared`'s plugin list in the
//! same order every time (spec §6: slot indices are assigned at
//! registration and must stay stable for a server's lifetime).

pub mod error_page;
pub mod static_file;

pub use error_page::ErrorPagePlugin;
pub use static_file::StaticFilePlugin;
