pub mod cache;
pub mod view;

pub use cache::{CacheNode, ViewCache};
pub use view::View;
