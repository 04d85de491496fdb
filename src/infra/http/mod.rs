mod admin;
mod demo;

pub use admin::{AdminState, build_admin_router};
pub use demo::{
    Feed, FeedCatalog, FeedInput, NAMESPACE, build_demo_router, operation, operation_catalog,
    register_invalidation,
};
