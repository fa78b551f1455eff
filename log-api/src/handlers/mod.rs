mod app;
mod ingest;

pub use app::{add_routes, AppState};
