mod app;
mod job;

pub use app::{add_routes, AppState};
