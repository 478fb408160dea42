mod app;
mod load_job;
mod notification;

pub use app::{add_routes, AppState};
