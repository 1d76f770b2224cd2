mod app;
mod handlers;
mod models;
mod state;

pub use app::create_app;
pub use state::AppState;
