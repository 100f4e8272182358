mod handler;
mod protocol;
mod session;

pub use handler::router;
