pub mod web_server;

pub use web_server::{build_server, run_web_server};
