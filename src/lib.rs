pub mod config;
pub mod error;
pub mod generation;
pub mod handler;
pub mod quota;
pub mod reference_image;
pub mod replicate;
pub mod server;

pub use config::Config;
pub use error::AppError;
pub use handler::GenerateService;
