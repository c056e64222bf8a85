pub mod params;
pub mod config;
pub mod evaluation;
pub mod trajectory;
pub mod errors;

pub use params::*;
pub use config::*;
pub use evaluation::*;
pub use trajectory::*;
pub use errors::*;
