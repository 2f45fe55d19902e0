pub mod episode;
pub mod errors;
pub mod matrix;
pub mod validation;

pub use episode::*;
pub use errors::*;
pub use validation::*;
